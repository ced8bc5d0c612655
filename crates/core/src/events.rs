use parlor_llm::{StreamOutcome, StreamTarget};
use parlor_storage::{MessageId, SessionId, SessionRecord};
use tokio::sync::mpsc;

use crate::message::{Message, MessageStatus};

/// Notifications for the presentation surface, in the order state changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// The history window now mirrors `session`; `messages` is the full list.
    SessionActivated {
        session: SessionRecord,
        messages: Vec<Message>,
    },
    /// Sessions, most recently updated first.
    SessionsChanged(Vec<SessionRecord>),
    MessageAppended {
        session_id: SessionId,
        message: Message,
    },
    /// Replacement content for an existing message. Streaming placeholders
    /// get exactly one of these per received fragment.
    MessageUpdated {
        session_id: SessionId,
        message_id: MessageId,
        content: String,
        status: MessageStatus,
    },
    ExchangeStarted {
        session_id: SessionId,
        target: StreamTarget,
    },
    ExchangeCompleted {
        session_id: SessionId,
        message_id: MessageId,
    },
    ExchangeFailed {
        session_id: SessionId,
        message_id: MessageId,
        notice: String,
    },
    TitleUpdated(SessionRecord),
    /// A write or read against the store failed. In-memory state stays
    /// authoritative until the next successful write.
    StorageFailed {
        operation: &'static str,
        message: String,
    },
    /// A command was refused or failed before changing any state.
    OperationFailed {
        operation: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ChatEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<ChatEvent>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ChatEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: ChatEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("chat event dropped; presentation receiver is closed");
        }
    }
}

/// Results from background workers, applied on the controller's update path.
#[derive(Debug)]
pub(crate) enum LoopEvent {
    Delta {
        target: StreamTarget,
        fragment: String,
    },
    StreamFinished {
        target: StreamTarget,
        outcome: StreamOutcome,
    },
    TitleApplied(SessionRecord),
}
