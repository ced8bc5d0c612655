use std::collections::HashSet;

use parlor_llm::ProviderMessage;
use parlor_storage::{MessageId, MessageRecord, SessionId};

use crate::message::{Message, MessageStatus};

/// Handle to one message in the window.
///
/// A handle only resolves while the window still holds the same session
/// load it was issued for; any reload or clear invalidates every handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageSlot {
    index: usize,
    generation: u64,
}

/// In-memory ordered message list for the active session.
#[derive(Debug, Default)]
pub struct HistoryWindow {
    session_id: Option<SessionId>,
    generation: u64,
    messages: Vec<Message>,
    persisted: HashSet<MessageId>,
}

impl HistoryWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Replaces the whole window with the stored list of `session_id`.
    pub fn reload(&mut self, session_id: SessionId, records: Vec<MessageRecord>) {
        self.generation = self.generation.wrapping_add(1);
        self.session_id = Some(session_id);
        self.persisted = records.iter().map(|record| record.id).collect();
        self.messages = records.into_iter().map(Message::from_record).collect();
    }

    /// Empties the window and binds it to `session_id`.
    pub fn clear(&mut self, session_id: SessionId) {
        self.reload(session_id, Vec::new());
    }

    pub fn push(&mut self, message: Message) -> MessageSlot {
        let slot = MessageSlot {
            index: self.messages.len(),
            generation: self.generation,
        };
        self.messages.push(message);
        slot
    }

    pub fn get(&self, slot: MessageSlot) -> Option<&Message> {
        if slot.generation != self.generation {
            return None;
        }
        self.messages.get(slot.index)
    }

    pub fn get_mut(&mut self, slot: MessageSlot) -> Option<&mut Message> {
        if slot.generation != self.generation {
            return None;
        }
        self.messages.get_mut(slot.index)
    }

    pub fn mark_persisted(&mut self, message_id: MessageId) {
        self.persisted.insert(message_id);
    }

    /// Finished messages the store has not acknowledged yet, in window order.
    /// Placeholders and failure notices never qualify.
    pub fn unsaved(&self) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|message| message.is_done())
            .filter(|message| !self.persisted.contains(&message.id))
            .cloned()
            .collect()
    }

    /// Context for the next model call.
    pub fn provider_messages(&self) -> Vec<ProviderMessage> {
        self.messages
            .iter()
            .filter(|message| message.is_done())
            .filter(|message| !message.content.trim().is_empty())
            .map(Message::to_provider_message)
            .collect()
    }

    /// Up to `limit` most recent finished messages, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Message> {
        let finished: Vec<&Message> = self
            .messages
            .iter()
            .filter(|message| matches!(message.status, MessageStatus::Done))
            .collect();
        let start = finished.len().saturating_sub(limit);
        finished[start..].iter().map(|message| (*message).clone()).collect()
    }
}
