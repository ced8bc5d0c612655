use std::sync::Arc;

use parlor_llm::{
    ChatRequest, DeltaRejected, LlmProvider, ProviderMessage, ProviderStreamHandle,
    StreamOutcome, StreamTarget,
};
use parlor_storage::{ConversationStore, SessionId};
use snafu::ensure;
use tokio::sync::mpsc;

use crate::error::{ChatResult, EmptyMessageSnafu, ExchangeInFlightSnafu, WindowMismatchSnafu};
use crate::events::{ChatEvent, EventSink, LoopEvent};
use crate::history::{HistoryWindow, MessageSlot};
use crate::message::{Message, MessageStatus};

/// Model id plus optional sampling limits applied to every request.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSelection {
    pub model_id: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl ModelSelection {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn request(&self, messages: Vec<ProviderMessage>) -> ChatRequest {
        let mut request = ChatRequest::new(self.model_id.clone(), messages);
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        request
    }
}

/// The in-flight user/assistant pair. `assistant` is the authoritative copy
/// of the reply; the window only mirrors it while `slot` resolves.
struct Exchange {
    target: StreamTarget,
    session_id: SessionId,
    assistant: Message,
    slot: Option<MessageSlot>,
}

/// A successfully finished exchange, handed back for the title refresh.
#[derive(Debug, Clone)]
pub(crate) struct CompletedExchange {
    pub session_id: SessionId,
}

pub struct StreamingDispatcher {
    store: Arc<dyn ConversationStore>,
    provider: Arc<dyn LlmProvider>,
    model: ModelSelection,
    events: EventSink,
    loop_tx: mpsc::UnboundedSender<LoopEvent>,
    next_target: u64,
    in_flight: Option<Exchange>,
}

impl StreamingDispatcher {
    pub(crate) fn new(
        store: Arc<dyn ConversationStore>,
        provider: Arc<dyn LlmProvider>,
        model: ModelSelection,
        events: EventSink,
        loop_tx: mpsc::UnboundedSender<LoopEvent>,
    ) -> Self {
        Self {
            store,
            provider,
            model,
            events,
            loop_tx,
            next_target: 1,
            in_flight: None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Session the in-flight exchange was bound to when it started.
    pub fn in_flight_session(&self) -> Option<SessionId> {
        self.in_flight.as_ref().map(|exchange| exchange.session_id)
    }

    /// Starts one exchange for `session_id`, whose messages must be the ones
    /// loaded in `window`.
    pub(crate) async fn send(
        &mut self,
        window: &mut HistoryWindow,
        session_id: SessionId,
        user_text: &str,
    ) -> ChatResult<StreamTarget> {
        if let Some(exchange) = &self.in_flight {
            return ExchangeInFlightSnafu {
                stage: "dispatch-send",
                session_id: exchange.session_id,
            }
            .fail();
        }

        let user_text = user_text.trim();
        ensure!(
            !user_text.is_empty(),
            EmptyMessageSnafu {
                stage: "dispatch-send"
            }
        );
        ensure!(
            window.session_id() == Some(session_id),
            WindowMismatchSnafu {
                stage: "dispatch-send",
                session_id,
                window: window.session_id(),
            }
        );

        let user_message = Message::user(user_text);
        window.push(user_message.clone());
        self.events.emit(ChatEvent::MessageAppended {
            session_id,
            message: user_message.clone(),
        });

        match self
            .store
            .save_message(session_id, user_message.to_new_record())
            .await
        {
            Ok(_) => window.mark_persisted(user_message.id),
            Err(error) => {
                tracing::warn!(
                    session_id = %session_id,
                    message_id = %user_message.id,
                    error = %error,
                    "failed to persist user message; it stays in the window until the next flush"
                );
                self.events.emit(ChatEvent::StorageFailed {
                    operation: "save-user-message",
                    message: error.to_string(),
                });
            }
        }

        let context = window.provider_messages();
        let placeholder = Message::assistant_streaming();
        let slot = window.push(placeholder.clone());
        self.events.emit(ChatEvent::MessageAppended {
            session_id,
            message: placeholder.clone(),
        });

        let target = StreamTarget::new(self.next_target);
        self.next_target = self.next_target.saturating_add(1);
        self.in_flight = Some(Exchange {
            target,
            session_id,
            assistant: placeholder,
            slot: Some(slot),
        });
        self.events.emit(ChatEvent::ExchangeStarted { session_id, target });

        let request = self.model.request(context);
        match self.provider.stream_chat(target, request) {
            Ok(handle) => self.spawn_stream_pipeline(target, handle),
            Err(error) => {
                tracing::error!(
                    session_id = %session_id,
                    target = ?target,
                    provider_id = %self.provider.id(),
                    error = %error,
                    "failed to start provider stream"
                );
                // Routed through the loop so every ending takes the same path.
                let _ = self.loop_tx.send(LoopEvent::StreamFinished {
                    target,
                    outcome: StreamOutcome::Failed {
                        partial: String::new(),
                        message: error.to_string(),
                    },
                });
            }
        }

        Ok(target)
    }

    fn spawn_stream_pipeline(&self, target: StreamTarget, handle: ProviderStreamHandle) {
        let ProviderStreamHandle { stream, worker } = handle;
        tokio::spawn(worker);

        let loop_tx = self.loop_tx.clone();
        tokio::spawn(async move {
            let outcome = stream
                .consume(|fragment| {
                    loop_tx
                        .send(LoopEvent::Delta {
                            target,
                            fragment: fragment.to_string(),
                        })
                        .map_err(|_| DeltaRejected::new("controller loop closed"))
                })
                .await;

            if loop_tx
                .send(LoopEvent::StreamFinished { target, outcome })
                .is_err()
            {
                tracing::debug!(target = ?target, "stream finished after controller loop closed");
            }
        });
    }

    pub(crate) fn apply_delta(
        &mut self,
        window: &mut HistoryWindow,
        target: StreamTarget,
        fragment: &str,
    ) {
        let Some(exchange) = self
            .in_flight
            .as_mut()
            .filter(|exchange| exchange.target == target)
        else {
            tracing::debug!(target = ?target, "dropping delta for a stream that is no longer in flight");
            return;
        };

        exchange.assistant.content.push_str(fragment);

        if let Some(slot) = exchange.slot {
            match window.get_mut(slot) {
                Some(message) => message.content.clone_from(&exchange.assistant.content),
                None => exchange.slot = None,
            }
        }

        self.events.emit(ChatEvent::MessageUpdated {
            session_id: exchange.session_id,
            message_id: exchange.assistant.id,
            content: exchange.assistant.content.clone(),
            status: MessageStatus::Streaming,
        });
    }

    /// Ends the exchange for `target`. Returns the completion only when the
    /// model finished without error.
    pub(crate) async fn finish(
        &mut self,
        window: &mut HistoryWindow,
        target: StreamTarget,
        outcome: StreamOutcome,
    ) -> Option<CompletedExchange> {
        let Some(exchange) = self.in_flight.take_if(|exchange| exchange.target == target) else {
            tracing::debug!(target = ?target, "ignoring stream end for a stream that is no longer in flight");
            return None;
        };

        match outcome {
            StreamOutcome::Completed(content) => self.complete(window, exchange, content).await,
            StreamOutcome::Failed { partial, message }
            | StreamOutcome::Aborted {
                partial,
                reason: message,
            } => {
                self.fail(window, exchange, &partial, message);
                None
            }
        }
    }

    async fn complete(
        &mut self,
        window: &mut HistoryWindow,
        mut exchange: Exchange,
        content: String,
    ) -> Option<CompletedExchange> {
        let session_id = exchange.session_id;
        exchange.assistant.content = content;
        exchange.assistant.status = MessageStatus::Done;

        let attached = exchange
            .slot
            .and_then(|slot| window.get_mut(slot))
            .map(|message| {
                message.content.clone_from(&exchange.assistant.content);
                message.status = MessageStatus::Done;
            })
            .is_some();

        match self
            .store
            .save_message(session_id, exchange.assistant.to_new_record())
            .await
        {
            Ok(_) => {
                if attached {
                    window.mark_persisted(exchange.assistant.id);
                }
            }
            Err(error) => {
                if attached {
                    tracing::warn!(
                        session_id = %session_id,
                        message_id = %exchange.assistant.id,
                        error = %error,
                        "failed to persist assistant reply; it stays in the window until the next flush"
                    );
                } else {
                    tracing::error!(
                        session_id = %session_id,
                        message_id = %exchange.assistant.id,
                        error = %error,
                        "failed to persist assistant reply for a session that is no longer in view"
                    );
                }
                self.events.emit(ChatEvent::StorageFailed {
                    operation: "save-assistant-message",
                    message: error.to_string(),
                });
            }
        }

        self.events.emit(ChatEvent::MessageUpdated {
            session_id,
            message_id: exchange.assistant.id,
            content: exchange.assistant.content.clone(),
            status: MessageStatus::Done,
        });
        self.events.emit(ChatEvent::ExchangeCompleted {
            session_id,
            message_id: exchange.assistant.id,
        });

        Some(CompletedExchange { session_id })
    }

    fn fail(
        &mut self,
        window: &mut HistoryWindow,
        mut exchange: Exchange,
        partial: &str,
        message: String,
    ) {
        tracing::warn!(
            session_id = %exchange.session_id,
            target = ?exchange.target,
            partial_chars = partial.len(),
            error = %message,
            "exchange failed; discarding partial reply"
        );

        let notice = format!("Error: {message}");
        exchange.assistant.content.clone_from(&notice);
        exchange.assistant.status = MessageStatus::Failed(message);

        if let Some(placeholder) = exchange.slot.and_then(|slot| window.get_mut(slot)) {
            placeholder.content.clone_from(&exchange.assistant.content);
            placeholder.status = exchange.assistant.status.clone();
        }

        self.events.emit(ChatEvent::MessageUpdated {
            session_id: exchange.session_id,
            message_id: exchange.assistant.id,
            content: exchange.assistant.content.clone(),
            status: exchange.assistant.status.clone(),
        });
        self.events.emit(ChatEvent::ExchangeFailed {
            session_id: exchange.session_id,
            message_id: exchange.assistant.id,
            notice,
        });
    }

    /// Puts the in-flight placeholder back into `window` when the window was
    /// just reloaded for the exchange's own session.
    pub(crate) fn reattach(&mut self, window: &mut HistoryWindow) {
        let Some(exchange) = self.in_flight.as_mut() else {
            return;
        };
        if window.session_id() != Some(exchange.session_id) {
            return;
        }
        if exchange.slot.is_some_and(|slot| window.get(slot).is_some()) {
            return;
        }

        exchange.slot = Some(window.push(exchange.assistant.clone()));
        tracing::debug!(
            session_id = %exchange.session_id,
            target = ?exchange.target,
            "reattached in-flight reply to the history window"
        );
    }
}
