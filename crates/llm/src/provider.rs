use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
    pub default_model: Option<String>,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        default_model: Option<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
            default_model: default_model
                .map(|model| model.trim().to_string())
                .filter(|model| !model.is_empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: String,
}

impl ProviderMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Routing key for one streaming exchange.
///
/// Every stream gets a fresh value so events from an older stream can be
/// told apart from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamTarget(pub u64);

impl StreamTarget {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventPayload {
    Delta(String),
    Done,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEventMapped {
    pub target: StreamTarget,
    pub payload: StreamEventPayload,
}

/// One model call. Both the one-shot and the streaming mode take this shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model_id: String,
    pub messages: Vec<ProviderMessage>,
    pub preamble: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl ChatRequest {
    pub fn new(model_id: impl Into<String>, messages: Vec<ProviderMessage>) -> Self {
        Self {
            model_id: model_id.into(),
            messages,
            preamble: None,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("request for model '{model_id}' has no user or assistant messages"))]
    EmptyMessageSet {
        stage: &'static str,
        model_id: String,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
}

/// Returned by a delta callback to stop consuming the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaRejected {
    pub reason: String,
}

impl DeltaRejected {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// How a consumed stream ended. `partial` is whatever text arrived before
/// the stream stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed(String),
    Failed { partial: String, message: String },
    Aborted { partial: String, reason: String },
}

pub struct ProviderEventStream {
    target: StreamTarget,
    events: mpsc::UnboundedReceiver<StreamEventMapped>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub worker: ProviderWorker,
}

impl ProviderEventStream {
    fn new(
        target: StreamTarget,
        events: mpsc::UnboundedReceiver<StreamEventMapped>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            target,
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn target(&self) -> StreamTarget {
        self.target
    }

    pub async fn recv(&mut self) -> Option<StreamEventMapped> {
        self.events.recv().await
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }

    /// Drives the stream to its end, handing every text fragment to
    /// `on_delta` in arrival order. An `Err` from the callback cancels the
    /// provider worker and ends consumption.
    pub async fn consume<F>(mut self, mut on_delta: F) -> StreamOutcome
    where
        F: FnMut(&str) -> Result<(), DeltaRejected>,
    {
        let mut accumulated = String::new();

        while let Some(event) = self.recv().await {
            if event.target != self.target {
                tracing::debug!(
                    expected = ?self.target,
                    received = ?event.target,
                    "ignoring stream event for another target"
                );
                continue;
            }

            match event.payload {
                StreamEventPayload::Delta(fragment) => {
                    if fragment.is_empty() {
                        continue;
                    }
                    accumulated.push_str(&fragment);
                    if let Err(rejected) = on_delta(&fragment) {
                        self.cancel();
                        return StreamOutcome::Aborted {
                            partial: accumulated,
                            reason: rejected.reason,
                        };
                    }
                }
                StreamEventPayload::Done => return StreamOutcome::Completed(accumulated),
                StreamEventPayload::Error(message) => {
                    return StreamOutcome::Failed {
                        partial: accumulated,
                        message,
                    };
                }
            }
        }

        StreamOutcome::Failed {
            partial: accumulated,
            message: "provider stream ended before a terminal event".to_string(),
        }
    }
}

impl Drop for ProviderEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn default_model(&self) -> &str;
    /// One non-streaming call returning the full reply text.
    fn generate<'a>(&'a self, request: ChatRequest) -> BoxFuture<'a, ProviderResult<String>>;
    /// Opens a stream. The returned worker must be polled (usually spawned)
    /// for events to flow.
    fn stream_chat(
        &self,
        target: StreamTarget,
        request: ChatRequest,
    ) -> ProviderResult<ProviderStreamHandle>;
}

/// Channel pair a provider worker uses to publish events, plus the receiver
/// it watches for cancellation.
pub fn make_event_stream(
    target: StreamTarget,
) -> (
    mpsc::UnboundedSender<StreamEventMapped>,
    ProviderEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ProviderEventStream::new(target, event_rx, cancel_tx),
        cancel_rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(target: StreamTarget, text: &str) -> StreamEventMapped {
        StreamEventMapped {
            target,
            payload: StreamEventPayload::Delta(text.to_string()),
        }
    }

    #[tokio::test]
    async fn consume_reports_fragments_in_order_then_completes() {
        let target = StreamTarget::new(1);
        let (event_tx, stream, _cancel_rx) = make_event_stream(target);
        event_tx.send(delta(target, "Hi")).unwrap();
        event_tx.send(delta(target, " there")).unwrap();
        event_tx
            .send(StreamEventMapped {
                target,
                payload: StreamEventPayload::Done,
            })
            .unwrap();

        let mut seen = Vec::new();
        let outcome = stream
            .consume(|fragment| {
                seen.push(fragment.to_string());
                Ok(())
            })
            .await;

        assert_eq!(seen, vec!["Hi", " there"]);
        assert_eq!(outcome, StreamOutcome::Completed("Hi there".to_string()));
    }

    #[tokio::test]
    async fn consume_skips_events_for_other_targets() {
        let target = StreamTarget::new(2);
        let (event_tx, stream, _cancel_rx) = make_event_stream(target);
        event_tx.send(delta(StreamTarget::new(1), "stale")).unwrap();
        event_tx.send(delta(target, "fresh")).unwrap();
        event_tx
            .send(StreamEventMapped {
                target,
                payload: StreamEventPayload::Done,
            })
            .unwrap();

        let outcome = stream.consume(|_| Ok(())).await;
        assert_eq!(outcome, StreamOutcome::Completed("fresh".to_string()));
    }

    #[tokio::test]
    async fn consume_surfaces_error_with_partial_text() {
        let target = StreamTarget::new(3);
        let (event_tx, stream, _cancel_rx) = make_event_stream(target);
        event_tx.send(delta(target, "Hi")).unwrap();
        event_tx
            .send(StreamEventMapped {
                target,
                payload: StreamEventPayload::Error("connection reset".to_string()),
            })
            .unwrap();

        let outcome = stream.consume(|_| Ok(())).await;
        assert_eq!(
            outcome,
            StreamOutcome::Failed {
                partial: "Hi".to_string(),
                message: "connection reset".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn closed_channel_without_terminal_event_is_a_failure() {
        let target = StreamTarget::new(4);
        let (event_tx, stream, _cancel_rx) = make_event_stream(target);
        event_tx.send(delta(target, "half")).unwrap();
        drop(event_tx);

        let outcome = stream.consume(|_| Ok(())).await;
        assert!(matches!(outcome, StreamOutcome::Failed { partial, .. } if partial == "half"));
    }

    #[tokio::test]
    async fn rejected_delta_cancels_the_worker() {
        let target = StreamTarget::new(5);
        let (event_tx, stream, cancel_rx) = make_event_stream(target);
        event_tx.send(delta(target, "one")).unwrap();
        event_tx.send(delta(target, "two")).unwrap();

        let mut calls = 0;
        let outcome = stream
            .consume(|_| {
                calls += 1;
                Err(DeltaRejected::new("listener gone"))
            })
            .await;

        assert_eq!(calls, 1);
        assert_eq!(
            outcome,
            StreamOutcome::Aborted {
                partial: "one".to_string(),
                reason: "listener gone".to_string(),
            }
        );
        assert!(cancel_rx.await.is_ok());
    }
}
