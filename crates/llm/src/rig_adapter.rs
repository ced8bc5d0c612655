use futures::StreamExt;
use rig::completion::message::AssistantContent;
use rig::completion::{CompletionModel, CompletionRequestBuilder, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{OptionExt, ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::provider::{
    BoxFuture, ChatRequest, CompletionsFailedSnafu, EmptyMessageSetSnafu, HttpClientSnafu,
    LlmProvider, MissingApiKeySnafu, ProviderConfig, ProviderError, ProviderMessage,
    ProviderResult, ProviderStreamHandle, ProviderWorker, Role, StreamEventMapped,
    StreamEventPayload, StreamTarget, make_event_stream,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

pub struct RigProviderAdapter {
    config: ProviderConfig,
}

impl RigProviderAdapter {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-adapter-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self { config })
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(message: &ProviderMessage) -> Option<RigMessage> {
        match message.role {
            Role::System => None,
            Role::User => Some(RigMessage::user(message.content.clone())),
            Role::Assistant => Some(RigMessage::assistant(message.content.clone())),
        }
    }

    fn merged_preamble(request: &ChatRequest) -> Option<String> {
        let mut preamble_parts = Vec::new();

        if let Some(preamble) = &request.preamble
            && !preamble.trim().is_empty()
        {
            preamble_parts.push(preamble.clone());
        }

        // Rig takes a single preamble, so system turns are folded into it.
        for message in &request.messages {
            if matches!(message.role, Role::System) && !message.content.trim().is_empty() {
                preamble_parts.push(message.content.clone());
            }
        }

        if preamble_parts.is_empty() {
            None
        } else {
            Some(preamble_parts.join("\n\n"))
        }
    }

    /// Splits the conversation into the prompt (last turn) and the history before it.
    fn split_prompt(
        request: &ChatRequest,
        stage: &'static str,
    ) -> ProviderResult<(RigMessage, Vec<RigMessage>)> {
        let mut messages = request
            .messages
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let prompt = messages.pop().context(EmptyMessageSetSnafu {
            stage,
            model_id: request.model_id.clone(),
        })?;

        Ok((prompt, messages))
    }

    fn configure_builder<M>(
        mut builder: CompletionRequestBuilder<M>,
        request: &ChatRequest,
    ) -> CompletionRequestBuilder<M>
    where
        M: CompletionModel,
    {
        if let Some(preamble) = Self::merged_preamble(request) {
            builder = builder.preamble(preamble);
        }

        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature);
        }

        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        builder
    }

    async fn open_stream(
        config: &ProviderConfig,
        target: StreamTarget,
        request: &ChatRequest,
    ) -> ProviderResult<RigStreamingResponse> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(request.model_id.clone());

        let (prompt, history) = match Self::split_prompt(request, "open-stream-split-prompt") {
            Ok(split) => split,
            Err(error) => {
                tracing::warn!(
                    target = ?target,
                    model_id = %request.model_id,
                    total_message_count = request.messages.len(),
                    "cannot open stream because no user/assistant messages remain after filtering"
                );
                return Err(error);
            }
        };

        let builder = model.completion_request(prompt).messages(history);
        Self::configure_builder(builder, request)
            .stream()
            .await
            .context(CompletionsFailedSnafu {
                stage: "open-stream",
            })
    }

    fn emit_error_event(
        event_tx: &mpsc::UnboundedSender<StreamEventMapped>,
        target: StreamTarget,
        error: ProviderError,
    ) {
        let _ = event_tx.send(StreamEventMapped {
            target,
            payload: StreamEventPayload::Error(error.to_string()),
        });
    }

    fn map_stream_item<R>(
        target: StreamTarget,
        item: StreamedAssistantContent<R>,
    ) -> Option<StreamEventMapped>
    where
        R: Clone + Unpin,
    {
        let payload = match item {
            StreamedAssistantContent::Text(text) => StreamEventPayload::Delta(text.text),
            StreamedAssistantContent::Reasoning(_)
            | StreamedAssistantContent::ReasoningDelta { .. }
            | StreamedAssistantContent::ToolCall { .. }
            | StreamedAssistantContent::ToolCallDelta { .. }
            | StreamedAssistantContent::Final(_) => return None,
        };

        Some(StreamEventMapped { target, payload })
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        target: StreamTarget,
        request: ChatRequest,
        event_tx: mpsc::UnboundedSender<StreamEventMapped>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let mut stream = match Self::open_stream(&config, target, &request).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    target = ?target,
                    provider_id = %config.provider_id,
                    model_id = %request.model_id,
                    error = %error,
                    "failed to open provider stream"
                );
                Self::emit_error_event(&event_tx, target, error);
                return;
            }
        };

        let mut cancelled = false;
        let mut stream_failed = false;

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    cancelled = true;
                    tracing::debug!(target = ?target, "provider stream cancelled");
                    stream.cancel();
                    break;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(mapped) = Self::map_stream_item(target, item)
                                && event_tx.send(mapped).is_err()
                            {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            stream_failed = true;
                            tracing::warn!(
                                target = ?target,
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            let error = ProviderError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            Self::emit_error_event(&event_tx, target, error);
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        if !cancelled && !stream_failed {
            let _ = event_tx.send(StreamEventMapped {
                target,
                payload: StreamEventPayload::Done,
            });
        }
    }
}

impl LlmProvider for RigProviderAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        "Rig OpenAI"
    }

    fn default_model(&self) -> &str {
        self.config
            .default_model
            .as_deref()
            .unwrap_or(DEFAULT_OPENAI_MODEL)
    }

    fn generate<'a>(&'a self, request: ChatRequest) -> BoxFuture<'a, ProviderResult<String>> {
        Box::pin(async move {
            let client = Self::build_client(&self.config)?;
            let model = client.completion_model(request.model_id.clone());
            let (prompt, history) = Self::split_prompt(&request, "generate-split-prompt")?;

            let builder = model.completion_request(prompt).messages(history);
            let response = Self::configure_builder(builder, &request)
                .send()
                .await
                .context(CompletionsFailedSnafu {
                    stage: "generate-send",
                })?;

            let text = response
                .choice
                .iter()
                .filter_map(|content| match content {
                    AssistantContent::Text(text) => Some(text.text.as_str()),
                    _ => None,
                })
                .collect::<String>();

            tracing::debug!(
                provider_id = %self.config.provider_id,
                model_id = %request.model_id,
                response_chars = text.len(),
                "one-shot completion finished"
            );

            Ok(text)
        })
    }

    fn stream_chat(
        &self,
        target: StreamTarget,
        request: ChatRequest,
    ) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "stream-chat",
                model_id: request.model_id.clone(),
            }
        );

        let (event_tx, stream, cancel_rx) = make_event_stream(target);
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            target,
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}
