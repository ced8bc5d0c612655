use std::sync::Arc;

mod provider;
mod rig_adapter;

pub use provider::{
    BoxFuture, ChatRequest, DeltaRejected, LlmProvider, ProviderConfig, ProviderError,
    ProviderEventStream, ProviderMessage, ProviderResult, ProviderStreamHandle, ProviderWorker,
    Role, StreamEventMapped, StreamEventPayload, StreamOutcome, StreamTarget, make_event_stream,
};
pub use rig_adapter::{DEFAULT_OPENAI_MODEL, RIG_OPENAI_PROVIDER_ID, RigProviderAdapter};

pub fn create_provider(mut config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "openai" | "rig-openai" => {
            config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
            Ok(Arc::new(RigProviderAdapter::new(config)?))
        }
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-provider",
            provider_id: config.provider_id,
        }),
    }
}
