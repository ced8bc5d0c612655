use std::sync::Arc;

use parlor_llm::{LlmProvider, ProviderMessage, Role as ProviderRole};
use parlor_storage::DEFAULT_SESSION_TITLE;
use snafu::ResultExt;

use crate::dispatcher::ModelSelection;
use crate::error::{ChatResult, ModelSnafu};
use crate::message::{Message, Role};

/// Most recent messages (four exchanges) the title is derived from.
pub const TITLE_WINDOW: usize = 8;
/// Below this many messages there is nothing worth naming.
pub const MIN_TITLE_MESSAGES: usize = 2;

const TITLE_INSTRUCTION: &str = "You name conversations. Read the exchange between a user and an \
assistant and reply with a short, accurate title of at most ten words that captures its topic. \
Reply with the title only.";

pub struct TitleGenerator {
    provider: Arc<dyn LlmProvider>,
    model: ModelSelection,
}

impl TitleGenerator {
    pub fn new(provider: Arc<dyn LlmProvider>, model: ModelSelection) -> Self {
        Self { provider, model }
    }

    /// Names a conversation from its latest messages with one non-streaming
    /// call. Windows below [`MIN_TITLE_MESSAGES`] and empty model output both
    /// yield [`DEFAULT_SESSION_TITLE`]; the former never reaches the model.
    pub async fn generate_title(&self, messages: &[Message]) -> ChatResult<String> {
        if messages.len() < MIN_TITLE_MESSAGES {
            return Ok(DEFAULT_SESSION_TITLE.to_string());
        }

        let start = messages.len().saturating_sub(TITLE_WINDOW);
        let transcript = render_transcript(&messages[start..]);
        let request = self
            .model
            .request(vec![ProviderMessage::new(
                ProviderRole::User,
                format!("Write a title for this conversation:\n\n{transcript}"),
            )])
            .with_preamble(TITLE_INSTRUCTION);

        let output = self
            .provider
            .generate(request)
            .await
            .context(ModelSnafu {
                stage: "generate-title",
            })?;

        let title = output.trim();
        if title.is_empty() {
            return Ok(DEFAULT_SESSION_TITLE.to_string());
        }

        Ok(title.to_string())
    }
}

fn render_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|message| matches!(message.role, Role::User | Role::Assistant))
        .map(|message| format!("{}: {}\n", message.role.label(), message.content))
        .collect()
}
