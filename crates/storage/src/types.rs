use super::ids::{MessageId, SessionId};

/// Title given to sessions before the title generator has named them.
pub const DEFAULT_SESSION_TITLE: &str = "New Conversation";

/// Storage-local message role, decoupled from the orchestration layer's role enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: SessionId,
    pub title: String,
    pub created_at_unix_millis: u64,
    pub updated_at_unix_millis: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSession {
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub session_id: SessionId,
    pub role: MessageRole,
    pub content: String,
    pub timestamp_unix_millis: u64,
}

/// A message about to be persisted. The id is minted by the caller so that
/// in-memory copies and stored rows share one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub id: MessageId,
    pub role: MessageRole,
    pub content: String,
    pub timestamp_unix_millis: u64,
}
