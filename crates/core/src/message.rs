use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parlor_llm::{ProviderMessage, Role as ProviderRole};
use parlor_storage::{MessageId, MessageRecord, MessageRole as StorageMessageRole, NewMessage};

/// Speaker of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Label used when a conversation is rendered as plain text.
    pub fn label(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Lifecycle status for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    /// Assistant placeholder whose content still grows with every delta.
    Streaming,
    /// Content is frozen.
    Done,
    /// The exchange failed; content holds the notice shown to the user.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub status: MessageStatus,
    pub timestamp_unix_millis: u64,
}

impl Message {
    pub fn new(
        id: MessageId,
        role: Role,
        content: impl Into<String>,
        status: MessageStatus,
        timestamp_unix_millis: u64,
    ) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            status,
            timestamp_unix_millis,
        }
    }

    /// A finished user message stamped with the next tick of the message clock.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(
            MessageId::new_v7(),
            Role::User,
            content,
            MessageStatus::Done,
            next_message_timestamp(),
        )
    }

    /// An empty assistant placeholder for a starting exchange.
    pub fn assistant_streaming() -> Self {
        Self::new(
            MessageId::new_v7(),
            Role::Assistant,
            String::new(),
            MessageStatus::Streaming,
            next_message_timestamp(),
        )
    }

    pub fn is_done(&self) -> bool {
        matches!(self.status, MessageStatus::Done)
    }

    pub fn from_record(record: MessageRecord) -> Self {
        Self::new(
            record.id,
            storage_role_to_chat(record.role),
            record.content,
            MessageStatus::Done,
            record.timestamp_unix_millis,
        )
    }

    pub fn to_new_record(&self) -> NewMessage {
        NewMessage {
            id: self.id,
            role: chat_role_to_storage(self.role),
            content: self.content.clone(),
            timestamp_unix_millis: self.timestamp_unix_millis,
        }
    }

    pub fn to_provider_message(&self) -> ProviderMessage {
        ProviderMessage::new(chat_role_to_provider(self.role), self.content.clone())
    }
}

static LAST_MESSAGE_TIMESTAMP: AtomicU64 = AtomicU64::new(0);

/// Wall-clock millis, bumped past the previous value so messages created in
/// the same millisecond still order strictly.
pub fn next_message_timestamp() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_u64, |duration| {
            u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
        });

    let mut last = LAST_MESSAGE_TIMESTAMP.load(Ordering::Relaxed);
    loop {
        let next = now.max(last.saturating_add(1));
        match LAST_MESSAGE_TIMESTAMP.compare_exchange_weak(
            last,
            next,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => return next,
            Err(observed) => last = observed,
        }
    }
}

pub fn chat_role_to_provider(role: Role) -> ProviderRole {
    match role {
        Role::System => ProviderRole::System,
        Role::User => ProviderRole::User,
        Role::Assistant => ProviderRole::Assistant,
    }
}

pub fn chat_role_to_storage(role: Role) -> StorageMessageRole {
    match role {
        Role::System => StorageMessageRole::System,
        Role::User => StorageMessageRole::User,
        Role::Assistant => StorageMessageRole::Assistant,
    }
}

pub fn storage_role_to_chat(role: StorageMessageRole) -> Role {
    match role {
        StorageMessageRole::System => Role::System,
        StorageMessageRole::User => Role::User,
        StorageMessageRole::Assistant => Role::Assistant,
    }
}
