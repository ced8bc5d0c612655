use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod ids;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{MessageId, SessionId};
pub use sqlite::SqliteStorage;
pub use types::{
    DEFAULT_SESSION_TITLE, MessageRecord, MessageRole, NewMessage, NewSession, SessionRecord,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait SessionStore: Send + Sync {
    /// Inserts a session under a fresh id. An id collision is reported as
    /// `Conflict`, never silently merged.
    fn create_session(&self, input: NewSession) -> BoxFuture<'_, StorageResult<SessionRecord>>;
    /// Upsert by id. `created_at` of an existing row is kept and `updated_at`
    /// never moves backwards.
    fn save_session(&self, session: SessionRecord) -> BoxFuture<'_, StorageResult<()>>;
    fn get_session(
        &self,
        session_id: SessionId,
    ) -> BoxFuture<'_, StorageResult<Option<SessionRecord>>>;
    /// Most recently updated first.
    fn list_sessions(&self) -> BoxFuture<'_, StorageResult<Vec<SessionRecord>>>;
    /// Removes the session and every message that belongs to it.
    fn delete_session(&self, session_id: SessionId) -> BoxFuture<'_, StorageResult<()>>;
    fn update_session_title(
        &self,
        session_id: SessionId,
        title: String,
    ) -> BoxFuture<'_, StorageResult<SessionRecord>>;
}

pub trait MessageStore: Send + Sync {
    /// Inserts the message and refreshes the owning session's `updated_at`
    /// in one transaction.
    fn save_message(
        &self,
        session_id: SessionId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>>;
    /// Ordered by timestamp ascending.
    fn get_messages(
        &self,
        session_id: SessionId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>>;
    /// Returns the number of removed rows.
    fn clear_messages(&self, session_id: SessionId) -> BoxFuture<'_, StorageResult<u64>>;
}

pub trait ConversationStore: SessionStore + MessageStore {}

impl<T> ConversationStore for T where T: SessionStore + MessageStore {}
