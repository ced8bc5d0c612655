use parlor_llm::ProviderError;
use parlor_storage::{SessionId, StorageError};
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("storage failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("model call failed on `{stage}`: {source}"))]
    Model {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("message is empty after trimming"))]
    EmptyMessage { stage: &'static str },
    #[snafu(display("session title is empty after trimming"))]
    EmptyTitle { stage: &'static str },
    #[snafu(display("an exchange is already in flight for session {session_id}"))]
    ExchangeInFlight {
        stage: &'static str,
        session_id: SessionId,
    },
    #[snafu(display("session {session_id} does not exist"))]
    SessionNotFound {
        stage: &'static str,
        session_id: SessionId,
    },
    #[snafu(display("no session is active"))]
    NoActiveSession { stage: &'static str },
    #[snafu(display("history window holds {window:?}, not session {session_id}"))]
    WindowMismatch {
        stage: &'static str,
        session_id: SessionId,
        window: Option<SessionId>,
    },
}

pub type ChatResult<T> = Result<T, ChatError>;
