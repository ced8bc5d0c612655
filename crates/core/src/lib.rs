pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod history;
pub mod message;
pub mod title;

pub use controller::{Command, SessionController};
pub use dispatcher::{ModelSelection, StreamingDispatcher};
pub use error::{ChatError, ChatResult};
pub use events::{ChatEvent, EventSink};
pub use history::{HistoryWindow, MessageSlot};
pub use message::{Message, MessageStatus, Role};
pub use parlor_storage::{MessageId, SessionId, SessionRecord};
pub use title::{MIN_TITLE_MESSAGES, TITLE_WINDOW, TitleGenerator};
