use std::fmt::Write as _;

use parlor_core::{ChatEvent, Command, MessageId, MessageStatus, Role, SessionId};
use parlor_storage::StorageError;
use snafu::{ResultExt, Snafu};

pub const HELP: &str = "\
commands:
  <text>                 send a message
  /new                   start a new conversation
  /list                  list conversations
  /switch <id>           open a conversation
  /delete <id>           delete a conversation
  /rename <id> <title>   rename a conversation
  /clear                 remove every message of the open conversation
  /help                  show this help
  /quit                  exit
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Command(Command),
    Help,
    Blank,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum InputError {
    #[snafu(display("unknown command `/{name}`; try /help"))]
    UnknownCommand { name: String },
    #[snafu(display("`/{command}` needs {argument}"))]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },
    #[snafu(display("`{raw}` is not a conversation id"))]
    InvalidSessionId { raw: String, source: StorageError },
}

pub fn parse_input(line: &str) -> Result<Input, InputError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Input::Blank);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Input::Command(Command::Send(line.to_string())));
    };

    let (name, argument) = match rest.split_once(char::is_whitespace) {
        Some((name, argument)) => (name, argument.trim()),
        None => (rest, ""),
    };

    let command = match name {
        "new" => Command::CreateSession,
        "list" => Command::ListSessions,
        "clear" => Command::ClearConversation,
        "quit" | "exit" => Command::Shutdown,
        "help" => return Ok(Input::Help),
        "switch" => Command::SwitchSession(session_argument("switch", argument)?),
        "delete" => Command::DeleteSession(session_argument("delete", argument)?),
        "rename" => {
            let (raw_id, title) = argument.split_once(char::is_whitespace).ok_or(
                InputError::MissingArgument {
                    command: "rename",
                    argument: "an id and a title",
                },
            )?;
            Command::RenameSession {
                session_id: session_argument("rename", raw_id)?,
                title: title.trim().to_string(),
            }
        }
        other => {
            return UnknownCommandSnafu { name: other }.fail();
        }
    };

    Ok(Input::Command(command))
}

fn session_argument(command: &'static str, raw: &str) -> Result<SessionId, InputError> {
    if raw.is_empty() {
        return MissingArgumentSnafu {
            command,
            argument: "a conversation id",
        }
        .fail();
    }
    SessionId::parse(raw).context(InvalidSessionIdSnafu { raw })
}

/// Turns events into terminal text. Streaming replies are printed as they
/// grow, so only the unseen suffix of each update is written.
#[derive(Debug, Default)]
pub struct Renderer {
    streaming: Option<(MessageId, usize)>,
    active_session: Option<SessionId>,
}

impl Renderer {
    pub fn render(&mut self, event: &ChatEvent) -> Option<String> {
        match event {
            ChatEvent::SessionActivated { session, messages } => {
                self.active_session = Some(session.id);
                self.streaming = None;
                let mut out = format!("== {} ({})\n", session.title, session.id);
                for message in messages {
                    if message.status == MessageStatus::Streaming {
                        // Left open so later updates continue the same line.
                        let _ = write!(out, "{}: {}", speaker(message.role), message.content);
                        self.streaming = Some((message.id, message.content.len()));
                    } else {
                        let _ = writeln!(out, "{}: {}", speaker(message.role), message.content);
                    }
                }
                Some(out)
            }
            ChatEvent::SessionsChanged(sessions) => {
                let mut out = String::from("conversations:\n");
                for session in sessions {
                    let marker = if Some(session.id) == self.active_session {
                        '*'
                    } else {
                        ' '
                    };
                    let _ = writeln!(out, "{marker} {}  {}", session.id, session.title);
                }
                Some(out)
            }
            ChatEvent::MessageAppended {
                session_id,
                message,
            } => {
                if Some(*session_id) != self.active_session || message.role == Role::User {
                    return None;
                }
                self.streaming = Some((message.id, 0));
                Some(format!("{}: ", speaker(message.role)))
            }
            ChatEvent::MessageUpdated {
                session_id,
                message_id,
                content,
                status,
            } => {
                if Some(*session_id) != self.active_session {
                    return None;
                }
                let printed = match self.streaming {
                    Some((id, printed)) if id == *message_id => printed,
                    _ => return None,
                };

                match status {
                    MessageStatus::Streaming => {
                        let unseen = content.get(printed..).unwrap_or_default();
                        self.streaming = Some((*message_id, content.len()));
                        Some(unseen.to_string())
                    }
                    MessageStatus::Done => {
                        self.streaming = None;
                        let unseen = content.get(printed..).unwrap_or_default();
                        Some(format!("{unseen}\n"))
                    }
                    MessageStatus::Failed(_) => {
                        self.streaming = None;
                        Some(format!("\n{content}\n"))
                    }
                }
            }
            ChatEvent::TitleUpdated(session) if Some(session.id) == self.active_session => {
                Some(format!("== {}\n", session.title))
            }
            ChatEvent::StorageFailed { operation, message } => {
                Some(format!("! storage problem during {operation}: {message}\n"))
            }
            ChatEvent::OperationFailed { operation, message } => {
                Some(format!("! {operation} failed: {message}\n"))
            }
            ChatEvent::TitleUpdated(_)
            | ChatEvent::ExchangeStarted { .. }
            | ChatEvent::ExchangeCompleted { .. }
            | ChatEvent::ExchangeFailed { .. } => None,
        }
    }
}

fn speaker(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "you",
        Role::Assistant => "assistant",
    }
}
