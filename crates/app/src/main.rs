mod settings;
mod terminal;

use std::process::ExitCode;
use std::sync::Arc;

use parlor_core::{ChatError, Command, EventSink, SessionController, TitleGenerator};
use parlor_llm::{ProviderError, create_provider};
use parlor_storage::{SqliteStorage, StorageError};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use settings::{SettingsError, SettingsStore};
use terminal::{HELP, Input, Renderer, parse_input};

#[derive(Debug, Snafu)]
enum AppError {
    #[snafu(display("{source}"))]
    Settings { source: SettingsError },
    #[snafu(display("conversation database at `{path}` could not be prepared: {source}"))]
    Bootstrap { path: String, source: StorageError },
    #[snafu(display("failed to open conversation database on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("invalid provider configuration on `{stage}`: {source}"))]
    Provider {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("failed to activate a conversation on `{stage}`: {source}"))]
    Session {
        stage: &'static str,
        source: ChatError,
    },
    #[snafu(display("failed to read terminal input on `{stage}`: {source}"))]
    Input {
        stage: &'static str,
        source: std::io::Error,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "parlor stopped with an error");
            eprintln!("parlor: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), AppError> {
    let settings_store =
        SettingsStore::load(SettingsStore::default_config_path()).context(SettingsSnafu)?;
    let settings = settings_store
        .resolve_for_startup(|key| std::env::var(key).ok())
        .context(SettingsSnafu)?;
    tracing::debug!(path = %settings_store.config_path().display(), "settings loaded");

    let database_path = settings.storage.resolved_database_path().to_string_lossy().into_owned();
    let storage = SqliteStorage::open(&database_path)
        .await
        .map_err(|source| {
            if source.is_bootstrap() {
                AppError::Bootstrap {
                    path: database_path.clone(),
                    source,
                }
            } else {
                AppError::Storage {
                    stage: "open-database",
                    source,
                }
            }
        })?;
    tracing::info!(database_url = %storage.database_url(), "conversation store ready");

    let chat_provider =
        create_provider(settings.chat.to_provider_config()).context(ProviderSnafu {
            stage: "create-chat-provider",
        })?;
    let assistant = settings.assistant_settings();
    let title_provider =
        create_provider(assistant.to_provider_config()).context(ProviderSnafu {
            stage: "create-assistant-provider",
        })?;

    let (events, mut event_rx) = EventSink::channel();
    let mut controller = SessionController::new(
        Arc::new(storage),
        chat_provider,
        settings.chat.model_selection(),
        TitleGenerator::new(title_provider, assistant.model_selection()),
        events,
    );
    controller.start().await.context(SessionSnafu {
        stage: "start-controller",
    })?;

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let controller_task = tokio::spawn(controller.run(command_rx));
    let render_task = tokio::spawn(async move {
        let mut renderer = Renderer::default();
        let mut stdout = tokio::io::stdout();
        while let Some(event) = event_rx.recv().await {
            let Some(text) = renderer.render(&event) else {
                continue;
            };
            if let Err(error) = stdout.write_all(text.as_bytes()).await {
                tracing::warn!(error = %error, "failed to write to stdout");
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context(InputSnafu {
        stage: "read-stdin",
    })? {
        let command = match parse_input(&line) {
            Ok(Input::Command(command)) => command,
            Ok(Input::Help) => {
                println!("{HELP}");
                continue;
            }
            Ok(Input::Blank) => continue,
            Err(error) => {
                println!("! {error}");
                continue;
            }
        };

        let quitting = command == Command::Shutdown;
        if command_tx.send(command).is_err() || quitting {
            break;
        }
    }

    let _ = command_tx.send(Command::Shutdown);
    if let Err(error) = controller_task.await {
        tracing::error!(error = %error, "session controller task failed");
    }
    if let Err(error) = render_task.await {
        tracing::warn!(error = %error, "render task failed");
    }
    Ok(())
}
