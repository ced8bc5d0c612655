use std::sync::Arc;
use std::time::Duration;

use parlor_llm::{LlmProvider, StreamTarget};
use parlor_storage::{
    ConversationStore, DEFAULT_SESSION_TITLE, MessageRecord, NewSession, SessionId,
    SessionRecord, StorageError,
};
use snafu::{ResultExt, ensure};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::dispatcher::{ModelSelection, StreamingDispatcher};
use crate::error::{
    ChatError, ChatResult, EmptyTitleSnafu, ExchangeInFlightSnafu, SessionNotFoundSnafu,
    StorageSnafu,
};
use crate::events::{ChatEvent, EventSink, LoopEvent};
use crate::history::HistoryWindow;
use crate::message::Message;
use crate::title::{MIN_TITLE_MESSAGES, TITLE_WINDOW, TitleGenerator};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// User intent forwarded from the presentation surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    CreateSession,
    SwitchSession(SessionId),
    DeleteSession(SessionId),
    RenameSession { session_id: SessionId, title: String },
    ClearConversation,
    ListSessions,
    Shutdown,
}

/// Owns the active session and its history window.
///
/// Every mutation of that state happens through `&mut self`, either from a
/// direct call or from [`SessionController::run`], which serializes commands
/// and background results on one task.
pub struct SessionController {
    store: Arc<dyn ConversationStore>,
    dispatcher: StreamingDispatcher,
    titles: Arc<TitleGenerator>,
    events: EventSink,
    window: HistoryWindow,
    active: Option<SessionRecord>,
    loop_tx: mpsc::UnboundedSender<LoopEvent>,
    loop_rx: mpsc::UnboundedReceiver<LoopEvent>,
    title_tasks: Vec<JoinHandle<()>>,
}

impl SessionController {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        chat_provider: Arc<dyn LlmProvider>,
        chat_model: ModelSelection,
        titles: TitleGenerator,
        events: EventSink,
    ) -> Self {
        let (loop_tx, loop_rx) = mpsc::unbounded_channel();
        let dispatcher = StreamingDispatcher::new(
            Arc::clone(&store),
            chat_provider,
            chat_model,
            events.clone(),
            loop_tx.clone(),
        );

        Self {
            store,
            dispatcher,
            titles: Arc::new(titles),
            events,
            window: HistoryWindow::new(),
            active: None,
            loop_tx,
            loop_rx,
            title_tasks: Vec::new(),
        }
    }

    pub fn active_session(&self) -> Option<&SessionRecord> {
        self.active.as_ref()
    }

    pub fn history(&self) -> &HistoryWindow {
        &self.window
    }

    pub fn exchange_in_flight(&self) -> bool {
        self.dispatcher.is_in_flight()
    }

    /// Activates the most recently updated session, creating one when the
    /// store is empty.
    pub async fn start(&mut self) -> ChatResult<SessionRecord> {
        let session = self.activate_most_recent("start").await?;
        tracing::info!(session_id = %session.id, title = %session.title, "session controller started");
        self.refresh_sessions().await;
        Ok(session)
    }

    pub async fn list_sessions(&self) -> ChatResult<Vec<SessionRecord>> {
        self.store.list_sessions().await.context(StorageSnafu {
            stage: "list-sessions",
        })
    }

    pub async fn create_session(&mut self) -> ChatResult<SessionRecord> {
        self.flush().await?;
        let session = self.create_and_activate("create-session").await?;
        self.refresh_sessions().await;
        Ok(session)
    }

    pub async fn switch_session(&mut self, session_id: SessionId) -> ChatResult<()> {
        let current = self.active_session_id();
        if current == Some(session_id) {
            return Ok(());
        }
        if let Some(current) = current
            && self.dispatcher.in_flight_session() == Some(current)
        {
            return ExchangeInFlightSnafu {
                stage: "switch-session",
                session_id: current,
            }
            .fail();
        }

        let target = self
            .store
            .get_session(session_id)
            .await
            .context(StorageSnafu {
                stage: "switch-session-load-target",
            })?
            .ok_or(ChatError::SessionNotFound {
                stage: "switch-session-load-target",
                session_id,
            })?;

        self.flush().await?;
        let records = self
            .store
            .get_messages(session_id)
            .await
            .context(StorageSnafu {
                stage: "switch-session-load-messages",
            })?;

        tracing::debug!(from = ?current, to = %session_id, message_count = records.len(), "switching session");
        self.activate(target, records);
        Ok(())
    }

    pub async fn delete_session(&mut self, session_id: SessionId) -> ChatResult<()> {
        if self.dispatcher.in_flight_session() == Some(session_id) {
            return ExchangeInFlightSnafu {
                stage: "delete-session",
                session_id,
            }
            .fail();
        }

        let deleting_active = self.active_session_id() == Some(session_id);
        let replacement = if deleting_active {
            self.load_replacement(session_id).await?
        } else {
            None
        };

        self.store
            .delete_session(session_id)
            .await
            .map_err(|source| session_error("delete-session", session_id, source))?;
        tracing::info!(session_id = %session_id, "session deleted");

        if deleting_active {
            // Unsaved messages of the deleted session must never reach flush.
            self.window.clear(session_id);
            match replacement {
                Some((session, records)) => self.activate(session, records),
                None => {
                    if let Err(error) = self.create_and_activate("delete-session-recreate").await
                    {
                        self.active = None;
                        self.refresh_sessions().await;
                        return Err(error);
                    }
                }
            }
        }

        self.refresh_sessions().await;
        Ok(())
    }

    /// The session that takes over once `deleted` is gone, loaded up front so
    /// a failed read leaves the current state untouched.
    async fn load_replacement(
        &self,
        deleted: SessionId,
    ) -> ChatResult<Option<(SessionRecord, Vec<MessageRecord>)>> {
        let stage = "delete-session-load-replacement";
        let sessions = self
            .store
            .list_sessions()
            .await
            .context(StorageSnafu { stage })?;
        let Some(next) = sessions.into_iter().find(|session| session.id != deleted) else {
            return Ok(None);
        };

        let records = self
            .store
            .get_messages(next.id)
            .await
            .context(StorageSnafu { stage })?;
        Ok(Some((next, records)))
    }

    pub async fn rename_session(
        &mut self,
        session_id: SessionId,
        title: &str,
    ) -> ChatResult<SessionRecord> {
        let title = title.trim();
        ensure!(
            !title.is_empty(),
            EmptyTitleSnafu {
                stage: "rename-session"
            }
        );

        let record = self
            .store
            .update_session_title(session_id, title.to_string())
            .await
            .map_err(|source| session_error("rename-session", session_id, source))?;

        self.apply_title(record.clone());
        self.refresh_sessions().await;
        Ok(record)
    }

    /// Drops every message of the active session, in the store and in memory.
    pub async fn clear_conversation(&mut self) -> ChatResult<()> {
        let session = self.require_active("clear-conversation")?.clone();
        if self.dispatcher.in_flight_session() == Some(session.id) {
            return ExchangeInFlightSnafu {
                stage: "clear-conversation",
                session_id: session.id,
            }
            .fail();
        }

        let removed = self
            .store
            .clear_messages(session.id)
            .await
            .context(StorageSnafu {
                stage: "clear-conversation",
            })?;
        tracing::debug!(session_id = %session.id, removed, "conversation cleared");

        self.window.clear(session.id);
        self.events.emit(ChatEvent::SessionActivated {
            session,
            messages: Vec::new(),
        });
        Ok(())
    }

    pub async fn send(&mut self, text: &str) -> ChatResult<StreamTarget> {
        let session_id = self.require_active("send")?.id;
        self.dispatcher.send(&mut self.window, session_id, text).await
    }

    /// Persists finished window messages the store has not acknowledged,
    /// skipping any id already stored.
    pub async fn flush(&mut self) -> ChatResult<usize> {
        let Some(session_id) = self.window.session_id() else {
            return Ok(0);
        };

        let mut flushed = 0;
        for message in self.window.unsaved() {
            match self
                .store
                .save_message(session_id, message.to_new_record())
                .await
            {
                Ok(_) => flushed += 1,
                Err(StorageError::Conflict { .. }) => {
                    tracing::debug!(
                        session_id = %session_id,
                        message_id = %message.id,
                        "message already stored; skipping"
                    );
                }
                Err(source) => {
                    return Err(ChatError::Storage {
                        stage: "flush-window",
                        source,
                    });
                }
            }
            self.window.mark_persisted(message.id);
        }

        if flushed > 0 {
            tracing::debug!(session_id = %session_id, flushed, "flushed unsaved messages");
        }
        Ok(flushed)
    }

    /// Waits for the next background result and applies it. Returns `false`
    /// once no more results can arrive.
    pub async fn process_next(&mut self) -> bool {
        match self.loop_rx.recv().await {
            Some(event) => {
                self.handle_loop_event(event).await;
                true
            }
            None => false,
        }
    }

    /// Applies background results until no exchange is in flight and every
    /// title refresh has landed.
    pub async fn settle(&mut self) {
        loop {
            if self.dispatcher.is_in_flight() {
                if !self.process_next().await {
                    return;
                }
                continue;
            }

            let pending: Vec<_> = self.title_tasks.drain(..).collect();
            if pending.is_empty() {
                while let Ok(event) = self.loop_rx.try_recv() {
                    self.handle_loop_event(event).await;
                }
                if self.title_tasks.is_empty() && !self.dispatcher.is_in_flight() {
                    return;
                }
                continue;
            }

            for task in pending {
                if let Err(error) = task.await {
                    tracing::warn!(error = %error, "title task panicked");
                }
            }
        }
    }

    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.execute(command).await,
                },
                Some(event) = self.loop_rx.recv() => self.handle_loop_event(event).await,
            }
        }

        if self.dispatcher.is_in_flight() {
            tracing::debug!("waiting for the reply in flight before shutdown");
            if tokio::time::timeout(SHUTDOWN_GRACE, self.settle()).await.is_err() {
                tracing::warn!("reply still streaming at shutdown; it will be lost");
            }
        }
        if let Err(error) = self.flush().await {
            tracing::warn!(error = %error, "failed to flush history window on shutdown");
        }
        for task in self.title_tasks.drain(..) {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                tracing::debug!("title task still running at shutdown");
            }
        }
        tracing::debug!("session controller stopped");
    }

    async fn execute(&mut self, command: Command) {
        let (operation, result) = match command {
            Command::Send(text) => ("send", self.send(&text).await.map(|_| ())),
            Command::CreateSession => ("create-session", self.create_session().await.map(|_| ())),
            Command::SwitchSession(session_id) => {
                ("switch-session", self.switch_session(session_id).await)
            }
            Command::DeleteSession(session_id) => {
                ("delete-session", self.delete_session(session_id).await)
            }
            Command::RenameSession { session_id, title } => (
                "rename-session",
                self.rename_session(session_id, &title).await.map(|_| ()),
            ),
            Command::ClearConversation => ("clear-conversation", self.clear_conversation().await),
            Command::ListSessions => {
                self.refresh_sessions().await;
                return;
            }
            Command::Shutdown => return,
        };

        if let Err(error) = result {
            tracing::warn!(operation, error = %error, "command failed");
            self.events.emit(ChatEvent::OperationFailed {
                operation,
                message: error.to_string(),
            });
        }
    }

    async fn handle_loop_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Delta { target, fragment } => {
                self.dispatcher
                    .apply_delta(&mut self.window, target, &fragment);
            }
            LoopEvent::StreamFinished { target, outcome } => {
                let completed = self
                    .dispatcher
                    .finish(&mut self.window, target, outcome)
                    .await;
                if let Some(completed) = completed {
                    self.request_title_refresh(completed.session_id).await;
                    self.refresh_sessions().await;
                }
            }
            LoopEvent::TitleApplied(record) => {
                self.apply_title(record);
                self.refresh_sessions().await;
            }
        }
    }

    async fn request_title_refresh(&mut self, session_id: SessionId) {
        let messages = if self.window.session_id() == Some(session_id) {
            self.window.recent(TITLE_WINDOW)
        } else {
            match self.store.get_messages(session_id).await {
                Ok(records) => {
                    let start = records.len().saturating_sub(TITLE_WINDOW);
                    records
                        .into_iter()
                        .skip(start)
                        .map(Message::from_record)
                        .collect()
                }
                Err(error) => {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %error,
                        "skipping title refresh; messages could not be loaded"
                    );
                    return;
                }
            }
        };

        if messages.len() < MIN_TITLE_MESSAGES {
            return;
        }

        // A generated title only lands if nothing touched the session since.
        let seen_updated_at = match self.store.get_session(session_id).await {
            Ok(Some(session)) => session.updated_at_unix_millis,
            Ok(None) => return,
            Err(error) => {
                tracing::warn!(
                    session_id = %session_id,
                    error = %error,
                    "skipping title refresh; session could not be loaded"
                );
                return;
            }
        };

        let titles = Arc::clone(&self.titles);
        let store = Arc::clone(&self.store);
        let loop_tx = self.loop_tx.clone();

        self.title_tasks.retain(|task| !task.is_finished());
        self.title_tasks.push(tokio::spawn(async move {
            let title = match titles.generate_title(&messages).await {
                Ok(title) if title == DEFAULT_SESSION_TITLE => {
                    tracing::debug!(session_id = %session_id, "title model returned no usable title");
                    return;
                }
                Ok(title) => title,
                Err(error) => {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %error,
                        "title generation failed; keeping previous title"
                    );
                    return;
                }
            };

            match store.get_session(session_id).await {
                Ok(Some(current)) if current.updated_at_unix_millis <= seen_updated_at => {}
                Ok(Some(_)) | Ok(None) => {
                    tracing::debug!(session_id = %session_id, "session changed while titling; dropping generated title");
                    return;
                }
                Err(error) => {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %error,
                        "failed to recheck session before storing title"
                    );
                    return;
                }
            }

            match store.update_session_title(session_id, title).await {
                Ok(record) => {
                    let _ = loop_tx.send(LoopEvent::TitleApplied(record));
                }
                Err(error) => {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %error,
                        "failed to store generated title"
                    );
                }
            }
        }));
    }

    fn apply_title(&mut self, record: SessionRecord) {
        if let Some(active) = self.active.as_mut()
            && active.id == record.id
        {
            *active = record.clone();
        }
        self.events.emit(ChatEvent::TitleUpdated(record));
    }

    fn activate(&mut self, session: SessionRecord, records: Vec<MessageRecord>) {
        self.window.reload(session.id, records);
        self.dispatcher.reattach(&mut self.window);
        self.active = Some(session.clone());
        self.events.emit(ChatEvent::SessionActivated {
            session,
            messages: self.window.messages().to_vec(),
        });
    }

    async fn create_and_activate(&mut self, stage: &'static str) -> ChatResult<SessionRecord> {
        let session = self
            .store
            .create_session(NewSession {
                title: DEFAULT_SESSION_TITLE.to_string(),
            })
            .await
            .context(StorageSnafu { stage })?;

        tracing::debug!(session_id = %session.id, "session created");
        self.activate(session.clone(), Vec::new());
        Ok(session)
    }

    async fn activate_most_recent(&mut self, stage: &'static str) -> ChatResult<SessionRecord> {
        let sessions = self
            .store
            .list_sessions()
            .await
            .context(StorageSnafu { stage })?;

        let Some(latest) = sessions.into_iter().next() else {
            return self.create_and_activate(stage).await;
        };

        let records = self
            .store
            .get_messages(latest.id)
            .await
            .context(StorageSnafu { stage })?;
        self.activate(latest.clone(), records);
        Ok(latest)
    }

    async fn refresh_sessions(&self) {
        match self.store.list_sessions().await {
            Ok(sessions) => self.events.emit(ChatEvent::SessionsChanged(sessions)),
            Err(error) => {
                tracing::warn!(error = %error, "failed to refresh session list");
                self.events.emit(ChatEvent::StorageFailed {
                    operation: "list-sessions",
                    message: error.to_string(),
                });
            }
        }
    }

    fn active_session_id(&self) -> Option<SessionId> {
        self.active.as_ref().map(|session| session.id)
    }

    fn require_active(&self, stage: &'static str) -> ChatResult<&SessionRecord> {
        self.active
            .as_ref()
            .ok_or(ChatError::NoActiveSession { stage })
    }
}

fn session_error(stage: &'static str, session_id: SessionId, source: StorageError) -> ChatError {
    match source {
        StorageError::NotFound { .. } => SessionNotFoundSnafu { stage, session_id }.build(),
        source => ChatError::Storage { stage, source },
    }
}
