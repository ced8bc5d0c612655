#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use parlor_core::{ChatEvent, EventSink, ModelSelection, SessionController, TitleGenerator};
use parlor_llm::{
    BoxFuture, ChatRequest, LlmProvider, ProviderError, ProviderResult, ProviderStreamHandle,
    StreamEventMapped, StreamEventPayload, StreamTarget, make_event_stream,
};
use parlor_storage::{
    MessageRecord, MessageStore, NewMessage, NewSession, SessionId, SessionRecord, SessionStore,
    SqliteStorage, StorageError, StorageResult,
};
use tempfile::TempDir;
use tokio::sync::{Notify, mpsc};

pub const SCRIPTED_TITLE: &str = "Scripted Title";

pub enum Step {
    Fragment(String),
    Fail(String),
    Done,
    /// Parks the worker until the notify fires or the stream is cancelled.
    Wait(Arc<Notify>),
}

pub enum StreamScript {
    Steps(Vec<Step>),
    RefuseOpen,
}

pub fn fragments(parts: &[&str]) -> StreamScript {
    let mut steps: Vec<Step> = parts
        .iter()
        .map(|part| Step::Fragment((*part).to_string()))
        .collect();
    steps.push(Step::Done);
    StreamScript::Steps(steps)
}

/// Replies `parts`, then blocks until the returned notify fires, then finishes.
pub fn gated(parts: &[&str]) -> (StreamScript, Arc<Notify>) {
    let gate = Arc::new(Notify::new());
    let mut steps: Vec<Step> = parts
        .iter()
        .map(|part| Step::Fragment((*part).to_string()))
        .collect();
    steps.push(Step::Wait(Arc::clone(&gate)));
    steps.push(Step::Done);
    (StreamScript::Steps(steps), gate)
}

#[derive(Default)]
pub struct ScriptedProvider {
    streams: Mutex<VecDeque<StreamScript>>,
    titles: Mutex<VecDeque<Result<String, String>>>,
    stream_requests: Mutex<Vec<ChatRequest>>,
    generate_requests: Mutex<Vec<ChatRequest>>,
    title_gate: Mutex<Option<Arc<Notify>>>,
}

impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_stream(&self, script: StreamScript) {
        self.streams.lock().unwrap().push_back(script);
    }

    pub fn push_title(&self, reply: Result<&str, &str>) {
        self.titles
            .lock()
            .unwrap()
            .push_back(reply.map(str::to_string).map_err(str::to_string));
    }

    /// Holds the next title reply until the returned notify fires.
    pub fn gate_next_title(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.title_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn stream_requests(&self) -> Vec<ChatRequest> {
        self.stream_requests.lock().unwrap().clone()
    }

    pub fn generate_requests(&self) -> Vec<ChatRequest> {
        self.generate_requests.lock().unwrap().clone()
    }
}

fn refused(stage: &'static str, message: String) -> ProviderError {
    ProviderError::UnsupportedProvider {
        stage,
        provider_id: message,
    }
}

impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    fn default_model(&self) -> &str {
        "scripted-model"
    }

    fn generate<'a>(&'a self, request: ChatRequest) -> BoxFuture<'a, ProviderResult<String>> {
        Box::pin(async move {
            self.generate_requests.lock().unwrap().push(request);
            let gate = self.title_gate.lock().unwrap().take();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            let reply = self.titles.lock().unwrap().pop_front();
            match reply {
                Some(Ok(title)) => Ok(title),
                Some(Err(message)) => Err(refused("scripted-generate", message)),
                None => Ok(SCRIPTED_TITLE.to_string()),
            }
        })
    }

    fn stream_chat(
        &self,
        target: StreamTarget,
        request: ChatRequest,
    ) -> ProviderResult<ProviderStreamHandle> {
        self.stream_requests.lock().unwrap().push(request);
        let script = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| fragments(&["ok"]));

        let steps = match script {
            StreamScript::Steps(steps) => steps,
            StreamScript::RefuseOpen => {
                return Err(refused("scripted-open", "stream refused".to_string()));
            }
        };

        let (event_tx, stream, mut cancel_rx) = make_event_stream(target);
        let worker = Box::pin(async move {
            for step in steps {
                let payload = match step {
                    Step::Fragment(text) => StreamEventPayload::Delta(text),
                    Step::Fail(message) => StreamEventPayload::Error(message),
                    Step::Done => StreamEventPayload::Done,
                    Step::Wait(gate) => {
                        tokio::select! {
                            _ = gate.notified() => continue,
                            _ = &mut cancel_rx => return,
                        }
                    }
                };
                if event_tx.send(StreamEventMapped { target, payload }).is_err() {
                    return;
                }
            }
        });

        Ok(ProviderStreamHandle { stream, worker })
    }
}

/// Sqlite store with switchable failures for selected operations.
pub struct FlakyStore {
    pub inner: SqliteStorage,
    failing_message_saves: AtomicUsize,
    failing_message_reads: AtomicUsize,
    failing_deletes: AtomicUsize,
}

impl FlakyStore {
    pub fn fail_message_saves(&self, count: usize) {
        self.failing_message_saves.store(count, Ordering::SeqCst);
    }

    pub fn fail_message_reads(&self, count: usize) {
        self.failing_message_reads.store(count, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, count: usize) {
        self.failing_deletes.store(count, Ordering::SeqCst);
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
            remaining.checked_sub(1)
        })
        .is_ok()
}

fn injected(operation: &str) -> StorageError {
    StorageError::InvariantViolation {
        stage: "injected",
        details: format!("injected {operation} failure"),
    }
}

impl SessionStore for FlakyStore {
    fn create_session(&self, input: NewSession) -> BoxFuture<'_, StorageResult<SessionRecord>> {
        self.inner.create_session(input)
    }

    fn save_session(&self, session: SessionRecord) -> BoxFuture<'_, StorageResult<()>> {
        self.inner.save_session(session)
    }

    fn get_session(
        &self,
        session_id: SessionId,
    ) -> BoxFuture<'_, StorageResult<Option<SessionRecord>>> {
        self.inner.get_session(session_id)
    }

    fn list_sessions(&self) -> BoxFuture<'_, StorageResult<Vec<SessionRecord>>> {
        self.inner.list_sessions()
    }

    fn delete_session(&self, session_id: SessionId) -> BoxFuture<'_, StorageResult<()>> {
        if take_failure(&self.failing_deletes) {
            return Box::pin(async { Err(injected("delete")) });
        }
        self.inner.delete_session(session_id)
    }

    fn update_session_title(
        &self,
        session_id: SessionId,
        title: String,
    ) -> BoxFuture<'_, StorageResult<SessionRecord>> {
        self.inner.update_session_title(session_id, title)
    }
}

impl MessageStore for FlakyStore {
    fn save_message(
        &self,
        session_id: SessionId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        if take_failure(&self.failing_message_saves) {
            return Box::pin(async { Err(injected("message save")) });
        }
        self.inner.save_message(session_id, input)
    }

    fn get_messages(
        &self,
        session_id: SessionId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        if take_failure(&self.failing_message_reads) {
            return Box::pin(async { Err(injected("message read")) });
        }
        self.inner.get_messages(session_id)
    }

    fn clear_messages(&self, session_id: SessionId) -> BoxFuture<'_, StorageResult<u64>> {
        self.inner.clear_messages(session_id)
    }
}

pub async fn open_store() -> (TempDir, Arc<FlakyStore>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conversations.db");
    let inner = SqliteStorage::open(path.to_str().unwrap()).await.unwrap();
    let store = Arc::new(FlakyStore {
        inner,
        failing_message_saves: AtomicUsize::new(0),
        failing_message_reads: AtomicUsize::new(0),
        failing_deletes: AtomicUsize::new(0),
    });
    (dir, store)
}

pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<FlakyStore>,
    pub provider: Arc<ScriptedProvider>,
    pub controller: SessionController,
    pub events: mpsc::UnboundedReceiver<ChatEvent>,
}

impl Harness {
    /// Events emitted since the previous call.
    pub fn drain_events(&mut self) -> Vec<ChatEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn active_id(&self) -> SessionId {
        self.controller.active_session().unwrap().id
    }

    pub async fn stored_messages(&self, session_id: SessionId) -> Vec<MessageRecord> {
        self.store.inner.get_messages(session_id).await.unwrap()
    }
}

pub fn controller_for(
    store: Arc<FlakyStore>,
    provider: Arc<ScriptedProvider>,
) -> (SessionController, mpsc::UnboundedReceiver<ChatEvent>) {
    let (events, rx) = EventSink::channel();
    let titles = TitleGenerator::new(provider.clone(), ModelSelection::new("title-model"));
    let controller = SessionController::new(
        store,
        provider,
        ModelSelection::new("chat-model"),
        titles,
        events,
    );
    (controller, rx)
}

/// A started controller over an empty store.
pub async fn harness() -> Harness {
    let (dir, store) = open_store().await;
    let provider = ScriptedProvider::new();
    let (mut controller, events) = controller_for(store.clone(), provider.clone());
    controller.start().await.unwrap();

    let mut harness = Harness {
        dir,
        store,
        provider,
        controller,
        events,
    };
    harness.drain_events();
    harness
}
