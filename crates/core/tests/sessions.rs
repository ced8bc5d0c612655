mod support;

use parlor_core::{ChatError, ChatEvent, MessageStatus, SessionId};
use parlor_storage::{
    DEFAULT_SESSION_TITLE, MessageRole, MessageStore, NewMessage, NewSession, SessionStore,
};
use support::{ScriptedProvider, controller_for, fragments, gated, harness, open_store};

async fn session_ids(harness: &support::Harness) -> Vec<SessionId> {
    harness
        .controller
        .list_sessions()
        .await
        .unwrap()
        .into_iter()
        .map(|session| session.id)
        .collect()
}

#[tokio::test]
async fn start_on_empty_store_creates_a_default_session() {
    let harness = harness().await;

    let sessions = harness.controller.list_sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].title, DEFAULT_SESSION_TITLE);
    assert_eq!(harness.active_id(), sessions[0].id);
    assert!(harness.controller.history().is_empty());
}

#[tokio::test]
async fn start_activates_the_most_recent_session_with_its_history() {
    let (_dir, store) = open_store().await;
    let older = store
        .inner
        .create_session(NewSession {
            title: "older".to_string(),
        })
        .await
        .unwrap();
    let newer = store
        .inner
        .create_session(NewSession {
            title: "newer".to_string(),
        })
        .await
        .unwrap();
    store
        .inner
        .save_message(
            newer.id,
            NewMessage {
                id: parlor_core::MessageId::new_v7(),
                role: MessageRole::User,
                content: "remember me".to_string(),
                timestamp_unix_millis: 10,
            },
        )
        .await
        .unwrap();

    let (mut controller, mut events) = controller_for(store, ScriptedProvider::new());
    let active = controller.start().await.unwrap();

    assert_eq!(active.id, newer.id);
    assert_ne!(active.id, older.id);
    assert_eq!(controller.history().len(), 1);
    assert_eq!(controller.history().messages()[0].content, "remember me");
    assert!(matches!(
        events.try_recv().unwrap(),
        ChatEvent::SessionActivated { session, messages } if session.id == newer.id && messages.len() == 1
    ));
}

#[tokio::test]
async fn switching_to_the_active_session_does_nothing() {
    let mut harness = harness().await;
    let active = harness.active_id();

    harness.controller.switch_session(active).await.unwrap();
    assert!(harness.drain_events().is_empty());
}

#[tokio::test]
async fn switching_loads_the_target_history() {
    let mut harness = harness().await;
    let first = harness.active_id();
    harness.controller.send("in first").await.unwrap();
    harness.controller.settle().await;

    let second = harness.controller.create_session().await.unwrap();
    assert!(harness.controller.history().is_empty());

    harness.controller.switch_session(first).await.unwrap();
    assert_eq!(harness.active_id(), first);
    let contents: Vec<&str> = harness
        .controller
        .history()
        .messages()
        .iter()
        .map(|message| message.content.as_str())
        .collect();
    assert_eq!(contents, vec!["in first", "ok"]);

    harness.controller.switch_session(second.id).await.unwrap();
    assert!(harness.controller.history().is_empty());
}

#[tokio::test]
async fn switching_to_a_missing_session_fails() {
    let mut harness = harness().await;
    let active = harness.active_id();

    let error = harness
        .controller
        .switch_session(SessionId::new_v7())
        .await
        .unwrap_err();
    assert!(matches!(error, ChatError::SessionNotFound { .. }));
    assert_eq!(harness.active_id(), active);
}

#[tokio::test]
async fn switching_away_from_a_streaming_session_is_refused() {
    let mut harness = harness().await;
    let first = harness.active_id();
    let other = harness
        .store
        .inner
        .create_session(NewSession {
            title: "other".to_string(),
        })
        .await
        .unwrap();
    let (script, gate) = gated(&["x"]);
    harness.provider.push_stream(script);
    harness.controller.send("hello").await.unwrap();

    let error = harness
        .controller
        .switch_session(other.id)
        .await
        .unwrap_err();
    assert!(matches!(error, ChatError::ExchangeInFlight { session_id, .. } if session_id == first));
    assert_eq!(harness.active_id(), first);

    gate.notify_one();
    harness.controller.settle().await;
    harness.controller.switch_session(other.id).await.unwrap();
}

#[tokio::test]
async fn reply_lands_in_its_own_session_after_creating_another() {
    let mut harness = harness().await;
    let first = harness.active_id();
    let (script, gate) = gated(&["Hi"]);
    harness.provider.push_stream(script);
    harness.controller.send("hello").await.unwrap();

    let second = harness.controller.create_session().await.unwrap();
    gate.notify_one();
    harness.controller.settle().await;

    assert_eq!(harness.active_id(), second.id);
    assert!(harness.controller.history().is_empty());
    assert!(harness.stored_messages(second.id).await.is_empty());

    let stored = harness.stored_messages(first).await;
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[1].role, MessageRole::Assistant);
    assert_eq!(stored[1].content, "Hi");
}

#[tokio::test]
async fn switching_back_reattaches_the_streaming_reply() {
    let mut harness = harness().await;
    let first = harness.active_id();
    let (script, gate) = gated(&["Hi"]);
    harness.provider.push_stream(script);
    harness.controller.send("hello").await.unwrap();
    // Let the first fragment land before leaving.
    assert!(harness.controller.process_next().await);

    harness.controller.create_session().await.unwrap();
    harness.controller.switch_session(first).await.unwrap();

    let window = harness.controller.history().messages();
    assert_eq!(window.len(), 2);
    assert_eq!(window[0].content, "hello");
    assert_eq!(window[1].content, "Hi");
    assert_eq!(window[1].status, MessageStatus::Streaming);

    gate.notify_one();
    harness.controller.settle().await;

    let window = harness.controller.history().messages();
    assert_eq!(window.len(), 2);
    assert!(window[1].is_done());
    assert_eq!(harness.stored_messages(first).await.len(), 2);
}

#[tokio::test]
async fn sessions_list_most_recent_first_and_a_reply_moves_a_session_up() {
    let mut harness = harness().await;
    let first = harness.active_id();
    let second = harness.controller.create_session().await.unwrap().id;
    assert_eq!(session_ids(&harness).await, vec![second, first]);

    harness.controller.switch_session(first).await.unwrap();
    harness.controller.send("bump").await.unwrap();
    harness.controller.settle().await;

    assert_eq!(session_ids(&harness).await, vec![first, second]);
    let events = harness.drain_events();
    assert!(matches!(
        events
            .iter()
            .rev()
            .find(|event| matches!(event, ChatEvent::SessionsChanged(_))),
        Some(ChatEvent::SessionsChanged(sessions)) if sessions[0].id == first
    ));
}

#[tokio::test]
async fn deleting_the_active_session_activates_the_next_most_recent() {
    let mut harness = harness().await;
    let first = harness.active_id();
    let second = harness.controller.create_session().await.unwrap().id;

    harness.controller.delete_session(second).await.unwrap();

    assert_eq!(harness.active_id(), first);
    assert_eq!(session_ids(&harness).await, vec![first]);
}

#[tokio::test]
async fn deleting_the_last_session_creates_a_fresh_one() {
    let mut harness = harness().await;
    let only = harness.active_id();
    harness.controller.send("hello").await.unwrap();
    harness.controller.settle().await;

    harness.controller.delete_session(only).await.unwrap();

    let ids = session_ids(&harness).await;
    assert_eq!(ids.len(), 1);
    assert_ne!(ids[0], only);
    assert_eq!(harness.active_id(), ids[0]);
    assert!(harness.controller.history().is_empty());
    assert!(harness.stored_messages(only).await.is_empty());
}

#[tokio::test]
async fn deleting_another_session_keeps_the_active_one() {
    let mut harness = harness().await;
    let first = harness.active_id();
    let second = harness.controller.create_session().await.unwrap().id;
    harness.controller.send("keep").await.unwrap();
    harness.controller.settle().await;

    harness.controller.delete_session(first).await.unwrap();

    assert_eq!(harness.active_id(), second);
    assert_eq!(harness.controller.history().len(), 2);
    assert_eq!(session_ids(&harness).await, vec![second]);
}

#[tokio::test]
async fn deleting_the_streaming_session_is_refused() {
    let mut harness = harness().await;
    let first = harness.active_id();
    let (script, gate) = gated(&[]);
    harness.provider.push_stream(script);
    harness.controller.send("hello").await.unwrap();

    let error = harness.controller.delete_session(first).await.unwrap_err();
    assert!(matches!(error, ChatError::ExchangeInFlight { .. }));
    assert!(harness.controller.list_sessions().await.unwrap().len() == 1);

    gate.notify_one();
    harness.controller.settle().await;
}

#[tokio::test]
async fn failed_delete_leaves_state_untouched() {
    let mut harness = harness().await;
    let first = harness.active_id();
    harness.controller.send("hello").await.unwrap();
    harness.controller.settle().await;
    harness.store.fail_deletes(1);

    let error = harness.controller.delete_session(first).await.unwrap_err();
    assert!(matches!(error, ChatError::Storage { .. }));
    assert_eq!(harness.active_id(), first);
    assert_eq!(harness.controller.history().len(), 2);
    assert_eq!(session_ids(&harness).await, vec![first]);
}

#[tokio::test]
async fn unreadable_replacement_keeps_the_deleted_session_usable() {
    let mut harness = harness().await;
    let first = harness.active_id();
    let second = harness.controller.create_session().await.unwrap().id;
    harness.store.fail_message_saves(1);
    harness.controller.send("unsaved").await.unwrap();
    harness.controller.settle().await;
    assert_eq!(harness.stored_messages(second).await.len(), 1);
    harness.store.fail_message_reads(1);

    let error = harness.controller.delete_session(second).await.unwrap_err();
    assert!(matches!(error, ChatError::Storage { .. }));
    assert_eq!(harness.active_id(), second);
    assert_eq!(harness.controller.history().len(), 2);
    assert!(session_ids(&harness).await.contains(&second));

    harness.controller.delete_session(second).await.unwrap();
    assert_eq!(harness.active_id(), first);
    assert_eq!(harness.controller.history().session_id(), Some(first));
    assert!(harness.controller.history().is_empty());

    harness.controller.send("still here").await.unwrap();
    harness.controller.settle().await;
    assert_eq!(harness.stored_messages(first).await.len(), 2);
    let third = harness.controller.create_session().await.unwrap().id;
    harness.controller.switch_session(first).await.unwrap();
    assert_eq!(harness.active_id(), first);
    assert_ne!(third, first);
}

#[tokio::test]
async fn failed_switch_leaves_state_untouched() {
    let mut harness = harness().await;
    let first = harness.active_id();
    harness.controller.send("hello").await.unwrap();
    harness.controller.settle().await;
    let other = harness
        .store
        .inner
        .create_session(NewSession {
            title: "other".to_string(),
        })
        .await
        .unwrap();
    harness.store.fail_message_reads(1);

    let error = harness
        .controller
        .switch_session(other.id)
        .await
        .unwrap_err();
    assert!(matches!(error, ChatError::Storage { .. }));
    assert_eq!(harness.active_id(), first);
    assert_eq!(harness.controller.history().len(), 2);
    assert_eq!(harness.controller.history().session_id(), Some(first));
}

#[tokio::test]
async fn rename_trims_and_rejects_blank_titles() {
    let mut harness = harness().await;
    let active = harness.active_id();

    let renamed = harness
        .controller
        .rename_session(active, "  Trip planning  ")
        .await
        .unwrap();
    assert_eq!(renamed.title, "Trip planning");
    assert_eq!(harness.controller.active_session().unwrap().title, "Trip planning");
    assert!(
        harness
            .drain_events()
            .iter()
            .any(|event| matches!(event, ChatEvent::TitleUpdated(session) if session.title == "Trip planning"))
    );

    let error = harness
        .controller
        .rename_session(active, "   ")
        .await
        .unwrap_err();
    assert!(matches!(error, ChatError::EmptyTitle { .. }));

    let error = harness
        .controller
        .rename_session(SessionId::new_v7(), "ghost")
        .await
        .unwrap_err();
    assert!(matches!(error, ChatError::SessionNotFound { .. }));
}

#[tokio::test]
async fn clearing_removes_messages_but_keeps_the_session() {
    let mut harness = harness().await;
    let active = harness.active_id();
    harness.provider.push_stream(fragments(&["reply"]));
    harness.controller.send("hello").await.unwrap();
    harness.controller.settle().await;

    harness.controller.clear_conversation().await.unwrap();

    assert!(harness.controller.history().is_empty());
    assert!(harness.stored_messages(active).await.is_empty());
    assert_eq!(session_ids(&harness).await, vec![active]);

    harness.controller.send("fresh start").await.unwrap();
    harness.controller.settle().await;
    let requests = harness.provider.stream_requests();
    assert_eq!(requests.last().unwrap().messages.len(), 1);
}
