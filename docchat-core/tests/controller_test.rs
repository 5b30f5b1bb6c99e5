use async_trait::async_trait;
use bytes::Bytes;
use config::Settings;
use docchat_api::{ApiError, ApiResult, ChatMode, ChatTransport, StreamRequest, TransportStream};
use docchat_core::{
    ChatController, ConversationEvent, ConversationId, ConversationStore, MemoryConversationStore,
    Message, PreferenceStore, Role, SessionState, Source, StoreError, TurnEvent, TurnOutcome,
};
use futures::channel::mpsc;
use futures::stream;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Scripted transport
// ============================================================================

enum Script {
    /// Body delivered all at once
    Body(Vec<&'static str>),
    /// Body fed by the test through a channel
    Live(mpsc::UnboundedReceiver<ApiResult<Bytes>>),
    /// `send` fails before any chunk
    Fail(ApiError),
}

#[derive(Default)]
struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<StreamRequest>>,
}

impl ScriptedTransport {
    fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    fn live(&self) -> mpsc::UnboundedSender<ApiResult<Bytes>> {
        let (tx, rx) = mpsc::unbounded();
        self.push(Script::Live(rx));
        tx
    }

    fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn send(&self, request: &StreamRequest, cancel: CancellationToken) -> ApiResult<TransportStream> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            Some(Script::Body(frames)) => {
                let chunks: Vec<ApiResult<Bytes>> =
                    frames.into_iter().map(|f| Ok(Bytes::from_static(f.as_bytes()))).collect();
                Ok(TransportStream::new(Box::pin(stream::iter(chunks)), cancel))
            }
            Some(Script::Live(rx)) => Ok(TransportStream::new(Box::pin(rx), cancel)),
            Some(Script::Fail(error)) => Err(error),
            None => panic!("no script left for request {:?}", request.message),
        }
    }
}

fn frame(data: &'static str) -> Bytes {
    Bytes::from_static(data.as_bytes())
}

struct Harness {
    controller: Arc<ChatController>,
    transport: Arc<ScriptedTransport>,
    store: Arc<MemoryConversationStore>,
    preferences: Arc<PreferenceStore>,
}

fn harness_with(store: MemoryConversationStore, settings: Settings) -> Harness {
    harness_with_preferences(store, PreferenceStore::in_memory(settings))
}

fn harness_with_preferences(store: MemoryConversationStore, preferences: PreferenceStore) -> Harness {
    let transport = Arc::new(ScriptedTransport::default());
    let store = Arc::new(store);
    let preferences = Arc::new(preferences);
    let controller = Arc::new(ChatController::new(
        transport.clone(),
        store.clone(),
        preferences.clone(),
    ));
    Harness {
        controller,
        transport,
        store,
        preferences,
    }
}

fn harness() -> Harness {
    harness_with(MemoryConversationStore::new(), Settings::default())
}

async fn wait_for_turn(rx: &mut broadcast::Receiver<TurnEvent>, want: impl Fn(&TurnEvent) -> bool) -> TurnEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.unwrap();
            if want(&event) {
                return event;
            }
        }
    })
    .await
    .expect("turn event not received")
}

fn streaming_count(messages: &[Message]) -> usize {
    messages.iter().filter(|m| m.is_streaming).count()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_completed_turn_concatenates_tokens() {
    let h = harness();
    h.transport.push(Script::Body(vec![
        "data: {\"token\":\"Hi\"}\n\n",
        "data: {\"token\":\" there\"}\n\n",
        "data: {\"done\":true}\n\n",
    ]));

    let outcome = h.controller.submit("Hello").await;
    assert_eq!(outcome, TurnOutcome::Completed);

    let messages = h.controller.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "Hello");
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content, "Hi there");
    assert!(!messages[1].is_streaming);
    assert!(messages[1].sources.is_none());
    assert!(!h.controller.is_streaming());
    assert!(h.controller.error().is_none());
    assert_eq!(h.controller.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_stream_error_offers_retry() {
    let h = harness();
    h.transport.push(Script::Body(vec![
        "data: {\"token\":\"Earlier\"}\n\n",
        "data: {\"done\":true}\n\n",
    ]));
    h.transport.push(Script::Body(vec![
        "data: {\"token\":\"part\"}\n\n",
        "data: {\"error\":\"LLM unavailable\"}\n\n",
    ]));

    assert!(h.controller.submit("first").await.is_completed());
    let before = h.controller.messages();

    let outcome = h.controller.submit("X").await;
    assert_eq!(outcome, TurnOutcome::Failed("LLM unavailable".to_string()));

    let session = h.controller.snapshot();
    assert_eq!(session.error(), Some("LLM unavailable"));
    assert_eq!(session.retry_payload().map(|p| p.message.as_str()), Some("X"));
    assert_eq!(session.state(), SessionState::Errored);
    assert_eq!(streaming_count(session.messages()), 0);
    assert_eq!(&session.messages()[..2], &before[..]);
    assert_eq!(session.messages().last().map(|m| m.content.as_str()), Some("X"));
}

#[tokio::test]
async fn test_cancel_mid_stream_drops_partial_answer() {
    let h = harness();
    let tx = h.transport.live();
    let mut turns = h.controller.subscribe_turns();

    let controller = h.controller.clone();
    let turn = tokio::spawn(async move { controller.submit("Y").await });

    tx.unbounded_send(Ok(frame("data: {\"token\":\"par\"}\n\n"))).unwrap();
    wait_for_turn(&mut turns, |e| matches!(e, TurnEvent::Token(_))).await;

    assert!(h.controller.cancel_current());
    // Anything arriving after the cancel is discarded
    let _ = tx.unbounded_send(Ok(frame("data: {\"token\":\"tial\"}\n\n")));
    let _ = tx.unbounded_send(Ok(frame("data: {\"done\":true}\n\n")));

    assert_eq!(turn.await.unwrap(), TurnOutcome::Cancelled);

    let session = h.controller.snapshot();
    assert!(session.error().is_none());
    assert!(!session.is_streaming());
    assert!(session.retry_payload().is_none());
    assert_eq!(session.messages().len(), 1);
    assert_eq!(session.messages()[0].content, "Y");

    wait_for_turn(&mut turns, |e| matches!(e, TurnEvent::Cancelled)).await;
}

#[tokio::test]
async fn test_missing_conversation_is_replaced() {
    let settings = Settings {
        last_conversation_id: Some("gone".to_string()),
        ..Default::default()
    };
    let h = harness_with(MemoryConversationStore::new(), settings);
    let mut events = h.controller.subscribe();

    let id = h.controller.bootstrap().await.unwrap().unwrap();

    assert_ne!(id.as_str(), "gone");
    assert_eq!(h.controller.conversation_id(), Some(id.clone()));
    assert_eq!(h.preferences.last_conversation(), Some(id.clone()));
    assert!(h.controller.error().is_none());
    assert_eq!(events.recv().await.unwrap(), ConversationEvent::Created(id));
}

// ============================================================================
// Properties
// ============================================================================

#[tokio::test]
async fn test_submit_while_streaming_is_ignored() {
    let h = harness();
    let tx = h.transport.live();
    let mut turns = h.controller.subscribe_turns();

    let controller = h.controller.clone();
    let turn = tokio::spawn(async move { controller.submit("one").await });
    wait_for_turn(&mut turns, |e| matches!(e, TurnEvent::Started { .. })).await;

    let before = h.controller.messages();
    assert_eq!(h.controller.submit("two").await, TurnOutcome::Rejected);
    assert_eq!(h.controller.messages(), before);
    assert_eq!(h.transport.requests().len(), 1);
    assert_eq!(streaming_count(&before), 1);

    tx.unbounded_send(Ok(frame("data: {\"token\":\"ok\",\"done\":true}\n\n"))).unwrap();
    assert_eq!(turn.await.unwrap(), TurnOutcome::Completed);
}

#[tokio::test]
async fn test_retry_without_payload_is_noop() {
    let h = harness();
    assert_eq!(h.controller.retry().await, TurnOutcome::Rejected);
    assert!(h.transport.requests().is_empty());
    assert!(h.controller.messages().is_empty());
}

#[tokio::test]
async fn test_retry_resends_original_text() {
    let h = harness();
    h.transport.push(Script::Fail(ApiError::InvalidRequest("connection reset".into())));
    h.transport.push(Script::Body(vec!["data: {\"token\":\"fine\",\"done\":true}\n\n"]));

    assert!(matches!(h.controller.submit("X").await, TurnOutcome::Failed(_)));
    assert!(h.controller.can_retry());

    assert_eq!(h.controller.retry().await, TurnOutcome::Completed);
    let requests = h.transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].message, "X");
    assert!(h.controller.error().is_none());
    assert!(!h.controller.can_retry());
}

#[tokio::test]
async fn test_completed_turn_is_saved() {
    let h = harness();
    h.transport.push(Script::Body(vec![
        "data: {\"sources\":[{\"document\":\"a.pdf\",\"relevance\":0.9}]}\n\n",
        "data: {\"token\":\"Answer\"}\n\n",
        "data: [DONE]\n\n",
    ]));

    assert!(h.controller.submit("Question").await.is_completed());
    h.controller.flush_saves().await;

    let id = h.controller.conversation_id().unwrap();
    let saved = h.store.load(&id).await.unwrap();
    assert_eq!(saved, h.controller.messages());
    assert_eq!(saved[1].sources, Some(vec![Source::new("a.pdf", 0.9)]));

    let list = h.store.list().await.unwrap();
    assert_eq!(list[0].preview, "Question");
}

#[tokio::test]
async fn test_stream_without_done_completes() {
    let h = harness();
    h.transport.push(Script::Body(vec![
        "data: {\"sources\":[{\"document\":\"b.md\",\"relevance\":0.4}]}\n\n",
        "data: {\"token\":\"tail\"}",
    ]));

    assert!(h.controller.submit("q").await.is_completed());
    let messages = h.controller.messages();
    assert_eq!(messages[1].content, "tail");
    assert_eq!(messages[1].sources, Some(vec![Source::new("b.md", 0.4)]));
}

#[tokio::test]
async fn test_save_failure_is_not_surfaced() {
    let h = harness();
    h.store.set_fail_saves(true);
    h.transport.push(Script::Body(vec!["data: {\"token\":\"a\",\"done\":true}\n\n"]));
    h.transport.push(Script::Body(vec!["data: {\"token\":\"b\",\"done\":true}\n\n"]));

    assert!(h.controller.submit("one").await.is_completed());
    h.controller.flush_saves().await;
    assert!(h.controller.error().is_none());
    assert_eq!(h.controller.messages().len(), 2);

    assert!(h.controller.submit("two").await.is_completed());
    assert_eq!(h.controller.messages().len(), 4);
    assert_eq!(h.store.save_count(), 0);
}

#[tokio::test]
async fn test_submit_provisions_conversation_and_sends_mode() {
    let h = harness();
    h.controller.set_mode(ChatMode::DocumentsOnly);
    h.transport.push(Script::Body(vec!["data: {\"done\":true}\n\n"]));

    h.controller.submit("hi").await;

    let id = h.controller.conversation_id().unwrap();
    let request = &h.transport.requests()[0];
    assert_eq!(request.conversation_id.as_ref(), Some(&id));
    assert_eq!(request.mode, ChatMode::DocumentsOnly);
    assert_eq!(h.preferences.last_conversation(), Some(id));
}

#[tokio::test]
async fn test_unauthorized_stream() {
    let h = harness();
    h.transport.push(Script::Fail(ApiError::Unauthorized));

    assert_eq!(h.controller.submit("secret").await, TurnOutcome::Unauthorized);
    assert_eq!(streaming_count(&h.controller.messages()), 0);
    assert!(h.controller.error().is_some());
}

#[tokio::test]
async fn test_dropped_submit_cancels_turn() {
    let h = harness();
    let _tx = h.transport.live();

    let result = tokio::time::timeout(Duration::from_millis(50), h.controller.submit("slow")).await;
    assert!(result.is_err());

    let session = h.controller.snapshot();
    assert!(!session.is_streaming());
    assert_eq!(session.messages().len(), 1);
    assert!(session.error().is_none());

    h.transport.push(Script::Body(vec!["data: {\"done\":true}\n\n"]));
    assert!(h.controller.submit("again").await.is_completed());
}

#[tokio::test]
async fn test_provisioning_failure_starts_no_turn() {
    let h = harness();
    h.store.set_fail_creates(true);
    let mut turns = h.controller.subscribe_turns();

    let outcome = h.controller.submit("hello").await;
    assert!(matches!(outcome, TurnOutcome::Failed(_)));
    assert!(h.controller.error().is_some());
    assert!(h.controller.messages().is_empty());
    assert!(h.controller.conversation_id().is_none());
    assert!(h.transport.requests().is_empty());
    assert!(turns.try_recv().is_err());

    h.store.set_fail_creates(false);
    h.transport.push(Script::Body(vec!["data: {\"done\":true}\n\n"]));
    assert!(h.controller.submit("hello").await.is_completed());
    assert!(h.controller.error().is_none());
}

#[tokio::test]
async fn test_submit_uses_mode_changed_by_another_process() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.toml");
    let h = harness_with_preferences(MemoryConversationStore::new(), PreferenceStore::load_from(&path));
    h.transport.push(Script::Body(vec!["data: {\"token\":\"a1\",\"done\":true}\n\n"]));
    h.transport.push(Script::Body(vec!["data: {\"token\":\"a2\",\"done\":true}\n\n"]));

    assert!(h.controller.submit("q1").await.is_completed());
    assert_eq!(h.transport.requests()[0].mode, ChatMode::Auto);

    PreferenceStore::load_from(&path).set_mode(ChatMode::DocumentsOnly);

    assert!(h.controller.submit("q2").await.is_completed());
    assert_eq!(h.transport.requests()[1].mode, ChatMode::DocumentsOnly);
    assert_eq!(h.controller.mode(), ChatMode::DocumentsOnly);
}

// ============================================================================
// Conversation switching
// ============================================================================

#[tokio::test]
async fn test_bootstrap_restores_last_conversation_once() {
    let history = vec![Message::user("old question"), Message::assistant("old answer")];
    let store = MemoryConversationStore::new().with_conversation("c1", history.clone());
    let settings = Settings {
        last_conversation_id: Some("c1".to_string()),
        ..Default::default()
    };
    let h = harness_with(store, settings);
    let mut events = h.controller.subscribe();

    let id = h.controller.bootstrap().await.unwrap();
    assert_eq!(id, Some(ConversationId::from("c1")));
    assert_eq!(h.controller.messages(), history);
    assert_eq!(events.recv().await.unwrap(), ConversationEvent::Selected("c1".into()));

    h.controller.bootstrap().await.unwrap();
    assert_eq!(h.store.len(), 1);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_switching_saves_previous_conversation() {
    let other = vec![Message::user("elsewhere")];
    let store = MemoryConversationStore::new().with_conversation("other", other.clone());
    let h = harness_with(store, Settings::default());
    h.transport.push(Script::Body(vec!["data: {\"token\":\"a1\",\"done\":true}\n\n"]));

    h.controller.submit("q1").await;
    let first = h.controller.conversation_id().unwrap();

    let selected = h.controller.select_conversation("other".into()).await.unwrap();
    assert_eq!(selected.as_str(), "other");
    assert_eq!(h.controller.messages(), other);
    assert_eq!(h.preferences.last_conversation(), Some("other".into()));

    h.controller.flush_saves().await;
    let saved = h.store.load(&first).await.unwrap();
    assert_eq!(saved.len(), 2);
    assert_eq!(saved[1].content, "a1");
}

#[tokio::test]
async fn test_deleting_active_conversation_provisions_new_one() {
    let h = harness();
    let first = h.controller.new_conversation().await.unwrap();
    let mut events = h.controller.subscribe();

    h.controller.delete_conversation(&first).await.unwrap();

    assert_eq!(events.recv().await.unwrap(), ConversationEvent::Deleted(first.clone()));
    let next = h.controller.conversation_id().unwrap();
    assert_ne!(next, first);
    assert_eq!(events.recv().await.unwrap(), ConversationEvent::Created(next));
    assert!(!h.store.contains(&first));
}

#[tokio::test]
async fn test_clear_conversations() {
    let store = MemoryConversationStore::new()
        .with_conversation("a", vec![Message::user("a")])
        .with_conversation("b", vec![Message::user("b")]);
    let h = harness_with(store, Settings::default());

    let id = h.controller.clear_conversations().await.unwrap();

    let list = h.controller.list_conversations().await.unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].id, id);
    assert!(h.controller.messages().is_empty());
}

#[tokio::test]
async fn test_bootstrap_retries_after_failure() {
    let history = vec![Message::user("old question"), Message::assistant("old answer")];
    let store = MemoryConversationStore::new().with_conversation("c1", history.clone());
    store.set_unauthorized(true);
    let settings = Settings {
        last_conversation_id: Some("c1".to_string()),
        ..Default::default()
    };
    let h = harness_with(store, settings);

    let err = h.controller.bootstrap().await.unwrap_err();
    assert!(matches!(err, StoreError::Unauthorized));
    assert!(h.controller.conversation_id().is_none());

    // Signed in again
    h.store.set_unauthorized(false);
    let id = h.controller.bootstrap().await.unwrap();
    assert_eq!(id, Some(ConversationId::from("c1")));
    assert_eq!(h.controller.messages(), history);
    assert!(h.controller.error().is_none());
    assert_eq!(h.store.len(), 1);
}

#[tokio::test]
async fn test_switching_mid_stream_cancels_turn() {
    let other = vec![Message::user("elsewhere")];
    let store = MemoryConversationStore::new().with_conversation("other", other.clone());
    let h = harness_with(store, Settings::default());
    let tx = h.transport.live();
    let mut turns = h.controller.subscribe_turns();

    let controller = h.controller.clone();
    let turn = tokio::spawn(async move { controller.submit("Y").await });

    tx.unbounded_send(Ok(frame("data: {\"token\":\"par\"}\n\n"))).unwrap();
    wait_for_turn(&mut turns, |e| matches!(e, TurnEvent::Token(_))).await;
    let first = h.controller.conversation_id().unwrap();

    h.controller.select_conversation("other".into()).await.unwrap();
    let _ = tx.unbounded_send(Ok(frame("data: {\"token\":\"tial\"}\n\n")));
    let _ = tx.unbounded_send(Ok(frame("data: {\"done\":true}\n\n")));

    assert_eq!(turn.await.unwrap(), TurnOutcome::Cancelled);
    wait_for_turn(&mut turns, |e| matches!(e, TurnEvent::Cancelled)).await;

    let session = h.controller.snapshot();
    assert_eq!(session.conversation_id(), Some(&ConversationId::from("other")));
    assert_eq!(session.messages(), &other[..]);
    assert!(!session.is_streaming());
    assert!(session.error().is_none());

    h.controller.flush_saves().await;
    let saved = h.store.load(&first).await.unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].role, Role::User);
    assert_eq!(saved[0].content, "Y");
}
