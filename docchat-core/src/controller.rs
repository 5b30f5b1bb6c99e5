//! ChatController - drives one chat session against the backend
//!
//! The controller coordinates:
//! - the [`Session`] state machine for the displayed conversation
//! - a [`ChatTransport`] that opens the token stream for each turn
//! - a [`ConversationStore`] for provisioning, loading and saving
//! - the shared [`PreferenceStore`] (active conversation, chat mode)
//!
//! Saves run on a background task in submission order, so a slow save never
//! holds up the next turn. Front ends observe progress through the
//! [`ConversationEvent`] and [`TurnEvent`] broadcast channels.

use docchat_api::{
    ApiError, ChatMode, ChatTransport, ConversationId, ConversationSummary, Message, StreamEvent,
    StreamRequest,
};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::events::{ConversationEvent, TurnEvent, TurnOutcome};
use crate::persistence::{ConversationStore, StoreError, StoreResult, conversation_preview};
use crate::preferences::PreferenceStore;
use crate::session::{Session, SessionState};

const EVENT_CAPACITY: usize = 256;

// ============================================================================
// Background saves
// ============================================================================

enum SaveCommand {
    Save {
        id: ConversationId,
        messages: Vec<Message>,
    },
    /// Reply once every earlier save has finished
    Flush(oneshot::Sender<()>),
}

async fn run_saves(
    store: Arc<dyn ConversationStore>,
    mut rx: mpsc::UnboundedReceiver<SaveCommand>,
    events: broadcast::Sender<ConversationEvent>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            SaveCommand::Save { id, messages } => match store.save(&id, &messages).await {
                Ok(()) => {
                    tracing::debug!(conversation = %id, count = messages.len(), "Conversation saved");
                    let preview = conversation_preview(&messages);
                    let _ = events.send(ConversationEvent::Saved { id, preview });
                }
                Err(e) => {
                    tracing::warn!(conversation = %id, "Failed to save conversation: {}", e);
                }
            },
            SaveCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

// ============================================================================
// ChatController
// ============================================================================

pub struct ChatController {
    session: Mutex<Session>,
    transport: Arc<dyn ChatTransport>,
    store: Arc<dyn ConversationStore>,
    preferences: Arc<PreferenceStore>,
    /// Token of the turn currently streaming
    current_cancel: Mutex<Option<CancellationToken>>,
    /// Held from the start of `submit` until it returns
    turn_active: AtomicBool,
    bootstrapped: AtomicBool,
    save_tx: mpsc::UnboundedSender<SaveCommand>,
    conversation_tx: broadcast::Sender<ConversationEvent>,
    turn_tx: broadcast::Sender<TurnEvent>,
}

/// Releases the turn slot when `submit` ends, including when its future is
/// dropped mid-stream.
struct TurnGuard<'a> {
    controller: &'a ChatController,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        self.controller.cancel_current();
        *self.controller.current_cancel() = None;
        self.controller.turn_active.store(false, Ordering::SeqCst);
    }
}

impl ChatController {
    /// Create a controller with an empty session. Must be called inside a
    /// Tokio runtime (the save worker is spawned here).
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        store: Arc<dyn ConversationStore>,
        preferences: Arc<PreferenceStore>,
    ) -> Self {
        let (save_tx, save_rx) = mpsc::unbounded_channel();
        let (conversation_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (turn_tx, _) = broadcast::channel(EVENT_CAPACITY);

        tokio::spawn(run_saves(store.clone(), save_rx, conversation_tx.clone()));

        Self {
            session: Mutex::new(Session::new()),
            transport,
            store,
            preferences,
            current_cancel: Mutex::new(None),
            turn_active: AtomicBool::new(false),
            bootstrapped: AtomicBool::new(false),
            save_tx,
            conversation_tx,
            turn_tx,
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_cancel(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.current_cancel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ConversationEvent) {
        let _ = self.conversation_tx.send(event);
    }

    fn emit_turn(&self, event: TurnEvent) {
        let _ = self.turn_tx.send(event);
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.conversation_tx.subscribe()
    }

    pub fn subscribe_turns(&self) -> broadcast::Receiver<TurnEvent> {
        self.turn_tx.subscribe()
    }

    /// Copy of the current session.
    pub fn snapshot(&self) -> Session {
        self.session().clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.session().messages().to_vec()
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.session().conversation_id().cloned()
    }

    pub fn state(&self) -> SessionState {
        self.session().state()
    }

    pub fn is_streaming(&self) -> bool {
        self.session().is_streaming()
    }

    pub fn error(&self) -> Option<String> {
        self.session().error().map(str::to_string)
    }

    pub fn can_retry(&self) -> bool {
        self.session().retry_payload().is_some()
    }

    pub fn preferences(&self) -> &Arc<PreferenceStore> {
        &self.preferences
    }

    pub fn mode(&self) -> ChatMode {
        self.preferences.reload();
        self.preferences.mode()
    }

    pub fn set_mode(&self, mode: ChatMode) {
        self.preferences.set_mode(mode);
    }

    // ------------------------------------------------------------------------
    // Turns
    // ------------------------------------------------------------------------

    /// Send `text` as a new turn and stream the answer into the session.
    ///
    /// Returns once the turn has completed, failed or been cancelled.
    /// Ignored while another turn is in flight.
    #[instrument(level = "debug", skip(self, text), fields(len = text.len()))]
    pub async fn submit(&self, text: &str) -> TurnOutcome {
        if text.trim().is_empty() {
            return TurnOutcome::Rejected;
        }
        if self.is_streaming()
            || self
                .turn_active
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            tracing::debug!("Turn already in flight; ignoring submit");
            return TurnOutcome::Rejected;
        }
        let _guard = TurnGuard { controller: self };

        let conversation_id = match self.ensure_conversation().await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("Could not provision a conversation: {}", e);
                let message = format!("Could not start a conversation: {}", e);
                self.session().set_error(message.clone());
                return match e {
                    StoreError::Unauthorized => TurnOutcome::Unauthorized,
                    _ => TurnOutcome::Failed(message),
                };
            }
        };

        let cancel = CancellationToken::new();
        let user = {
            let mut session = self.session();
            if !session.start_turn(text) {
                return TurnOutcome::Rejected;
            }
            *self.current_cancel() = Some(cancel.clone());
            session.last_user_message().cloned()
        };
        if let Some(user) = user {
            self.emit_turn(TurnEvent::Started { user });
        }

        // Another process may have changed the mode since the last turn
        self.preferences.reload();
        let request = StreamRequest::new(text, Some(conversation_id), self.preferences.mode());
        let stream = match self.transport.send(&request, cancel.clone()).await {
            Ok(stream) => stream,
            Err(ApiError::Cancelled) => return self.finish_cancelled(),
            Err(e) => {
                let outcome = if e.is_unauthorized() {
                    TurnOutcome::Unauthorized
                } else {
                    TurnOutcome::Failed(e.to_string())
                };
                return self.fail_turn(text, e.to_string(), &cancel, outcome);
            }
        };

        let mut events = stream.into_events();
        while let Some(event) = events.next().await {
            let mut session = self.session();
            if cancel.is_cancelled() {
                tracing::trace!("Discarding event after cancellation");
                break;
            }
            match event {
                StreamEvent::Token(token) => {
                    session.apply_token(&token);
                    drop(session);
                    self.emit_turn(TurnEvent::Token(token));
                }
                StreamEvent::Sources(sources) => {
                    session.apply_sources(sources.clone());
                    drop(session);
                    self.emit_turn(TurnEvent::Sources(sources));
                }
                StreamEvent::Done { sources } => {
                    session.apply_completion(sources);
                    let answer = session.messages().last().cloned();
                    let messages = session.messages().to_vec();
                    let id = session.conversation_id().cloned();
                    drop(session);

                    if let Some(id) = id {
                        self.queue_save(id, messages);
                    }
                    if let Some(answer) = answer {
                        self.emit_turn(TurnEvent::Completed(answer));
                    }
                    return TurnOutcome::Completed;
                }
                StreamEvent::Error(message) => {
                    drop(session);
                    let outcome = TurnOutcome::Failed(message.clone());
                    return self.fail_turn(text, message, &cancel, outcome);
                }
            }
        }

        self.finish_cancelled()
    }

    fn fail_turn(
        &self,
        text: &str,
        message: String,
        cancel: &CancellationToken,
        outcome: TurnOutcome,
    ) -> TurnOutcome {
        {
            let mut session = self.session();
            if cancel.is_cancelled() {
                return TurnOutcome::Cancelled;
            }
            tracing::warn!("Chat turn failed: {}", message);
            session.apply_error(message.clone());
            session.record_retry(text);
        }
        self.emit_turn(TurnEvent::Failed(message));
        outcome
    }

    fn finish_cancelled(&self) -> TurnOutcome {
        self.cancel_current();
        TurnOutcome::Cancelled
    }

    /// Resend the user text of the last failed turn.
    pub async fn retry(&self) -> TurnOutcome {
        let payload = self.session().retry_payload().cloned();
        match payload {
            Some(payload) => self.submit(&payload.message).await,
            None => TurnOutcome::Rejected,
        }
    }

    /// Stop the streaming turn, if any. The partial answer is dropped and no
    /// error is recorded. Returns whether a turn was cancelled.
    pub fn cancel_current(&self) -> bool {
        {
            let mut session = self.session();
            if !session.is_streaming() {
                return false;
            }
            if let Some(token) = self.current_cancel().take() {
                token.cancel();
            }
            session.cancel();
        }
        tracing::debug!("Turn cancelled");
        self.emit_turn(TurnEvent::Cancelled);
        true
    }

    // ------------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------------

    /// Restore the last active conversation, or provision one. Once this
    /// has succeeded, later calls return the active id. A failed attempt
    /// (for example before sign-in) leaves the next call free to try again.
    pub async fn bootstrap(&self) -> StoreResult<Option<ConversationId>> {
        if self.bootstrapped.swap(true, Ordering::SeqCst) {
            return Ok(self.conversation_id());
        }

        let restored = self.restore_last_conversation().await;
        if let Err(e) = &restored {
            tracing::debug!("Bootstrap failed, will retry on next call: {}", e);
            self.bootstrapped.store(false, Ordering::SeqCst);
        }
        restored.map(Some)
    }

    async fn restore_last_conversation(&self) -> StoreResult<ConversationId> {
        if let Some(id) = self.conversation_id() {
            return Ok(id);
        }
        self.preferences.reload();
        match self.preferences.last_conversation() {
            Some(id) => self.select_conversation(id).await,
            None => self.new_conversation().await,
        }
    }

    /// Make `id` the active conversation. A conversation that no longer
    /// exists is replaced by a fresh one, whose id is returned.
    #[instrument(level = "debug", skip(self))]
    pub async fn select_conversation(&self, id: ConversationId) -> StoreResult<ConversationId> {
        self.leave_current();

        match self.store.load(&id).await {
            Ok(messages) => {
                self.session().replace(Some(id.clone()), messages);
                self.preferences.set_last_conversation(Some(&id));
                self.emit(ConversationEvent::Selected(id.clone()));
                Ok(id)
            }
            Err(e) if e.is_not_found() => {
                tracing::info!(conversation = %id, "Conversation no longer exists; starting a new one");
                self.provision().await
            }
            Err(e) => {
                self.session().set_error(format!("Could not load conversation: {}", e));
                Err(e)
            }
        }
    }

    /// Save the current conversation and start an empty one.
    pub async fn new_conversation(&self) -> StoreResult<ConversationId> {
        self.leave_current();
        self.provision().await
    }

    /// Delete `id`. Deleting the active conversation starts a new one.
    pub async fn delete_conversation(&self, id: &ConversationId) -> StoreResult<()> {
        let active = self.conversation_id().as_ref() == Some(id);
        if active {
            self.cancel_current();
        }
        self.flush_saves().await;

        self.store.delete(id).await?;
        self.emit(ConversationEvent::Deleted(id.clone()));

        if active {
            self.session().replace(None, Vec::new());
            self.provision().await?;
        }
        Ok(())
    }

    /// Delete every conversation and start a new one.
    pub async fn clear_conversations(&self) -> StoreResult<ConversationId> {
        self.cancel_current();
        self.flush_saves().await;

        self.store.clear_all().await?;
        self.emit(ConversationEvent::Cleared);

        self.session().replace(None, Vec::new());
        self.provision().await
    }

    pub async fn list_conversations(&self) -> StoreResult<Vec<ConversationSummary>> {
        self.store.list().await
    }

    /// Wait for every queued save to finish.
    pub async fn flush_saves(&self) {
        let (tx, rx) = oneshot::channel();
        if self.save_tx.send(SaveCommand::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    async fn ensure_conversation(&self) -> StoreResult<ConversationId> {
        let existing = self.session().conversation_id().cloned();
        match existing {
            Some(id) => Ok(id),
            None => self.provision().await,
        }
    }

    /// Obtain a new conversation id from the store and make it active.
    async fn provision(&self) -> StoreResult<ConversationId> {
        let id = match self.store.create().await {
            Ok(id) => id,
            Err(e) => {
                self.session().set_error(format!("Could not start a conversation: {}", e));
                return Err(e);
            }
        };
        tracing::info!(conversation = %id, "Conversation created");

        self.session().set_conversation_id(Some(id.clone()));
        self.preferences.set_last_conversation(Some(&id));
        self.emit(ConversationEvent::Created(id.clone()));
        Ok(id)
    }

    /// Cancel any turn, queue a save of the current messages and clear the
    /// session.
    fn leave_current(&self) {
        self.cancel_current();
        let pending = {
            let mut session = self.session();
            let pending = session
                .conversation_id()
                .cloned()
                .filter(|_| !session.is_empty())
                .map(|id| (id, session.messages().to_vec()));
            session.replace(None, Vec::new());
            pending
        };
        if let Some((id, messages)) = pending {
            self.queue_save(id, messages);
        }
    }

    fn queue_save(&self, id: ConversationId, messages: Vec<Message>) {
        if self
            .save_tx
            .send(SaveCommand::Save { id, messages })
            .is_err()
        {
            tracing::warn!("Save worker stopped; conversation not saved");
        }
    }
}
