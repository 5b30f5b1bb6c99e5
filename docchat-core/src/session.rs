//! Working state for one conversation
//!
//! `Session` is a plain state machine: it never performs I/O. The
//! controller feeds it decoded stream events and persists what it produces.
//!
//! ```text
//! Idle --start_turn--> Streaming --apply_completion--> Idle
//! Streaming --apply_error--> Errored
//! Streaming --cancel--> Idle (no error text)
//! Errored --start_turn--> Streaming
//! Idle/Errored --reset--> Idle
//! ```

use docchat_api::{ConversationId, Message, Role, Source};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Streaming,
    Errored,
}

/// User input of the last failed turn, replayed by retry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPayload {
    pub message: String,
}

#[derive(Clone, Debug, Default)]
pub struct Session {
    conversation_id: Option<ConversationId>,
    messages: Vec<Message>,
    is_streaming: bool,
    error: Option<String>,
    retry_payload: Option<RetryPayload>,
    /// Sources seen mid-stream, attached at completion if the terminal
    /// event carries none.
    pending_sources: Option<Vec<Source>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_conversation(conversation_id: ConversationId, messages: Vec<Message>) -> Self {
        Self {
            conversation_id: Some(conversation_id),
            messages,
            ..Self::default()
        }
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.conversation_id.as_ref()
    }

    pub fn set_conversation_id(&mut self, conversation_id: Option<ConversationId>) {
        self.conversation_id = conversation_id;
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_streaming(&self) -> bool {
        self.is_streaming
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn retry_payload(&self) -> Option<&RetryPayload> {
        self.retry_payload.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn state(&self) -> SessionState {
        if self.is_streaming {
            SessionState::Streaming
        } else if self.error.is_some() {
            SessionState::Errored
        } else {
            SessionState::Idle
        }
    }

    /// The in-flight assistant message, if any. Always the last element.
    pub fn streaming_message(&self) -> Option<&Message> {
        self.messages.last().filter(|m| m.is_streaming)
    }

    fn streaming_message_mut(&mut self) -> Option<&mut Message> {
        self.messages.last_mut().filter(|m| m.is_streaming)
    }

    /// Begin a turn. Returns false, changing nothing, if a turn is already
    /// streaming.
    pub fn start_turn(&mut self, user_text: &str) -> bool {
        if self.is_streaming {
            return false;
        }
        self.messages.push(Message::user(user_text));
        self.messages.push(Message::streaming_placeholder());
        self.is_streaming = true;
        self.error = None;
        self.retry_payload = None;
        self.pending_sources = None;
        true
    }

    /// Append a token to the in-flight assistant message.
    pub fn apply_token(&mut self, text: &str) {
        if let Some(message) = self.streaming_message_mut() {
            message.content.push_str(text);
        }
    }

    pub fn apply_sources(&mut self, sources: Vec<Source>) {
        if self.is_streaming {
            self.pending_sources = Some(sources);
        }
    }

    /// Close the in-flight message and attach its sources.
    pub fn apply_completion(&mut self, sources: Option<Vec<Source>>) {
        let sources = sources.or_else(|| self.pending_sources.take());
        if let Some(message) = self.streaming_message_mut() {
            message.is_streaming = false;
            message.sources = sources;
        }
        self.pending_sources = None;
        self.is_streaming = false;
    }

    /// Record a stream failure and drop the partial assistant message.
    pub fn apply_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
        self.end_stream();
    }

    /// Like [`Session::apply_error`] without error text.
    pub fn cancel(&mut self) {
        self.end_stream();
    }

    fn end_stream(&mut self) {
        if self.streaming_message().is_some() {
            self.messages.pop();
        }
        self.pending_sources = None;
        self.is_streaming = false;
    }

    /// Set an error that did not come from a stream (no retry offered).
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    /// Remember `user_text` for retry. Only kept while an error is shown.
    pub fn record_retry(&mut self, user_text: impl Into<String>) {
        if self.error.is_some() {
            self.retry_payload = Some(RetryPayload {
                message: user_text.into(),
            });
        }
    }

    /// Clear messages, error and retry state. The conversation id is kept.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.error = None;
        self.retry_payload = None;
        self.pending_sources = None;
        self.is_streaming = false;
    }

    /// Install a loaded history for `conversation_id`.
    pub fn replace(&mut self, conversation_id: Option<ConversationId>, messages: Vec<Message>) {
        self.reset();
        self.conversation_id = conversation_id;
        self.messages = messages
            .into_iter()
            .map(|mut m| {
                m.is_streaming = false;
                m
            })
            .collect();
    }

    pub fn last_user_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn streaming_count(session: &Session) -> usize {
        session.messages().iter().filter(|m| m.is_streaming).count()
    }

    #[test]
    fn test_start_turn_appends_user_and_placeholder() {
        let mut session = Session::new();
        assert!(session.start_turn("Hello"));

        assert_eq!(session.len(), 2);
        assert_eq!(session.messages()[0].role, Role::User);
        assert_eq!(session.messages()[0].content, "Hello");
        assert!(session.messages()[1].is_streaming);
        assert!(session.messages()[1].content.is_empty());
        assert_eq!(session.state(), SessionState::Streaming);
    }

    #[test]
    fn test_start_turn_rejected_while_streaming() {
        let mut session = Session::new();
        session.start_turn("one");
        session.apply_token("partial");

        assert!(!session.start_turn("two"));
        assert_eq!(session.len(), 2);
        assert_eq!(session.messages()[1].content, "partial");
    }

    #[test]
    fn test_tokens_concatenate_in_order() {
        let mut session = Session::new();
        session.start_turn("q");
        let tokens = ["The", " quick", " brown", "", " fox", "\n", "é"];
        for token in tokens {
            session.apply_token(token);
        }
        session.apply_completion(None);

        assert_eq!(session.messages()[1].content, tokens.concat());
        assert!(!session.is_streaming());
        assert_eq!(streaming_count(&session), 0);
    }

    #[test]
    fn test_apply_token_without_streaming_message_is_noop() {
        let mut session = Session::for_conversation("c".into(), vec![Message::assistant("done")]);
        session.apply_token("extra");
        assert_eq!(session.messages()[0].content, "done");
    }

    #[test]
    fn test_completion_attaches_sources() {
        let mut session = Session::new();
        session.start_turn("q");
        session.apply_sources(vec![Source::new("mid.pdf", 0.3)]);
        session.apply_completion(Some(vec![Source::new("a.pdf", 0.9)]));
        assert_eq!(
            session.messages()[1].sources,
            Some(vec![Source::new("a.pdf", 0.9)])
        );

        session.start_turn("q2");
        session.apply_sources(vec![Source::new("mid.pdf", 0.3)]);
        session.apply_completion(None);
        assert_eq!(
            session.messages()[3].sources,
            Some(vec![Source::new("mid.pdf", 0.3)])
        );
    }

    #[test]
    fn test_error_drops_partial_message() {
        let mut session = Session::new();
        session.start_turn("first");
        session.apply_token("answer");
        session.apply_completion(None);

        session.start_turn("second");
        session.apply_token("half");
        session.apply_error("LLM unavailable");

        assert_eq!(session.len(), 3);
        assert_eq!(session.messages()[1].content, "answer");
        assert_eq!(session.messages()[2].content, "second");
        assert_eq!(session.error(), Some("LLM unavailable"));
        assert_eq!(session.state(), SessionState::Errored);
        assert_eq!(streaming_count(&session), 0);
    }

    #[test]
    fn test_cancel_has_no_error_text() {
        let mut session = Session::new();
        session.start_turn("Y");
        session.apply_token("par");
        session.cancel();

        assert_eq!(session.len(), 1);
        assert_eq!(session.messages()[0].content, "Y");
        assert!(session.error().is_none());
        assert!(!session.is_streaming());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_cancel_never_removes_completed_message() {
        let mut session = Session::new();
        session.start_turn("q");
        session.apply_token("a");
        session.apply_completion(None);

        session.cancel();
        session.apply_error("late");
        assert_eq!(session.len(), 2);
        assert_eq!(session.messages()[1].content, "a");
    }

    #[test]
    fn test_retry_payload_requires_error() {
        let mut session = Session::new();
        session.record_retry("ignored");
        assert!(session.retry_payload().is_none());

        session.start_turn("X");
        session.apply_error("boom");
        session.record_retry("X");
        assert_eq!(
            session.retry_payload(),
            Some(&RetryPayload {
                message: "X".to_string()
            })
        );

        session.start_turn("X");
        assert!(session.retry_payload().is_none());
        assert!(session.error().is_none());
    }

    #[test]
    fn test_reset_keeps_conversation_id() {
        let mut session = Session::for_conversation("c1".into(), vec![Message::user("hi")]);
        session.set_error("oops");
        session.reset();

        assert!(session.is_empty());
        assert!(session.error().is_none());
        assert_eq!(session.conversation_id().map(|id| id.as_str()), Some("c1"));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_replace_clears_streaming_flags() {
        let mut loaded = Message::assistant("stale");
        loaded.is_streaming = true;
        let mut session = Session::new();
        session.replace(Some("c2".into()), vec![Message::user("q"), loaded]);

        assert_eq!(session.len(), 2);
        assert_eq!(streaming_count(&session), 0);
        assert_eq!(session.last_user_message().map(|m| m.content.as_str()), Some("q"));
    }
}
