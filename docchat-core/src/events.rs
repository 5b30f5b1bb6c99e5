//! Events published by the controller

use docchat_api::{ConversationId, Message, Source};

/// Conversation lifecycle changes, for front ends that show a conversation
/// list.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    /// A fresh conversation was provisioned and made active
    Created(ConversationId),
    /// An existing conversation was loaded and made active
    Selected(ConversationId),
    /// A background save finished
    Saved { id: ConversationId, preview: String },
    Deleted(ConversationId),
    /// Every conversation was removed
    Cleared,
}

/// Progress of the active turn.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// User message appended and placeholder created
    Started { user: Message },
    Token(String),
    Sources(Vec<Source>),
    /// The assistant message as committed to the session
    Completed(Message),
    Failed(String),
    Cancelled,
}

/// How a call to `submit` or `retry` ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Failed(String),
    Cancelled,
    /// Nothing was sent: empty input, a turn already streaming, or nothing
    /// to retry
    Rejected,
    /// The backend refused the stored credentials
    Unauthorized,
}

impl TurnOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TurnOutcome::Completed)
    }
}
