//! Conversation persistence
//!
//! [`ConversationStore`] is the seam between the controller and wherever
//! conversations live: the backend ([`HttpConversationStore`]) or process
//! memory ([`MemoryConversationStore`]).

mod http;
mod memory;

pub use http::HttpConversationStore;
pub use memory::MemoryConversationStore;

use async_trait::async_trait;
use docchat_api::{ApiError, ConversationId, ConversationSummary, Message, Role};
use thiserror::Error;

/// Characters of the latest user message used as a conversation preview.
pub const PREVIEW_CHARS: usize = 50;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The conversation does not exist (any more) on the backend.
    #[error("conversation not found: {0}")]
    NotFound(ConversationId),

    #[error("not authenticated")]
    Unauthorized,

    #[error("backend error: {0}")]
    Backend(ApiError),

    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// Map a client error, attributing not-found to `id`.
    pub fn from_api(error: ApiError, id: Option<&ConversationId>) -> Self {
        match (error, id) {
            (ApiError::NotFound(_), Some(id)) => StoreError::NotFound(id.clone()),
            (ApiError::Unauthorized, _) => StoreError::Unauthorized,
            (error, _) => StoreError::Backend(error),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<ApiError> for StoreError {
    fn from(error: ApiError) -> Self {
        StoreError::from_api(error, None)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Provision a new, empty conversation.
    async fn create(&self) -> StoreResult<ConversationId>;

    /// Load a conversation's history. Missing conversations are
    /// [`StoreError::NotFound`].
    async fn load(&self, id: &ConversationId) -> StoreResult<Vec<Message>>;

    /// Store the full message list, replacing what was there.
    async fn save(&self, id: &ConversationId, messages: &[Message]) -> StoreResult<()>;

    /// Summaries, most recently updated first.
    async fn list(&self) -> StoreResult<Vec<ConversationSummary>>;

    async fn delete(&self, id: &ConversationId) -> StoreResult<()>;

    async fn clear_all(&self) -> StoreResult<()>;
}

/// Preview text for a conversation: the start of its latest user message.
pub fn conversation_preview(messages: &[Message]) -> String {
    let Some(message) = messages.iter().rev().find(|m| m.role == Role::User) else {
        return String::new();
    };
    let text = message.content.trim();
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}
