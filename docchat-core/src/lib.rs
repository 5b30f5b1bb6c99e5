//! Streaming chat session controller
//!
//! - [`Session`]: per-conversation state machine (no I/O)
//! - [`ConversationStore`]: where conversations are provisioned and saved
//! - [`ChatController`]: runs turns against a [`ChatTransport`] and keeps
//!   the session, the store and the preferences in step
//! - [`PreferenceStore`]: settings with change notification
//! - [`AuthContext`]: capabilities of the signed-in user

pub mod auth;
pub mod controller;
pub mod events;
pub mod persistence;
pub mod preferences;
pub mod session;

pub use auth::{AuthContext, AuthError, Authenticator, Capability, CapabilitySet};
pub use controller::ChatController;
pub use events::{ConversationEvent, TurnEvent, TurnOutcome};
pub use persistence::{
    ConversationStore, HttpConversationStore, MemoryConversationStore, StoreError, StoreResult,
    conversation_preview,
};
pub use preferences::PreferenceStore;
pub use session::{RetryPayload, Session, SessionState};

pub use docchat_api::{
    ApiClient, ApiError, ChatMode, ChatTransport, ConversationId, ConversationSummary,
    HttpTransport, Message, Role, Source, StreamEvent, TransportStream,
};
