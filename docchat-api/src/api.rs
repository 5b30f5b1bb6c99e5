use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Copy, Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cited document attached to a completed assistant message.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Source {
    pub document: String,
    /// Relevance score in `[0, 1]`.
    pub relevance: f64,
}

impl Source {
    pub fn new(document: impl Into<String>, relevance: f64) -> Self {
        Self {
            document: document.into(),
            relevance: relevance.clamp(0.0, 1.0),
        }
    }

    /// Clamp an out-of-range score received from the backend.
    pub fn normalized(self) -> Self {
        let relevance = if self.relevance.is_nan() {
            0.0
        } else {
            self.relevance.clamp(0.0, 1.0)
        };
        Self { relevance, ..self }
    }
}

/// One turn in a conversation.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<Source>>,
    #[serde(default, rename = "isStreaming", skip_serializing_if = "is_false")]
    pub is_streaming: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            sources: None,
            is_streaming: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Empty assistant message that tokens will be appended to.
    pub fn streaming_placeholder() -> Self {
        Self {
            is_streaming: true,
            ..Self::new(Role::Assistant, String::new())
        }
    }

    pub fn with_sources(mut self, sources: Vec<Source>) -> Self {
        self.sources = Some(sources);
        self
    }
}

/// Server-assigned conversation identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ConversationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Which knowledge the backend may draw on when answering.
#[derive(Copy, Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatMode {
    #[default]
    Auto,
    DocumentsOnly,
    GeneralKnowledge,
}

impl ChatMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ChatMode::Auto => "auto",
            ChatMode::DocumentsOnly => "documents_only",
            ChatMode::GeneralKnowledge => "general_knowledge",
        }
    }
}

impl fmt::Display for ChatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChatMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(ChatMode::Auto),
            "documents_only" | "documents" | "docs" => Ok(ChatMode::DocumentsOnly),
            "general_knowledge" | "general" => Ok(ChatMode::GeneralKnowledge),
            _ => Err(format!("Unknown chat mode: {}", s)),
        }
    }
}

// ============================================================================
// Conversations
// ============================================================================

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NewConversationResponse {
    pub conversation_id: ConversationId,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: ConversationId,
    #[serde(default)]
    pub preview: String,
    #[serde(default)]
    pub last_updated: Option<String>,
    #[serde(default)]
    pub message_count: usize,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ConversationList {
    pub conversations: Vec<ConversationSummary>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ConversationHistory {
    pub messages: Vec<Message>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SaveConversationRequest {
    pub conversation_id: ConversationId,
    pub preview: String,
    pub history: Vec<Message>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ============================================================================
// Chat stream
// ============================================================================

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StreamRequest {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub mode: ChatMode,
}

impl StreamRequest {
    pub fn new(message: impl Into<String>, conversation_id: Option<ConversationId>, mode: ChatMode) -> Self {
        Self {
            message: message.into(),
            conversation_id,
            mode,
        }
    }
}

/// JSON payload carried by one `data:` frame of the chat stream.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct StreamPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<Source>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
}

// ============================================================================
// Documents, logs, status, models, users
// ============================================================================

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DocumentInfo {
    #[serde(alias = "filename")]
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub chunks: Option<u64>,
    #[serde(default)]
    pub uploaded_at: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DocumentList {
    pub documents: Vec<DocumentInfo>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UploadResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub chunks: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DeleteDocumentRequest {
    pub filename: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct LogFileInfo {
    #[serde(alias = "name")]
    pub filename: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LogList {
    pub logs: Vec<LogFileInfo>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LogContent {
    #[serde(default)]
    pub filename: String,
    pub content: String,
}

/// Backend health report. Fields beyond the known ones are kept verbatim.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SystemStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub document_count: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct OllamaStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub available: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ModelList {
    pub models: Vec<String>,
    #[serde(default)]
    pub current: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SetModelRequest {
    pub model: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct UserInfo {
    pub username: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_names() {
        let mut msg = Message::assistant("Hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "assistant");
        assert!(json.get("isStreaming").is_none());
        assert!(json.get("sources").is_none());

        msg.is_streaming = true;
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["isStreaming"], true);
    }

    #[test]
    fn test_message_without_timestamp_deserializes() {
        let msg: Message = serde_json::from_str(r#"{"role":"user","content":"Hello"}"#).unwrap();
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Hello");
        assert!(!msg.is_streaming);
    }

    #[test]
    fn test_stream_request_omits_missing_conversation() {
        let request = StreamRequest::new("Hi", None, ChatMode::DocumentsOnly);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["mode"], "documents_only");
        assert!(json.get("conversation_id").is_none());
    }

    #[test]
    fn test_chat_mode_from_str() {
        use std::str::FromStr;
        assert_eq!(ChatMode::from_str("docs").unwrap(), ChatMode::DocumentsOnly);
        assert_eq!(ChatMode::from_str("General").unwrap(), ChatMode::GeneralKnowledge);
        assert_eq!(ChatMode::from_str("auto").unwrap(), ChatMode::Auto);
        assert!(ChatMode::from_str("web").is_err());
    }

    #[test]
    fn test_source_normalized_clamps() {
        assert_eq!(Source { document: "a".into(), relevance: 1.7 }.normalized().relevance, 1.0);
        assert_eq!(Source { document: "a".into(), relevance: -0.2 }.normalized().relevance, 0.0);
        assert_eq!(Source::new("b", 0.4).relevance, 0.4);
    }

    #[test]
    fn test_conversation_summary_camel_case() {
        let summary: ConversationSummary = serde_json::from_str(
            r#"{"id":"c1","preview":"Hello","lastUpdated":"2024-01-01","messageCount":4}"#,
        )
        .unwrap();
        assert_eq!(summary.id.as_str(), "c1");
        assert_eq!(summary.message_count, 4);
        assert_eq!(summary.last_updated.as_deref(), Some("2024-01-01"));
    }
}
