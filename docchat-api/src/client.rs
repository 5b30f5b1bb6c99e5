use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderValue};
use reqwest::{RequestBuilder, Response};
use serde::{Serialize, de::DeserializeOwned};
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tracing::{Level, event, instrument};

use crate::api::{
    ConversationHistory, ConversationId, ConversationList, ConversationSummary,
    DeleteDocumentRequest, DocumentInfo, DocumentList, LogContent, LogFileInfo, LogList,
    LoginForm, Message, ModelList, NewConversationResponse, OllamaStatus,
    SaveConversationRequest, SetModelRequest, StatusResponse, StreamRequest, SystemStatus,
    TokenResponse, UploadResponse, UserInfo,
};
use crate::error::{ApiError, ApiResult};

pub type BoxedStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// Byte chunks of a streaming response body.
pub type ByteStream = BoxedStream<ApiResult<Bytes>>;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// HTTP client for the document-QA backend.
///
/// Clones share the connection pool and the bearer token, so signing in
/// through one clone authorizes all of them.
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    token: Arc<RwLock<Option<String>>>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: Arc::new(RwLock::new(None)),
        }
    }

    pub fn with_token(self, token: Option<String>) -> Self {
        self.set_token(token);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn set_token(&self, token: Option<String>) {
        if let Ok(mut slot) = self.token.write() {
            *slot = token;
        }
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().ok().and_then(|t| t.clone())
    }

    pub fn has_token(&self) -> bool {
        self.token().is_some()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.token() {
            Some(token) => match HeaderValue::from_str(&format!("Bearer {}", token)) {
                Ok(value) => builder.header(AUTHORIZATION, value),
                Err(_) => {
                    tracing::warn!("Stored access token is not a valid header value; sending unauthenticated");
                    builder
                }
            },
            None => builder,
        }
    }

    async fn check(response: Response) -> ApiResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let url = response.url().path().to_string();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error body".to_string());
        Err(ApiError::from_status(status, &url, body))
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> ApiResult<T> {
        let response = Self::check(self.authorize(builder).send().await?).await?;
        let text = response.text().await?;
        event!(Level::TRACE, response = text);
        Ok(serde_json::from_str::<T>(&text)?)
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        self.send_json(self.client.get(self.url(path))).await
    }

    #[instrument(level = "trace", skip(self, request), fields(json_request = serde_json::to_string(request).unwrap_or_default()))]
    pub async fn post<S, T>(&self, path: &str, request: &S) -> ApiResult<T>
    where
        S: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send_json(self.client.post(self.url(path)).json(request)).await
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn post_empty<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        self.send_json(self.client.post(self.url(path))).await
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        self.send_json(self.client.delete(self.url(path))).await
    }

    /// POST a JSON body and hand back the raw response body as a byte stream.
    #[instrument(level = "trace", skip(self, request), fields(json_request = serde_json::to_string(request).unwrap_or_default()))]
    pub async fn post_stream<S>(&self, path: &str, request: &S) -> ApiResult<ByteStream>
    where
        S: Serialize + ?Sized,
    {
        let builder = self
            .client
            .post(self.url(path))
            .header(ACCEPT, HeaderValue::from_static("text/event-stream"))
            .json(request);
        let response = Self::check(self.authorize(builder).send().await?).await?;
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(ApiError::from));
        Ok(Box::pin(chunks))
    }

    // ------------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------------

    pub async fn create_conversation(&self) -> ApiResult<ConversationId> {
        let response: NewConversationResponse = self.post_empty("/conversations/new").await?;
        Ok(response.conversation_id)
    }

    pub async fn list_conversations(&self) -> ApiResult<Vec<ConversationSummary>> {
        let response: ConversationList = self.get("/conversations").await?;
        Ok(response.conversations)
    }

    pub async fn get_conversation(&self, id: &ConversationId) -> ApiResult<Vec<Message>> {
        let path = format!("/conversations/{}", urlencoding::encode(id.as_str()));
        match self.get::<ConversationHistory>(&path).await {
            Ok(history) => Ok(history.messages),
            Err(ApiError::NotFound(_)) => Err(ApiError::NotFound(id.to_string())),
            Err(e) => Err(e),
        }
    }

    pub async fn save_conversation(&self, request: &SaveConversationRequest) -> ApiResult<StatusResponse> {
        self.post("/conversations/save", request).await
    }

    pub async fn delete_conversation(&self, id: &ConversationId) -> ApiResult<StatusResponse> {
        let path = format!("/conversations/{}", urlencoding::encode(id.as_str()));
        self.delete(&path).await
    }

    pub async fn clear_conversations(&self) -> ApiResult<StatusResponse> {
        self.post_empty("/conversations/clear").await
    }

    // ------------------------------------------------------------------------
    // Chat
    // ------------------------------------------------------------------------

    pub async fn chat_stream(&self, request: &StreamRequest) -> ApiResult<ByteStream> {
        self.post_stream("/chat/stream", request).await
    }

    // ------------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------------

    pub async fn list_documents(&self) -> ApiResult<Vec<DocumentInfo>> {
        let response: DocumentList = self.get("/documents").await?;
        Ok(response.documents)
    }

    #[instrument(level = "debug", skip(self, contents), fields(bytes = contents.len()))]
    pub async fn upload_document(&self, file_name: &str, contents: Vec<u8>) -> ApiResult<UploadResponse> {
        if file_name.is_empty() {
            return Err(ApiError::InvalidRequest("file name must not be empty".to_string()));
        }
        let part = reqwest::multipart::Part::bytes(contents).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);
        self.send_json(self.client.post(self.url("/upload")).multipart(form))
            .await
    }

    pub async fn clear_documents(&self) -> ApiResult<StatusResponse> {
        self.post_empty("/clear_documents").await
    }

    pub async fn clear_all_documents(&self) -> ApiResult<StatusResponse> {
        self.post_empty("/clear_all_documents").await
    }

    pub async fn delete_document(&self, file_name: &str) -> ApiResult<StatusResponse> {
        let request = DeleteDocumentRequest {
            filename: file_name.to_string(),
        };
        self.post("/delete_document", &request).await
    }

    // ------------------------------------------------------------------------
    // Logs
    // ------------------------------------------------------------------------

    pub async fn list_logs(&self) -> ApiResult<Vec<LogFileInfo>> {
        let response: LogList = self.get("/logs").await?;
        Ok(response.logs)
    }

    /// Fetch one log file. Accepts either a JSON `{content}` body or plain text.
    #[instrument(level = "trace", skip(self))]
    pub async fn read_log(&self, file_name: &str) -> ApiResult<LogContent> {
        let path = format!("/logs/{}", urlencoding::encode(file_name));
        let builder = self.client.get(self.url(&path));
        let response = Self::check(self.authorize(builder).send().await?).await?;
        let text = response.text().await?;
        match serde_json::from_str::<LogContent>(&text) {
            Ok(mut log) => {
                if log.filename.is_empty() {
                    log.filename = file_name.to_string();
                }
                Ok(log)
            }
            Err(_) => Ok(LogContent {
                filename: file_name.to_string(),
                content: text,
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Status & models
    // ------------------------------------------------------------------------

    pub async fn status(&self) -> ApiResult<SystemStatus> {
        self.get("/status").await
    }

    pub async fn check_ollama(&self) -> ApiResult<OllamaStatus> {
        self.get("/check_ollama").await
    }

    pub async fn clear_cache(&self) -> ApiResult<StatusResponse> {
        self.post_empty("/clear_cache").await
    }

    pub async fn list_models(&self) -> ApiResult<ModelList> {
        self.get("/models").await
    }

    pub async fn set_model(&self, model: &str) -> ApiResult<StatusResponse> {
        let request = SetModelRequest {
            model: model.to_string(),
        };
        self.post("/set_model", &request).await
    }

    // ------------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------------

    /// Exchange credentials for an access token. The token is not stored on
    /// the client; callers decide where it is persisted.
    #[instrument(level = "debug", skip(self, password))]
    pub async fn login(&self, username: &str, password: &str) -> ApiResult<String> {
        let form = LoginForm {
            username: username.to_string(),
            password: password.to_string(),
        };
        let builder = self.client.post(self.url("/users/login")).form(&form);
        let response = Self::check(builder.send().await?).await?;
        let token: TokenResponse = serde_json::from_str(&response.text().await?)?;
        Ok(token.access_token)
    }

    pub async fn me(&self) -> ApiResult<UserInfo> {
        self.get("/users/me").await
    }
}
