use async_trait::async_trait;
use docchat_api::{ApiClient, ConversationId, ConversationSummary, Message, SaveConversationRequest};
use tracing::instrument;

use super::{ConversationStore, StoreError, StoreResult, conversation_preview};

/// Conversations stored by the backend under `/conversations`.
#[derive(Clone)]
pub struct HttpConversationStore {
    client: ApiClient,
}

impl HttpConversationStore {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ConversationStore for HttpConversationStore {
    async fn create(&self) -> StoreResult<ConversationId> {
        Ok(self.client.create_conversation().await?)
    }

    #[instrument(level = "debug", skip(self))]
    async fn load(&self, id: &ConversationId) -> StoreResult<Vec<Message>> {
        self.client
            .get_conversation(id)
            .await
            .map_err(|e| StoreError::from_api(e, Some(id)))
    }

    #[instrument(level = "debug", skip(self, messages), fields(count = messages.len()))]
    async fn save(&self, id: &ConversationId, messages: &[Message]) -> StoreResult<()> {
        let request = SaveConversationRequest {
            conversation_id: id.clone(),
            preview: conversation_preview(messages),
            history: messages.to_vec(),
        };
        self.client
            .save_conversation(&request)
            .await
            .map_err(|e| StoreError::from_api(e, Some(id)))?;
        Ok(())
    }

    async fn list(&self) -> StoreResult<Vec<ConversationSummary>> {
        Ok(self.client.list_conversations().await?)
    }

    async fn delete(&self, id: &ConversationId) -> StoreResult<()> {
        self.client
            .delete_conversation(id)
            .await
            .map_err(|e| StoreError::from_api(e, Some(id)))?;
        Ok(())
    }

    async fn clear_all(&self) -> StoreResult<()> {
        self.client.clear_conversations().await?;
        Ok(())
    }
}
