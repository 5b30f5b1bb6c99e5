use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docchat_api::{ConversationId, ConversationSummary, Message};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::{ConversationStore, StoreError, StoreResult, conversation_preview};

struct ConversationEntry {
    preview: String,
    messages: Vec<Message>,
    updated_at: DateTime<Utc>,
    /// Tie-breaker for entries updated within the same clock tick
    revision: u64,
}

/// In-process conversation store for tests and offline use.
#[derive(Default)]
pub struct MemoryConversationStore {
    conversations: Mutex<HashMap<ConversationId, ConversationEntry>>,
    next_id: AtomicU64,
    revision: AtomicU64,
    fail_saves: AtomicBool,
    fail_creates: AtomicBool,
    unauthorized: AtomicBool,
    save_count: AtomicU64,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an existing conversation.
    pub fn with_conversation(self, id: impl Into<ConversationId>, messages: Vec<Message>) -> Self {
        self.insert(id.into(), messages);
        self
    }

    /// Make every subsequent save fail (or succeed again).
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent create fail (or succeed again).
    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Reject reads and creates as if the session had expired.
    pub fn set_unauthorized(&self, unauthorized: bool) {
        self.unauthorized.store(unauthorized, Ordering::SeqCst);
    }

    fn check_authorized(&self) -> StoreResult<()> {
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(StoreError::Unauthorized);
        }
        Ok(())
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> u64 {
        self.save_count.load(Ordering::SeqCst)
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.entries().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ConversationId, ConversationEntry>> {
        self.conversations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, id: ConversationId, messages: Vec<Message>) {
        let entry = ConversationEntry {
            preview: conversation_preview(&messages),
            messages,
            updated_at: Utc::now(),
            revision: self.revision.fetch_add(1, Ordering::SeqCst),
        };
        self.entries().insert(id, entry);
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn create(&self) -> StoreResult<ConversationId> {
        self.check_authorized()?;
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(StoreError::Other("create rejected".to_string()));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = ConversationId::from_string(format!("conv-{}", n));
        self.insert(id.clone(), Vec::new());
        Ok(id)
    }

    async fn load(&self, id: &ConversationId) -> StoreResult<Vec<Message>> {
        self.check_authorized()?;
        self.entries()
            .get(id)
            .map(|entry| entry.messages.clone())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn save(&self, id: &ConversationId, messages: &[Message]) -> StoreResult<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Other(format!("save rejected for {}", id)));
        }
        self.insert(id.clone(), messages.to_vec());
        self.save_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self) -> StoreResult<Vec<ConversationSummary>> {
        self.check_authorized()?;
        let conversations = self.entries();
        let mut entries: Vec<_> = conversations.iter().collect();
        entries.sort_by(|a, b| b.1.revision.cmp(&a.1.revision));
        Ok(entries
            .into_iter()
            .map(|(id, entry)| ConversationSummary {
                id: id.clone(),
                preview: entry.preview.clone(),
                last_updated: Some(entry.updated_at.to_rfc3339()),
                message_count: entry.messages.len(),
            })
            .collect())
    }

    async fn delete(&self, id: &ConversationId) -> StoreResult<()> {
        self.entries()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn clear_all(&self) -> StoreResult<()> {
        self.entries().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docchat_api::Source;

    #[tokio::test]
    async fn test_save_then_load_roundtrip() {
        let store = MemoryConversationStore::new();
        let id = store.create().await.unwrap();
        let messages = vec![
            Message::user("What is in the report?"),
            Message::assistant("A summary.").with_sources(vec![Source::new("report.pdf", 0.82)]),
        ];

        store.save(&id, &messages).await.unwrap();
        assert_eq!(store.load(&id).await.unwrap(), messages);
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let store = MemoryConversationStore::new();
        let err = store.load(&"nope".into()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_orders_by_recent_update() {
        let store = MemoryConversationStore::new();
        let first = store.create().await.unwrap();
        let second = store.create().await.unwrap();
        store.save(&first, &[Message::user("bump")]).await.unwrap();

        let list = store.list().await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, first);
        assert_eq!(list[0].preview, "bump");
        assert_eq!(list[0].message_count, 1);
        assert_eq!(list[1].id, second);
    }

    #[tokio::test]
    async fn test_failing_saves() {
        let store = MemoryConversationStore::new().with_conversation("c1", vec![]);
        store.set_fail_saves(true);
        assert!(store.save(&"c1".into(), &[Message::user("x")]).await.is_err());
        assert!(store.load(&"c1".into()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_creates_and_unauthorized() {
        let store = MemoryConversationStore::new().with_conversation("c1", vec![]);

        store.set_fail_creates(true);
        assert!(matches!(store.create().await, Err(StoreError::Other(_))));
        assert_eq!(store.len(), 1);
        store.set_fail_creates(false);

        store.set_unauthorized(true);
        assert!(matches!(store.load(&"c1".into()).await, Err(StoreError::Unauthorized)));
        assert!(matches!(store.list().await, Err(StoreError::Unauthorized)));
        store.set_unauthorized(false);
        assert!(store.load(&"c1".into()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let store = MemoryConversationStore::new();
        let a = store.create().await.unwrap();
        store.create().await.unwrap();

        store.delete(&a).await.unwrap();
        assert!(!store.contains(&a));
        assert!(store.delete(&a).await.unwrap_err().is_not_found());

        store.clear_all().await.unwrap();
        assert!(store.is_empty());
    }
}
