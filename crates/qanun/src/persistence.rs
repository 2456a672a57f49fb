//! Conversation persistence boundary.
//!
//! The pipeline consumes this interface but does not own conversation
//! storage; a host application plugs in its own implementation. `NotFound`
//! is the signal the recovery controller reacts to; everything else is a
//! terminal store failure.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced conversation does not exist (deleted or never created).
    #[error("conversation not found")]
    NotFound,
    #[error("conversation store backend failure")]
    Backend(#[source] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: Role,
    pub content: String,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create a fresh conversation and return its id.
    async fn start_conversation(&self) -> Result<i64, StoreError>;

    async fn append_message(
        &self,
        conversation_id: i64,
        role: Role,
        content: &str,
    ) -> Result<(), StoreError>;

    async fn read_messages(&self, conversation_id: i64) -> Result<Vec<StoredMessage>, StoreError>;
}

/// In-memory reference implementation, for embedding hosts without a
/// database and for tests.
#[derive(Default)]
pub struct InMemoryStore {
    next_id: AtomicI64,
    conversations: RwLock<HashMap<i64, Vec<StoredMessage>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            conversations: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn start_conversation(&self) -> Result<i64, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.conversations.write().insert(id, Vec::new());
        tracing::debug!(conversation_id = id, "Conversation created");
        Ok(id)
    }

    async fn append_message(
        &self,
        conversation_id: i64,
        role: Role,
        content: &str,
    ) -> Result<(), StoreError> {
        let mut conversations = self.conversations.write();
        let messages = conversations
            .get_mut(&conversation_id)
            .ok_or(StoreError::NotFound)?;
        messages.push(StoredMessage {
            role,
            content: content.to_string(),
        });
        Ok(())
    }

    async fn read_messages(&self, conversation_id: i64) -> Result<Vec<StoredMessage>, StoreError> {
        self.conversations
            .read()
            .get(&conversation_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_and_read_round_trip() {
        let store = InMemoryStore::new();
        let id = store.start_conversation().await.unwrap();
        store.append_message(id, Role::User, "question").await.unwrap();
        store
            .append_message(id, Role::Assistant, "réponse")
            .await
            .unwrap();

        let messages = store.read_messages(id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].content, "réponse");
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let store = InMemoryStore::new();
        assert!(matches!(
            store.read_messages(42).await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store.append_message(42, Role::User, "x").await,
            Err(StoreError::NotFound)
        ));
    }
}
