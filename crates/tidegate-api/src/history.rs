//! Conversation history collaborator.
//!
//! The session loop persists turns through this trait so the storage
//! backend stays swappable. The in-memory implementation is suitable for
//! a single process; anything durable lives behind the same trait.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use tidegate_core::{ChatRole, ChatTurn, GatewayError};

/// One persisted conversation turn.
#[derive(Debug, Clone, Serialize)]
pub struct StoredTurn {
    pub id: Uuid,
    pub role: ChatRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl StoredTurn {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            model: None,
            tokens_used: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tokens_used(mut self, tokens: u32) -> Self {
        self.tokens_used = Some(tokens);
        self
    }
}

impl From<&StoredTurn> for ChatTurn {
    fn from(turn: &StoredTurn) -> Self {
        ChatTurn {
            role: turn.role,
            content: turn.content.clone(),
            model: turn.model.clone(),
            tokens_used: turn.tokens_used,
        }
    }
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append one turn to a chat, preserving insertion order.
    async fn append_turn(
        &self,
        user_id: &str,
        chat_id: &str,
        turn: StoredTurn,
    ) -> Result<(), GatewayError>;

    /// All turns of a chat, oldest first.
    async fn list_turns(
        &self,
        user_id: &str,
        chat_id: &str,
    ) -> Result<Vec<StoredTurn>, GatewayError>;
}

/// Process-local history store.
#[derive(Default)]
pub struct MemoryHistory {
    chats: Mutex<HashMap<(String, String), Vec<StoredTurn>>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn append_turn(
        &self,
        user_id: &str,
        chat_id: &str,
        turn: StoredTurn,
    ) -> Result<(), GatewayError> {
        let mut chats = self
            .chats
            .lock()
            .map_err(|_| GatewayError::Generation("history store poisoned".to_string()))?;
        chats
            .entry((user_id.to_string(), chat_id.to_string()))
            .or_default()
            .push(turn);
        Ok(())
    }

    async fn list_turns(
        &self,
        user_id: &str,
        chat_id: &str,
    ) -> Result<Vec<StoredTurn>, GatewayError> {
        let chats = self
            .chats
            .lock()
            .map_err(|_| GatewayError::Generation("history store poisoned".to_string()))?;
        Ok(chats
            .get(&(user_id.to_string(), chat_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_turns_keep_insertion_order() {
        let store = MemoryHistory::new();
        store
            .append_turn("u1", "c1", StoredTurn::new(ChatRole::User, "first"))
            .await
            .unwrap();
        store
            .append_turn("u1", "c1", StoredTurn::new(ChatRole::Assistant, "second"))
            .await
            .unwrap();

        let turns = store.list_turns("u1", "c1").await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content, "first");
        assert_eq!(turns[1].role, ChatRole::Assistant);
    }

    #[tokio::test]
    async fn test_chats_are_isolated() {
        let store = MemoryHistory::new();
        store
            .append_turn("u1", "c1", StoredTurn::new(ChatRole::User, "hi"))
            .await
            .unwrap();

        assert!(store.list_turns("u1", "c2").await.unwrap().is_empty());
        assert!(store.list_turns("u2", "c1").await.unwrap().is_empty());
    }

    #[test]
    fn test_stored_turn_to_chat_turn() {
        let stored = StoredTurn::new(ChatRole::Assistant, "answer")
            .with_model("qwen2.5:32b-instruct")
            .with_tokens_used(12);
        let turn = ChatTurn::from(&stored);
        assert_eq!(turn.role, ChatRole::Assistant);
        assert_eq!(turn.model.as_deref(), Some("qwen2.5:32b-instruct"));
        assert_eq!(turn.tokens_used, Some(12));
    }
}
