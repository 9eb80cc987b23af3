use async_trait::async_trait;
use chrono::{ DateTime, Duration, Utc };
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{ ChatError, ChatResult };
use crate::history::ChatStore;
use crate::models::chat::{ Conversation, Message, NewMessage };

#[derive(Default)]
struct Inner {
    conversations: HashMap<String, Conversation>,
    messages: HashMap<String, Message>,
    /// Message ids per conversation in insertion order.
    threads: HashMap<String, Vec<String>>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl Inner {
    /// Wall clock, nudged forward so that no two writes share a timestamp.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_timestamp {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }
}

/// Process-local store. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn create_conversation(&self, user_id: &str, title: &str) -> ChatResult<Conversation> {
        let mut inner = self.inner.write().await;
        let now = inner.tick();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        };
        inner.threads.insert(conversation.id.clone(), Vec::new());
        inner.conversations.insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn list_conversations(&self, user_id: &str) -> ChatResult<Vec<Conversation>> {
        let inner = self.inner.read().await;
        let mut list: Vec<Conversation> = inner.conversations
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(list)
    }

    async fn get_conversation(&self, conversation_id: &str) -> ChatResult<Option<Conversation>> {
        Ok(self.inner.read().await.conversations.get(conversation_id).cloned())
    }

    async fn rename_conversation(&self, conversation_id: &str, title: &str) -> ChatResult<Conversation> {
        let mut inner = self.inner.write().await;
        let conversation = inner.conversations
            .get_mut(conversation_id)
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", conversation_id)))?;
        conversation.title = title.to_string();
        Ok(conversation.clone())
    }

    async fn delete_conversation(&self, conversation_id: &str) -> ChatResult<()> {
        let mut inner = self.inner.write().await;
        if inner.conversations.remove(conversation_id).is_none() {
            return Err(ChatError::NotFound(format!("conversation {}", conversation_id)));
        }
        if let Some(ids) = inner.threads.remove(conversation_id) {
            for id in ids {
                inner.messages.remove(&id);
            }
        }
        Ok(())
    }

    async fn insert_message(&self, message: NewMessage) -> ChatResult<Message> {
        let mut inner = self.inner.write().await;
        if !inner.conversations.contains_key(&message.conversation_id) {
            return Err(ChatError::NotFound(format!("conversation {}", message.conversation_id)));
        }
        let now = inner.tick();
        let stored = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: message.conversation_id,
            role: message.role,
            content: message.content,
            created_at: now,
        };
        if let Some(conversation) = inner.conversations.get_mut(&stored.conversation_id) {
            conversation.updated_at = now;
        }
        inner.threads.entry(stored.conversation_id.clone()).or_default().push(stored.id.clone());
        inner.messages.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        offset: usize,
        limit: usize
    ) -> ChatResult<Vec<Message>> {
        let inner = self.inner.read().await;
        let ids = match inner.threads.get(conversation_id) {
            Some(ids) => ids,
            None => {
                return Ok(Vec::new());
            }
        };
        Ok(
            ids
                .iter()
                .skip(offset)
                .take(limit)
                .filter_map(|id| inner.messages.get(id).cloned())
                .collect()
        )
    }

    async fn recent_messages(&self, conversation_id: &str, n: usize) -> ChatResult<Vec<Message>> {
        let inner = self.inner.read().await;
        let ids = match inner.threads.get(conversation_id) {
            Some(ids) => ids,
            None => {
                return Ok(Vec::new());
            }
        };
        let start = ids.len().saturating_sub(n);
        Ok(
            ids[start..]
                .iter()
                .filter_map(|id| inner.messages.get(id).cloned())
                .collect()
        )
    }

    async fn get_message(&self, message_id: &str) -> ChatResult<Option<Message>> {
        Ok(self.inner.read().await.messages.get(message_id).cloned())
    }

    async fn delete_message(&self, message_id: &str) -> ChatResult<()> {
        let mut inner = self.inner.write().await;
        let message = inner.messages
            .remove(message_id)
            .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))?;
        if let Some(ids) = inner.threads.get_mut(&message.conversation_id) {
            ids.retain(|id| id != message_id);
        }
        Ok(())
    }
}
