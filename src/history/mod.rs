mod memory;
mod redis;
mod rest;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;
pub use self::rest::RestStore;

use async_trait::async_trait;
use log::info;
use std::sync::Arc;

use crate::cli::Args;
use crate::error::{ ChatError, ChatResult };
use crate::models::chat::{ Conversation, Message, NewMessage };

/// Number of prior turns forwarded to the gateway alongside the new message.
pub const CONTEXT_TURNS: usize = 5;

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_conversation(&self, user_id: &str, title: &str) -> ChatResult<Conversation>;

    /// The user's conversations, most recently updated first.
    async fn list_conversations(&self, user_id: &str) -> ChatResult<Vec<Conversation>>;

    async fn get_conversation(&self, conversation_id: &str) -> ChatResult<Option<Conversation>>;

    async fn rename_conversation(&self, conversation_id: &str, title: &str) -> ChatResult<Conversation>;

    /// Removes the conversation together with its messages.
    async fn delete_conversation(&self, conversation_id: &str) -> ChatResult<()>;

    /// Stores a message and bumps the conversation's `updated_at`.
    async fn insert_message(&self, message: NewMessage) -> ChatResult<Message>;

    /// Messages oldest first, skipping `offset` and returning at most `limit`.
    async fn list_messages(
        &self,
        conversation_id: &str,
        offset: usize,
        limit: usize
    ) -> ChatResult<Vec<Message>>;

    /// The newest `n` messages, oldest first.
    async fn recent_messages(&self, conversation_id: &str, n: usize) -> ChatResult<Vec<Message>>;

    async fn get_message(&self, message_id: &str) -> ChatResult<Option<Message>>;

    async fn delete_message(&self, message_id: &str) -> ChatResult<()>;
}

pub async fn create_store(args: &Args) -> ChatResult<Arc<dyn ChatStore>> {
    match args.history_type.to_lowercase().as_str() {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        "redis" => {
            let store = RedisStore::connect(&args.history_host, &args.history_redis_prefix).await?;
            Ok(Arc::new(store))
        }
        "rest" => {
            if args.backend_url.is_empty() {
                return Err(ChatError::Config("rest history requires --backend-url".to_string()));
            }
            if args.backend_api_key.is_empty() {
                return Err(
                    ChatError::Config("rest history requires a service-role --backend-api-key".to_string())
                );
            }
            let base = format!("{}/rest/v1", args.backend_url.trim_end_matches('/'));
            let store = RestStore::new(&base, &args.backend_api_key)?;
            Ok(Arc::new(store))
        }
        other => Err(ChatError::Config(format!("Unsupported history store type: {}", other))),
    }
}

pub async fn initialize_store(args: &Args) -> ChatResult<Arc<dyn ChatStore>> {
    info!("Chat history will be stored in: {}", args.history_type);
    create_store(args).await
}

/// The last `CONTEXT_TURNS` prior messages followed by the new turn.
pub fn context_window(prior: &[Message], new_turn: &Message) -> Vec<Message> {
    let start = prior.len().saturating_sub(CONTEXT_TURNS);
    let mut window: Vec<Message> = prior[start..].to_vec();
    window.push(new_turn.clone());
    window
}
