pub mod openai_compat;

use async_trait::async_trait;
use futures::{ Future, Stream };
use serde::{ Deserialize, Serialize };
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::LlmConfig;
use self::openai_compat::OpenAICompatClient;
use crate::error::{ ChatError, ChatResult };
use crate::models::chat::{ Message, Role };
use crate::models::content::MessageContent;

pub type TokenStream = Pin<Box<dyn Stream<Item = ChatResult<String>> + Send>>;

/// One role-tagged turn in the shape the gateway expects.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GatewayMessage {
    pub role: String,
    pub content: String,
}

impl GatewayMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role: role.as_str().to_string(),
            content: content.into(),
        }
    }
}

impl From<&Message> for GatewayMessage {
    fn from(message: &Message) -> Self {
        GatewayMessage::new(message.role, MessageContent::parse(&message.content).to_prompt_text())
    }
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Sends the whole message array and returns the first choice's text.
    async fn complete(&self, messages: &[GatewayMessage], model: Option<&str>) -> ChatResult<String>;

    /// Streams the reply. Clients without native streaming yield the full reply as one chunk.
    async fn complete_stream(
        &self,
        messages: &[GatewayMessage],
        model: Option<&str>
    ) -> ChatResult<TokenStream> {
        let reply = self.complete(messages, model).await?;
        Ok(Box::pin(futures::stream::once(async move { Ok(reply) })))
    }

    fn get_model(&self) -> String;
    fn get_base_url(&self) -> String;
}

pub fn create_streaming_response<F, Fut>(response_fn: F) -> TokenStream
    where
        F: FnOnce(mpsc::Sender<ChatResult<String>>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static
{
    let (tx, rx) = mpsc::channel(32);

    tokio::spawn(async move {
        response_fn(tx).await;
    });

    Box::pin(ReceiverStream::new(rx))
}

pub fn new_client(config: &LlmConfig) -> ChatResult<Arc<dyn ChatClient>> {
    if config.llm_type.requires_api_key() && config.api_key.as_deref().unwrap_or("").is_empty() {
        return Err(ChatError::Config(format!("{} requires an API key", config.llm_type)));
    }
    let client: Arc<dyn ChatClient> = Arc::new(OpenAICompatClient::from_config(config)?);
    Ok(client)
}
