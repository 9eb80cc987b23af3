#![allow(dead_code)]

use async_trait::async_trait;
use chatdesk::agent::ChatAgent;
use chatdesk::auth::LocalAuth;
use chatdesk::config::assistant::AssistantProfile;
use chatdesk::error::{ ChatError, ChatResult };
use chatdesk::history::MemoryStore;
use chatdesk::ingest::ocr::OcrEngine;
use chatdesk::llm::chat::{ ChatClient, GatewayMessage };
use chatdesk::storage::ObjectStore;
use std::sync::Arc;

pub struct EchoClient;

#[async_trait]
impl ChatClient for EchoClient {
    async fn complete(&self, messages: &[GatewayMessage], _model: Option<&str>) -> ChatResult<String> {
        let last = messages.last().map(|m| m.content.as_str()).unwrap_or("");
        if last == "fail" {
            return Err(ChatError::Gateway("HTTP error! status: 503".to_string()));
        }
        Ok(format!("echo: {}", last))
    }

    fn get_model(&self) -> String {
        "echo".to_string()
    }

    fn get_base_url(&self) -> String {
        "http://echo.test".to_string()
    }
}

pub struct StaticOcr;

#[async_trait]
impl OcrEngine for StaticOcr {
    async fn recognize(&self, _image_bytes: &[u8]) -> ChatResult<String> {
        Ok("HELLO 123".to_string())
    }
}

pub struct NullObjects;

#[async_trait]
impl ObjectStore for NullObjects {
    async fn put(&self, path: &str, _bytes: Vec<u8>, _content_type: &str) -> ChatResult<String> {
        Ok(format!("https://files.test/{}", path))
    }
}

pub fn test_agent() -> Arc<ChatAgent> {
    Arc::new(
        ChatAgent::with_components(
            Arc::new(MemoryStore::new()),
            Arc::new(LocalAuth::new("integration-secret")),
            Arc::new(NullObjects),
            Arc::new(StaticOcr),
            Arc::new(EchoClient),
            AssistantProfile::default()
        )
    )
}
