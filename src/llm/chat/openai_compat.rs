use async_trait::async_trait;
use futures::StreamExt;
use log::{ debug, error };
use reqwest::{ Client as HttpClient, header::{ HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, AUTHORIZATION } };
use serde::{ Deserialize, Serialize };

use super::{ create_streaming_response, ChatClient, GatewayMessage, TokenStream };
use crate::error::{ ChatError, ChatResult };
use crate::llm::{ LlmConfig, LlmType };

/// Client for any `/chat/completions` endpoint speaking the OpenAI wire format
/// (OpenRouter, OpenAI, Ollama's compatibility layer).
pub struct OpenAICompatClient {
    http: HttpClient,
    model: String,
    base_url: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [GatewayMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<GatewayErrorBody>,
}

/// Error object OpenRouter emits inside a 200 stream once generation fails.
#[derive(Deserialize)]
struct GatewayErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

impl GatewayErrorBody {
    fn describe(&self) -> String {
        let message = self.message.as_deref().unwrap_or("stream failed");
        match &self.code {
            Some(code) => format!("{} (code {})", message, code),
            None => message.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: Delta,
    #[serde(rename = "finish_reason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct Delta {
    content: Option<String>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum SseEvent {
    Token(String),
    Done,
    Error(String),
    Skip,
}

/// Interprets one line of a server-sent-events body.
pub(crate) fn parse_sse_line(line: &str) -> SseEvent {
    let line = line.trim_end_matches('\r');
    let data = match line.strip_prefix("data:") {
        Some(d) => d.trim_start(),
        None => {
            return SseEvent::Skip;
        }
    };
    if data == "[DONE]" {
        return SseEvent::Done;
    }
    match serde_json::from_str::<StreamResponse>(data) {
        Ok(resp) => {
            if let Some(err) = resp.error {
                return SseEvent::Error(err.describe());
            }
            let mut token = String::new();
            let mut finished = false;
            for choice in resp.choices {
                if let Some(content) = choice.delta.content {
                    token.push_str(&content);
                }
                if choice.finish_reason.as_deref() == Some("stop") {
                    finished = true;
                }
            }
            if !token.is_empty() {
                SseEvent::Token(token)
            } else if finished {
                SseEvent::Done
            } else {
                SseEvent::Skip
            }
        }
        Err(e) => {
            debug!("Ignoring unparsable stream line ({}): {}", e, data);
            SseEvent::Skip
        }
    }
}

impl OpenAICompatClient {
    pub fn from_config(config: &LlmConfig) -> ChatResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(api_key) = config.api_key.as_deref().filter(|k| !k.is_empty()) {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", api_key)).map_err(|e|
                    ChatError::Config(format!("Invalid API key format: {}", e))
                )?
            );
        }
        if config.llm_type == LlmType::OpenRouter {
            if let Some(site_url) = &config.site_url {
                insert_header(&mut headers, "http-referer", site_url)?;
            }
            if let Some(site_name) = &config.site_name {
                insert_header(&mut headers, "x-title", site_name)?;
            }
        }

        let http = HttpClient::builder().default_headers(headers).build()?;

        Ok(Self {
            http,
            model: config.completion_model
                .clone()
                .unwrap_or_else(|| config.llm_type.default_model().to_string()),
            base_url: config.base_url
                .clone()
                .unwrap_or_else(|| config.llm_type.default_base_url().to_string()),
        })
    }

    fn endpoint(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{}/chat/completions", base)
        }
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) -> ChatResult<()> {
    let value = HeaderValue::from_str(value).map_err(|e|
        ChatError::Config(format!("Invalid value for header {}: {}", name, e))
    )?;
    headers.insert(HeaderName::from_static(name), value);
    Ok(())
}

#[async_trait]
impl ChatClient for OpenAICompatClient {
    async fn complete(&self, messages: &[GatewayMessage], model: Option<&str>) -> ChatResult<String> {
        let req = ChatRequest {
            model: model.unwrap_or(self.model.as_str()),
            messages,
            stream: None,
        };

        let resp = self.http.post(self.endpoint()).json(&req).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            error!("Gateway returned {}: {}", status, body);
            return Err(ChatError::Gateway(format!("HTTP error! status: {}", status.as_u16())));
        }
        let data = resp.json::<ChatResponse>().await?;
        debug!("Gateway returned {} choice(s)", data.choices.len());

        let choice = data.choices
            .into_iter()
            .next()
            .ok_or_else(|| ChatError::Gateway("No choices returned from gateway".to_string()))?;
        match choice.message.content {
            Some(content) if !content.trim().is_empty() => Ok(content),
            _ => Err(ChatError::Gateway("Gateway returned an empty reply".to_string())),
        }
    }

    async fn complete_stream(
        &self,
        messages: &[GatewayMessage],
        model: Option<&str>
    ) -> ChatResult<TokenStream> {
        let body = serde_json::to_value(ChatRequest {
            model: model.unwrap_or(self.model.as_str()),
            messages,
            stream: Some(true),
        })?;
        let client = self.http.clone();
        let url = self.endpoint();

        Ok(
            create_streaming_response(move |tx| async move {
                let resp = match client.post(&url).json(&body).send().await {
                    Ok(r) => r,
                    Err(e) => {
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                };
                if !resp.status().is_success() {
                    let msg = format!("HTTP error! status: {}", resp.status().as_u16());
                    let _ = tx.send(Err(ChatError::Gateway(msg))).await;
                    return;
                }

                let mut bytes = resp.bytes_stream();
                let mut pending: Vec<u8> = Vec::new();
                while let Some(chunk) = bytes.next().await {
                    let chunk = match chunk {
                        Ok(c) => c,
                        Err(e) => {
                            let _ = tx.send(Err(e.into())).await;
                            return;
                        }
                    };
                    pending.extend_from_slice(&chunk);

                    // Lines may be split across chunks; keep the unterminated tail.
                    while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = pending.drain(..=pos).collect();
                        let line = String::from_utf8_lossy(&line);
                        match parse_sse_line(line.trim_end_matches('\n')) {
                            SseEvent::Token(token) => {
                                if tx.send(Ok(token)).await.is_err() {
                                    return;
                                }
                            }
                            SseEvent::Done => {
                                return;
                            }
                            SseEvent::Error(msg) => {
                                error!("Gateway stream failed: {}", msg);
                                let _ = tx.send(Err(ChatError::Gateway(msg))).await;
                                return;
                            }
                            SseEvent::Skip => {}
                        }
                    }
                }
                match parse_sse_line(&String::from_utf8_lossy(&pending)) {
                    SseEvent::Token(token) => {
                        let _ = tx.send(Ok(token)).await;
                    }
                    SseEvent::Error(msg) => {
                        let _ = tx.send(Err(ChatError::Gateway(msg))).await;
                    }
                    _ => {}
                }
            })
        )
    }

    fn get_model(&self) -> String {
        self.model.clone()
    }

    fn get_base_url(&self) -> String {
        self.base_url.clone()
    }
}
