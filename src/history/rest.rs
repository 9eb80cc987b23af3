use async_trait::async_trait;
use log::error;
use reqwest::{ Client as HttpClient, RequestBuilder, Response, header::{ HeaderMap, HeaderValue, AUTHORIZATION } };
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{ ChatError, ChatResult };
use crate::history::ChatStore;
use crate::models::chat::{ Conversation, Message, NewMessage, Role };

/// Conversation/message tables exposed through a PostgREST endpoint
/// (e.g. `https://<project>.supabase.co/rest/v1`).
pub struct RestStore {
    http: HttpClient,
    base_url: String,
}

#[derive(Serialize)]
struct ConversationInsert<'a> {
    user_id: &'a str,
    title: &'a str,
}

#[derive(Serialize)]
struct TitleUpdate<'a> {
    title: &'a str,
}

#[derive(Serialize)]
struct MessageInsert<'a> {
    conversation_id: &'a str,
    role: Role,
    content: &'a str,
}

impl RestStore {
    pub fn new(base_url: &str, api_key: &str) -> ChatResult<Self> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(api_key).map_err(|e|
            ChatError::Config(format!("Invalid backend API key: {}", e))
        )?;
        headers.insert("apikey", key);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key)).map_err(|e|
                ChatError::Config(format!("Invalid backend API key: {}", e))
            )?
        );
        let http = HttpClient::builder().default_headers(headers).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn table(&self, name: &str) -> String {
        format!("{}/{}", self.base_url, name)
    }

    async fn fetch<T: DeserializeOwned>(&self, req: RequestBuilder) -> ChatResult<Vec<T>> {
        let resp = check(req.send().await?).await?;
        Ok(resp.json::<Vec<T>>().await?)
    }

    /// Runs a write with `Prefer: return=representation` and returns the single affected row.
    async fn write_one<T: DeserializeOwned>(&self, req: RequestBuilder, what: &str) -> ChatResult<T> {
        let rows: Vec<T> = self.fetch(req.header("Prefer", "return=representation")).await?;
        rows.into_iter().next().ok_or_else(|| ChatError::NotFound(what.to_string()))
    }
}

async fn check(resp: Response) -> ChatResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    error!("Backend returned {}: {}", status, body);
    Err(ChatError::Storage(format!("backend returned status {}", status.as_u16())))
}

#[async_trait]
impl ChatStore for RestStore {
    async fn create_conversation(&self, user_id: &str, title: &str) -> ChatResult<Conversation> {
        let req = self.http
            .post(self.table("conversations"))
            .json(&(ConversationInsert { user_id, title }));
        self.write_one(req, "conversation").await
    }

    async fn list_conversations(&self, user_id: &str) -> ChatResult<Vec<Conversation>> {
        let user_filter = format!("eq.{}", user_id);
        let req = self.http
            .get(self.table("conversations"))
            .query(&[("select", "*"), ("user_id", user_filter.as_str()), ("order", "updated_at.desc")]);
        self.fetch(req).await
    }

    async fn get_conversation(&self, conversation_id: &str) -> ChatResult<Option<Conversation>> {
        let id_filter = format!("eq.{}", conversation_id);
        let req = self.http
            .get(self.table("conversations"))
            .query(&[("select", "*"), ("id", id_filter.as_str())]);
        let rows: Vec<Conversation> = self.fetch(req).await?;
        Ok(rows.into_iter().next())
    }

    async fn rename_conversation(&self, conversation_id: &str, title: &str) -> ChatResult<Conversation> {
        let id_filter = format!("eq.{}", conversation_id);
        let req = self.http
            .patch(self.table("conversations"))
            .query(&[("id", id_filter.as_str())])
            .json(&(TitleUpdate { title }));
        self.write_one(req, &format!("conversation {}", conversation_id)).await
    }

    async fn delete_conversation(&self, conversation_id: &str) -> ChatResult<()> {
        let id_filter = format!("eq.{}", conversation_id);
        let req = self.http.delete(self.table("conversations")).query(&[("id", id_filter.as_str())]);
        check(req.send().await?).await?;
        Ok(())
    }

    async fn insert_message(&self, message: NewMessage) -> ChatResult<Message> {
        let req = self.http.post(self.table("messages")).json(
            &(MessageInsert {
                conversation_id: &message.conversation_id,
                role: message.role,
                content: &message.content,
            })
        );
        let stored: Message = self.write_one(req, "message").await?;

        // The table has no trigger for this; keep list ordering fresh.
        let id_filter = format!("eq.{}", stored.conversation_id);
        let touch = self.http
            .patch(self.table("conversations"))
            .query(&[("id", id_filter.as_str())])
            .json(&serde_json::json!({ "updated_at": stored.created_at }));
        check(touch.send().await?).await?;
        Ok(stored)
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        offset: usize,
        limit: usize
    ) -> ChatResult<Vec<Message>> {
        let filter = format!("eq.{}", conversation_id);
        let offset = offset.to_string();
        let limit = limit.to_string();
        let req = self.http
            .get(self.table("messages"))
            .query(
                &[
                    ("select", "*"),
                    ("conversation_id", filter.as_str()),
                    ("order", "created_at.asc"),
                    ("offset", offset.as_str()),
                    ("limit", limit.as_str()),
                ]
            );
        self.fetch(req).await
    }

    async fn recent_messages(&self, conversation_id: &str, n: usize) -> ChatResult<Vec<Message>> {
        let filter = format!("eq.{}", conversation_id);
        let limit = n.to_string();
        let req = self.http
            .get(self.table("messages"))
            .query(
                &[
                    ("select", "*"),
                    ("conversation_id", filter.as_str()),
                    ("order", "created_at.desc"),
                    ("limit", limit.as_str()),
                ]
            );
        let mut rows: Vec<Message> = self.fetch(req).await?;
        rows.reverse();
        Ok(rows)
    }

    async fn get_message(&self, message_id: &str) -> ChatResult<Option<Message>> {
        let id_filter = format!("eq.{}", message_id);
        let req = self.http
            .get(self.table("messages"))
            .query(&[("select", "*"), ("id", id_filter.as_str())]);
        let rows: Vec<Message> = self.fetch(req).await?;
        Ok(rows.into_iter().next())
    }

    async fn delete_message(&self, message_id: &str) -> ChatResult<()> {
        let id_filter = format!("eq.{}", message_id);
        let req = self.http.delete(self.table("messages")).query(&[("id", id_filter.as_str())]);
        check(req.send().await?).await?;
        Ok(())
    }
}
