use chrono::{ DateTime, Utc };
use serde::{ Deserialize, Serialize };
use std::fmt;
use std::str::FromStr;

use crate::error::ChatError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            _ => Err(ChatError::Validation(format!("Invalid role: '{}'", s))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A message as submitted to a store, before it has an id or timestamp.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewMessage {
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
}

impl NewMessage {
    pub fn new(conversation_id: &str, role: Role, content: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            role,
            content: content.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub offset: usize,
    pub limit: usize,
    pub has_more: bool,
}
