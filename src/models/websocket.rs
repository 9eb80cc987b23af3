use serde::{ Serialize, Deserialize };

use crate::models::chat::Message;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ImageUpload {
    pub file_name: String,
    /// Base64 (standard alphabet) encoded file contents.
    pub data: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "chat")] Chat {
        #[serde(default)]
        content: String,
        #[serde(default)]
        image: Option<ImageUpload>,
        #[serde(default)]
        model: Option<String>,
    },
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "user_message")] UserMessage {
        message: Message,
    },
    #[serde(rename = "chunk")] Chunk {
        content: String,
    },
    #[serde(rename = "response")] Response {
        message: Message,
    },
    #[serde(rename = "notice")] Notice {
        message: String,
    },
    #[serde(rename = "error")] Error {
        message: String,
    },
    #[serde(rename = "processing")]
    Processing,
}
