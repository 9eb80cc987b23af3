use serde::{ Deserialize, Serialize };

/// Decoded form of `Message::content`.
#[derive(Clone, Debug, PartialEq)]
pub enum MessageContent {
    Text(String),
    Image(ImageContent),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageContent {
    #[serde(default)]
    pub text: String,
    pub image: String,
    #[serde(default)]
    pub ocr: String,
}

impl MessageContent {
    pub fn parse(raw: &str) -> Self {
        match serde_json::from_str::<ImageContent>(raw) {
            Ok(image) if !image.image.trim().is_empty() => MessageContent::Image(image),
            _ => MessageContent::Text(raw.to_string()),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Image(image) =>
                serde_json::to_string(image).unwrap_or_else(|_| image.text.clone()),
        }
    }

    /// Text handed to the LLM gateway for this turn.
    pub fn to_prompt_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Image(image) => {
                let mut out = image.text.clone();
                if !out.is_empty() {
                    out.push_str("\n\n");
                }
                out.push_str(&format!("[Image: {}]", image.image));
                if !image.ocr.trim().is_empty() {
                    out.push_str("\n[Extracted text]\n");
                    out.push_str(image.ocr.trim());
                }
                out
            }
        }
    }

    pub fn text(&self) -> &str {
        match self {
            MessageContent::Text(text) => text,
            MessageContent::Image(image) => &image.text,
        }
    }
}
