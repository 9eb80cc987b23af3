pub mod chat;
use serde::{ Deserialize, Serialize };
use std::str::FromStr;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmType {
    OpenRouter,
    OpenAI,
    Ollama,
}

impl LlmType {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            LlmType::OpenRouter => "https://openrouter.ai/api/v1",
            LlmType::OpenAI => "https://api.openai.com/v1",
            LlmType::Ollama => "http://localhost:11434/v1",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            LlmType::OpenRouter => "deepseek/deepseek-r1-distill-llama-70b:free",
            LlmType::OpenAI => "gpt-4o",
            LlmType::Ollama => "llama3",
        }
    }

    pub fn requires_api_key(&self) -> bool {
        !matches!(self, LlmType::Ollama)
    }
}

impl fmt::Display for LlmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LlmType::OpenRouter => "openrouter",
            LlmType::OpenAI => "openai",
            LlmType::Ollama => "ollama",
        };
        f.write_str(name)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseLlmTypeError {
    message: String,
}

impl fmt::Display for ParseLlmTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseLlmTypeError {}
impl FromStr for LlmType {
    type Err = ParseLlmTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openrouter" => Ok(LlmType::OpenRouter),
            "openai" => Ok(LlmType::OpenAI),
            "ollama" => Ok(LlmType::Ollama),
            _ =>
                Err(ParseLlmTypeError {
                    message: format!("Invalid LLM type: '{}'", s),
                }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub llm_type: LlmType,
    pub api_key: Option<String>,
    pub completion_model: Option<String>,
    pub base_url: Option<String>,
    /// Sent as HTTP-Referer to OpenRouter.
    pub site_url: Option<String>,
    /// Sent as X-Title to OpenRouter.
    pub site_name: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            llm_type: LlmType::OpenRouter,
            api_key: None,
            completion_model: None,
            base_url: None,
            site_url: None,
            site_name: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("OpenRouter".parse::<LlmType>().unwrap(), LlmType::OpenRouter);
        assert_eq!("ollama".parse::<LlmType>().unwrap(), LlmType::Ollama);
        assert!("gemini".parse::<LlmType>().is_err());
    }
}
