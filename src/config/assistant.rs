use log::{ info, warn };
use serde::{ Deserialize, Serialize };
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::SystemTime;

use crate::error::{ ChatError, ChatResult };

pub const DEFAULT_GREETING: &str = "Hello! How can I help you today?";
pub const DEFAULT_TITLE: &str = "New Chat";
pub const DEFAULT_FALLBACK_REPLY: &str =
    "I apologize, but I encountered an error processing your request. Please try again.";

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct AssistantProfile {
    pub greeting: String,
    pub default_title: String,
    pub fallback_reply: String,
    pub system_prompt: Option<String>,
    /// Alias shown to users -> gateway model id.
    pub models: BTreeMap<String, String>,
    /// Alias used when a turn names no model. Unset means the gateway client's
    /// configured model (`--chat-model`, else the backend default).
    pub default_model: Option<String>,
    #[serde(skip)]
    pub last_loaded: Option<SystemTime>,
}

impl Default for AssistantProfile {
    fn default() -> Self {
        let models = BTreeMap::from([
            ("DeepSeek-R1".to_string(), "deepseek/deepseek-r1-distill-llama-70b:free".to_string()),
            ("GPT-3.5".to_string(), "openai/gpt-3.5-turbo".to_string()),
            ("GPT-4".to_string(), "openai/gpt-4".to_string()),
        ]);
        Self {
            greeting: DEFAULT_GREETING.to_string(),
            default_title: DEFAULT_TITLE.to_string(),
            fallback_reply: DEFAULT_FALLBACK_REPLY.to_string(),
            system_prompt: None,
            models,
            default_model: None,
            last_loaded: None,
        }
    }
}

impl AssistantProfile {
    fn validate(&self) -> ChatResult<()> {
        if let Some(default_model) = &self.default_model {
            if !self.models.contains_key(default_model) {
                return Err(
                    ChatError::Config(
                        format!("default_model '{}' is not one of the configured models", default_model)
                    )
                );
            }
        }
        if self.default_title.trim().is_empty() {
            return Err(ChatError::Config("default_title must not be empty".to_string()));
        }
        Ok(())
    }

    /// Maps a user-facing alias to a gateway model id. A full gateway id that
    /// appears as a value is accepted as-is. `Ok(None)` leaves the choice to the
    /// gateway client.
    pub fn resolve_model(&self, requested: Option<&str>) -> ChatResult<Option<String>> {
        let alias = match requested.map(str::trim) {
            Some(a) if !a.is_empty() => a,
            _ =>
                match &self.default_model {
                    Some(alias) => alias.as_str(),
                    None => {
                        return Ok(None);
                    }
                }
        };
        if let Some(id) = self.models.get(alias) {
            return Ok(Some(id.clone()));
        }
        if self.models.values().any(|id| id == alias) {
            return Ok(Some(alias.to_string()));
        }

        let suggestion = self.models
            .keys()
            .map(|candidate| {
                (strsim::jaro_winkler(&alias.to_lowercase(), &candidate.to_lowercase()), candidate)
            })
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, name)| name.clone());

        Err(
            ChatError::Validation(match suggestion {
                Some(name) => format!("Unknown model '{}'. Did you mean '{}'?", alias, name),
                None => format!("Unknown model '{}'", alias),
            })
        )
    }

    /// The alias whose gateway id is `model_id`, if any.
    pub fn alias_for(&self, model_id: &str) -> Option<&str> {
        self.models
            .iter()
            .find(|(_, id)| id.as_str() == model_id)
            .map(|(alias, _)| alias.as_str())
    }
}

pub fn load_profile_from_str(content: &str) -> ChatResult<AssistantProfile> {
    let profile: AssistantProfile = serde_json::from_str(content)?;
    profile.validate()?;
    Ok(profile)
}

/// Loads the profile at `path`, falling back to built-in defaults when the file does not exist.
pub fn load_profile(path: &str) -> ChatResult<AssistantProfile> {
    if !Path::new(path).exists() {
        warn!("Assistant profile '{}' not found, using built-in defaults", path);
        return Ok(AssistantProfile {
            last_loaded: Some(SystemTime::now()),
            ..AssistantProfile::default()
        });
    }
    let content = fs
        ::read_to_string(path)
        .map_err(|e| ChatError::Config(format!("Failed to read assistant profile '{}': {}", path, e)))?;
    let mut profile = load_profile_from_str(&content).map_err(|e|
        ChatError::Config(format!("Failed to parse assistant profile '{}': {}", path, e))
    )?;
    profile.last_loaded = Some(SystemTime::now());
    info!("Loaded assistant profile from {} ({} models)", path, profile.models.len());
    Ok(profile)
}

/// Returns a freshly loaded profile if the file changed since `current` was loaded.
pub fn reload_profile_if_changed(
    path: &str,
    current: &AssistantProfile
) -> ChatResult<Option<AssistantProfile>> {
    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(_) => {
            return Ok(None);
        }
    };

    if let Ok(modified) = metadata.modified() {
        match current.last_loaded {
            Some(last_loaded) if modified <= last_loaded => {}
            _ => {
                info!("Assistant profile changed, reloading...");
                return load_profile(path).map(Some);
            }
        }
    }
    Ok(None)
}
