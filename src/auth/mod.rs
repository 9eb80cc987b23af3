mod gotrue;
mod local;

pub use self::gotrue::GoTrueAuth;
pub use self::local::LocalAuth;

use async_trait::async_trait;
use log::info;
use serde::{ Deserialize, Serialize };
use std::sync::Arc;

use crate::cli::Args;
use crate::error::{ ChatError, ChatResult };

/// GoTrue rejects shorter passwords on sign-up.
pub const MIN_PASSWORD_LEN: usize = 6;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub user: User,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn sign_up(&self, email: &str, password: &str) -> ChatResult<User>;

    async fn sign_in(&self, email: &str, password: &str) -> ChatResult<Session>;

    async fn sign_out(&self, access_token: &str) -> ChatResult<()>;

    /// Resolves a bearer token to its user, or `Unauthorized`.
    async fn user_for_token(&self, access_token: &str) -> ChatResult<User>;
}

pub fn validate_credentials(email: &str, password: &str) -> ChatResult<()> {
    let email = email.trim();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {}
        _ => {
            return Err(ChatError::Validation(format!("Invalid email address: '{}'", email)));
        }
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(
            ChatError::Validation(
                format!("Password should be at least {} characters", MIN_PASSWORD_LEN)
            )
        );
    }
    Ok(())
}

pub fn create_auth_provider(args: &Args) -> ChatResult<Arc<dyn AuthProvider>> {
    match args.auth_type.to_lowercase().as_str() {
        "local" => {
            info!("Using local auth provider");
            Ok(Arc::new(LocalAuth::new(&args.local_auth_secret)))
        }
        "gotrue" => {
            if args.backend_url.is_empty() {
                return Err(ChatError::Config("gotrue auth requires --backend-url".to_string()));
            }
            info!("Using GoTrue auth at {}", args.backend_url);
            Ok(Arc::new(GoTrueAuth::new(&args.backend_url, &args.backend_api_key)?))
        }
        other => Err(ChatError::Config(format!("Unsupported auth type: {}", other))),
    }
}
