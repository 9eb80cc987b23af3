use async_trait::async_trait;
use hmac::{ Hmac, Mac };
use log::{ info, warn };
use sha2::Sha256;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ validate_credentials, AuthProvider, Session, User };
use crate::error::{ ChatError, ChatResult };

type HmacSha256 = Hmac<Sha256>;

struct Account {
    user: User,
    salt: String,
    password_hash: String,
}

#[derive(Default)]
struct Registry {
    /// Keyed by lowercased email.
    accounts: HashMap<String, Account>,
    sessions: HashMap<String, User>,
}

/// In-process accounts and sessions. Passwords are stored as
/// hex(HMAC-SHA256(secret, salt || password)).
pub struct LocalAuth {
    secret: String,
    registry: RwLock<Registry>,
}

impl LocalAuth {
    pub fn new(secret: &str) -> Self {
        if secret == "change-me" {
            warn!("Local auth is using the default secret. Set LOCAL_AUTH_SECRET.");
        }
        Self {
            secret: secret.to_string(),
            registry: RwLock::new(Registry::default()),
        }
    }

    fn hash_password(&self, salt: &str, password: &str) -> ChatResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).map_err(|e|
            ChatError::Config(format!("Invalid auth secret: {}", e))
        )?;
        mac.update(salt.as_bytes());
        mac.update(password.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn verify_password(&self, account: &Account, password: &str) -> ChatResult<bool> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).map_err(|e|
            ChatError::Config(format!("Invalid auth secret: {}", e))
        )?;
        mac.update(account.salt.as_bytes());
        mac.update(password.as_bytes());
        let expected = match hex::decode(&account.password_hash) {
            Ok(bytes) => bytes,
            Err(_) => {
                return Ok(false);
            }
        };
        Ok(mac.verify_slice(&expected).is_ok())
    }
}

#[async_trait]
impl AuthProvider for LocalAuth {
    async fn sign_up(&self, email: &str, password: &str) -> ChatResult<User> {
        validate_credentials(email, password)?;
        let key = email.trim().to_lowercase();
        let mut registry = self.registry.write().await;
        if registry.accounts.contains_key(&key) {
            return Err(ChatError::Conflict("User already registered".to_string()));
        }
        let salt = Uuid::new_v4().to_string();
        let user = User {
            id: Uuid::new_v4().to_string(),
            email: email.trim().to_string(),
        };
        let password_hash = self.hash_password(&salt, password)?;
        registry.accounts.insert(key, Account {
            user: user.clone(),
            salt,
            password_hash,
        });
        info!("Registered local user {}", user.id);
        Ok(user)
    }

    async fn sign_in(&self, email: &str, password: &str) -> ChatResult<Session> {
        let key = email.trim().to_lowercase();
        let mut registry = self.registry.write().await;
        let user = match registry.accounts.get(&key) {
            Some(account) if self.verify_password(account, password)? => account.user.clone(),
            _ => {
                return Err(ChatError::Unauthorized("Invalid login credentials".to_string()));
            }
        };
        let access_token = Uuid::new_v4().to_string();
        registry.sessions.insert(access_token.clone(), user.clone());
        Ok(Session { access_token, user })
    }

    async fn sign_out(&self, access_token: &str) -> ChatResult<()> {
        self.registry.write().await.sessions.remove(access_token);
        Ok(())
    }

    async fn user_for_token(&self, access_token: &str) -> ChatResult<User> {
        self.registry
            .read().await
            .sessions.get(access_token)
            .cloned()
            .ok_or_else(|| ChatError::Unauthorized("Invalid or expired session".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sign_up_sign_in_sign_out() {
        let auth = LocalAuth::new("test-secret");
        let user = auth.sign_up("Alice@Example.com", "hunter22").await.unwrap();

        let session = auth.sign_in("alice@example.com", "hunter22").await.unwrap();
        assert_eq!(session.user, user);
        assert_eq!(auth.user_for_token(&session.access_token).await.unwrap(), user);

        auth.sign_out(&session.access_token).await.unwrap();
        assert!(matches!(
            auth.user_for_token(&session.access_token).await,
            Err(ChatError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn wrong_password_and_duplicates_are_rejected() {
        let auth = LocalAuth::new("test-secret");
        auth.sign_up("bob@example.com", "correct-horse").await.unwrap();

        assert!(matches!(
            auth.sign_in("bob@example.com", "wrong-horse").await,
            Err(ChatError::Unauthorized(_))
        ));
        assert!(matches!(
            auth.sign_in("nobody@example.com", "correct-horse").await,
            Err(ChatError::Unauthorized(_))
        ));
        assert!(matches!(
            auth.sign_up("BOB@example.com", "another-one").await,
            Err(ChatError::Conflict(_))
        ));
    }
}
