use async_trait::async_trait;
use log::error;
use reqwest::{ Client as HttpClient, Response, StatusCode, header::{ HeaderMap, HeaderValue, AUTHORIZATION } };
use serde::{ Deserialize, Serialize };

use super::{ validate_credentials, AuthProvider, Session, User };
use crate::error::{ ChatError, ChatResult };

/// Client for a hosted GoTrue auth server (`<backend>/auth/v1`).
pub struct GoTrueAuth {
    http: HttpClient,
    base_url: String,
}

#[derive(Serialize)]
struct Credentials<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct GoTrueUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

impl From<GoTrueUser> for User {
    fn from(u: GoTrueUser) -> Self {
        User {
            id: u.id,
            email: u.email.unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    user: GoTrueUser,
}

/// Sign-up answers with the user either at the top level or nested under `user`.
#[derive(Deserialize)]
#[serde(untagged)]
enum SignUpResponse {
    Session {
        user: GoTrueUser,
    },
    User(GoTrueUser),
}

#[derive(Deserialize, Default)]
struct GoTrueError {
    #[serde(default, alias = "error_description", alias = "message")]
    msg: Option<String>,
}

impl GoTrueAuth {
    pub fn new(backend_url: &str, api_key: &str) -> ChatResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "apikey",
            HeaderValue::from_str(api_key).map_err(|e|
                ChatError::Config(format!("Invalid backend API key: {}", e))
            )?
        );
        let http = HttpClient::builder().default_headers(headers).build()?;
        Ok(Self {
            http,
            base_url: format!("{}/auth/v1", backend_url.trim_end_matches('/')),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Maps GoTrue failures onto our error kinds, keeping its message for the user.
async fn check(resp: Response) -> ChatResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body: GoTrueError = resp.json().await.unwrap_or_default();
    let msg = body.msg.unwrap_or_else(|| format!("auth server returned {}", status.as_u16()));
    Err(match status {
        StatusCode::BAD_REQUEST if msg.to_lowercase().contains("invalid login") =>
            ChatError::Unauthorized(msg),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ChatError::Unauthorized(msg),
        StatusCode::UNPROCESSABLE_ENTITY if msg.to_lowercase().contains("already") =>
            ChatError::Conflict(msg),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ChatError::Validation(msg),
        _ => {
            error!("Auth server error {}: {}", status, msg);
            ChatError::Storage(msg)
        }
    })
}

#[async_trait]
impl AuthProvider for GoTrueAuth {
    async fn sign_up(&self, email: &str, password: &str) -> ChatResult<User> {
        validate_credentials(email, password)?;
        let resp = self.http
            .post(self.url("/signup"))
            .json(&(Credentials { email: email.trim(), password }))
            .send().await?;
        let parsed: SignUpResponse = check(resp).await?.json().await?;
        Ok(match parsed {
            SignUpResponse::Session { user } => user.into(),
            SignUpResponse::User(user) => user.into(),
        })
    }

    async fn sign_in(&self, email: &str, password: &str) -> ChatResult<Session> {
        let resp = self.http
            .post(self.url("/token"))
            .query(&[("grant_type", "password")])
            .json(&(Credentials { email: email.trim(), password }))
            .send().await?;
        let token: TokenResponse = check(resp).await?.json().await?;
        Ok(Session {
            access_token: token.access_token,
            user: token.user.into(),
        })
    }

    async fn sign_out(&self, access_token: &str) -> ChatResult<()> {
        let resp = self.http
            .post(self.url("/logout"))
            .header(AUTHORIZATION, format!("Bearer {}", access_token))
            .send().await?;
        check(resp).await?;
        Ok(())
    }

    async fn user_for_token(&self, access_token: &str) -> ChatResult<User> {
        let resp = self.http
            .get(self.url("/user"))
            .header(AUTHORIZATION, format!("Bearer {}", access_token))
            .send().await?;
        let user: GoTrueUser = check(resp).await?.json().await?;
        Ok(user.into())
    }
}
