use axum::extract::{ Query, State };
use axum::http::{ HeaderMap, StatusCode };
use axum::response::{ IntoResponse, Response };
use axum::routing::{ get, post };
use axum::{ Json, Router };
use chatdesk::auth::{ AuthProvider, GoTrueAuth };
use chatdesk::error::ChatError;
use serde_json::{ json, Value };
use std::collections::HashMap;
use std::sync::{ Arc, Mutex };

/// Minimal GoTrue: users by email, one token per user.
#[derive(Clone, Default)]
struct FakeAuth {
    users: Arc<Mutex<HashMap<String, (String, String)>>>,
    missing_apikey: Arc<Mutex<usize>>,
}

impl FakeAuth {
    fn note_apikey(&self, headers: &HeaderMap) {
        if headers.get("apikey").map(|v| v != "anon-key").unwrap_or(true) {
            *self.missing_apikey.lock().unwrap() += 1;
        }
    }
}

fn reply(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

async fn signup(State(fake): State<FakeAuth>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    fake.note_apikey(&headers);
    let email = body["email"].as_str().unwrap_or_default().to_string();
    let password = body["password"].as_str().unwrap_or_default().to_string();
    if email.starts_with("bad") {
        return reply(
            StatusCode::BAD_REQUEST,
            json!({ "msg": "Unable to validate email address: invalid format" })
        );
    }
    let mut users = fake.users.lock().unwrap();
    if users.contains_key(&email) {
        return reply(StatusCode::UNPROCESSABLE_ENTITY, json!({ "msg": "User already registered" }));
    }
    let id = format!("user-{}", users.len() + 1);
    users.insert(email.clone(), (id.clone(), password));
    let user = json!({ "id": id, "email": email });
    if email.starts_with("nested") {
        reply(StatusCode::OK, json!({ "user": user, "session": null }))
    } else {
        reply(StatusCode::OK, user)
    }
}

async fn token(
    State(fake): State<FakeAuth>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Value>
) -> Response {
    fake.note_apikey(&headers);
    if params.get("grant_type").map(String::as_str) != Some("password") {
        return reply(StatusCode::BAD_REQUEST, json!({ "msg": "unsupported_grant_type" }));
    }
    let email = body["email"].as_str().unwrap_or_default();
    let users = fake.users.lock().unwrap();
    match users.get(email) {
        Some((id, password)) if Some(password.as_str()) == body["password"].as_str() =>
            reply(
                StatusCode::OK,
                json!({
                    "access_token": format!("token-{}", id),
                    "token_type": "bearer",
                    "user": { "id": id, "email": email }
                })
            ),
        _ =>
            reply(
                StatusCode::BAD_REQUEST,
                json!({ "error": "invalid_grant", "error_description": "Invalid login credentials" })
            ),
    }
}

async fn current_user(State(fake): State<FakeAuth>, headers: HeaderMap) -> Response {
    fake.note_apikey(&headers);
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_string();
    if bearer == "token-crash" {
        return reply(StatusCode::INTERNAL_SERVER_ERROR, json!({ "msg": "database unavailable" }));
    }
    let users = fake.users.lock().unwrap();
    let found = users.iter().find(|(_, (id, _))| format!("token-{}", id) == bearer);
    match found {
        Some((email, (id, _))) => reply(StatusCode::OK, json!({ "id": id, "email": email })),
        None => reply(StatusCode::UNAUTHORIZED, json!({ "msg": "invalid JWT" })),
    }
}

async fn logout(State(fake): State<FakeAuth>, headers: HeaderMap) -> StatusCode {
    fake.note_apikey(&headers);
    match headers.get("authorization") {
        Some(_) => StatusCode::NO_CONTENT,
        None => StatusCode::UNAUTHORIZED,
    }
}

async fn spawn_auth_server() -> (GoTrueAuth, FakeAuth) {
    let fake = FakeAuth::default();
    let app = Router::new()
        .route("/auth/v1/signup", post(signup))
        .route("/auth/v1/token", post(token))
        .route("/auth/v1/user", get(current_user))
        .route("/auth/v1/logout", post(logout))
        .with_state(fake.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    let auth = GoTrueAuth::new(&format!("http://{}/", addr), "anon-key").unwrap();
    (auth, fake)
}

#[tokio::test]
async fn sign_up_sign_in_and_resolve_token() {
    let (auth, fake) = spawn_auth_server().await;

    let user = auth.sign_up("ada@example.com", "hunter22").await.unwrap();
    assert_eq!(user.email, "ada@example.com");
    let nested = auth.sign_up("nested@example.com", "hunter22").await.unwrap();
    assert_eq!(nested.id, "user-2");

    let session = auth.sign_in(" ada@example.com ", "hunter22").await.unwrap();
    assert_eq!(session.user, user);
    assert_eq!(auth.user_for_token(&session.access_token).await.unwrap(), user);
    auth.sign_out(&session.access_token).await.unwrap();

    assert_eq!(*fake.missing_apikey.lock().unwrap(), 0);
}

#[tokio::test]
async fn auth_server_statuses_map_to_error_kinds() {
    let (auth, _) = spawn_auth_server().await;
    auth.sign_up("ada@example.com", "hunter22").await.unwrap();

    match auth.sign_up("ada@example.com", "hunter22").await.unwrap_err() {
        ChatError::Conflict(msg) => assert_eq!(msg, "User already registered"),
        other => panic!("unexpected error: {:?}", other),
    }
    match auth.sign_in("ada@example.com", "wrong-password").await.unwrap_err() {
        ChatError::Unauthorized(msg) => assert_eq!(msg, "Invalid login credentials"),
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(
        matches!(
            auth.sign_up("bad@example.com", "hunter22").await.unwrap_err(),
            ChatError::Validation(_)
        )
    );
    assert!(matches!(auth.user_for_token("forged").await.unwrap_err(), ChatError::Unauthorized(_)));
    assert!(matches!(auth.user_for_token("token-crash").await.unwrap_err(), ChatError::Storage(_)));
}

#[tokio::test]
async fn malformed_credentials_never_reach_the_server() {
    let (auth, fake) = spawn_auth_server().await;
    assert!(matches!(auth.sign_up("no-at-sign", "hunter22").await, Err(ChatError::Validation(_))));
    assert!(matches!(auth.sign_up("ada@example.com", "123").await, Err(ChatError::Validation(_))));
    assert!(fake.users.lock().unwrap().is_empty());
}
