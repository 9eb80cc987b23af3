use crate::agent::{ ChatAgent, ImageAttachment, SendRequest };
use crate::auth::User;
use crate::cli::Args;
use crate::error::ChatError;
use crate::ingest::{ classify_upload, UploadKind };
use crate::models::websocket::ImageUpload;

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use axum::{
    routing::{ get, post, patch, delete },
    Router,
    Json,
    extract::{ DefaultBodyLimit, FromRequestParts, Multipart, Path, Query, State },
    response::{ IntoResponse, Response },
    http::{ header, request::Parts, StatusCode },
};
use serde::{ Deserialize, Serialize };
use serde_json::json;
use tower_http::cors::{ Any, CorsLayer };
use tower_http::services::ServeDir;
use log::{ info, warn, error };

#[derive(Clone)]
pub struct AppState {
    agent: Arc<ChatAgent>,
    max_upload_bytes: usize,
}

/// A `ChatError` rendered as `{"error": "..."}` with a matching status code.
pub struct ApiError(ChatError);

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        Self(e)
    }
}

pub fn status_for(e: &ChatError) -> StatusCode {
    match e {
        ChatError::Validation(_) => StatusCode::BAD_REQUEST,
        ChatError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        ChatError::NotFound(_) => StatusCode::NOT_FOUND,
        ChatError::Conflict(_) => StatusCode::CONFLICT,
        ChatError::UnsupportedFile(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        ChatError::Gateway(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        } else {
            warn!("Request rejected: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Caller resolved from the `Authorization: Bearer` header.
pub struct AuthUser {
    pub user: User,
    pub token: String,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts.headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|v| v.trim().to_string())
            .ok_or_else(|| ChatError::Unauthorized("Missing bearer token".to_string()))?;
        let user = state.agent.authenticate(&token).await?;
        Ok(Self { user, token })
    }
}

#[derive(Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct RenameRequest {
    pub title: String,
}

#[derive(Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub offset: usize,
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct SendMessageBody {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub image: Option<ImageUpload>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Serialize)]
struct ReloadResponse {
    success: bool,
    message: String,
}

pub fn router(agent: Arc<ChatAgent>, args: &Args) -> Router {
    let state = AppState {
        agent,
        max_upload_bytes: args.max_upload_bytes,
    };

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let mut app = Router::new()
        .route("/health", get(health_handler))
        .route("/api/auth/signup", post(signup_handler))
        .route("/api/auth/login", post(login_handler))
        .route("/api/auth/logout", post(logout_handler))
        .route("/api/auth/me", get(me_handler))
        .route("/api/conversations", get(list_conversations_handler).post(new_conversation_handler))
        .route(
            "/api/conversations/{id}",
            patch(rename_conversation_handler).delete(delete_conversation_handler)
        )
        .route(
            "/api/conversations/{id}/messages",
            get(list_messages_handler).post(send_message_handler)
        )
        .route("/api/messages/{id}", delete(delete_message_handler))
        .route("/api/ingest/spreadsheet", post(spreadsheet_handler))
        .route("/api/ingest/ocr", post(ocr_handler))
        .route("/api/models", get(models_handler))
        .route("/api/reload-config", get(reload_config_handler));

    if args.storage_type == "local" {
        app = app.nest_service("/files", ServeDir::new(&args.storage_dir));
    }

    // Base64 image bodies are larger than the raw upload.
    app.layer(DefaultBodyLimit::max(args.max_upload_bytes.saturating_mul(2)))
        .layer(cors)
        .with_state(state)
}

pub async fn start_http_server(
    http_port: u16,
    agent: Arc<ChatAgent>,
    args: Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = format!("0.0.0.0:{}", http_port).parse::<SocketAddr>()?;
    info!("Starting HTTP API server on: http://{}", addr);

    let app = router(agent, &args);

    match (args.enable_tls, &args.tls_cert_path, &args.tls_key_path) {
        (true, Some(cert_path), Some(key_path)) => {
            let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                cert_path,
                key_path
            ).await?;

            tokio::spawn(async move {
                let result = axum_server
                    ::bind_rustls(addr, tls_config)
                    .serve(app.into_make_service()).await;

                if let Err(e) = result {
                    error!("HTTPS server error: {}", e);
                }
            });

            info!("HTTPS server started with TLS enabled");
        }
        _ => {
            let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
                error!("Failed to bind HTTP server to {}: {}. Try a different port.", addr, e);
                e
            })?;

            tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                    error!("HTTP server error: {}", e);
                }
            });

            info!("HTTP server started");
        }
    }

    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// --- Auth ---

async fn signup_handler(
    State(state): State<AppState>,
    Json(body): Json<Credentials>
) -> Result<impl IntoResponse, ApiError> {
    let user = state.agent.sign_up(&body.email, &body.password).await?;
    info!("New account created for {}", user.email);
    Ok((StatusCode::CREATED, Json(user)))
}

async fn login_handler(
    State(state): State<AppState>,
    Json(body): Json<Credentials>
) -> ApiResult<crate::auth::Session> {
    Ok(Json(state.agent.sign_in(&body.email, &body.password).await?))
}

async fn logout_handler(
    State(state): State<AppState>,
    auth: AuthUser
) -> Result<StatusCode, ApiError> {
    state.agent.sign_out(&auth.token).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn me_handler(auth: AuthUser) -> ApiResult<User> {
    Ok(Json(auth.user))
}

// --- Conversations ---

async fn list_conversations_handler(
    State(state): State<AppState>,
    auth: AuthUser
) -> ApiResult<Vec<crate::models::chat::Conversation>> {
    Ok(Json(state.agent.list_conversations(&auth.user).await?))
}

async fn new_conversation_handler(
    State(state): State<AppState>,
    auth: AuthUser
) -> Result<impl IntoResponse, ApiError> {
    let conversation = state.agent.start_new_chat(&auth.user).await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn rename_conversation_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
    Json(body): Json<RenameRequest>
) -> ApiResult<crate::models::chat::Conversation> {
    Ok(Json(state.agent.rename_conversation(&auth.user, &id, &body.title).await?))
}

async fn delete_conversation_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>
) -> Result<StatusCode, ApiError> {
    state.agent.delete_conversation(&auth.user, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// --- Messages ---

async fn list_messages_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
    Query(page): Query<PageQuery>
) -> ApiResult<crate::models::chat::MessagePage> {
    Ok(Json(state.agent.load_messages(&auth.user, &id, page.offset, page.limit).await?))
}

async fn send_message_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
    Json(body): Json<SendMessageBody>
) -> ApiResult<crate::agent::SendOutcome> {
    let image = body.image.as_ref().map(ImageAttachment::from_upload).transpose()?;
    if let Some(image) = &image {
        check_size(image.bytes.len(), state.max_upload_bytes)?;
    }
    let request = SendRequest {
        text: body.content,
        image,
        model: body.model,
    };
    Ok(Json(state.agent.send_message(&auth.user, &id, request).await?))
}

async fn delete_message_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>
) -> Result<StatusCode, ApiError> {
    state.agent.delete_message(&auth.user, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// --- Ingestion ---

struct UploadedFile {
    file_name: String,
    content_type: Option<String>,
    bytes: Vec<u8>,
}

fn check_size(len: usize, max: usize) -> Result<(), ChatError> {
    if len > max {
        return Err(
            ChatError::Validation(format!("File too large ({} bytes, limit {})", len, max))
        );
    }
    Ok(())
}

async fn read_file_field(mut multipart: Multipart, max: usize) -> Result<UploadedFile, ChatError> {
    while
        let Some(field) = multipart
            .next_field().await
            .map_err(|e| ChatError::Validation(format!("Invalid multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("upload").to_string();
        let content_type = field.content_type().map(str::to_string);
        let bytes = field
            .bytes().await
            .map_err(|e| ChatError::Validation(format!("Could not read upload: {}", e)))?;
        check_size(bytes.len(), max)?;
        return Ok(UploadedFile { file_name, content_type, bytes: bytes.to_vec() });
    }
    Err(ChatError::Validation("Missing 'file' field".to_string()))
}

async fn spreadsheet_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    multipart: Multipart
) -> ApiResult<crate::agent::SpreadsheetReport> {
    let file = read_file_field(multipart, state.max_upload_bytes).await?;
    if classify_upload(&file.file_name, file.content_type.as_deref()) != Some(UploadKind::Spreadsheet) {
        return Err(ChatError::UnsupportedFile(format!("'{}' is not a spreadsheet", file.file_name)).into());
    }
    Ok(Json(state.agent.analyze_spreadsheet(&file.file_name, file.bytes).await?))
}

async fn ocr_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    multipart: Multipart
) -> Result<impl IntoResponse, ApiError> {
    let file = read_file_field(multipart, state.max_upload_bytes).await?;
    if classify_upload(&file.file_name, file.content_type.as_deref()) != Some(UploadKind::Image) {
        return Err(ChatError::UnsupportedFile(format!("'{}' is not an image", file.file_name)).into());
    }
    let text = state.agent.extract_text(&file.bytes).await?;
    Ok(Json(json!({ "text": text })))
}

// --- Assistant profile ---

async fn models_handler(State(state): State<AppState>) -> ApiResult<crate::agent::ModelList> {
    Ok(Json(state.agent.list_models().await))
}

async fn reload_config_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.agent.reload_profile_if_changed().await {
        Ok(changed) =>
            (
                StatusCode::OK,
                Json(ReloadResponse {
                    success: true,
                    message: (if changed { "Assistant profile reloaded" } else { "Assistant profile unchanged" }).into(),
                }),
            ),
        Err(e) => {
            error!("Failed to reload assistant profile: {}", e);
            (
                StatusCode::BAD_REQUEST,
                Json(ReloadResponse {
                    success: false,
                    message: format!("Reload error: {}", e),
                }),
            )
        }
    }
}
