use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- History Store Args ---
    /// Conversation store type (memory, redis, rest)
    #[arg(long, env = "HISTORY_TYPE", default_value = "memory")]
    pub history_type: String,

    /// Redis endpoint for the redis conversation store (e.g., redis://127.0.0.1:6379)
    #[arg(long, env = "HISTORY_HOST", default_value = "redis://127.0.0.1:6379")]
    pub history_host: String,

    /// Prefix for Redis keys.
    #[arg(long, env = "HISTORY_REDIS_PREFIX", default_value = "chatdesk:")]
    pub history_redis_prefix: String,

    // --- Backend-as-a-service Args ---
    /// Auth provider type (local, gotrue)
    #[arg(long, env = "AUTH_TYPE", default_value = "local")]
    pub auth_type: String,

    /// Base URL of the hosted backend (e.g., https://xyz.supabase.co). Used by gotrue auth, rest history and bucket storage.
    #[arg(long, env = "BACKEND_URL", default_value = "")]
    pub backend_url: String,

    /// Service-role API key of the hosted backend, sent as `apikey` and as the bearer token.
    /// REST history and bucket storage act as the service, so an anon key is not enough.
    #[arg(long, env = "BACKEND_API_KEY", default_value = "")]
    pub backend_api_key: String,

    /// Secret used to hash passwords for the local auth provider.
    #[arg(long, env = "LOCAL_AUTH_SECRET", default_value = "change-me")]
    pub local_auth_secret: String,

    // --- Object Storage Args ---
    /// Object storage type for uploaded images (local, bucket)
    #[arg(long, env = "STORAGE_TYPE", default_value = "local")]
    pub storage_type: String,

    /// Directory used by the local object store.
    #[arg(long, env = "STORAGE_DIR", default_value = "data/uploads")]
    pub storage_dir: String,

    /// Bucket name used by the bucket object store.
    #[arg(long, env = "STORAGE_BUCKET", default_value = "message-images")]
    pub storage_bucket: String,

    /// Public base URL of this server, used to build links to locally stored files.
    #[arg(long, env = "PUBLIC_URL", default_value = "http://127.0.0.1:4001")]
    pub public_url: String,

    // --- Chat LLM Provider Args ---
    /// Type of LLM gateway for chat completion (openrouter, openai, ollama)
    #[arg(long, env = "CHAT_LLM_TYPE", default_value = "openrouter")]
    pub chat_llm_type: String,

    /// Base URL for the chat gateway API (e.g., https://openrouter.ai/api/v1)
    #[arg(long, env = "CHAT_BASE_URL")] // No default, let adapters handle defaults if None
    pub chat_base_url: Option<String>,

    /// API Key for the chat gateway
    #[arg(long, env = "CHAT_API_KEY", default_value = "")]
    pub chat_api_key: String,

    /// Model name for chat completion (e.g., deepseek/deepseek-r1-distill-llama-70b:free)
    #[arg(long, env = "CHAT_MODEL")] // No default, rely on adapter defaults if None
    pub chat_model: Option<String>,

    /// Site name reported to OpenRouter in the X-Title header.
    #[arg(long, env = "SITE_NAME", default_value = "AI Chat Assistant")]
    pub site_name: String,

    // --- OCR Args ---
    /// Path to the tesseract binary.
    #[arg(long, env = "TESSERACT_BIN", default_value = "tesseract")]
    pub tesseract_bin: String,

    /// OCR language passed to tesseract.
    #[arg(long, env = "OCR_LANG", default_value = "eng")]
    pub ocr_lang: String,

    /// Characters tesseract may emit. Unset uses the built-in set; empty disables the whitelist.
    #[arg(long, env = "OCR_WHITELIST")]
    pub ocr_whitelist: Option<String>,

    // --- General App Args ---
    /// Path to the assistant profile (greeting, model aliases, system prompt).
    #[arg(long, env = "ASSISTANT_PATH", default_value = "json/assistant.json")]
    pub assistant_path: String,

    /// Host address and port for the WebSocket chat server.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:4000")]
    pub server_addr: String,

    /// Port for the HTTP API server.
    #[arg(long, env = "HTTP_PORT", default_value = "4001")]
    pub http_port: u16,

    /// Maximum accepted upload size in bytes.
    #[arg(long, env = "MAX_UPLOAD_BYTES", default_value = "10485760")]
    pub max_upload_bytes: usize,

    /// Optional path to the TLS certificate file (PEM format). Requires --tls-key-path.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Optional path to the TLS private key file (PEM format). Requires --tls-cert-path.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,
}

impl Args {
    /// Args as if no flags were passed. Environment variables still apply.
    pub fn defaults() -> Self {
        Self::parse_from(["chatdesk"])
    }
}
