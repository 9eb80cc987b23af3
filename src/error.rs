use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("unsupported file: {0}")]
    UnsupportedFile(String),

    #[error("spreadsheet error: {0}")]
    Spreadsheet(String),

    #[error("OCR error: {0}")]
    Ocr(String),

    #[error("LLM gateway error: {0}")]
    Gateway(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ChatResult<T> = Result<T, ChatError>;
