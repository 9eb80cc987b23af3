mod bucket;
mod local;

pub use self::bucket::BucketStore;
pub use self::local::LocalObjectStore;

use async_trait::async_trait;
use log::info;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::cli::Args;
use crate::error::{ ChatError, ChatResult };

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `bytes` at `path` and returns a publicly reachable URL.
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> ChatResult<String>;
}

/// `<user_id>/<uuid>.<ext>`; the extension is taken from the uploaded file name.
pub fn object_path(user_id: &str, file_name: &str) -> String {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "bin".to_string());
    format!("{}/{}.{}", user_id, Uuid::new_v4(), ext)
}

pub fn content_type_for(file_name: &str) -> &'static str {
    let lower = file_name.to_lowercase();
    match lower.rsplit('.').next().unwrap_or("") {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

pub fn create_object_store(args: &Args) -> ChatResult<Arc<dyn ObjectStore>> {
    match args.storage_type.to_lowercase().as_str() {
        "local" => {
            info!("Uploaded images will be stored in {}", args.storage_dir);
            let public_base = format!("{}/files", args.public_url.trim_end_matches('/'));
            Ok(Arc::new(LocalObjectStore::new(&args.storage_dir, &public_base)))
        }
        "bucket" => {
            if args.backend_url.is_empty() {
                return Err(ChatError::Config("bucket storage requires --backend-url".to_string()));
            }
            if args.backend_api_key.is_empty() {
                return Err(
                    ChatError::Config("bucket storage requires a service-role --backend-api-key".to_string())
                );
            }
            info!("Uploaded images will be stored in bucket '{}'", args.storage_bucket);
            Ok(
                Arc::new(
                    BucketStore::new(&args.backend_url, &args.backend_api_key, &args.storage_bucket)?
                )
            )
        }
        other => Err(ChatError::Config(format!("Unsupported storage type: {}", other))),
    }
}
