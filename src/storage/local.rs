use async_trait::async_trait;
use log::debug;
use std::path::{ Component, Path, PathBuf };

use super::ObjectStore;
use crate::error::{ ChatError, ChatResult };

/// Files under a local directory, served by the HTTP API at `<public_base>/<path>`.
pub struct LocalObjectStore {
    root: PathBuf,
    public_base: String,
}

impl LocalObjectStore {
    pub fn new(root: &str, public_base: &str) -> Self {
        Self {
            root: PathBuf::from(root),
            public_base: public_base.trim_end_matches('/').to_string(),
        }
    }

    fn resolve(&self, path: &str) -> ChatResult<PathBuf> {
        let relative = Path::new(path);
        if relative.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(ChatError::Validation(format!("Invalid object path: {}", path)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, path: &str, bytes: Vec<u8>, _content_type: &str) -> ChatResult<String> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &bytes).await?;
        debug!("Stored {} bytes at {}", bytes.len(), target.display());
        Ok(format!("{}/{}", self.public_base, path))
    }
}
