pub mod markdown;
pub mod pdf;

use std::path::Path;

use common::error::AppError;
use serde::{de::DeserializeOwned, Serialize};

/// Persists a JSON artifact next to the checkpoints.
pub async fn save_json<T: Serialize>(value: &T, path: &Path) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let payload = serde_json::to_string_pretty(value)?;
    tokio::fs::write(path, payload).await?;
    Ok(())
}

pub async fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, AppError> {
    let raw = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&raw)?)
}
