//! Producing workspaces on disk.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use uuid::Uuid;

use super::CacheKey;
use crate::error::CacheError;

/// Creates and removes working copies of a repository at a reference.
#[async_trait]
pub trait Materializer: Send + Sync {
    /// Produce a fresh working copy for `key` and return its location.
    async fn materialize(&self, key: &CacheKey) -> Result<PathBuf, CacheError>;

    /// Remove a working copy previously returned by `materialize`.
    async fn discard(&self, path: &Path) -> Result<(), CacheError>;
}

/// Shallow `git clone` into a directory under `root`.
#[derive(Debug, Clone)]
pub struct GitMaterializer {
    root: PathBuf,
    timeout: Duration,
}

impl GitMaterializer {
    pub fn new(root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            root: root.into(),
            timeout,
        }
    }

    /// Unique checkout directory for `key`.
    pub fn checkout_dir(&self, key: &CacheKey) -> PathBuf {
        let id = Uuid::new_v4().simple().to_string();
        self.root.join(format!(
            "{}-{}-{}",
            sanitize(&key.repository),
            sanitize(&key.reference),
            &id[..8]
        ))
    }
}

#[async_trait]
impl Materializer for GitMaterializer {
    async fn materialize(&self, key: &CacheKey) -> Result<PathBuf, CacheError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let target = self.checkout_dir(key);

        let output = tokio::time::timeout(
            self.timeout,
            Command::new("git")
                .args(["clone", "--quiet", "--depth", "1", "--branch"])
                .arg(&key.reference)
                .arg("--")
                .arg(&key.repository)
                .arg(&target)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| CacheError::Timeout {
            repository: key.repository.clone(),
            reference: key.reference.clone(),
            timeout: self.timeout,
        })?
        .map_err(|e| CacheError::Materialize {
            repository: key.repository.clone(),
            reference: key.reference.clone(),
            reason: format!("failed to execute git clone: {e}"),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            // A partial checkout may be left behind.
            let _ = tokio::fs::remove_dir_all(&target).await;
            return Err(CacheError::Materialize {
                repository: key.repository.clone(),
                reference: key.reference.clone(),
                reason: format!("git clone failed: {stderr}"),
            });
        }

        tracing::info!(
            repository = %key.repository,
            reference = %key.reference,
            path = %target.display(),
            "Materialized workspace"
        );
        Ok(target)
    }

    async fn discard(&self, path: &Path) -> Result<(), CacheError> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keep directory names to `[A-Za-z0-9._-]`.
fn sanitize(raw: &str) -> String {
    let cleaned: String = raw
        .trim_end_matches(".git")
        .rsplit(['/', ':'])
        .take(2)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == '.' || c == '_');
    if trimmed.is_empty() {
        "repo".to_string()
    } else {
        trimmed.to_string()
    }
}
