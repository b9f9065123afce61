use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use waengine_protocol::InstanceId;

use crate::error::CredentialError;

/// Prefix of each per-instance credential directory.
pub const ENTRY_PREFIX: &str = "session-";

/// Durable, opaque per-instance authentication material.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Instance ids that currently have persisted credentials.
    async fn list(&self) -> Result<Vec<InstanceId>, CredentialError>;

    /// Remove the credentials of `instance_id`. Returns `false` when there
    /// was nothing to remove.
    async fn delete(&self, instance_id: &str) -> Result<bool, CredentialError>;
}

/// Credential entries stored as `<root>/session-<instanceId>` directories,
/// the layout the bridge's local auth strategy writes.
#[derive(Debug, Clone)]
pub struct FsCredentialStore {
    root: PathBuf,
}

impl FsCredentialStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_path(&self, instance_id: &str) -> PathBuf {
        self.root.join(format!("{ENTRY_PREFIX}{instance_id}"))
    }

    /// Create the root directory with `0700` permissions if needed.
    pub fn ensure_root(&self) -> std::io::Result<()> {
        if !self.root.exists() {
            std::fs::create_dir_all(&self.root)?;
            #[cfg(unix)]
            std::fs::set_permissions(&self.root, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FsCredentialStore {
    async fn list(&self) -> Result<Vec<InstanceId>, CredentialError> {
        let list_err = |source| CredentialError::List {
            path: self.root.display().to_string(),
            source,
        };

        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(list_err(e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(list_err)? {
            if !entry.file_type().await.map_err(list_err)?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.strip_prefix(ENTRY_PREFIX)) else {
                continue;
            };
            if !id.is_empty() {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, instance_id: &str) -> Result<bool, CredentialError> {
        let path = self.entry_path(instance_id);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                debug!(instance_id, path = %path.display(), "credential entry removed");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(CredentialError::Delete {
                instance_id: instance_id.to_string(),
                source,
            }),
        }
    }
}
