use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::fs;
use uuid::Uuid;

use crate::constants::WORKSPACE_PREFIX;

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("failed to create workspace under {root}: {source}")]
    Creation {
        root: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write source into {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid source file name `{0}`")]
    InvalidFileName(String),
}

/// Hands out one fresh directory per execution under a common root.
#[derive(Clone, Debug)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new<T: AsRef<Path>>(root: T) -> Self {
        Self {
            root: root.as_ref().into(),
        }
    }

    #[tracing::instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn acquire(&self) -> Result<Workspace, WorkspaceError> {
        let creation = |source| WorkspaceError::Creation {
            root: self.root.clone(),
            source,
        };

        fs::create_dir_all(&self.root).await.map_err(creation)?;

        let path = self
            .root
            .join(format!("{}{}", WORKSPACE_PREFIX, Uuid::new_v4()));
        // `create` rather than `create_all`: an existing directory is a collision, not a reuse.
        let mut builder = fs::DirBuilder::new();
        builder.mode(0o700);
        builder.create(&path).await.map_err(creation)?;

        tracing::debug!("Acquired workspace {}", path.display());
        Ok(Workspace {
            path,
            released: false,
        })
    }
}

/// An exclusively owned execution directory. Removed by `release`, or by `Drop`
/// when the owner never got that far.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    released: bool,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write_source(
        &self,
        file_name: &str,
        source: &str,
    ) -> Result<PathBuf, WorkspaceError> {
        if file_name.is_empty() || file_name.contains('/') || file_name.starts_with('.') {
            return Err(WorkspaceError::InvalidFileName(file_name.to_string()));
        }

        let path = self.path.join(file_name);
        let write_error = |source| WorkspaceError::Write {
            path: path.clone(),
            source,
        };
        fs::write(&path, source).await.map_err(write_error)?;
        fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(write_error)?;
        Ok(path)
    }

    /// Idempotent. Failures are logged and retried by `Drop`, never returned.
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        match fs::remove_dir_all(&self.path).await {
            Ok(()) => {
                tracing::debug!("Released workspace {}", self.path.display());
                self.released = true;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.released = true,
            Err(e) => {
                tracing::warn!("Failed to remove workspace {}: {}", self.path.display(), e);
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => tracing::debug!("Removed workspace {} on drop", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::error!(
                "Failed to remove workspace {} on drop: {}",
                self.path.display(),
                e
            ),
        }
    }
}
