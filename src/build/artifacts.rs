//! Build-scoped working directory
//!
//! Every build owns `<base>/clusters/<name>-<hash>`. The directory holds the
//! rendered manifest, the SSH key and the kubeconfig file the provisioning tool
//! overwrites. [`WorkingDir`] is a guard: `release()` removes the directory on
//! success; dropping it unreleased applies the [`RetentionPolicy`].

use crate::build::template::{ManifestTemplate, TemplateError};
use crate::build::view::ProvisioningView;
use crate::model::BuildId;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Subdirectory of the base directory holding all working directories
pub const CLUSTERS_DIR: &str = "clusters";
pub const MANIFEST_FILE_NAME: &str = "kubeone.yaml";
pub const PRIVATE_KEY_FILE_NAME: &str = "private.pem";
/// Present while a build owns its working directory
pub const LIVE_MARKER_FILE_NAME: &str = ".kube-eleven-build";

/// Owner read/write only
#[cfg(unix)]
const SECRET_FILE_MODE: u32 = 0o600;

/// What happens to a working directory when a build does not finish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Keep the directory for postmortem debugging
    #[default]
    RetainOnFailure,
    /// Remove the directory on every exit path
    RemoveAlways,
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("working directory {path} is in use by a running build")]
    InUse { path: PathBuf },

    #[error(transparent)]
    Template(#[from] TemplateError),
}

impl ArtifactError {
    fn io<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> Self + 'a {
        move |source| ArtifactError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Path of the working directory for `build_id` under `base_dir`
pub fn working_dir_path(base_dir: &Path, build_id: &BuildId) -> PathBuf {
    base_dir.join(CLUSTERS_DIR).join(build_id.to_string())
}

/// Path of the kubeconfig file inside a working directory
pub fn kubeconfig_path(dir: &Path, cluster_name: &str) -> PathBuf {
    dir.join(format!("{}-kubeconfig", cluster_name))
}

/// Exclusive working directory of one build
#[derive(Debug)]
pub struct WorkingDir {
    path: PathBuf,
    retention: RetentionPolicy,
    released: bool,
}

impl WorkingDir {
    /// Create an empty working directory for `build_id`
    ///
    /// The leaf directory is created exclusively and marked live with
    /// [`LIVE_MARKER_FILE_NAME`]. A leftover directory without the marker was
    /// retained by an earlier build and is replaced; one with the marker
    /// belongs to a running build and makes this call fail with
    /// [`ArtifactError::InUse`].
    pub async fn prepare(
        base_dir: &Path,
        build_id: &BuildId,
        retention: RetentionPolicy,
    ) -> Result<Self, ArtifactError> {
        let path = working_dir_path(base_dir, build_id);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(ArtifactError::io("failed to create", parent))?;
        }

        match tokio::fs::create_dir(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                replace_stale_dir(&path, build_id).await?;
            }
            Err(e) => return Err(ArtifactError::io("failed to create", &path)(e)),
        }

        // Losing the marker race leaves the directory to its owner
        mark_live(&path).await?;

        debug!(cluster = %build_id, path = %path.display(), "Working directory prepared");
        Ok(Self {
            path,
            retention,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(MANIFEST_FILE_NAME)
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.path.join(PRIVATE_KEY_FILE_NAME)
    }

    pub fn kubeconfig_path(&self, cluster_name: &str) -> PathBuf {
        kubeconfig_path(&self.path, cluster_name)
    }

    /// Write every file the provisioning tool needs
    ///
    /// - `kubeone.yaml` rendered from `template` and `view`
    /// - `private.pem` holding `private_key` (mode 0600)
    /// - `<cluster>-kubeconfig` seeded with `kubeconfig`, possibly empty (mode 0600)
    pub async fn materialize(
        &self,
        template: &ManifestTemplate,
        view: &ProvisioningView,
        private_key: &str,
        kubeconfig: &str,
    ) -> Result<(), ArtifactError> {
        let manifest = template.render(view)?;
        let manifest_path = self.manifest_path();
        tokio::fs::write(&manifest_path, manifest)
            .await
            .map_err(ArtifactError::io("failed to write", &manifest_path))?;

        write_secret_file(&self.private_key_path(), private_key).await?;
        write_secret_file(&self.kubeconfig_path(&view.cluster_name), kubeconfig).await?;

        debug!(
            path = %self.path.display(),
            nodes = view.node_count(),
            "Provisioning artifacts written"
        );
        Ok(())
    }

    /// Remove the working directory
    pub async fn release(mut self) -> Result<(), ArtifactError> {
        self.released = true;
        tokio::fs::remove_dir_all(&self.path)
            .await
            .map_err(ArtifactError::io("failed to remove", &self.path))
    }
}

impl Drop for WorkingDir {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match self.retention {
            RetentionPolicy::RetainOnFailure => {
                // Without the marker the next build for this id may replace it
                let marker = self.path.join(LIVE_MARKER_FILE_NAME);
                if let Err(e) = std::fs::remove_file(&marker) {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!(
                            error = %e,
                            path = %marker.display(),
                            "Failed to remove live marker of retained working directory"
                        );
                    }
                }
                info!(path = %self.path.display(), "Retaining working directory of unfinished build");
            }
            RetentionPolicy::RemoveAlways => {
                if let Err(e) = std::fs::remove_dir_all(&self.path) {
                    warn!(
                        error = %e,
                        path = %self.path.display(),
                        "Failed to remove working directory of unfinished build"
                    );
                }
            }
        }
    }
}

async fn replace_stale_dir(path: &Path, build_id: &BuildId) -> Result<(), ArtifactError> {
    let marker = path.join(LIVE_MARKER_FILE_NAME);
    let live = tokio::fs::try_exists(&marker)
        .await
        .map_err(ArtifactError::io("failed to inspect", &marker))?;
    if live {
        return Err(ArtifactError::InUse {
            path: path.to_path_buf(),
        });
    }

    tokio::fs::remove_dir_all(path)
        .await
        .map_err(ArtifactError::io("failed to remove stale", path))?;
    warn!(
        cluster = %build_id,
        path = %path.display(),
        "Removed stale working directory from a previous build"
    );

    tokio::fs::create_dir(path).await.map_err(|e| {
        if e.kind() == io::ErrorKind::AlreadyExists {
            ArtifactError::InUse {
                path: path.to_path_buf(),
            }
        } else {
            ArtifactError::io("failed to create", path)(e)
        }
    })
}

async fn mark_live(dir: &Path) -> Result<(), ArtifactError> {
    let marker = dir.join(LIVE_MARKER_FILE_NAME);
    tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&marker)
        .await
        .map(drop)
        .map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                ArtifactError::InUse {
                    path: dir.to_path_buf(),
                }
            } else {
                ArtifactError::io("failed to mark", &marker)(e)
            }
        })
}

/// Create `path` readable by the owner only and write `content`
///
/// The mode is set at creation, so the content is never exposed.
async fn write_secret_file(path: &Path, content: &str) -> Result<(), ArtifactError> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(SECRET_FILE_MODE);

    let mut file = options
        .open(path)
        .await
        .map_err(ArtifactError::io("failed to create", path))?;
    file.write_all(content.as_bytes())
        .await
        .map_err(ArtifactError::io("failed to write", path))?;
    file.flush()
        .await
        .map_err(ArtifactError::io("failed to write", path))?;

    Ok(())
}

#[cfg(test)]
#[path = "artifacts_test.rs"]
mod tests;
