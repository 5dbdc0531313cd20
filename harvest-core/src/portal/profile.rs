use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use crate::config::HarvestConfig;

use super::error::{PortalError, PortalResult};

/// Private browser profile directories, one per license.
///
/// The path is derived from the license number so a crashed run leaves a
/// directory the next run for the same license can find and purge.
#[derive(Debug, Clone)]
pub struct ProfileManager {
    base_dir: PathBuf,
    prefix: String,
}

impl ProfileManager {
    pub fn new<P: AsRef<Path>>(base_dir: P, prefix: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            prefix: prefix.into(),
        }
    }

    pub fn from_config(config: &HarvestConfig) -> Self {
        Self::new(&config.browser.profile_root, config.browser.profile_prefix.clone())
    }

    pub fn path_for(&self, owner: &str) -> PathBuf {
        self.base_dir.join(format!("{}{}", self.prefix, owner))
    }

    /// Removes the profile directory for `owner`. Returns whether anything
    /// was removed; a missing directory is not an error.
    pub async fn purge(&self, owner: &str) -> PortalResult<bool> {
        let path = self.path_for(owner);
        match fs::remove_dir_all(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "removed browser profile");
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(PortalError::Profile(format!(
                "failed to remove profile {}: {err}",
                path.display()
            ))),
        }
    }

    /// Synchronous purge for drop paths where no runtime can be awaited.
    pub fn purge_blocking(&self, owner: &str) {
        let path = self.path_for(owner);
        if let Err(err) = std::fs::remove_dir_all(&path) {
            if err.kind() != ErrorKind::NotFound {
                warn!(path = %path.display(), error = %err, "failed to remove browser profile");
            }
        }
    }

    /// Purges any stale directory and creates an empty one.
    pub async fn prepare(&self, owner: &str) -> PortalResult<PathBuf> {
        if self.purge(owner).await? {
            warn!(owner, "purged stale browser profile left by a previous run");
        }
        let path = self.path_for(owner);
        fs::create_dir_all(&path).await.map_err(|err| {
            PortalError::Profile(format!("failed to create profile dir: {err}"))
        })?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn prepare_replaces_stale_profile() {
        let dir = tempdir().unwrap();
        let profiles = ProfileManager::new(dir.path(), "profile_");
        let stale = profiles.path_for("402R-1");
        std::fs::create_dir_all(stale.join("Default")).unwrap();
        std::fs::write(stale.join("Default/Cookies"), b"old").unwrap();

        let path = profiles.prepare("402R-1").await.unwrap();
        assert_eq!(path, dir.path().join("profile_402R-1"));
        assert!(path.is_dir());
        assert!(!path.join("Default").exists());
    }

    #[tokio::test]
    async fn purge_is_idempotent() {
        let dir = tempdir().unwrap();
        let profiles = ProfileManager::new(dir.path(), "profile_");
        profiles.prepare("A").await.unwrap();
        assert!(profiles.purge("A").await.unwrap());
        assert!(!profiles.purge("A").await.unwrap());
        profiles.purge_blocking("A");
        assert!(!profiles.path_for("A").exists());
    }
}
