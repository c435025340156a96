//! Service-root layout
//!
//! Every persisted file and the socket live under one root directory whose
//! subpaths are fixed by convention.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::constants::paths;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePaths {
    pub root: PathBuf,
    pub socket: PathBuf,
    pub config_dir: PathBuf,
    pub values_file: PathBuf,
    pub profile_tag: PathBuf,
}

impl ServicePaths {
    pub fn from_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let values_dir = root.join(paths::VALUES_DIR);
        Self {
            socket: root.join(paths::SOCKET),
            config_dir: root.join(paths::CONFIG_DIR),
            values_file: values_dir.join(paths::VALUES_FILE),
            profile_tag: values_dir.join(paths::PROFILE_TAG_FILE),
            root,
        }
    }

    /// Platform data dir (e.g. ~/.local/share/profiled), `./fsroot` if unknown
    pub fn default_root() -> PathBuf {
        dirs::data_local_dir()
            .map(|dir| dir.join(paths::APP_DIR))
            .unwrap_or_else(|| PathBuf::from(paths::FALLBACK_ROOT))
    }

    /// Use a socket outside the root
    pub fn with_socket(mut self, socket: impl Into<PathBuf>) -> Self {
        self.socket = socket.into();
        self
    }

    pub fn values_dir(&self) -> &Path {
        self.values_file.parent().unwrap_or(&self.root)
    }

    /// Create the temp, config and values directories
    pub fn ensure_dirs(&self) -> Result<()> {
        let tmp = self.root.join(paths::TMP_DIR);
        for dir in [tmp.as_path(), self.config_dir.as_path(), self.values_dir()] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        debug!(root = %self.root.display(), "Service directories ready");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_under_root() {
        let paths = ServicePaths::from_root("/srv/p");
        assert_eq!(paths.socket, PathBuf::from("/srv/p/tmp/profiled.socket"));
        assert_eq!(paths.config_dir, PathBuf::from("/srv/p/etc/profiles"));
        assert_eq!(paths.values_file, PathBuf::from("/srv/p/var/profiles/values.ini"));
        assert_eq!(paths.profile_tag, PathBuf::from("/srv/p/var/profiles/current"));
        assert_eq!(paths.values_dir(), Path::new("/srv/p/var/profiles"));
    }

    #[test]
    fn test_ensure_dirs_creates_tree() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = ServicePaths::from_root(dir.path());
        paths.ensure_dirs().unwrap();

        assert!(dir.path().join("tmp").is_dir());
        assert!(paths.config_dir.is_dir());
        assert!(paths.values_dir().is_dir());
    }
}
