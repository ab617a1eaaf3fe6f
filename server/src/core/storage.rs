//! Platform-aware data storage directory management
//!
//! ## Platform Paths
//!
//! | Type | Windows | macOS | Linux |
//! |------|---------|-------|-------|
//! | Data | `%APPDATA%\Spool\` | `~/Library/Application Support/Spool/` | `$XDG_DATA_HOME/spool/` |
//!
//! `--data-dir` / `SPOOL_DATA_DIR` overrides the platform directory; when no
//! platform directory exists `./.spool` is used.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;

use super::config::AppConfig;
use super::constants::{APP_DOT_FOLDER, APP_NAME};

/// Data subdirectories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSubdir {
    /// One directory per pipeline queue
    Queue,
    DeadLetter,
    Debug,
}

impl DataSubdir {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DataSubdir::Queue => "queue",
            DataSubdir::DeadLetter => "deadletter",
            DataSubdir::Debug => "debug",
        }
    }

    /// Subdirectories that always exist. Debug is only created in debug mode.
    pub const fn all() -> &'static [DataSubdir] {
        &[DataSubdir::Queue, DataSubdir::DeadLetter]
    }
}

/// Application storage manager
#[derive(Debug, Clone)]
pub struct AppStorage {
    data_dir: PathBuf,
}

impl AppStorage {
    /// Resolve and create the data directory and its subdirectories
    pub async fn init(config: &AppConfig) -> Result<Self> {
        let data_dir = config
            .data_dir
            .clone()
            .unwrap_or_else(Self::resolve_data_dir);

        // canonicalize requires the path to exist
        Self::ensure_directories(&data_dir, config.debug).await?;
        let data_dir = data_dir.canonicalize().unwrap_or(data_dir);

        tracing::debug!(data_dir = %data_dir.display(), "Storage initialized");
        if config.debug {
            let debug_path = data_dir.join(DataSubdir::Debug.as_str());
            tracing::warn!(path = %debug_path.display(), "Debug mode enabled");
        }

        Ok(Self { data_dir })
    }

    /// Platform data directory, else `./.spool`
    pub fn resolve_data_dir() -> PathBuf {
        if let Some(proj_dirs) = ProjectDirs::from("", "", APP_NAME) {
            return proj_dirs.data_dir().to_path_buf();
        }
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        cwd.join(APP_DOT_FOLDER)
    }

    async fn ensure_directories(data_dir: &Path, debug: bool) -> Result<()> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let debug_subdir = debug.then_some(DataSubdir::Debug);
        for subdir in DataSubdir::all().iter().copied().chain(debug_subdir) {
            let path = data_dir.join(subdir.as_str());
            tokio::fs::create_dir_all(&path).await.with_context(|| {
                format!(
                    "Failed to create {} directory: {}",
                    subdir.as_str(),
                    path.display()
                )
            })?;
        }
        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Get path to a subdirectory
    pub fn subdir(&self, subdir: DataSubdir) -> PathBuf {
        self.data_dir.join(subdir.as_str())
    }

    /// Directory holding one pipeline's queue logs
    pub fn queue_dir(&self, pipeline: &str) -> PathBuf {
        self.subdir(DataSubdir::Queue).join(pipeline)
    }

    /// Create AppStorage for testing with a specific data directory
    #[cfg(test)]
    pub fn init_for_test(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_subdir_as_str() {
        assert_eq!(DataSubdir::Queue.as_str(), "queue");
        assert_eq!(DataSubdir::DeadLetter.as_str(), "deadletter");
        assert_eq!(DataSubdir::Debug.as_str(), "debug");
    }

    #[test]
    fn test_data_subdir_all_excludes_debug() {
        assert!(!DataSubdir::all().contains(&DataSubdir::Debug));
    }

    #[test]
    fn test_resolve_data_dir_not_empty() {
        assert!(!AppStorage::resolve_data_dir().as_os_str().is_empty());
    }

    #[test]
    fn test_queue_dir() {
        let storage = AppStorage::init_for_test(PathBuf::from("/data"));
        assert_eq!(storage.queue_dir("logs"), PathBuf::from("/data/queue/logs"));
    }

    #[tokio::test]
    async fn test_ensure_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("spool");
        AppStorage::ensure_directories(&root, true).await.unwrap();
        for subdir in ["queue", "deadletter", "debug"] {
            assert!(root.join(subdir).is_dir(), "{}", subdir);
        }
    }
}
