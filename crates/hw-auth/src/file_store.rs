use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde_json::Value;
use tokio::fs;
use tokio::sync::Mutex;

use crate::errors::{Error, Result};
use crate::store::TokenPersister;

/// File-based token persister
///
/// Stores one JSON record per token name.
///
/// # Directory Structure
/// ```text
/// ~/.config/halo-waypoint/tokens/
/// ├── lock                                          # Advisory lock file
/// ├── halo.authToken.json
/// ├── xbox.userToken.json
/// └── xbox.xstsTicket.https___prod.xsts.halowaypoint.com_.json
/// ```
#[derive(Debug)]
pub struct FileTokenPersister {
    storage_dir: PathBuf,
    lock_file: PathBuf,
    /// Serializes writers inside this process; the lock file covers other processes
    write_lock: Mutex<()>,
}

impl FileTokenPersister {
    /// Create a new file-based persister rooted at `storage_dir`
    pub async fn new(storage_dir: impl AsRef<Path>) -> Result<Self> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        let lock_file = storage_dir.join("lock");

        fs::create_dir_all(&storage_dir).await?;

        // Set secure permissions (Unix only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            std::fs::set_permissions(&storage_dir, perms)?;
        }

        Ok(Self {
            storage_dir,
            lock_file,
            write_lock: Mutex::new(()),
        })
    }

    /// Get default storage directory for the current platform
    pub fn default_storage_dir() -> Result<PathBuf> {
        let project_dirs = directories::ProjectDirs::from("", "", "halo-waypoint").ok_or_else(|| {
            Error::InvalidResponse("Could not determine config directory".to_string())
        })?;

        Ok(project_dirs.config_dir().join("tokens"))
    }

    /// Get the path for a token record
    ///
    /// Token names may embed relying-party URLs, so anything outside
    /// `[A-Za-z0-9._-]` is replaced.
    fn token_path(&self, name: &str) -> PathBuf {
        let file_name: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.storage_dir.join(format!("{}.json", file_name))
    }

    /// Acquire an exclusive lock on the storage
    fn acquire_lock(&self) -> Result<std::fs::File> {
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_file)?;

        lock_file.try_lock_exclusive().map_err(|_| Error::StoreLock)?;

        Ok(lock_file)
    }
}

#[async_trait::async_trait]
impl TokenPersister for FileTokenPersister {
    async fn load(&self, name: &str) -> Result<Option<Value>> {
        let path = self.token_path(name);

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(Some(serde_json::from_str(&content)?))
    }

    async fn save(&self, name: &str, record: &Value) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let _lock = self.acquire_lock()?;

        let path = self.token_path(name);
        let json = serde_json::to_string_pretty(record)?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, json).await?;

        // Sync to disk
        let file = std::fs::File::open(&temp_path)?;
        file.sync_all()?;

        fs::rename(&temp_path, &path).await?;

        // Set secure permissions (Unix only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&path, perms)?;
        }

        tracing::debug!("Saved token record {}", name);
        Ok(())
    }

    async fn clear(&self, name: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let _lock = self.acquire_lock()?;

        match fs::remove_file(self.token_path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
