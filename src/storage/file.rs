use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::Store;
use crate::error::StoreError;

const DATA_DIR: &str = "DATA_DIR";
const XDG_DATA_HOME: &str = "XDG_DATA_HOME";
const LOCAL_APP_DATA: &str = "LocalAppData";

/// Stores each key as `<dir>/<key>.json`.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// File store rooted in the per-user data directory.
    pub fn new() -> Self {
        Self::with_dir(data_dir())
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl Default for FileStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves the data directory from the process environment.
pub fn data_dir() -> PathBuf {
    resolve_data_dir(
        |name| std::env::var(name).ok(),
        dirs::home_dir(),
        cfg!(windows),
    )
}

fn resolve_data_dir(
    lookup: impl Fn(&str) -> Option<String>,
    home: Option<PathBuf>,
    windows: bool,
) -> PathBuf {
    let set = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(dir) = set(DATA_DIR) {
        return PathBuf::from(dir).join("overleash");
    }
    if let Some(dir) = set(XDG_DATA_HOME) {
        return PathBuf::from(dir).join("overleash");
    }
    if windows {
        if let Some(dir) = set(LOCAL_APP_DATA) {
            return PathBuf::from(dir).join("Overleash");
        }
    }

    home.unwrap_or_default()
        .join(".local")
        .join("share")
        .join("overleash")
}

#[async_trait]
impl Store for FileStore {
    async fn read(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        match tokio::fs::read(self.path(key)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path(key);
        tokio::fs::write(&path, data).await?;
        restrict_permissions(&path).await?;
        debug!(path = %path.display(), bytes = data.len(), "wrote store file");
        Ok(())
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
