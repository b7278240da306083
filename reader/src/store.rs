//! Filesystem-backed image store.
//!
//! A single flat directory; the filename is the key and the file mtime is
//! the only metadata.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;
use tokio::fs::File;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("image not found: {0}")]
    NotFound(String),
    #[error("invalid image name: {0}")]
    InvalidName(String),
    #[error("cannot read image directory {}: {source}", .dir.display())]
    Unreadable { dir: PathBuf, source: io::Error },
    #[error("cannot open {name}: {source}")]
    Open { name: String, source: io::Error },
    #[error("removed {removed} image(s) but {failed} could not be deleted: {first}")]
    PartialClear {
        removed: usize,
        failed: usize,
        first: io::Error,
    },
}

/// An opened image ready to be streamed out.
#[derive(Debug)]
pub struct StoredImage {
    pub name: String,
    pub file: File,
    pub len: u64,
}

#[derive(Debug, Clone)]
pub struct ImageStore {
    dir: PathBuf,
}

impl ImageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        ImageStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the device should write `filename`. No existence check.
    pub fn save_target(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    /// Image names ordered by modification time, most recent first.
    pub async fn list_newest_first(&self) -> Result<Vec<String>, StoreError> {
        let unreadable = |source| StoreError::Unreadable {
            dir: self.dir.clone(),
            source,
        };

        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(unreadable)?;
        let mut images: Vec<(SystemTime, String)> = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(unreadable)? {
            let meta = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                Err(e) => {
                    // Removed between read_dir and stat.
                    debug!("Skipping {:?}: {e}", entry.file_name());
                    continue;
                }
            };
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            images.push((modified, entry.file_name().to_string_lossy().into_owned()));
        }

        // Ties broken by name so the order is stable.
        images.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        Ok(images.into_iter().map(|(_, name)| name).collect())
    }

    /// Name of the most recently modified image, if any.
    pub async fn newest(&self) -> Result<Option<String>, StoreError> {
        Ok(self.list_newest_first().await?.into_iter().next())
    }

    /// Open `filename` for streaming.
    pub async fn open(&self, filename: &str) -> Result<StoredImage, StoreError> {
        if !is_plain_name(filename) {
            return Err(StoreError::InvalidName(filename.to_string()));
        }

        let path = self.dir.join(filename);
        let file = match File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(filename.to_string()))
            }
            Err(source) => {
                return Err(StoreError::Open {
                    name: filename.to_string(),
                    source,
                })
            }
        };
        let meta = file.metadata().await.map_err(|source| StoreError::Open {
            name: filename.to_string(),
            source,
        })?;
        if !meta.is_file() {
            return Err(StoreError::NotFound(filename.to_string()));
        }

        Ok(StoredImage {
            name: filename.to_string(),
            file,
            len: meta.len(),
        })
    }

    /// Delete every entry in the store, returning how many were removed.
    ///
    /// Keeps going past individual failures and reports them together.
    pub async fn clear_all(&self) -> Result<usize, StoreError> {
        let unreadable = |source| StoreError::Unreadable {
            dir: self.dir.clone(),
            source,
        };

        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(unreadable)?;
        let mut removed = 0;
        let mut failures: Vec<io::Error> = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(unreadable)? {
            let path = entry.path();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            let result = if is_dir {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Cannot delete {}: {e}", path.display());
                    failures.push(e);
                }
            }
        }

        let failed = failures.len();
        match failures.into_iter().next() {
            None => Ok(removed),
            Some(first) => Err(StoreError::PartialClear {
                removed,
                failed,
                first,
            }),
        }
    }
}

/// A bare file name: no separators, no parent references.
pub fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains('\\') && !name.contains("..")
}

/// Content type by file extension. Unknown extensions are served as text.
pub fn mime_for(name: &str) -> &'static str {
    let ext = match name.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return "text/plain",
    };
    match ext.as_str() {
        "html" => "text/html",
        "txt" => "text/plain",
        "css" => "text/css",
        "gif" => "image/gif",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "svg" => "image/svg+xml",
        "js" => "application/javascript",
        _ => "text/plain",
    }
}
