//! # Filesystem Key-Value Collection
//!
//! One directory per collection, one pretty-printed JSON file per key.
//! Keys are percent-encoded into file names so identifiers containing
//! `:`, `#` or `/` map to a single flat file, and decoding is the exact
//! inverse of encoding.
//!
//! Writes go to a uniquely named temporary file in the same directory
//! which is then renamed over the target, so readers observe either the
//! previous content or the complete new content.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use shared::{
    config::StoreConfig,
    constants::*,
    error::{StoreError, StoreResult},
    types::RecordStatus,
};

/// Suffix of in-flight temporary files
const TEMP_SUFFIX: &str = ".tmp";

// =============================================================================
// KEY ENCODING
// =============================================================================

/// Encode a key into a file-name stem
pub fn encode_key(key: &str) -> String {
    urlencoding::encode(key).into_owned()
}

/// Decode a file-name stem back into a key
///
/// Returns `None` for stems that `encode_key` could not have produced.
pub fn decode_key(stem: &str) -> Option<String> {
    let key = urlencoding::decode(stem).ok()?.into_owned();
    (encode_key(&key) == stem).then_some(key)
}

// =============================================================================
// COLLECTION
// =============================================================================

/// A mapping from string key to serialized document, backed by a directory
#[derive(Debug, Clone)]
pub struct Collection {
    /// Name used in errors and logs ("pending", "keys", ...)
    name: String,

    /// Directory holding the collection's files
    dir: PathBuf,

    /// File extension (including the leading dot)
    extension: &'static str,
}

impl Collection {
    /// Create a collection over an arbitrary directory
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>, extension: &'static str) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
            extension,
        }
    }

    /// DID documents in one status area of the configured method/mode
    pub fn documents(config: &StoreConfig, status: RecordStatus) -> Self {
        Self::new(
            status.dir_name(),
            config.documents_dir(status),
            DOCUMENT_EXTENSION,
        )
    }

    /// Exported key material
    pub fn keys(config: &StoreConfig) -> Self {
        Self::new(KEYS_DIR, config.keys_dir(), KEYS_EXTENSION)
    }

    /// Per-identifier metadata
    pub fn meta(config: &StoreConfig) -> Self {
        Self::new(META_DIR, config.meta_dir(), META_EXTENSION)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding `key`
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}", encode_key(key), self.extension))
    }

    /// Serialize `value` and write it under `key`, replacing any prior value
    pub async fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StoreResult<()> {
        let path = self.path_for(key);
        let content = serde_json::to_vec_pretty(value)?;

        write_atomic(&path, &content).await?;

        debug!(collection = %self.name, key = %key, path = ?path, "Document stored");
        Ok(())
    }

    /// Load the value stored under `key`
    ///
    /// Returns `Ok(None)` when the key is absent and `Deserialization` when
    /// the file exists but does not parse as `T`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        let path = self.path_for(key);

        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error("read", &path, e)),
        };

        let value = serde_json::from_slice(&content).map_err(|e| StoreError::Deserialization {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        debug!(collection = %self.name, key = %key, "Document loaded");
        Ok(Some(value))
    }

    /// Delete `key`; returns `false` when it was already absent
    pub async fn remove(&self, key: &str) -> StoreResult<bool> {
        let path = self.path_for(key);

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(collection = %self.name, key = %key, "Document removed");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error("remove", &path, e)),
        }
    }

    /// Check whether `key` is present without parsing it
    pub async fn contains(&self, key: &str) -> StoreResult<bool> {
        let path = self.path_for(key);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_error("stat", &path, e))
    }

    /// All keys currently present, sorted
    ///
    /// A missing directory is an empty collection. Temporary files, files
    /// with another extension and names that do not decode are skipped.
    pub async fn list(&self) -> StoreResult<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("list", &self.dir, e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("list", &self.dir, e))?
        {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                warn!(collection = %self.name, path = ?entry.path(), "Skipping non UTF-8 file name");
                continue;
            };

            if is_temp_file(file_name) {
                continue;
            }

            let Some(stem) = file_name.strip_suffix(self.extension) else {
                continue;
            };

            match decode_key(stem) {
                Some(key) => keys.push(key),
                None => {
                    warn!(collection = %self.name, file = %file_name, "Skipping undecodable file name")
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

// =============================================================================
// FILE HELPERS
// =============================================================================

/// Create `dir` (and parents) with owner-only permissions
pub(crate) async fn ensure_dir(dir: &Path) -> StoreResult<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(DIR_MODE);

    builder
        .create(dir)
        .await
        .map_err(|e| io_error("create directory", dir, e))
}

/// Replace `path` with `content` via a temporary file and a rename
pub(crate) async fn write_atomic(path: &Path, content: &[u8]) -> StoreResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::Io(format!("{:?} has no parent directory", path)))?;
    ensure_dir(parent).await?;

    let tmp_path = temp_path(path);
    if let Err(e) = write_new_file(&tmp_path, content).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(io_error("write", &tmp_path, e));
    }

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(io_error("rename", path, e));
    }

    Ok(())
}

/// Create a file that must not exist yet and flush `content` to disk
async fn write_new_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(FILE_MODE);

    let mut file = options.open(path).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    Ok(())
}

/// Hidden sibling of `path` unique to this write
fn temp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}{}", file_name, Uuid::new_v4().simple(), TEMP_SUFFIX))
}

/// Whether `file_name` has the `.<name>.<uuid>.tmp` shape of [`temp_path`]
fn is_temp_file(file_name: &str) -> bool {
    let Some(inner) = file_name
        .strip_prefix('.')
        .and_then(|rest| rest.strip_suffix(TEMP_SUFFIX))
    else {
        return false;
    };

    match inner.rsplit_once('.') {
        Some((name, id)) => {
            !name.is_empty() && id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit())
        }
        None => false,
    }
}

pub(crate) fn io_error(action: &str, path: &Path, err: std::io::Error) -> StoreError {
    StoreError::Io(format!("failed to {} {:?}: {}", action, path, err))
}
