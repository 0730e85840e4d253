use std::fmt::Write as _;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::{OffsetStore, check_monotonic};
use crate::message::{Offset, StreamKey};
use crate::{Error, Result};

/// File backed [OffsetStore], one JSON document per [StreamKey] inside `dir`.
///
/// Documents are replaced by writing and syncing a sibling temp file, renaming it over the old one
/// and syncing the directory, so a crash leaves either the previous or the new offset on disk,
/// never a torn or empty file.
#[derive(Debug)]
pub struct FileOffsetStore {
    dir: PathBuf,
    // serializes read-compare-write cycles of this process.
    write_lock: Mutex<()>,
}

/// On-disk representation of a committed offset.
#[derive(Debug, Serialize, Deserialize)]
struct OffsetDocument {
    topic: String,
    partition: u32,
    client_id: String,
    offset: Offset,
}

impl FileOffsetStore {
    /// Opens the store, creating `dir` if it does not exist.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            Error::StoreUnavailable(format!(
                "creating offset directory {}: {e}",
                dir.display()
            ))
        })?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn document_path(&self, key: &StreamKey) -> PathBuf {
        self.dir.join(format!(
            "{}.{}.{}.json",
            escape_component(key.topic()),
            key.partition(),
            escape_component(key.client_id())
        ))
    }

    async fn read_document(&self, key: &StreamKey) -> Result<Option<Offset>> {
        let path = self.document_path(key);
        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::StoreUnavailable(format!(
                    "reading {}: {e}",
                    path.display()
                )));
            }
        };

        let document: OffsetDocument = serde_json::from_slice(&contents).map_err(|e| {
            Error::StoreUnavailable(format!("corrupt offset document {}: {e}", path.display()))
        })?;
        Ok(Some(document.offset))
    }
}

#[async_trait]
impl OffsetStore for FileOffsetStore {
    async fn get(&self, key: &StreamKey) -> Result<Option<Offset>> {
        self.read_document(key).await
    }

    async fn commit(&self, key: &StreamKey, offset: Offset) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let stored = self.read_document(key).await?;
        check_monotonic(key, stored, offset)?;
        if stored == Some(offset) {
            debug!(%key, offset, "Offset already committed, skipping write");
            return Ok(());
        }

        let document = OffsetDocument {
            topic: key.topic().to_string(),
            partition: key.partition(),
            client_id: key.client_id().to_string(),
            offset,
        };
        let contents = serde_json::to_vec(&document)
            .map_err(|e| Error::Internal(format!("encoding offset document: {e}")))?;

        self.replace_document(&self.document_path(key), &contents)
            .await
    }

    fn name(&self) -> &str {
        "file"
    }
}

impl FileOffsetStore {
    /// Writes `contents` to a temp file, syncs it, renames it over `path` and syncs the
    /// directory so the rename itself survives a power loss.
    async fn replace_document(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let tmp_path = path.with_extension("json.tmp");
        let unavailable = |what: &str, at: &Path, e: std::io::Error| {
            Error::StoreUnavailable(format!("{what} {}: {e}", at.display()))
        };

        let mut file = File::create(&tmp_path)
            .await
            .map_err(|e| unavailable("creating", tmp_path.as_path(), e))?;
        file.write_all(contents)
            .await
            .map_err(|e| unavailable("writing", tmp_path.as_path(), e))?;
        file.sync_all()
            .await
            .map_err(|e| unavailable("syncing", tmp_path.as_path(), e))?;
        drop(file);

        tokio::fs::rename(&tmp_path, path)
            .await
            .map_err(|e| unavailable("renaming into", path, e))?;

        let dir = File::open(&self.dir)
            .await
            .map_err(|e| unavailable("opening", self.dir.as_path(), e))?;
        dir.sync_all()
            .await
            .map_err(|e| unavailable("syncing", self.dir.as_path(), e))?;
        Ok(())
    }
}

/// Keeps file names portable for topics and client ids with separators or other special
/// characters by hex escaping everything outside `[A-Za-z0-9_-]`.
fn escape_component(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            escaped.push(char::from(byte));
        } else {
            let _ = write!(escaped, "%{byte:02X}");
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn test_commit_survives_reopen() {
        let tmp_dir = TempDir::new().unwrap();
        let key = StreamKey::new("orders", 3, "client-a").unwrap();

        let store = FileOffsetStore::open(tmp_dir.path()).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), None);
        store.commit(&key, 13).await.unwrap();
        drop(store);

        let store = FileOffsetStore::open(tmp_dir.path()).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some(13));
    }

    #[tokio::test]
    async fn test_stale_commit_and_idempotent_commit() {
        let tmp_dir = TempDir::new().unwrap();
        let key = StreamKey::new("orders", 0, "client-a").unwrap();
        let store = FileOffsetStore::open(tmp_dir.path()).await.unwrap();

        store.commit(&key, 20).await.unwrap();
        store.commit(&key, 20).await.unwrap();

        let err = store.commit(&key, 19).await.unwrap_err();
        assert!(matches!(
            err,
            Error::StaleCommit {
                stored: 20,
                attempted: 19,
                ..
            }
        ));
        assert_eq!(store.get(&key).await.unwrap(), Some(20));
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let tmp_dir = TempDir::new().unwrap();
        let key = StreamKey::new("a/b", 0, "client").unwrap();
        let store = FileOffsetStore::open(tmp_dir.path().join("nested"))
            .await
            .unwrap();

        for offset in 0..5 {
            store.commit(&key, offset).await.unwrap();
        }

        let mut entries = tokio::fs::read_dir(store.dir()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["a%2Fb.0.client.json".to_string()]);
    }

    #[tokio::test]
    async fn test_corrupt_document_is_unavailable() {
        let tmp_dir = TempDir::new().unwrap();
        let key = StreamKey::new("orders", 0, "client").unwrap();
        let store = FileOffsetStore::open(tmp_dir.path()).await.unwrap();

        tokio::fs::write(tmp_dir.path().join("orders.0.client.json"), b"{not json")
            .await
            .unwrap();

        assert!(matches!(
            store.get(&key).await,
            Err(Error::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_interrupted_write_keeps_previous_offset() {
        let tmp_dir = TempDir::new().unwrap();
        let key = StreamKey::new("orders", 0, "client").unwrap();
        let store = FileOffsetStore::open(tmp_dir.path()).await.unwrap();
        store.commit(&key, 7).await.unwrap();

        // a crash between creating and renaming the temp file leaves it half written
        let tmp_path = tmp_dir.path().join("orders.0.client.json.tmp");
        tokio::fs::write(&tmp_path, b"{\"topic\":").await.unwrap();

        let store = FileOffsetStore::open(tmp_dir.path()).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some(7));

        store.commit(&key, 8).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some(8));
        assert!(!tmp_path.exists());
    }

    #[test]
    fn test_escape_component() {
        assert_eq!(escape_component("plain-name_1"), "plain-name_1");
        assert_eq!(escape_component("a.b/c"), "a%2Eb%2Fc");
    }
}
