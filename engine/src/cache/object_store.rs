//! Object storage backends behind the content cache.
//!
//! Buckets are flat namespaces of keys. Keys are plain file names: no separators and no
//! leading dot, which keeps the filesystem backend's bookkeeping files out of listings.

use crate::errors::StoreError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
}

#[derive(Clone, Debug)]
pub struct StoredObject {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Objects of `bucket` whose key starts with `prefix`, ordered by key.
    /// A missing bucket lists as empty.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>, StoreError>;

    async fn get(&self, bucket: &str, key: &str) -> Result<StoredObject, StoreError>;

    /// Creates or replaces an object. Concurrent writers to the same key: last one wins.
    async fn put(&self, bucket: &str, key: &str, bytes: Bytes, content_type: &str) -> Result<(), StoreError>;
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\', '\0']) {
        return Err(StoreError::InvalidKey(name.to_string()));
    }
    Ok(())
}

#[derive(Default)]
pub struct MemoryObjectStore {
    buckets: RwLock<BTreeMap<String, BTreeMap<String, StoredObject>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>, StoreError> {
        let buckets = self.buckets.read();
        let Some(objects) = buckets.get(bucket) else {
            return Ok(Vec::new());
        };

        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectInfo {
                key: key.clone(),
                size: object.bytes.len() as u64,
            })
            .collect())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<StoredObject, StoreError> {
        self.buckets
            .read()
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn put(&self, bucket: &str, key: &str, bytes: Bytes, content_type: &str) -> Result<(), StoreError> {
        validate_name(bucket)?;
        validate_name(key)?;

        let object = StoredObject {
            bytes,
            content_type: Some(content_type.to_string()),
        };
        self.buckets
            .write()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), object);
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct ObjectMetadata {
    content_type: String,
}

const METADATA_DIR: &str = ".meta";

/// Stores each bucket as a directory under `root` and each object as a file.
///
/// Content types live in `<bucket>/.meta/<key>.json`. Writes go to a temporary file that
/// is renamed into place, so readers never observe a partially written object.
pub struct FilesystemObjectStore {
    root: PathBuf,
    sequence: AtomicU64,
}

impl FilesystemObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FilesystemObjectStore {
            root: root.into(),
            sequence: AtomicU64::new(0),
        }
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf, StoreError> {
        validate_name(bucket)?;
        Ok(self.root.join(bucket))
    }

    fn metadata_path(bucket_dir: &Path, key: &str) -> PathBuf {
        bucket_dir.join(METADATA_DIR).join(format!("{key}.json"))
    }

    async fn write_atomic(&self, dir: &Path, target: &Path, contents: &[u8]) -> Result<(), StoreError> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let temp = dir.join(format!(".tmp-{}-{}", std::process::id(), sequence));

        tokio::fs::write(&temp, contents).await?;
        if let Err(e) = tokio::fs::rename(&temp, target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FilesystemObjectStore {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>, StoreError> {
        let dir = self.bucket_dir(bucket)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut objects = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(key) = entry.file_name().into_string() else {
                continue;
            };
            if key.starts_with('.') || !key.starts_with(prefix) {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            objects.push(ObjectInfo {
                key,
                size: metadata.len(),
            });
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<StoredObject, StoreError> {
        let dir = self.bucket_dir(bucket)?;
        validate_name(key)?;

        let bytes = match tokio::fs::read(dir.join(key)).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        // Objects written by hand have no metadata; that's fine
        let content_type = match tokio::fs::read(Self::metadata_path(&dir, key)).await {
            Ok(raw) => Some(serde_json::from_slice::<ObjectMetadata>(&raw)?.content_type),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        Ok(StoredObject { bytes, content_type })
    }

    async fn put(&self, bucket: &str, key: &str, bytes: Bytes, content_type: &str) -> Result<(), StoreError> {
        let dir = self.bucket_dir(bucket)?;
        validate_name(key)?;

        let metadata_dir = dir.join(METADATA_DIR);
        tokio::fs::create_dir_all(&metadata_dir).await?;

        let metadata = serde_json::to_vec(&ObjectMetadata {
            content_type: content_type.to_string(),
        })?;
        self.write_atomic(&metadata_dir, &Self::metadata_path(&dir, key), &metadata)
            .await?;
        self.write_atomic(&dir, &dir.join(key), &bytes).await?;

        tracing::debug!(bucket, key, size = bytes.len(), "Stored object");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise_store(store: &dyn ObjectStore) {
        assert!(store.list("telegram", "abc").await.unwrap().is_empty());

        store
            .put("telegram", "abc123.png", Bytes::from_static(b"png-bytes"), "image/png")
            .await
            .unwrap();
        store
            .put("telegram", "abc123.jpg", Bytes::from_static(b""), "image/jpeg")
            .await
            .unwrap();
        store
            .put("telegram", "zzz.txt", Bytes::from_static(b"z"), "text/plain")
            .await
            .unwrap();
        store
            .put("other", "abc123.png", Bytes::from_static(b"other"), "image/png")
            .await
            .unwrap();

        let listed = store.list("telegram", "abc").await.unwrap();
        assert_eq!(
            listed,
            vec![
                ObjectInfo {
                    key: "abc123.jpg".into(),
                    size: 0
                },
                ObjectInfo {
                    key: "abc123.png".into(),
                    size: 9
                },
            ]
        );

        let object = store.get("telegram", "abc123.png").await.unwrap();
        assert_eq!(object.bytes.as_ref(), b"png-bytes");
        assert_eq!(object.content_type.as_deref(), Some("image/png"));

        // Last write wins
        store
            .put("telegram", "abc123.png", Bytes::from_static(b"newer"), "image/png")
            .await
            .unwrap();
        let object = store.get("telegram", "abc123.png").await.unwrap();
        assert_eq!(object.bytes.as_ref(), b"newer");

        assert!(matches!(
            store.get("telegram", "missing.png").await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store
                .put("telegram", "../escape", Bytes::new(), "text/plain")
                .await,
            Err(StoreError::InvalidKey(_))
        ));
        assert!(matches!(
            store.put("telegram", ".hidden", Bytes::new(), "text/plain").await,
            Err(StoreError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise_store(&MemoryObjectStore::new()).await;
    }

    #[tokio::test]
    async fn test_filesystem_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new(dir.path());
        exercise_store(&store).await;

        // Bookkeeping files never show up as objects
        let all = store.list("telegram", "").await.unwrap();
        let keys: Vec<_> = all.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["abc123.jpg", "abc123.png", "zzz.txt"]);
    }

    #[tokio::test]
    async fn test_filesystem_object_without_metadata() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("telegram")).unwrap();
        std::fs::write(dir.path().join("telegram").join("manual.pdf"), b"%PDF").unwrap();

        let store = FilesystemObjectStore::new(dir.path());
        let object = store.get("telegram", "manual.pdf").await.unwrap();
        assert_eq!(object.bytes.as_ref(), b"%PDF");
        assert!(object.content_type.is_none());
    }
}
