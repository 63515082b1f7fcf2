//! Content cache keyed by `<resource id>.<extension>` in one bucket per scope.

pub mod object_store;

pub use object_store::{FilesystemObjectStore, MemoryObjectStore, ObjectInfo, ObjectStore, StoredObject};

use crate::content_type::mime_for_extension;
use crate::errors::{EngineError, Result, StoreError};
use crate::metrics_defs::CACHE_WRITE_ERROR;
use bytes::Bytes;
use shared::counter;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};

/// A stored object that can serve `resource_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub resource_id: String,
    pub extension: String,
    pub size_bytes: u64,
    pub content_type: String,
}

impl CacheEntry {
    pub fn key(&self) -> String {
        object_key(&self.resource_id, &self.extension)
    }
}

#[derive(Clone, Debug)]
pub struct CachedContent {
    pub bytes: Bytes,
    pub content_type: String,
}

pub fn object_key(resource_id: &str, extension: &str) -> String {
    format!("{resource_id}.{extension}")
}

#[derive(Clone)]
pub struct ContentCache {
    store: Arc<dyn ObjectStore>,
    timeout: Duration,
    write_timeout: Duration,
}

impl ContentCache {
    /// `timeout` bounds lookups and reads; `write_timeout` bounds background writes.
    pub fn new(store: Arc<dyn ObjectStore>, timeout: Duration, write_timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            write_timeout,
        }
    }

    /// Finds the first non-empty object whose key is exactly `resource_id` plus an
    /// extension. The extension is everything after the last dot, so `abc` never matches
    /// `abc123.png` and `abc1234` never matches `abc123.png`.
    pub async fn find_entry(&self, scope: &str, resource_id: &str) -> Result<Option<CacheEntry>> {
        let objects = bounded(self.timeout, self.store.list(scope, resource_id))
            .await
            .map_err(EngineError::CacheRead)?;

        let entry = objects.into_iter().find_map(|object| {
            let (base, extension) = object.key.rsplit_once('.')?;
            if object.size == 0 || base != resource_id || extension.is_empty() {
                return None;
            }
            Some(CacheEntry {
                resource_id: resource_id.to_string(),
                extension: extension.to_string(),
                size_bytes: object.size,
                content_type: mime_for_extension(extension).to_string(),
            })
        });

        Ok(entry)
    }

    pub async fn read(&self, scope: &str, entry: &CacheEntry) -> Result<CachedContent> {
        let object = bounded(self.timeout, self.store.get(scope, &entry.key()))
            .await
            .map_err(EngineError::CacheRead)?;

        let content_type = object
            .content_type
            .filter(|ct| is_informative(ct))
            .unwrap_or_else(|| entry.content_type.clone());

        Ok(CachedContent {
            bytes: object.bytes,
            content_type,
        })
    }

    /// Find and read in one step. `Ok(None)` is a miss.
    pub async fn lookup(&self, scope: &str, resource_id: &str) -> Result<Option<(CacheEntry, CachedContent)>> {
        let Some(entry) = self.find_entry(scope, resource_id).await? else {
            return Ok(None);
        };
        let content = self.read(scope, &entry).await?;
        Ok(Some((entry, content)))
    }

    pub async fn write(
        &self,
        scope: &str,
        resource_id: &str,
        extension: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<()> {
        let key = object_key(resource_id, extension);
        bounded(self.write_timeout, self.store.put(scope, &key, bytes, content_type))
            .await
            .map_err(EngineError::CacheWrite)
    }

    /// Writes in a detached task so the caller's response never waits on the store.
    /// Failures are logged and counted, nothing else.
    pub fn spawn_write(
        &self,
        scope: &str,
        resource_id: &str,
        extension: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> JoinHandle<()> {
        let cache = self.clone();
        let scope = scope.to_string();
        let resource_id = resource_id.to_string();
        let extension = extension.to_string();
        let content_type = content_type.to_string();

        tokio::spawn(async move {
            match cache
                .write(&scope, &resource_id, &extension, bytes, &content_type)
                .await
            {
                Ok(()) => tracing::debug!(scope, resource_id, extension, "Cached resource"),
                Err(error) => {
                    counter!(CACHE_WRITE_ERROR, "scope" => scope.clone()).increment(1);
                    tracing::warn!(scope, resource_id, %error, "Failed to cache resource");
                }
            }
        })
    }
}

fn is_informative(content_type: &str) -> bool {
    let content_type = content_type.trim();
    !content_type.is_empty() && !content_type.starts_with("application/octet-stream")
}

async fn bounded<T>(
    limit: Duration,
    fut: impl Future<Output = std::result::Result<T, StoreError>>,
) -> std::result::Result<T, StoreError> {
    timeout(limit, fut)
        .await
        .unwrap_or(Err(StoreError::Timeout(limit)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::FlakyObjectStore;

    fn cache_with(store: Arc<dyn ObjectStore>) -> ContentCache {
        ContentCache::new(store, Duration::from_secs(5), Duration::from_secs(30))
    }

    async fn seeded() -> ContentCache {
        let store = Arc::new(MemoryObjectStore::new());
        store
            .put("telegram", "abc123.png", Bytes::from_static(b"png"), "image/png")
            .await
            .unwrap();
        cache_with(store)
    }

    #[tokio::test]
    async fn test_find_entry_exact_key() {
        let cache = seeded().await;

        let entry = cache.find_entry("telegram", "abc123").await.unwrap().unwrap();
        assert_eq!(entry.key(), "abc123.png");
        assert_eq!(entry.size_bytes, 3);
        assert_eq!(entry.content_type, "image/png");

        assert!(cache.find_entry("telegram", "abc").await.unwrap().is_none());
        assert!(cache.find_entry("telegram", "abc1234").await.unwrap().is_none());
        assert!(cache.find_entry("other", "abc123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_entry_skips_empty_and_extensionless_objects() {
        let store = Arc::new(MemoryObjectStore::new());
        store
            .put("telegram", "f1.bin", Bytes::new(), "application/octet-stream")
            .await
            .unwrap();
        store
            .put("telegram", "f1.", Bytes::from_static(b"x"), "text/plain")
            .await
            .unwrap();
        let cache = cache_with(store.clone());
        assert!(cache.find_entry("telegram", "f1").await.unwrap().is_none());

        store
            .put("telegram", "f1.jpg", Bytes::from_static(b"jpeg"), "image/jpeg")
            .await
            .unwrap();
        let entry = cache.find_entry("telegram", "f1").await.unwrap().unwrap();
        assert_eq!(entry.extension, "jpg");
    }

    #[tokio::test]
    async fn test_find_entry_uses_last_dot() {
        let store = Arc::new(MemoryObjectStore::new());
        store
            .put("telegram", "a.b.mp4", Bytes::from_static(b"v"), "video/mp4")
            .await
            .unwrap();
        let cache = cache_with(store);

        let entry = cache.find_entry("telegram", "a.b").await.unwrap().unwrap();
        assert_eq!(entry.extension, "mp4");
        assert!(cache.find_entry("telegram", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_content_type_fallback() {
        let store = Arc::new(MemoryObjectStore::new());
        store
            .put("telegram", "doc.pdf", Bytes::from_static(b"%PDF"), "application/octet-stream")
            .await
            .unwrap();
        let cache = cache_with(store);

        let (entry, content) = cache.lookup("telegram", "doc").await.unwrap().unwrap();
        assert_eq!(entry.extension, "pdf");
        assert_eq!(content.bytes.as_ref(), b"%PDF");
        assert_eq!(content.content_type, "application/pdf");
    }

    #[tokio::test]
    async fn test_store_errors_surface_as_cache_errors() {
        let store = Arc::new(FlakyObjectStore::new());
        store.fail_reads(true);
        let cache = cache_with(store.clone());

        assert!(matches!(
            cache.find_entry("telegram", "abc").await,
            Err(EngineError::CacheRead(_))
        ));

        store.fail_writes(true);
        assert!(matches!(
            cache
                .write("telegram", "abc", "png", Bytes::from_static(b"x"), "image/png")
                .await,
            Err(EngineError::CacheWrite(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_entry_timeout() {
        let store = Arc::new(FlakyObjectStore::new());
        store.set_delay(Duration::from_secs(60));
        let cache = ContentCache::new(store, Duration::from_secs(5), Duration::from_secs(30));

        match cache.find_entry("telegram", "abc").await {
            Err(EngineError::CacheRead(StoreError::Timeout(limit))) => {
                assert_eq!(limit, Duration::from_secs(5))
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_spawn_write() {
        let store = Arc::new(MemoryObjectStore::new());
        let cache = cache_with(store.clone());

        cache
            .spawn_write("telegram", "f9", "gif", Bytes::from_static(b"GIF89a"), "image/gif")
            .await
            .unwrap();

        let object = store.get("telegram", "f9.gif").await.unwrap();
        assert_eq!(object.bytes.as_ref(), b"GIF89a");
        assert_eq!(object.content_type.as_deref(), Some("image/gif"));
    }
}
