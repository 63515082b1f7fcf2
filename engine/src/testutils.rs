//! Instrumented fakes for exercising races, caches and archives without a network.

use crate::cache::{MemoryObjectStore, ObjectInfo, ObjectStore, StoredObject};
use crate::client::{FetchedContent, NamedClient, ResolveFetchStore, ResourceLocator, StoreRequest};
use crate::errors::{ClientError, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Tracks how many calls are running at once across every client that shares it.
#[derive(Default)]
pub struct ConcurrencyTracker {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(self: &Arc<Self>) -> TrackerGuard {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        TrackerGuard(self.clone())
    }
}

struct TrackerGuard(Arc<ConcurrencyTracker>);

impl Drop for TrackerGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scriptable upstream client.
///
/// Locators it hands out are `<name>/<resource id>`; `fetch` refuses (and counts)
/// locators minted by any other client.
pub struct FakeClient {
    name: String,
    payload: Option<Bytes>,
    payloads: HashMap<String, Bytes>,
    hint: Option<String>,
    delay: Option<Duration>,
    hang: bool,
    fail_ids: HashSet<String>,
    failures_left: AtomicUsize,
    tracker: Arc<ConcurrencyTracker>,
    calls: Arc<AtomicUsize>,
    foreign_locators: Arc<AtomicUsize>,
    stored: Arc<Mutex<Vec<StoreRequest>>>,
}

impl FakeClient {
    fn new(name: &str, payload: Option<Bytes>) -> Self {
        FakeClient {
            name: name.to_string(),
            payload,
            payloads: HashMap::new(),
            hint: None,
            delay: None,
            hang: false,
            fail_ids: HashSet::new(),
            failures_left: AtomicUsize::new(0),
            tracker: ConcurrencyTracker::new(),
            calls: Arc::new(AtomicUsize::new(0)),
            foreign_locators: Arc::new(AtomicUsize::new(0)),
            stored: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn succeeding(name: &str, payload: &[u8]) -> Self {
        Self::new(name, Some(Bytes::copy_from_slice(payload)))
    }

    pub fn failing(name: &str) -> Self {
        Self::new(name, None)
    }

    /// Never answers; only timeouts end its calls.
    pub fn hanging(name: &str) -> Self {
        let mut client = Self::new(name, None);
        client.hang = true;
        client
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_hint(mut self, hint: &str) -> Self {
        self.hint = Some(hint.to_string());
        self
    }

    pub fn with_resource(mut self, resource_id: &str, payload: &[u8]) -> Self {
        self.payloads
            .insert(resource_id.to_string(), Bytes::copy_from_slice(payload));
        self
    }

    pub fn failing_for(mut self, resource_id: &str) -> Self {
        self.fail_ids.insert(resource_id.to_string());
        self
    }

    /// Fails the next `count` resolve calls, then behaves normally.
    pub fn failing_first(self, count: usize) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<ConcurrencyTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Number of resolve calls made so far.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    pub fn foreign_locators(&self) -> Arc<AtomicUsize> {
        self.foreign_locators.clone()
    }

    pub fn stored(&self) -> Arc<Mutex<Vec<StoreRequest>>> {
        self.stored.clone()
    }

    pub fn named(self) -> NamedClient {
        let name = self.name.clone();
        NamedClient::new(name, Arc::new(self))
    }

    async fn simulate_latency(&self) {
        if self.hang {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn should_fail(&self, resource_id: &str) -> bool {
        if self.payload.is_none() || self.fail_ids.contains(resource_id) {
            return true;
        }
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ResolveFetchStore for FakeClient {
    async fn resolve(&self, resource_id: &str) -> Result<ResourceLocator, ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _guard = self.tracker.enter();
        self.simulate_latency().await;

        if self.should_fail(resource_id) {
            return Err(ClientError::Rejected(format!("{} refused {}", self.name, resource_id)));
        }
        Ok(ResourceLocator::new(format!("{}/{}", self.name, resource_id)))
    }

    async fn fetch(&self, locator: &ResourceLocator) -> Result<FetchedContent, ClientError> {
        let _guard = self.tracker.enter();

        let prefix = format!("{}/", self.name);
        let Some(resource_id) = locator.as_str().strip_prefix(&prefix) else {
            self.foreign_locators.fetch_add(1, Ordering::SeqCst);
            return Err(ClientError::InvalidResponse(format!("foreign locator {locator}")));
        };

        let bytes = self
            .payloads
            .get(resource_id)
            .or(self.payload.as_ref())
            .cloned()
            .ok_or_else(|| ClientError::Request("no payload".into()))?;

        Ok(FetchedContent {
            bytes,
            content_type_hint: self.hint.clone(),
        })
    }

    async fn store(&self, request: &StoreRequest) -> Result<String, ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _guard = self.tracker.enter();
        self.simulate_latency().await;

        if self.payload.is_none() {
            return Err(ClientError::Rejected(format!("{} refused upload", self.name)));
        }
        self.stored.lock().push(request.clone());
        Ok(format!("{}:{}", self.name, request.name))
    }

    fn describe(&self) -> String {
        format!("FakeClient({})", self.name)
    }
}

/// Memory store whose reads and writes can be made to fail or stall.
#[derive(Default)]
pub struct FlakyObjectStore {
    inner: MemoryObjectStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl FlakyObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    async fn stall(&self) {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ObjectStore for FlakyObjectStore {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>, StoreError> {
        self.stall().await;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("list disabled".into()));
        }
        self.inner.list(bucket, prefix).await
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<StoredObject, StoreError> {
        self.stall().await;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("get disabled".into()));
        }
        self.inner.get(bucket, key).await
    }

    async fn put(&self, bucket: &str, key: &str, bytes: Bytes, content_type: &str) -> Result<(), StoreError> {
        self.stall().await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("put disabled".into()));
        }
        self.inner.put(bucket, key, bytes, content_type).await
    }
}
