//! The cache-aware fetch path shared by single downloads and archive entries, plus
//! uploads.

use crate::cache::ContentCache;
use crate::client::{ClientGroup, FetchedContent, NamedClient, ScopeRegistry, StoreRequest};
use crate::content_type::{ResolvedType, resolve_content_type};
use crate::errors::{ClientError, EngineError, Result};
use crate::metrics_defs::{CACHE_HIT, CACHE_MISS, CACHE_READ_ERROR};
use crate::providers::LinkDownloader;
use crate::providers::link::link_file_name;
use crate::racer::Racer;
use crate::selector::select_client;
use bytes::Bytes;
use shared::counter;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{Duration, sleep, timeout};
use url::Url;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (zero based): `base * 2^retry`.
    pub fn backoff(&self, retry: u32) -> Duration {
        self.base_backoff.saturating_mul(2u32.saturating_pow(retry))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServedFrom {
    Cache,
    Origin { client: String },
}

#[derive(Clone, Debug)]
pub struct FetchedResource {
    pub resource_id: String,
    pub bytes: Bytes,
    pub content_type: String,
    pub extension: String,
    pub served_from: ServedFrom,
}

/// How an upload picks its client and destination.
#[derive(Clone, Copy, Debug, Default)]
pub struct StoreOptions<'a> {
    /// Client to use when not racing
    pub preferred: Option<&'a str>,
    /// Race the upload across the whole group
    pub race: bool,
    /// Overrides the scope's configured destination
    pub destination: Option<&'a str>,
    pub content_type_hint: Option<&'a str>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredResource {
    pub resource_id: String,
    pub client: String,
    pub content_type: String,
    pub extension: String,
}

/// Serves resources of every configured scope: cache first, then the scope's clients.
pub struct ContentService {
    registry: Arc<ScopeRegistry>,
    cache: ContentCache,
    racer: Racer,
    retry: RetryPolicy,
}

impl ContentService {
    pub fn new(registry: Arc<ScopeRegistry>, cache: ContentCache, racer: Racer, retry: RetryPolicy) -> Self {
        ContentService {
            registry,
            cache,
            racer,
            retry,
        }
    }

    pub fn registry(&self) -> &ScopeRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    pub fn group(&self, scope: &str) -> Result<&ClientGroup> {
        self.registry
            .get(scope)
            .ok_or_else(|| EngineError::UnknownScope(scope.to_string()))
    }

    /// Serves `resource_id` from the cache if possible, otherwise from the scope's
    /// clients. Origin results are written back to the cache in the background.
    ///
    /// With `preferred` set only that client (or the default one, if it doesn't exist)
    /// is asked; otherwise the group is raced. Cache failures count as misses.
    pub async fn fetch(&self, scope: &str, resource_id: &str, preferred: Option<&str>) -> Result<FetchedResource> {
        let group = self.group(scope)?;

        match self.cache.lookup(scope, resource_id).await {
            Ok(Some((entry, content))) => {
                counter!(CACHE_HIT, "scope" => scope.to_string()).increment(1);
                tracing::debug!(scope, resource_id, key = %entry.key(), "Cache hit");
                return Ok(FetchedResource {
                    resource_id: resource_id.to_string(),
                    bytes: content.bytes,
                    content_type: content.content_type,
                    extension: entry.extension,
                    served_from: ServedFrom::Cache,
                });
            }
            Ok(None) => {
                counter!(CACHE_MISS, "scope" => scope.to_string()).increment(1);
            }
            Err(error) => {
                counter!(CACHE_READ_ERROR, "scope" => scope.to_string()).increment(1);
                tracing::warn!(scope, resource_id, %error, "Cache unavailable, fetching from origin");
            }
        }

        let resource = self.fetch_origin(group, resource_id, preferred).await?;
        self.cache.spawn_write(
            scope,
            resource_id,
            &resource.extension,
            resource.bytes.clone(),
            &resource.content_type,
        );
        Ok(resource)
    }

    /// `fetch`, repeated on retryable failures with exponential backoff.
    pub async fn fetch_with_retries(
        &self,
        scope: &str,
        resource_id: &str,
        preferred: Option<&str>,
    ) -> Result<FetchedResource> {
        let mut retry = 0;
        loop {
            match self.fetch(scope, resource_id, preferred).await {
                Err(error) if error.is_retryable() && retry < self.retry.retries => {
                    let backoff = self.retry.backoff(retry);
                    tracing::debug!(scope, resource_id, retry, ?backoff, %error, "Retrying fetch");
                    sleep(backoff).await;
                    retry += 1;
                }
                result => return result,
            }
        }
    }

    async fn fetch_origin(
        &self,
        group: &ClientGroup,
        resource_id: &str,
        preferred: Option<&str>,
    ) -> Result<FetchedResource> {
        let (content, client) = match preferred.filter(|name| !name.is_empty()) {
            Some(_) => {
                let client = select_client(group, preferred)?;
                let content = self
                    .single_attempt(client.name(), "fetch", resolve_and_fetch(client.clone(), resource_id.to_string()))
                    .await?;
                (content, client.name().to_string())
            }
            None => {
                let resource_id = resource_id.to_string();
                let outcome = self
                    .racer
                    .race(group, "fetch", move |client, _token| {
                        resolve_and_fetch(client, resource_id.clone())
                    })
                    .await?;
                (outcome.value, outcome.winner.name().to_string())
            }
        };

        let ResolvedType { mime, extension } =
            resolve_content_type(&content.bytes, content.content_type_hint.as_deref());
        tracing::debug!(
            scope = group.scope(),
            resource_id,
            client,
            extension,
            size = content.bytes.len(),
            "Fetched from origin"
        );

        Ok(FetchedResource {
            resource_id: resource_id.to_string(),
            bytes: content.bytes,
            content_type: mime.to_string(),
            extension: extension.to_string(),
            served_from: ServedFrom::Origin { client },
        })
    }

    /// Uploads `bytes` to the scope's destination and returns the id the upstream
    /// assigned. With `race` the upload is raced across the group, which can leave
    /// duplicate copies upstream; otherwise a single selected client is used.
    pub async fn store(
        &self,
        scope: &str,
        name: &str,
        bytes: Bytes,
        preferred: Option<&str>,
        race: bool,
    ) -> Result<StoredResource> {
        let options = StoreOptions {
            preferred,
            race,
            ..StoreOptions::default()
        };
        self.store_with(scope, name, bytes, options).await
    }

    /// `store` with every knob exposed.
    pub async fn store_with(
        &self,
        scope: &str,
        name: &str,
        bytes: Bytes,
        options: StoreOptions<'_>,
    ) -> Result<StoredResource> {
        let group = self.group(scope)?;
        let destination = options
            .destination
            .filter(|d| !d.trim().is_empty())
            .or(group.store_destination())
            .ok_or_else(|| EngineError::NoStoreDestination {
                scope: scope.to_string(),
            })?;

        let ResolvedType { mime, extension } = resolve_content_type(&bytes, options.content_type_hint);
        let name = match name.trim() {
            "" => format!("upload.{extension}"),
            name => name.to_string(),
        };
        let request = StoreRequest {
            content_type: mime.to_string(),
            name,
            bytes: bytes.clone(),
            destination: destination.to_string(),
        };

        let (resource_id, client) = if options.race {
            let outcome = self
                .racer
                .race(group, "store", move |client, _token| {
                    let request = request.clone();
                    async move { client.capability().store(&request).await }
                })
                .await?;
            (outcome.value, outcome.winner.name().to_string())
        } else {
            let client = select_client(group, options.preferred)?;
            let capability = client.clone();
            let id = self
                .single_attempt(client.name(), "store", async move {
                    capability.capability().store(&request).await
                })
                .await?;
            (id, client.name().to_string())
        };

        tracing::info!(scope, resource_id, client, extension, "Stored resource");
        self.cache.spawn_write(scope, &resource_id, extension, bytes, mime);

        Ok(StoredResource {
            resource_id,
            client,
            content_type: mime.to_string(),
            extension: extension.to_string(),
        })
    }

    /// Copies a resource held by `source`, a client outside every scope, into `scope`.
    ///
    /// The source resolves and downloads on its own; only the bytes cross over to the
    /// scope's clients. The stored name is the last segment of the source locator.
    pub async fn transfer(
        &self,
        source: &NamedClient,
        resource_id: &str,
        scope: &str,
        options: StoreOptions<'_>,
    ) -> Result<StoredResource> {
        self.group(scope)?;

        let capability = source.clone();
        let id = resource_id.to_string();
        let (locator, content) = self
            .single_attempt(source.name(), "transfer", async move {
                let locator = capability.capability().resolve(&id).await?;
                let content = capability.capability().fetch(&locator).await?;
                Ok::<_, ClientError>((locator, content))
            })
            .await?;

        let name = locator.as_str().rsplit('/').next().unwrap_or_default();
        tracing::info!(
            scope,
            resource_id,
            source = %source.capability().describe(),
            size = content.bytes.len(),
            "Transferring resource"
        );

        let options = StoreOptions {
            content_type_hint: content.content_type_hint.as_deref(),
            ..options
        };
        self.store_with(scope, name, content.bytes, options).await
    }

    /// Downloads `link` and stores the result in `scope`. Without `name` the last path
    /// segment of the link is used.
    pub async fn store_from_link(
        &self,
        links: &LinkDownloader,
        scope: &str,
        link: &Url,
        name: Option<&str>,
        options: StoreOptions<'_>,
    ) -> Result<StoredResource> {
        self.group(scope)?;

        let content = self.single_attempt("link", "download", links.download(link)).await?;
        let name = match name.filter(|n| !n.trim().is_empty()) {
            Some(name) => name.to_string(),
            None => link_file_name(link),
        };
        tracing::info!(scope, host = ?link.host_str(), size = content.bytes.len(), "Downloaded link");

        let options = StoreOptions {
            content_type_hint: content.content_type_hint.as_deref(),
            ..options
        };
        self.store_with(scope, &name, content.bytes, options).await
    }

    async fn single_attempt<T>(
        &self,
        client: &str,
        operation: &'static str,
        fut: impl Future<Output = std::result::Result<T, ClientError>>,
    ) -> Result<T> {
        let limit = self.racer.timeouts().attempt;
        let result = timeout(limit, fut)
            .await
            .unwrap_or(Err(ClientError::Timeout(limit)));

        result.map_err(|source| EngineError::ClientFailed {
            operation,
            client: client.to_string(),
            source,
        })
    }
}

/// Resolve and download on the same client, so a locator never crosses clients.
async fn resolve_and_fetch(client: NamedClient, resource_id: String) -> std::result::Result<FetchedContent, ClientError> {
    let locator = client.capability().resolve(&resource_id).await?;
    client.capability().fetch(&locator).await
}
