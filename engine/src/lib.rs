pub mod archive;
pub mod cache;
pub mod client;
pub mod config;
pub mod content_type;
pub mod errors;
pub mod locator;
pub mod metrics_defs;
pub mod pipeline;
pub mod providers;
pub mod racer;
pub mod selector;

#[cfg(any(test, feature = "testutils"))]
pub mod testutils;

pub use archive::{ArchiveAssembler, ArchiveItem, ArchiveJob, ArchiveLimits, ArchiveStream};
pub use cache::{CacheEntry, ContentCache};
pub use client::{ClientFactory, ClientGroup, NamedClient, ResolveFetchStore, ResourceLocator, ScopeRegistry};
pub use errors::{ClientError, EngineError, StoreError};
pub use pipeline::{ContentService, FetchedResource, ServedFrom, StoreOptions, StoredResource};

use crate::cache::{FilesystemObjectStore, MemoryObjectStore, ObjectStore};
use crate::config::{CacheConfig, ConfigError, EngineConfig, ProviderConfig};
use crate::pipeline::RetryPolicy;
use crate::errors::Result;
use crate::providers::{BotApiClient, BotApiFactory, LinkDownloader};
use crate::racer::{RaceTimeouts, Racer};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Everything built from an `EngineConfig`, shared by all request handlers.
pub struct Engine {
    service: Arc<ContentService>,
    archive: ArchiveAssembler,
    sources: Arc<dyn ClientFactory>,
    links: LinkDownloader,
}

impl Engine {
    /// Transfers and link downloads go through the default provider settings until
    /// `with_sources` / `with_links` replace them.
    pub fn new(service: Arc<ContentService>, limits: ArchiveLimits) -> Self {
        let archive = ArchiveAssembler::new(service.clone(), limits);
        let provider = ProviderConfig::default();
        let http = reqwest::Client::new();
        Engine {
            service,
            archive,
            sources: Arc::new(BotApiFactory::new(
                http.clone(),
                provider.base_url,
                provider.max_download_bytes,
            )),
            links: LinkDownloader::new(http, provider.max_download_bytes),
        }
    }

    pub fn with_sources(mut self, sources: Arc<dyn ClientFactory>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_links(mut self, links: LinkDownloader) -> Self {
        self.links = links;
        self
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        Self::from_config_with_env(config, |name| std::env::var(name).ok())
    }

    /// Like `from_config`, reading `clients_env` variables through `env`.
    pub fn from_config_with_env<F>(config: &EngineConfig, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        config.validate()?;
        let credentials = config.scope_credentials(env)?;
        let http = reqwest::Client::builder().build()?;

        let mut builder = ScopeRegistry::builder();
        for (scope, clients) in credentials {
            let destination = config
                .scopes
                .get(&scope)
                .and_then(|scope_config| scope_config.destination.clone());
            builder.add_scope(&scope, destination);

            let count = clients.len();
            for credential in clients {
                let client = BotApiClient::new(
                    http.clone(),
                    &config.provider.base_url,
                    credential.token,
                    config.provider.max_download_bytes,
                );
                builder.add_client(&scope, NamedClient::new(credential.name, Arc::new(client)))?;
            }

            if count == 0 {
                tracing::warn!(scope, "Scope has no clients configured");
            } else {
                tracing::info!(scope, clients = count, "Registered scope");
            }
        }

        let store: Arc<dyn ObjectStore> = match &config.cache {
            CacheConfig::Filesystem { root } => Arc::new(FilesystemObjectStore::new(root.clone())),
            CacheConfig::Memory => Arc::new(MemoryObjectStore::new()),
        };

        let timeouts = &config.timeouts;
        let limits = &config.limits;
        let service = ContentService::new(
            Arc::new(builder.build()),
            ContentCache::new(store, timeouts.cache(), timeouts.cache_write()),
            Racer::new(
                RaceTimeouts {
                    attempt: timeouts.attempt(),
                    race: timeouts.race(),
                },
                limits.max_fanout,
            ),
            RetryPolicy {
                retries: limits.archive_retries,
                base_backoff: Duration::from_millis(limits.retry_backoff_ms),
            },
        );

        let provider = &config.provider;
        let sources = BotApiFactory::new(http.clone(), provider.base_url.clone(), provider.max_download_bytes);
        let links = LinkDownloader::new(http, provider.max_download_bytes);

        let engine = Self::new(
            Arc::new(service),
            ArchiveLimits {
                max_items: limits.archive_max_items,
                max_in_flight: limits.archive_max_in_flight,
                job_timeout: timeouts.archive_job(),
            },
        );
        Ok(engine.with_sources(Arc::new(sources)).with_links(links))
    }

    pub fn service(&self) -> &Arc<ContentService> {
        &self.service
    }

    pub fn archive(&self) -> &ArchiveAssembler {
        &self.archive
    }

    /// Copies `resource_id`, readable with the foreign `credential`, into `scope`.
    pub async fn transfer(
        &self,
        credential: &str,
        resource_id: &str,
        scope: &str,
        options: StoreOptions<'_>,
    ) -> Result<StoredResource> {
        let source = self.sources.client_for(credential);
        self.service.transfer(&source, resource_id, scope, options).await
    }

    pub async fn upload_link(
        &self,
        scope: &str,
        link: &Url,
        name: Option<&str>,
        options: StoreOptions<'_>,
    ) -> Result<StoredResource> {
        self.service
            .store_from_link(&self.links, scope, link, name, options)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_config() {
        let yaml = r#"
scopes:
    telegram:
        destination: "-100"
        clients: ["111:aaa", "backup<222:bbb>"]
    tracker:
        clients_env: BOT_TRACKER
    idle: {}
"#;
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        let engine =
            Engine::from_config_with_env(&config, |_| Some("333:ccc".to_string())).unwrap();

        let registry = engine.service().registry();
        let details = registry.details();
        assert_eq!(details["telegram"], vec!["primary", "backup"]);
        assert_eq!(details["tracker"], vec!["primary"]);
        assert!(!details.contains_key("idle"));
        assert!(registry.contains("idle"));

        let telegram = registry.get("telegram").unwrap();
        assert_eq!(telegram.store_destination(), Some("-100"));
        assert!(!telegram.members()[0].capability().describe().contains("111:aaa"));

        assert_eq!(engine.archive().limits().max_items, 50);
    }

    #[tokio::test]
    async fn test_transfer_uses_factory_client() {
        use crate::cache::MemoryObjectStore;
        use crate::testutils::FakeClient;

        let target = FakeClient::succeeding("primary", b"");
        let stored = target.stored();
        let mut builder = ScopeRegistry::builder();
        builder.add_scope("telegram", Some("-100".into()));
        builder.add_client("telegram", target.named()).unwrap();
        let service = ContentService::new(
            Arc::new(builder.build()),
            ContentCache::new(
                Arc::new(MemoryObjectStore::new()),
                Duration::from_secs(5),
                Duration::from_secs(30),
            ),
            Racer::new(
                RaceTimeouts {
                    attempt: Duration::from_secs(5),
                    race: Duration::from_secs(10),
                },
                3,
            ),
            RetryPolicy {
                retries: 0,
                base_backoff: Duration::from_millis(1),
            },
        );
        let limits = ArchiveLimits {
            max_items: 1,
            max_in_flight: 1,
            job_timeout: Duration::from_secs(60),
        };
        let engine = Engine::new(Arc::new(service), limits).with_sources(Arc::new(|credential: &str| {
            FakeClient::succeeding("source", credential.as_bytes()).named()
        }));

        let result = engine
            .transfer("999:zzz", "doc", "telegram", StoreOptions::default())
            .await
            .unwrap();
        assert_eq!(result.resource_id, "primary:doc");
        assert_eq!(stored.lock()[0].bytes.as_ref(), b"999:zzz");
    }

    #[test]
    fn test_from_config_rejects_invalid() {
        let mut config = EngineConfig::default();
        config.limits.max_fanout = 0;
        assert!(matches!(
            Engine::from_config_with_env(&config, |_| None),
            Err(ConfigError::Validation(_))
        ));
    }
}
