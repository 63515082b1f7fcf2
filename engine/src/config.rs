use crate::client::RegistryError;
use crate::providers::telegram::DEFAULT_MAX_DOWNLOAD_BYTES;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Timeouts must increase strictly: cache < attempt < race < archive job")]
    TimeoutOrder,

    #[error("Limit {0} cannot be 0")]
    ZeroLimit(&'static str),

    #[error("Duplicate client name {name} in scope {scope}")]
    DuplicateClient { scope: String, name: String },

    #[error("Empty client name in scope {0}")]
    EmptyClientName(String),

    #[error("Empty token for client {name} in scope {scope}")]
    EmptyToken { scope: String, name: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid engine config: {0}")]
    Validation(#[from] ValidationError),

    #[error("could not register client: {0}")]
    Registry(#[from] RegistryError),

    #[error("could not build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Engine configuration
#[derive(Clone, Debug, Deserialize, PartialEq, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Client groups keyed by scope name
    #[serde(default)]
    pub scopes: BTreeMap<String, ScopeConfig>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Timeouts {
    /// Bounds every cache lookup and read
    pub cache_secs: u64,
    /// Bounds a single client attempt
    pub attempt_secs: u64,
    /// Bounds a whole race
    pub race_secs: u64,
    /// Bounds assembling one archive
    pub archive_job_secs: u64,
    /// Bounds a background cache write
    pub cache_write_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            cache_secs: 5,
            attempt_secs: 15,
            race_secs: 20,
            archive_job_secs: 300,
            cache_write_secs: 30,
        }
    }
}

impl Timeouts {
    pub fn cache(&self) -> Duration {
        Duration::from_secs(self.cache_secs)
    }

    pub fn attempt(&self) -> Duration {
        Duration::from_secs(self.attempt_secs)
    }

    pub fn race(&self) -> Duration {
        Duration::from_secs(self.race_secs)
    }

    pub fn archive_job(&self) -> Duration {
        Duration::from_secs(self.archive_job_secs)
    }

    pub fn cache_write(&self) -> Duration {
        Duration::from_secs(self.cache_write_secs)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Limits {
    /// Clients raced in the first wave
    pub max_fanout: usize,
    pub archive_max_items: usize,
    pub archive_max_in_flight: usize,
    /// Retries per archive item after the first attempt
    pub archive_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_fanout: 3,
            archive_max_items: 50,
            archive_max_in_flight: 4,
            archive_retries: 2,
            retry_backoff_ms: 250,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: Url,
    pub max_download_bytes: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig {
            base_url: Url::parse("https://api.telegram.org").expect("static url is valid"),
            max_download_bytes: DEFAULT_MAX_DOWNLOAD_BYTES,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum CacheConfig {
    Filesystem {
        root: PathBuf,
    },
    #[default]
    Memory,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Default)]
pub struct ScopeConfig {
    /// Chat that uploads for this scope are sent to
    pub destination: Option<String>,
    #[serde(default)]
    pub clients: Vec<ClientEntry>,
    /// Environment variable holding more comma separated client entries
    pub clients_env: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ClientEntry {
    Named { name: String, token: String },
    Compact(String),
}

/// A client entry with its name settled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientCredential {
    pub name: String,
    pub token: String,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let t = &self.timeouts;
        if !(t.cache_secs < t.attempt_secs && t.attempt_secs < t.race_secs && t.race_secs < t.archive_job_secs) {
            return Err(ValidationError::TimeoutOrder);
        }
        if t.cache_write_secs == 0 {
            return Err(ValidationError::ZeroLimit("cache_write_secs"));
        }

        let l = &self.limits;
        for (name, value) in [
            ("max_fanout", l.max_fanout),
            ("archive_max_items", l.archive_max_items),
            ("archive_max_in_flight", l.archive_max_in_flight),
        ] {
            if value == 0 {
                return Err(ValidationError::ZeroLimit(name));
            }
        }
        if self.provider.max_download_bytes == 0 {
            return Err(ValidationError::ZeroLimit("max_download_bytes"));
        }

        Ok(())
    }

    /// Resolves every scope's client list, reading `clients_env` through `env`.
    pub fn scope_credentials<F>(&self, env: F) -> Result<BTreeMap<String, Vec<ClientCredential>>, ValidationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut resolved = BTreeMap::new();

        for (scope, config) in &self.scopes {
            let mut entries = config.clients.clone();
            if let Some(var) = &config.clients_env {
                let value = env(var).unwrap_or_default();
                entries.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|entry| !entry.is_empty())
                        .map(|entry| ClientEntry::Compact(entry.to_string())),
                );
            }

            let credentials = parse_client_list(scope, &entries);
            let mut names = HashSet::new();
            for credential in &credentials {
                if credential.name.is_empty() {
                    return Err(ValidationError::EmptyClientName(scope.clone()));
                }
                if credential.token.is_empty() {
                    return Err(ValidationError::EmptyToken {
                        scope: scope.clone(),
                        name: credential.name.clone(),
                    });
                }
                if !names.insert(credential.name.clone()) {
                    return Err(ValidationError::DuplicateClient {
                        scope: scope.clone(),
                        name: credential.name.clone(),
                    });
                }
            }

            resolved.insert(scope.clone(), credentials);
        }

        Ok(resolved)
    }
}

/// Names every entry of a scope's client list.
///
/// Compact entries are either `name<token>` or a bare token. The first bare token is
/// the scope's `primary` client; later ones are named `<scope>_<position>`, counting
/// from 1. Malformed `<...>` entries are skipped.
pub fn parse_client_list(scope: &str, entries: &[ClientEntry]) -> Vec<ClientCredential> {
    let mut credentials = Vec::new();
    let mut seen_bare = false;

    for (index, entry) in entries.iter().enumerate() {
        let credential = match entry {
            ClientEntry::Named { name, token } => ClientCredential {
                name: name.trim().to_string(),
                token: token.trim().to_string(),
            },
            ClientEntry::Compact(raw) => {
                let raw = raw.trim();
                if raw.contains('<') || raw.contains('>') {
                    match parse_named(raw) {
                        Some(credential) => credential,
                        None => {
                            tracing::warn!(scope, position = index + 1, "Skipping malformed client entry");
                            continue;
                        }
                    }
                } else {
                    let name = if seen_bare {
                        format!("{scope}_{}", index + 1)
                    } else {
                        crate::client::PRIMARY_CLIENT_NAME.to_string()
                    };
                    seen_bare = true;
                    ClientCredential {
                        name,
                        token: raw.to_string(),
                    }
                }
            }
        };
        credentials.push(credential);
    }

    credentials
}

fn parse_named(raw: &str) -> Option<ClientCredential> {
    let start = raw.find('<')?;
    let end = raw.rfind('>')?;
    if start == 0 || end <= start {
        return None;
    }
    let name = raw[..start].trim();
    let token = raw[start + 1..end].trim();
    if name.is_empty() || token.is_empty() {
        return None;
    }
    Some(ClientCredential {
        name: name.to_string(),
        token: token.to_string(),
    })
}
