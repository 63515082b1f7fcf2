//! Named upstream clients and the scopes that group them.
//!
//! A scope's `ClientGroup` is assembled once at startup through `ScopeRegistryBuilder`
//! and frozen into a `ScopeRegistry`. Request handling only ever reads the frozen
//! registry, so membership can't change while races are in flight.

use crate::errors::ClientError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Name of the client used when a caller doesn't pin one.
pub const PRIMARY_CLIENT_NAME: &str = "primary";

/// Provider-specific handle for a resolved resource.
///
/// Only meaningful to the client that produced it: locators may embed credentials or
/// paths that belong to a single upstream account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceLocator(String);

impl ResourceLocator {
    pub fn new(raw: impl Into<String>) -> Self {
        ResourceLocator(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bytes returned by an upstream fetch along with the upstream's content type, if any.
#[derive(Clone, Debug)]
pub struct FetchedContent {
    pub bytes: Bytes,
    pub content_type_hint: Option<String>,
}

/// Payload handed to an upstream for storage.
#[derive(Clone, Debug)]
pub struct StoreRequest {
    pub content_type: String,
    pub name: String,
    pub bytes: Bytes,
    pub destination: String,
}

/// Capabilities every upstream provider exposes.
///
/// Implementations must be safe to call concurrently with the same arguments on many
/// clients at once; the racer relies on it.
#[async_trait]
pub trait ResolveFetchStore: Send + Sync {
    /// Look up where the resource with `resource_id` can be downloaded from.
    async fn resolve(&self, resource_id: &str) -> Result<ResourceLocator, ClientError>;

    /// Download the bytes behind a locator produced by this same client.
    async fn fetch(&self, locator: &ResourceLocator) -> Result<FetchedContent, ClientError>;

    /// Upload bytes and return the resource id assigned by the upstream.
    async fn store(&self, request: &StoreRequest) -> Result<String, ClientError>;

    /// Description safe to write to logs (credentials redacted).
    fn describe(&self) -> String;
}

/// One interchangeable upstream credential with a name unique within its scope.
#[derive(Clone)]
pub struct NamedClient {
    name: Arc<str>,
    capability: Arc<dyn ResolveFetchStore>,
}

impl NamedClient {
    pub fn new(name: impl Into<String>, capability: Arc<dyn ResolveFetchStore>) -> Self {
        NamedClient {
            name: Arc::from(name.into()),
            capability,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capability(&self) -> &dyn ResolveFetchStore {
        self.capability.as_ref()
    }
}

/// Builds a one-off client for a credential that belongs to no scope, such as the
/// source side of a transfer.
pub trait ClientFactory: Send + Sync {
    fn client_for(&self, credential: &str) -> NamedClient;
}

impl<F> ClientFactory for F
where
    F: Fn(&str) -> NamedClient + Send + Sync,
{
    fn client_for(&self, credential: &str) -> NamedClient {
        self(credential)
    }
}

impl fmt::Debug for NamedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedClient")
            .field("name", &self.name)
            .field("capability", &self.capability.describe())
            .finish()
    }
}

/// Ordered, immutable set of clients serving one scope.
#[derive(Clone, Debug)]
pub struct ClientGroup {
    scope: String,
    members: Arc<[NamedClient]>,
    store_destination: Option<String>,
}

impl ClientGroup {
    pub fn new(
        scope: impl Into<String>,
        members: Vec<NamedClient>,
        store_destination: Option<String>,
    ) -> Self {
        ClientGroup {
            scope: scope.into(),
            members: members.into(),
            store_destination,
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn members(&self) -> &[NamedClient] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&NamedClient> {
        self.members.iter().find(|client| client.name() == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.members.iter().map(|c| c.name().to_string()).collect()
    }

    /// Where uploads for this scope are sent, e.g. a chat id.
    pub fn store_destination(&self) -> Option<&str> {
        self.store_destination.as_deref()
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum RegistryError {
    #[error("duplicate client name {name} in scope {scope}")]
    DuplicateClient { scope: String, name: String },

    #[error("empty client name in scope {0}")]
    EmptyClientName(String),
}

#[derive(Default)]
struct PendingScope {
    members: Vec<NamedClient>,
    store_destination: Option<String>,
}

/// Collects clients per scope during startup.
#[derive(Default)]
pub struct ScopeRegistryBuilder {
    scopes: HashMap<String, PendingScope>,
}

impl ScopeRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a scope even if it ends up with no clients.
    pub fn add_scope(&mut self, scope: &str, store_destination: Option<String>) -> &mut Self {
        let pending = self.scopes.entry(scope.to_string()).or_default();
        if store_destination.is_some() {
            pending.store_destination = store_destination;
        }
        self
    }

    pub fn add_client(&mut self, scope: &str, client: NamedClient) -> Result<&mut Self, RegistryError> {
        if client.name().is_empty() {
            return Err(RegistryError::EmptyClientName(scope.to_string()));
        }

        let pending = self.scopes.entry(scope.to_string()).or_default();
        if pending.members.iter().any(|c| c.name() == client.name()) {
            return Err(RegistryError::DuplicateClient {
                scope: scope.to_string(),
                name: client.name().to_string(),
            });
        }
        pending.members.push(client);
        Ok(self)
    }

    pub fn build(self) -> ScopeRegistry {
        let scopes = self
            .scopes
            .into_iter()
            .map(|(scope, pending)| {
                let group = ClientGroup::new(scope.clone(), pending.members, pending.store_destination);
                (scope, group)
            })
            .collect();

        ScopeRegistry { scopes }
    }
}

/// Frozen scope → client group mapping shared by every request.
#[derive(Debug, Default)]
pub struct ScopeRegistry {
    scopes: HashMap<String, ClientGroup>,
}

impl ScopeRegistry {
    pub fn builder() -> ScopeRegistryBuilder {
        ScopeRegistryBuilder::new()
    }

    pub fn get(&self, scope: &str) -> Option<&ClientGroup> {
        self.scopes.get(scope)
    }

    pub fn contains(&self, scope: &str) -> bool {
        self.scopes.contains_key(scope)
    }

    /// Client names per scope, omitting scopes without clients.
    pub fn details(&self) -> BTreeMap<String, Vec<String>> {
        self.scopes
            .iter()
            .filter(|(_, group)| !group.is_empty())
            .map(|(scope, group)| (scope.clone(), group.names()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::FakeClient;

    #[test]
    fn test_builder_preserves_insertion_order() {
        let mut builder = ScopeRegistry::builder();
        for name in ["primary", "backup", "spare"] {
            builder
                .add_client("telegram", FakeClient::succeeding(name, b"x").named())
                .unwrap();
        }
        let registry = builder.build();

        let group = registry.get("telegram").unwrap();
        assert_eq!(group.scope(), "telegram");
        assert_eq!(group.names(), vec!["primary", "backup", "spare"]);
        assert_eq!(group.get("backup").unwrap().name(), "backup");
        assert!(group.get("missing").is_none());
    }

    #[test]
    fn test_duplicate_and_empty_names_rejected() {
        let mut builder = ScopeRegistry::builder();
        builder
            .add_client("telegram", FakeClient::succeeding("primary", b"x").named())
            .unwrap();

        let err = builder
            .add_client("telegram", FakeClient::succeeding("primary", b"y").named())
            .err()
            .unwrap();
        assert_eq!(
            err,
            RegistryError::DuplicateClient {
                scope: "telegram".into(),
                name: "primary".into()
            }
        );

        // The same name in another scope is fine
        assert!(
            builder
                .add_client("tracker", FakeClient::succeeding("primary", b"z").named())
                .is_ok()
        );

        assert!(matches!(
            builder.add_client("tracker", FakeClient::succeeding("", b"z").named()),
            Err(RegistryError::EmptyClientName(_))
        ));
    }

    #[test]
    fn test_details_skip_empty_scopes() {
        let mut builder = ScopeRegistry::builder();
        builder.add_scope("empty", None);
        builder.add_scope("telegram", Some("-100".into()));
        builder
            .add_client("telegram", FakeClient::succeeding("primary", b"x").named())
            .unwrap();
        let registry = builder.build();

        assert!(registry.contains("empty"));
        assert!(registry.get("empty").unwrap().is_empty());
        assert_eq!(registry.get("telegram").unwrap().store_destination(), Some("-100"));

        let details = registry.details();
        assert_eq!(details.len(), 1);
        assert_eq!(details["telegram"], vec!["primary"]);
    }
}
