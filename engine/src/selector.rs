use crate::client::{ClientGroup, NamedClient, PRIMARY_CLIENT_NAME};
use crate::errors::{EngineError, Result};

/// Picks exactly one client of `group` for callers that don't want a race.
///
/// Lookup order: the preferred name if it exists, then the member named `primary`,
/// then the first member. An unmatched preferred name is not an error.
pub fn select_client<'a>(group: &'a ClientGroup, preferred: Option<&str>) -> Result<&'a NamedClient> {
    let preferred = preferred.filter(|name| !name.is_empty());

    if let Some(name) = preferred {
        if let Some(client) = group.get(name) {
            return Ok(client);
        }
        tracing::warn!(
            scope = group.scope(),
            client = name,
            "Requested client not found, falling back to default"
        );
    }

    group
        .get(PRIMARY_CLIENT_NAME)
        .or_else(|| group.members().first())
        .ok_or_else(|| EngineError::NoClientsAvailable {
            scope: group.scope().to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::FakeClient;

    fn group(names: &[&str]) -> ClientGroup {
        let members = names
            .iter()
            .map(|name| FakeClient::succeeding(name, b"x").named())
            .collect();
        ClientGroup::new("telegram", members, None)
    }

    #[test]
    fn test_empty_group() {
        let empty = group(&[]);
        for preferred in [None, Some(""), Some("primary"), Some("x")] {
            assert!(matches!(
                select_client(&empty, preferred),
                Err(EngineError::NoClientsAvailable { .. })
            ));
        }
    }

    #[test]
    fn test_single_member() {
        let single = group(&["only"]);
        for preferred in [None, Some(""), Some("only"), Some("missing")] {
            assert_eq!(select_client(&single, preferred).unwrap().name(), "only");
        }
    }

    #[test]
    fn test_with_default_member() {
        let g = group(&["first", "primary", "third"]);
        assert_eq!(select_client(&g, None).unwrap().name(), "primary");
        assert_eq!(select_client(&g, Some("")).unwrap().name(), "primary");
        assert_eq!(select_client(&g, Some("third")).unwrap().name(), "third");
        assert_eq!(select_client(&g, Some("first")).unwrap().name(), "first");
        assert_eq!(select_client(&g, Some("nope")).unwrap().name(), "primary");
    }

    #[test]
    fn test_without_default_member() {
        let g = group(&["alpha", "beta", "gamma"]);
        assert_eq!(select_client(&g, None).unwrap().name(), "alpha");
        assert_eq!(select_client(&g, Some("")).unwrap().name(), "alpha");
        assert_eq!(select_client(&g, Some("gamma")).unwrap().name(), "gamma");
        assert_eq!(select_client(&g, Some("PRIMARY")).unwrap().name(), "alpha");
    }
}
