//! Method + path-pattern route table.

use http::Method;
use std::collections::HashMap;

#[derive(Debug, PartialEq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A path like `/instant/{scope}/{id}`. Surrounding slashes are ignored on both the
/// pattern and the request path.
#[derive(Debug)]
struct PathPattern {
    segments: Vec<Segment>,
}

impl PathPattern {
    fn parse(pattern: &str) -> Self {
        let segments = split(pattern)
            .map(|s| match s.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Some(name) => Segment::Param(name.to_string()),
                None => Segment::Literal(s.to_string()),
            })
            .collect();
        PathPattern { segments }
    }

    fn matches<'a>(&self, path: &'a str) -> Option<HashMap<&str, &'a str>> {
        let parts: Vec<&'a str> = split(path).collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut params = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(literal) if literal == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(_) if part.is_empty() => return None,
                Segment::Param(name) => {
                    params.insert(name.as_str(), part);
                }
            }
        }
        Some(params)
    }
}

fn split(path: &str) -> impl Iterator<Item = &str> {
    let trimmed = path.trim().trim_matches('/');
    trimmed.split('/').filter(move |_| !trimmed.is_empty())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Instant,
    Archive,
    Upload,
    UploadLink,
    Transfer,
    Scopes,
    CachedOnly,
}

impl Action {
    /// Label used for metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Instant => "instant",
            Action::Archive => "archive",
            Action::Upload => "upload",
            Action::UploadLink => "upload_link",
            Action::Transfer => "transfer",
            Action::Scopes => "scopes",
            Action::CachedOnly => "cache",
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum RouteMatch<'r, 'p> {
    Found {
        action: Action,
        params: HashMap<&'r str, &'p str>,
    },
    MethodNotAllowed,
    NotFound,
}

struct Route {
    method: Method,
    pattern: PathPattern,
    action: Action,
}

pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new(routes: &[(Method, &str, Action)]) -> Self {
        let routes = routes
            .iter()
            .map(|(method, pattern, action)| Route {
                method: method.clone(),
                pattern: PathPattern::parse(pattern),
                action: *action,
            })
            .collect();
        Router { routes }
    }

    /// The gateway's public endpoints.
    pub fn gateway() -> Self {
        Self::new(&[
            (Method::GET, "/instant/{scope}/{id}", Action::Instant),
            (Method::GET, "/instant/{scope}/{id}/{client}", Action::Instant),
            (Method::POST, "/archive", Action::Archive),
            (Method::POST, "/upload/{scope}", Action::Upload),
            (Method::POST, "/upload/{scope}/link", Action::UploadLink),
            (Method::POST, "/transfer", Action::Transfer),
            (Method::GET, "/scopes", Action::Scopes),
            (Method::GET, "/cache/{scope}/{id}", Action::CachedOnly),
        ])
    }

    pub fn resolve<'r, 'p>(&'r self, method: &Method, path: &'p str) -> RouteMatch<'r, 'p> {
        let mut path_matched = false;
        for route in &self.routes {
            let Some(params) = route.pattern.matches(path) else {
                continue;
            };
            if route.method == method {
                return RouteMatch::Found {
                    action: route.action,
                    params,
                };
            }
            path_matched = true;
        }

        if path_matched {
            RouteMatch::MethodNotAllowed
        } else {
            RouteMatch::NotFound
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn found<'r, 'p>(m: RouteMatch<'r, 'p>) -> (Action, HashMap<&'r str, &'p str>) {
        match m {
            RouteMatch::Found { action, params } => (action, params),
            other => panic!("expected a match, got {other:?}"),
        }
    }

    #[test]
    fn test_instant_routes() {
        let router = Router::gateway();

        let (action, params) = found(router.resolve(&Method::GET, "/instant/telegram/AgAD123"));
        assert_eq!(action, Action::Instant);
        assert_eq!(params.get("scope").copied(), Some("telegram"));
        assert_eq!(params.get("id").copied(), Some("AgAD123"));
        assert!(!params.contains_key("client"));

        let (_, params) = found(router.resolve(&Method::GET, "/instant/telegram/AgAD123/backup/"));
        assert_eq!(params.get("client").copied(), Some("backup"));
    }

    #[test]
    fn test_static_and_param_routes() {
        let router = Router::gateway();
        assert_eq!(found(router.resolve(&Method::GET, "/scopes")).0, Action::Scopes);
        assert_eq!(found(router.resolve(&Method::POST, "/archive/")).0, Action::Archive);

        let (action, params) = found(router.resolve(&Method::POST, "/upload/tracker"));
        assert_eq!(action, Action::Upload);
        assert_eq!(params.get("scope").copied(), Some("tracker"));

        let (action, params) = found(router.resolve(&Method::POST, "/upload/tracker/link"));
        assert_eq!(action, Action::UploadLink);
        assert_eq!(params.get("scope").copied(), Some("tracker"));
        assert_eq!(found(router.resolve(&Method::POST, "/transfer")).0, Action::Transfer);
    }

    #[test]
    fn test_no_match() {
        let router = Router::gateway();
        assert_eq!(router.resolve(&Method::GET, "/"), RouteMatch::NotFound);
        assert_eq!(router.resolve(&Method::GET, "/instant/telegram"), RouteMatch::NotFound);
        assert_eq!(router.resolve(&Method::GET, "/instant//x"), RouteMatch::NotFound);
        assert_eq!(router.resolve(&Method::GET, "/scopes/extra"), RouteMatch::NotFound);
        assert_eq!(router.resolve(&Method::GET, "/archive"), RouteMatch::MethodNotAllowed);
        assert_eq!(router.resolve(&Method::DELETE, "/scopes"), RouteMatch::MethodNotAllowed);
    }

    #[test]
    fn test_pattern_parsing() {
        let pattern = PathPattern::parse("/cache/{scope}/{id}/");
        assert_eq!(
            pattern.segments,
            vec![
                Segment::Literal("cache".into()),
                Segment::Param("scope".into()),
                Segment::Param("id".into()),
            ]
        );
        assert!(PathPattern::parse("").segments.is_empty());
        assert!(PathPattern::parse("/").matches("").is_some());
    }
}
