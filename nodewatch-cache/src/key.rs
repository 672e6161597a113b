//! Structured cache keys.
//!
//! A [`CacheKey`] pairs a query kind with the resource it inspects and renders
//! to `"<kind>:<resource>"`. Putting the kind first means every key for one
//! kind shares a prefix, and every key for one resource of that kind shares a
//! longer prefix, so `invalidate_prefix` can target either.

use serde::Serialize;
use std::fmt;

/// Separator between the query kind and the resource.
const SEPARATOR: char = ':';

/// Kind of inspection a key caches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    NodeList,
    NodeInfo,
    NodeParams,
    LifecycleState,
    ServiceList,
    Custom(String),
}

impl QueryKind {
    pub fn as_str(&self) -> &str {
        match self {
            QueryKind::NodeList => "node_list",
            QueryKind::NodeInfo => "node_info",
            QueryKind::NodeParams => "node_params",
            QueryKind::LifecycleState => "lifecycle_state",
            QueryKind::ServiceList => "service_list",
            QueryKind::Custom(name) => name,
        }
    }

    fn from_name(s: &str) -> Self {
        match s {
            "node_list" => QueryKind::NodeList,
            "node_info" => QueryKind::NodeInfo,
            "node_params" => QueryKind::NodeParams,
            "lifecycle_state" => QueryKind::LifecycleState,
            "service_list" => QueryKind::ServiceList,
            other => QueryKind::Custom(other.to_string()),
        }
    }

    /// Kinds whose keys are scoped to a single node.
    pub fn per_node() -> [QueryKind; 3] {
        [
            QueryKind::NodeInfo,
            QueryKind::NodeParams,
            QueryKind::LifecycleState,
        ]
    }
}

/// Cache key for one (query kind, resource) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    kind: QueryKind,
    resource: String,
    rendered: String,
}

impl CacheKey {
    pub fn new(kind: QueryKind, resource: impl Into<String>) -> Self {
        let resource = resource.into();
        let rendered = format!("{}{}{}", kind.as_str(), SEPARATOR, resource);
        Self {
            kind,
            resource,
            rendered,
        }
    }

    pub fn node_list() -> Self {
        Self::new(QueryKind::NodeList, "all")
    }

    pub fn node_info(node: &str) -> Self {
        Self::new(QueryKind::NodeInfo, node)
    }

    pub fn node_params(node: &str) -> Self {
        Self::new(QueryKind::NodeParams, node)
    }

    pub fn lifecycle_state(node: &str) -> Self {
        Self::new(QueryKind::LifecycleState, node)
    }

    pub fn service_list() -> Self {
        Self::new(QueryKind::ServiceList, "all")
    }

    /// Parse a rendered key back into its parts.
    ///
    /// Returns `None` if the key has no separator.
    pub fn parse(rendered: &str) -> Option<Self> {
        let (kind, resource) = rendered.split_once(SEPARATOR)?;
        Some(Self::new(QueryKind::from_name(kind), resource))
    }

    /// Prefix covering every key of `kind` for `resource`.
    pub fn prefix(kind: &QueryKind, resource: &str) -> String {
        format!("{}{}{}", kind.as_str(), SEPARATOR, resource)
    }

    pub fn kind(&self) -> &QueryKind {
        &self.kind
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn as_str(&self) -> &str {
        &self.rendered
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.rendered
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rendering() {
        assert_eq!(CacheKey::node_list().as_str(), "node_list:all");
        assert_eq!(
            CacheKey::node_info("/planning/planner").as_str(),
            "node_info:/planning/planner"
        );
        assert_eq!(
            CacheKey::new(QueryKind::Custom("topics".into()), "/x").to_string(),
            "topics:/x"
        );
    }

    #[test]
    fn test_parse_keeps_colons_in_resource() {
        let key = CacheKey::parse("node_params:/ns/node:extra").unwrap();
        assert_eq!(key.kind(), &QueryKind::NodeParams);
        assert_eq!(key.resource(), "/ns/node:extra");
        assert!(CacheKey::parse("no-separator").is_none());
    }

    #[test]
    fn test_prefix_covers_child_resources() {
        let prefix = CacheKey::prefix(&QueryKind::NodeInfo, "/sensing");
        assert!(CacheKey::node_info("/sensing/lidar").as_str().starts_with(&prefix));
        assert!(!CacheKey::node_params("/sensing/lidar").as_str().starts_with(&prefix));
    }
}
