//! Node inspection through the shared cache.
//!
//! [`InspectionFetcher`] turns a cache key into one `ros2` CLI call and parses
//! its output into JSON. [`NodeInspector`] is what the routes talk to: every
//! read goes through the [`TtlCache`], so concurrent requests for the same
//! node share one command, and mutations invalidate the keys they affect.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nodewatch_cache::{CacheKey, CacheRead, Fetcher, Freshness, QueryKind, RefreshScheduler, TtlCache};
use nodewatch_core::{ConfigError, FetchError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ApiError, ApiResult, ErrorCode};
use crate::transport::CommandTransport;

// ============================================================================
// TYPES
// ============================================================================

/// Topics, services and actions of one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub subscribers: Vec<String>,
    pub publishers: Vec<String>,
    pub services: Vec<String>,
    pub actions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Exposes `<name>/get_state`.
    Lifecycle,
    Regular,
    /// The service list could not be read.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub name: String,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeListing {
    pub total: usize,
    pub nodes: Vec<NodeSummary>,
    pub fetched_at: DateTime<Utc>,
    /// True if the list is past its TTL and a refresh is running.
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDetail {
    pub name: String,
    pub kind: NodeKind,
    #[serde(flatten)]
    pub info: NodeInfo,
    pub parameters: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifecycle_state: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleStateResponse {
    pub name: String,
    pub state: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownOutcome {
    pub name: String,
    pub kind: NodeKind,
    pub message: String,
    /// Cache entries dropped after the shutdown.
    pub invalidated: usize,
}

// ============================================================================
// NAMES
// ============================================================================

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '/' || c == '~'
}

/// Validate a node name and give it a leading `/`.
pub fn normalize_node_name(name: &str) -> ApiResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::missing_field("name"));
    }
    if !name.chars().all(is_name_char) {
        return Err(ApiError::invalid_format("name", "a ROS node name like /ns/node"));
    }
    let name = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    };
    if name == "/" {
        return Err(ApiError::invalid_format("name", "a ROS node name like /ns/node"));
    }
    Ok(name)
}

// ============================================================================
// OUTPUT PARSERS
// ============================================================================

/// `ros2 node list`: one name per line, other lines ignored.
pub fn parse_node_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('/'))
        .map(str::to_string)
        .collect()
}

/// `ros2 service list`: one service per non-empty line.
pub fn parse_service_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Clone, Copy)]
enum Section {
    Subscribers,
    Publishers,
    Services,
    Actions,
    Skipped,
}

fn section_header(line: &str) -> Option<Section> {
    if line.contains("Subscribers:") {
        Some(Section::Subscribers)
    } else if line.contains("Publishers:") {
        Some(Section::Publishers)
    } else if line.contains("Service Servers:") || line.contains("Services:") {
        Some(Section::Services)
    } else if line.contains("Action Servers:") {
        Some(Section::Actions)
    } else if line.contains("Action Clients:") || line.contains("Service Clients:") {
        Some(Section::Skipped)
    } else {
        None
    }
}

/// `ros2 node info`: entries are `/name: type` lines under section headers.
/// Client sections are skipped.
pub fn parse_node_info(output: &str) -> NodeInfo {
    let mut info = NodeInfo::default();
    let mut section = Section::Skipped;

    for line in output.lines().map(str::trim) {
        if !line.starts_with('/') {
            if let Some(next) = section_header(line) {
                section = next;
            }
            continue;
        }

        let name = line.split(':').next().unwrap_or(line).trim().to_string();
        match section {
            Section::Subscribers => info.subscribers.push(name),
            Section::Publishers => info.publishers.push(name),
            Section::Services => info.services.push(name),
            Section::Actions => info.actions.push(name),
            Section::Skipped => {}
        }
    }
    info
}

/// `ros2 param dump --print`: the `ros__parameters` map under the node's
/// top-level key. Output that can't be read yields an empty object.
pub fn parse_param_dump(output: &str, node: &str) -> Value {
    let empty = || Value::Object(serde_json::Map::new());

    let doc: serde_yaml::Value = match serde_yaml::from_str(output) {
        Ok(doc) => doc,
        Err(e) => {
            tracing::debug!(node = %node, error = %e, "Unreadable parameter dump");
            return empty();
        }
    };
    let Some(top) = doc.as_mapping() else {
        return empty();
    };

    top.values()
        .find_map(|section| section.get("ros__parameters"))
        .and_then(|params| serde_json::to_value(params).ok())
        .unwrap_or_else(empty)
}

/// `ros2 lifecycle get`: `current state: active [3]` gives `active`.
pub fn parse_lifecycle_state(output: &str) -> Option<String> {
    if !output.to_lowercase().contains("current state:") {
        return None;
    }
    output
        .rsplit(':')
        .next()
        .and_then(|rest| rest.split_whitespace().next())
        .map(str::to_lowercase)
}

// ============================================================================
// FETCHER
// ============================================================================

/// Runs the `ros2` command behind a cache key.
pub struct InspectionFetcher {
    transport: Arc<dyn CommandTransport>,
}

impl InspectionFetcher {
    pub fn new(transport: Arc<dyn CommandTransport>) -> Self {
        Self { transport }
    }

    /// CLI command for a key, or `None` for keys this fetcher doesn't serve.
    pub fn command_for(key: &CacheKey) -> Option<String> {
        let node = key.resource();
        let per_node = !matches!(key.kind(), QueryKind::NodeList | QueryKind::ServiceList);
        if per_node && (node.is_empty() || !node.chars().all(is_name_char)) {
            return None;
        }

        match key.kind() {
            QueryKind::NodeList => Some("ros2 node list".to_string()),
            QueryKind::ServiceList => Some("ros2 service list".to_string()),
            QueryKind::NodeInfo => Some(format!("ros2 node info {}", node)),
            QueryKind::NodeParams => Some(format!("ros2 param dump {} --print", node)),
            QueryKind::LifecycleState => Some(format!("ros2 lifecycle get {}", node)),
            QueryKind::Custom(_) => None,
        }
    }
}

#[async_trait]
impl Fetcher<Value> for InspectionFetcher {
    async fn fetch(&self, key: &str) -> Result<Value, FetchError> {
        let parsed = CacheKey::parse(key)
            .ok_or_else(|| FetchError::failed(key, "unrecognized cache key"))?;
        let command = Self::command_for(&parsed)
            .ok_or_else(|| FetchError::failed(key, "no command for this cache key"))?;

        let output = self
            .transport
            .exec(&command)
            .await
            .map_err(|e| e.into_fetch_error(key))?;

        let value = match parsed.kind() {
            QueryKind::NodeList => Value::from(parse_node_list(&output)),
            QueryKind::ServiceList => Value::from(parse_service_list(&output)),
            QueryKind::NodeInfo => serde_json::to_value(parse_node_info(&output))
                .map_err(|e| FetchError::failed(key, e.to_string()))?,
            QueryKind::NodeParams => parse_param_dump(&output, parsed.resource()),
            QueryKind::LifecycleState => parse_lifecycle_state(&output)
                .map(Value::String)
                .unwrap_or(Value::Null),
            QueryKind::Custom(_) => Value::Null,
        };
        Ok(value)
    }
}

// ============================================================================
// INSPECTOR
// ============================================================================

/// Cached view of the ROS graph.
pub struct NodeInspector {
    transport: Arc<dyn CommandTransport>,
    fetcher: Arc<InspectionFetcher>,
    cache: TtlCache<Value>,
    ttl: Duration,
    max_staleness: Duration,
}

impl NodeInspector {
    pub fn new(
        transport: Arc<dyn CommandTransport>,
        cache: TtlCache<Value>,
        max_staleness: Duration,
    ) -> Self {
        let ttl = cache.config().default_ttl;
        Self {
            fetcher: Arc::new(InspectionFetcher::new(Arc::clone(&transport))),
            transport,
            cache,
            ttl,
            max_staleness,
        }
    }

    pub fn cache(&self) -> &TtlCache<Value> {
        &self.cache
    }

    pub fn fetcher(&self) -> Arc<InspectionFetcher> {
        Arc::clone(&self.fetcher)
    }

    /// Keep the node and service lists warm.
    pub fn register_refresh(
        &self,
        scheduler: &RefreshScheduler<Value>,
        interval: Duration,
    ) -> Result<(), ConfigError> {
        for key in [CacheKey::node_list(), CacheKey::service_list()] {
            scheduler.register(key.as_str(), interval, self.ttl, self.fetcher())?;
        }
        Ok(())
    }

    async fn read(&self, key: CacheKey, freshness: Freshness) -> Result<CacheRead<Value>, FetchError> {
        let fetcher = self.fetcher();
        let rendered = key.as_str().to_string();
        self.cache
            .get(&key, self.ttl, freshness, move || async move {
                fetcher.fetch(&rendered).await
            })
            .await
    }

    fn freshness(&self, allow_stale: bool) -> Freshness {
        if allow_stale {
            Freshness::stale_tolerant(self.max_staleness)
        } else {
            Freshness::Fresh
        }
    }

    /// Every running node with its kind, sorted by name.
    pub async fn list_nodes(&self, allow_stale: bool) -> ApiResult<NodeListing> {
        let freshness = self.freshness(allow_stale);
        let (nodes, services) = tokio::join!(
            self.read(CacheKey::node_list(), freshness),
            self.read(CacheKey::service_list(), freshness),
        );

        let nodes = nodes?;
        let mut names: Vec<String> = serde_json::from_value(nodes.value().clone())
            .map_err(|e| ApiError::internal_error(format!("Corrupt node list: {}", e)))?;
        names.sort();
        names.dedup();

        let services: Option<Vec<String>> = match services {
            Ok(read) => serde_json::from_value(read.into_value()).ok(),
            Err(e) => {
                tracing::warn!(error = %e, "Service list unavailable, node kinds unknown");
                None
            }
        };

        let nodes_out: Vec<NodeSummary> = names
            .into_iter()
            .map(|name| {
                let kind = node_kind(&name, services.as_deref());
                NodeSummary { name, kind }
            })
            .collect();

        Ok(NodeListing {
            total: nodes_out.len(),
            nodes: nodes_out,
            fetched_at: nodes.fetched_at(),
            stale: nodes.is_stale(),
        })
    }

    async fn find_node(&self, name: &str) -> ApiResult<NodeSummary> {
        let listing = self.list_nodes(false).await?;
        listing
            .nodes
            .into_iter()
            .find(|node| node.name == name)
            .ok_or_else(|| ApiError::node_not_found(name))
    }

    /// Topics, services, parameters and (for lifecycle nodes) state.
    pub async fn node_detail(&self, name: &str) -> ApiResult<NodeDetail> {
        let name = normalize_node_name(name)?;
        let summary = self.find_node(&name).await?;

        let (info, params) = tokio::join!(
            self.read(CacheKey::node_info(&name), Freshness::Fresh),
            self.read(CacheKey::node_params(&name), Freshness::Fresh),
        );

        let info = info?;
        let fetched_at = info.fetched_at();
        let info: NodeInfo = serde_json::from_value(info.into_value())
            .map_err(|e| ApiError::internal_error(format!("Corrupt node info: {}", e)))?;

        let parameters = match params {
            Ok(read) => read.into_value(),
            Err(e) => {
                tracing::warn!(node = %name, error = %e, "Parameter dump failed");
                Value::Object(serde_json::Map::new())
            }
        };

        let lifecycle_state = if summary.kind == NodeKind::Lifecycle {
            match self.read(CacheKey::lifecycle_state(&name), Freshness::Fresh).await {
                Ok(read) => read.value().as_str().map(str::to_string),
                Err(e) => {
                    tracing::warn!(node = %name, error = %e, "Lifecycle state unavailable");
                    None
                }
            }
        } else {
            None
        };

        Ok(NodeDetail {
            name,
            kind: summary.kind,
            info,
            parameters,
            lifecycle_state,
            fetched_at,
        })
    }

    /// Current state of a lifecycle node.
    pub async fn lifecycle_state(&self, name: &str, allow_stale: bool) -> ApiResult<LifecycleStateResponse> {
        let name = normalize_node_name(name)?;
        let summary = self.find_node(&name).await?;
        if summary.kind != NodeKind::Lifecycle {
            return Err(ApiError::state_conflict(format!(
                "Node '{}' is not a lifecycle node",
                name
            )));
        }

        let read = self
            .read(CacheKey::lifecycle_state(&name), self.freshness(allow_stale))
            .await?;
        Ok(LifecycleStateResponse {
            state: read.value().as_str().map(str::to_string),
            fetched_at: read.fetched_at(),
            stale: read.is_stale(),
            name,
        })
    }

    /// Shut a node down: a lifecycle transition for lifecycle nodes, or a
    /// process kill for regular nodes when `force` is set.
    pub async fn shutdown_node(&self, name: &str, force: bool) -> ApiResult<ShutdownOutcome> {
        let name = normalize_node_name(name)?;
        let summary = self.find_node(&name).await?;

        let message = match summary.kind {
            NodeKind::Lifecycle => {
                self.run(&format!("ros2 lifecycle set {} shutdown", name))
                    .await
                    .map_err(|e| e.context("Failed to shutdown lifecycle node"))?;
                "Lifecycle node shutdown successfully".to_string()
            }
            NodeKind::Regular if !force => {
                return Err(ApiError::state_conflict(
                    "Regular node requires force=true to kill its process",
                ));
            }
            NodeKind::Regular => self.kill_process(&name).await?,
            NodeKind::Unknown => {
                return Err(ApiError::service_unavailable(
                    "Node kind is unknown until the service list can be read",
                ));
            }
        };

        let invalidated = self.invalidate_node(&name);
        tracing::info!(node = %name, kind = ?summary.kind, invalidated, "Node shut down");

        Ok(ShutdownOutcome {
            name,
            kind: summary.kind,
            message,
            invalidated,
        })
    }

    async fn kill_process(&self, name: &str) -> ApiResult<String> {
        let pattern = name.rsplit('/').next().unwrap_or(name);
        let not_found = || {
            ApiError::new(
                ErrorCode::NodeNotFound,
                format!("Could not find process matching '{}'", pattern),
            )
        };

        // pgrep exits non-zero when nothing matches.
        let output = self
            .run(&format!("pgrep -f '{}'", pattern))
            .await
            .map_err(|_| not_found())?;
        let pid = output
            .lines()
            .find_map(|line| line.trim().parse::<u32>().ok())
            .ok_or_else(not_found)?;

        self.run(&format!("kill {}", pid))
            .await
            .map_err(|e| e.context("Failed to kill process"))?;
        Ok("Process killed (node may restart if managed by launch)".to_string())
    }

    async fn run(&self, command: &str) -> ApiResult<String> {
        self.transport.exec(command).await.map_err(|e| {
            tracing::warn!(command = %command, error = %e, "Command failed");
            ApiError::new(ErrorCode::FetchFailed, e.to_string())
        })
    }

    /// Drop every cached entry describing `name`, plus the node and service
    /// lists. Returns the number of entries removed.
    pub fn invalidate_node(&self, name: &str) -> usize {
        let per_node = QueryKind::per_node()
            .iter()
            .filter(|kind| self.cache.invalidate(CacheKey::new((*kind).clone(), name)))
            .count();
        let lists = [CacheKey::node_list(), CacheKey::service_list()]
            .iter()
            .filter(|key| self.cache.invalidate(key))
            .count();
        per_node + lists
    }
}

fn node_kind(name: &str, services: Option<&[String]>) -> NodeKind {
    match services {
        None => NodeKind::Unknown,
        Some(services) => {
            let get_state = format!("{}/get_state", name);
            if services.iter().any(|s| *s == get_state) {
                NodeKind::Lifecycle
            } else {
                NodeKind::Regular
            }
        }
    }
}

impl ApiError {
    fn context(mut self, what: &str) -> Self {
        self.message = format!("{}: {}", what, self.message);
        self
    }
}
