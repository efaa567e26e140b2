//! Routing resolver: decides whether a tool id is served locally or by
//! the cloud gateway, backed by a small versioned allowlist of cloud
//! namespaces that is periodically refreshed from the cloud control
//! plane and cached on disk for offline startup.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::ToolId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    Local,
    Cloud,
}

/// Raised by [`RoutingResolver::resolve`] when the routing table has never
/// been successfully established and a refresh attempt has since failed.
/// Distinct from "never refreshed yet", which still defaults to local
/// routing: this is the "we tried to learn the real table and couldn't"
/// case, which must not be papered over with an all-local default.
#[derive(Debug, Clone, thiserror::Error)]
#[error("routing table is unavailable: no cached snapshot and the last refresh failed")]
pub struct RoutingUnavailable;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoutingSnapshot {
    pub version: String,
    pub cloud_namespaces: Vec<String>,
}

impl Default for RoutingSnapshot {
    fn default() -> Self {
        Self { version: "0".to_string(), cloud_namespaces: Vec::new() }
    }
}

/// Fetch outcome of a conditional routing-table request. Isolated behind
/// a trait so the resolver's synchronization logic is testable without a
/// live HTTP endpoint, mirroring how this codebase isolates other
/// external-process boundaries behind a small trait.
#[async_trait]
pub trait RoutingSource: Send + Sync {
    /// `known_version` is the version the caller already has cached, used
    /// for a conditional request; `Ok(None)` means "not modified".
    async fn fetch(&self, known_version: &str) -> Result<Option<RoutingSnapshot>, RoutingSourceError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RoutingSourceError {
    #[error("routing endpoint request failed: {0}")]
    Request(String),
    #[error("routing endpoint returned malformed data: {0}")]
    Malformed(String),
}

/// Real HTTP transport for [`RoutingSource`], speaking the cloud control
/// plane's conditional-fetch contract.
pub struct HttpRoutingSource {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRoutingSource {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), endpoint: endpoint.into() }
    }
}

#[async_trait]
impl RoutingSource for HttpRoutingSource {
    async fn fetch(&self, known_version: &str) -> Result<Option<RoutingSnapshot>, RoutingSourceError> {
        let response = self
            .client
            .get(&self.endpoint)
            .header("If-None-Match", known_version)
            .send()
            .await
            .map_err(|err| RoutingSourceError::Request(err.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(RoutingSourceError::Request(format!("status {}", response.status())));
        }

        let snapshot = response
            .json::<RoutingSnapshot>()
            .await
            .map_err(|err| RoutingSourceError::Malformed(err.to_string()))?;
        Ok(Some(snapshot))
    }
}

/// Internal routing state. `Cached` covers both "never refreshed yet" (the
/// all-local default) and "refreshed successfully at least once" — both
/// are trustworthy enough to route on. `Unavailable` is the one state
/// `resolve` refuses to route from.
enum RoutingState {
    Cached(RoutingSnapshot),
    Unavailable,
}

/// Resolves tool ids to a local or cloud route, caching the cloud
/// namespace allowlist across restarts so routing keeps working with a
/// stale-but-present cache even when the control plane is unreachable.
pub struct RoutingResolver {
    state: Arc<RwLock<RoutingState>>,
    /// Whether `state` currently holds data that came from disk or a
    /// successful fetch, as opposed to the untouched startup default.
    ever_synced: Arc<RwLock<bool>>,
    cache_path: Option<PathBuf>,
}

impl RoutingResolver {
    /// Load the cached snapshot from disk (defaulting to an empty
    /// all-local table if absent or unreadable).
    pub fn init(cache_path: Option<PathBuf>) -> Self {
        let loaded = cache_path
            .as_ref()
            .and_then(|path| std::fs::read_to_string(path).ok())
            .and_then(|raw| serde_json::from_str::<RoutingSnapshot>(&raw).ok());
        let ever_synced = loaded.is_some();
        let snapshot = loaded.unwrap_or_default();
        Self {
            state: Arc::new(RwLock::new(RoutingState::Cached(snapshot))),
            ever_synced: Arc::new(RwLock::new(ever_synced)),
            cache_path,
        }
    }

    /// Resolve a tool id to a route, failing loudly instead of defaulting
    /// to local when the routing table is known to be unavailable.
    pub fn resolve(&self, tool_id: &ToolId) -> Result<RouteTarget, RoutingUnavailable> {
        match &*self.state.read() {
            RoutingState::Unavailable => Err(RoutingUnavailable),
            RoutingState::Cached(snapshot) => {
                if snapshot.cloud_namespaces.iter().any(|ns| ns == tool_id.namespace()) {
                    Ok(RouteTarget::Cloud)
                } else {
                    Ok(RouteTarget::Local)
                }
            }
        }
    }

    pub fn current_version(&self) -> String {
        match &*self.state.read() {
            RoutingState::Cached(snapshot) => snapshot.version.clone(),
            RoutingState::Unavailable => "0".to_string(),
        }
    }

    pub fn cloud_namespaces(&self) -> Vec<String> {
        match &*self.state.read() {
            RoutingState::Cached(snapshot) => snapshot.cloud_namespaces.clone(),
            RoutingState::Unavailable => Vec::new(),
        }
    }

    pub fn is_available(&self) -> bool {
        !matches!(&*self.state.read(), RoutingState::Unavailable)
    }

    /// Conditionally refresh the routing table from `source`. A new
    /// version atomically replaces the in-memory table and is persisted;
    /// an unchanged version is a no-op; a fetch failure while a cached
    /// table already exists is logged and that cache keeps serving
    /// routing decisions; a fetch failure before any table has ever been
    /// established flips the resolver into `Unavailable` instead of
    /// silently keeping the all-local default.
    pub async fn refresh(&self, source: &dyn RoutingSource) {
        let known_version = self.current_version();
        match source.fetch(&known_version).await {
            Ok(None) => {
                debug!(version = %known_version, "routing table unchanged");
            }
            Ok(Some(snapshot)) => {
                debug!(version = %snapshot.version, "routing table updated");
                self.persist(&snapshot);
                *self.state.write() = RoutingState::Cached(snapshot);
                *self.ever_synced.write() = true;
            }
            Err(err) => {
                if *self.ever_synced.read() {
                    warn!(error = %err, "routing table refresh failed, keeping existing cache");
                } else {
                    warn!(error = %err, "routing table refresh failed and no cache was ever established, marking routing unavailable");
                    *self.state.write() = RoutingState::Unavailable;
                }
            }
        }
    }

    fn persist(&self, snapshot: &RoutingSnapshot) {
        let Some(path) = &self.cache_path else { return };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(raw) = serde_json::to_string_pretty(snapshot) {
            if let Err(err) = std::fs::write(path, raw) {
                warn!(error = %err, "failed to persist routing cache");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    struct StubSource {
        responses: std::sync::Mutex<Vec<Result<Option<RoutingSnapshot>, RoutingSourceError>>>,
    }

    #[async_trait]
    impl RoutingSource for StubSource {
        async fn fetch(&self, _known_version: &str) -> Result<Option<RoutingSnapshot>, RoutingSourceError> {
            self.responses.lock().unwrap().remove(0)
        }
    }

    fn tool(s: &str) -> ToolId {
        ToolId::parse(s).unwrap()
    }

    #[test]
    fn default_routes_everything_local() {
        let resolver = RoutingResolver::init(None);
        assert_eq!(resolver.resolve(&tool("fs:read")).unwrap(), RouteTarget::Local);
    }

    #[tokio::test]
    async fn refresh_with_new_version_replaces_table_and_persists() {
        let dir = tempdir().unwrap();
        let cache_path = dir.path().join("routing-cache.json");
        let resolver = RoutingResolver::init(Some(cache_path.clone()));

        let source = StubSource {
            responses: std::sync::Mutex::new(vec![Ok(Some(RoutingSnapshot {
                version: "v2".to_string(),
                cloud_namespaces: vec!["weather".to_string()],
            }))]),
        };
        resolver.refresh(&source).await;

        assert_eq!(resolver.resolve(&tool("weather:forecast")).unwrap(), RouteTarget::Cloud);
        assert_eq!(resolver.current_version(), "v2");
        assert!(cache_path.exists());
    }

    #[tokio::test]
    async fn refresh_failure_with_an_established_cache_keeps_serving_it() {
        let dir = tempdir().unwrap();
        let cache_path = dir.path().join("routing-cache.json");
        let resolver = RoutingResolver::init(Some(cache_path));

        let first = StubSource {
            responses: std::sync::Mutex::new(vec![Ok(Some(RoutingSnapshot {
                version: "v2".to_string(),
                cloud_namespaces: vec!["weather".to_string()],
            }))]),
        };
        resolver.refresh(&first).await;

        let second = StubSource { responses: std::sync::Mutex::new(vec![Err(RoutingSourceError::Request("down".into()))]) };
        resolver.refresh(&second).await;

        assert_eq!(resolver.resolve(&tool("weather:forecast")).unwrap(), RouteTarget::Cloud);
        assert!(resolver.is_available());
    }

    #[tokio::test]
    async fn refresh_failure_with_no_established_cache_marks_routing_unavailable() {
        let resolver = RoutingResolver::init(None);
        let source = StubSource { responses: std::sync::Mutex::new(vec![Err(RoutingSourceError::Request("down".into()))]) };
        resolver.refresh(&source).await;

        assert!(!resolver.is_available());
        assert!(resolver.resolve(&tool("fs:read")).is_err());
    }

    #[tokio::test]
    async fn not_modified_leaves_snapshot_untouched() {
        let dir = tempdir().unwrap();
        let resolver = RoutingResolver::init(Some(dir.path().join("routing-cache.json")));
        let source = StubSource { responses: std::sync::Mutex::new(vec![Ok(None)]) };
        resolver.refresh(&source).await;
        assert_eq!(resolver.current_version(), "0");
    }
}
