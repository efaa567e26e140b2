//! Core data model. Types here carry no behavior beyond normalization
//! and the invariants they're named for; the subsystems in sibling
//! modules own the operations.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical `namespace:action` tool identifier. Alternate external
/// spellings (`namespace.action`, `ns__action`) are normalized on ingest;
/// the empty namespace is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ToolId(String);

#[derive(Debug, thiserror::Error)]
pub enum ToolIdError {
    #[error("tool id `{0}` has an empty namespace")]
    EmptyNamespace(String),
    #[error("tool id `{0}` has no namespace separator")]
    MissingSeparator(String),
}

impl ToolId {
    /// Normalize an externally-spelled id (`ns.action`, `ns__action`,
    /// `ns:action`) into the canonical `ns:action` form.
    pub fn parse(raw: &str) -> Result<Self, ToolIdError> {
        let normalized = if raw.contains(':') {
            raw.to_string()
        } else if let Some(idx) = raw.find("__") {
            format!("{}:{}", &raw[..idx], &raw[idx + 2..])
        } else if let Some(idx) = raw.find('.') {
            format!("{}:{}", &raw[..idx], &raw[idx + 1..])
        } else {
            return Err(ToolIdError::MissingSeparator(raw.to_string()));
        };

        let (namespace, _action) = normalized
            .split_once(':')
            .ok_or_else(|| ToolIdError::MissingSeparator(raw.to_string()))?;
        if namespace.is_empty() {
            return Err(ToolIdError::EmptyNamespace(raw.to_string()));
        }
        Ok(Self(normalized))
    }

    pub fn namespace(&self) -> &str {
        self.0.split_once(':').map(|(ns, _)| ns).unwrap_or(&self.0)
    }

    pub fn action(&self) -> &str {
        self.0.split_once(':').map(|(_, a)| a).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ToolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hierarchical backend identifier: `org.project.namespace.action[.hash4]`.
/// The 4-segment prefix is the lockfile identity key ("base"); a 5th
/// segment, when present, is a short content-hash suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendFqdn(String);

impl BackendFqdn {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The 4-segment identity, stripping any trailing content-hash segment.
    pub fn base(&self) -> String {
        let segments: Vec<&str> = self.0.split('.').collect();
        if segments.len() >= 5 {
            segments[..4].join(".")
        } else {
            self.0.clone()
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub tool_id: ToolId,
    pub description: String,
    pub input_schema: Value,
    pub server_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEmbedding {
    pub tool_id: ToolId,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub id: String,
    pub display_name: String,
    pub tools_used: Vec<ToolId>,
    pub parameters_schema: Value,
    pub embedding: Vec<f32>,
    pub success_rate: f64,
    pub usage_count: u64,
    /// The backend this capability's code was fetched from, when it was
    /// sourced from one rather than hand-registered. Drives the
    /// integrity check the loader runs before dispatch.
    pub backend_fqdn: Option<BackendFqdn>,
    /// Content hash of the capability's code as last fetched from
    /// `backend_fqdn`, checked against the lockfile before dispatch.
    pub integrity: Option<String>,
}

impl Capability {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            tools_used: Vec::new(),
            parameters_schema: Value::Object(Default::default()),
            embedding: Vec::new(),
            success_rate: 0.0,
            usage_count: 0,
            backend_fqdn: None,
            integrity: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub observed_count: u64,
    pub confidence: f64,
    pub last_observed_at: DateTime<Utc>,
}

impl DependencyEdge {
    /// Beta(`alpha`, `beta`) posterior mean, giving a confidence that is
    /// non-decreasing in `observed_count` under a fixed prior.
    pub fn record_observation(&mut self, alpha: f64, beta: f64) {
        self.observed_count += 1;
        self.confidence = (self.observed_count as f64 + alpha)
            / (self.observed_count as f64 + alpha + beta);
        self.last_observed_at = Utc::now();
    }

    pub fn new(alpha: f64, beta: f64, now: DateTime<Utc>) -> Self {
        Self {
            observed_count: 0,
            confidence: alpha / (alpha + beta),
            last_observed_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionVerdict {
    Allow,
    Deny,
    Ask,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionPolicy {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    pub ask: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendType {
    Subprocess,
    Embedded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockfileEntry {
    pub fqdn: BackendFqdn,
    pub integrity: String,
    pub fetched_at: DateTime<Utc>,
    pub last_validated_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub backend_type: BackendType,
    pub approved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalKind {
    Dependency,
    ApiKey,
    Integrity,
    ToolPermission,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    pub workflow_id: String,
    pub capability_id: Option<String>,
    pub user_id: Option<String>,
    pub code: Option<Vec<u8>>,
    pub tool_id: Option<ToolId>,
    pub args: Option<Value>,
    pub backend_fqdn: Option<BackendFqdn>,
    pub approval_kind: ApprovalKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceTaskResult {
    pub task_id: String,
    pub tool_id: ToolId,
    pub args: Value,
    pub result: Value,
    pub success: bool,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchDecision {
    pub node_id: String,
    pub outcome: String,
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub capability_id: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub task_results: Vec<TraceTaskResult>,
    pub decisions: Vec<BranchDecision>,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<String>,
}

/// Expand `namespace.action`/`ns__action` shorthand map keys used by
/// backend rosters into canonical `ToolId`s, dropping anything that fails
/// to parse (logged by the caller).
pub fn try_parse_tool_ids(raw: &HashMap<String, Value>) -> Vec<(ToolId, Value)> {
    raw.iter()
        .filter_map(|(k, v)| ToolId::parse(k).ok().map(|id| (id, v.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalizes_alternate_spellings() {
        assert_eq!(ToolId::parse("fs:read_file").unwrap().as_str(), "fs:read_file");
        assert_eq!(ToolId::parse("fs.read_file").unwrap().as_str(), "fs:read_file");
        assert_eq!(ToolId::parse("fs__read_file").unwrap().as_str(), "fs:read_file");
    }

    #[test]
    fn rejects_empty_namespace() {
        assert!(ToolId::parse(":read_file").is_err());
    }

    #[test]
    fn fqdn_base_strips_hash_suffix() {
        let fqdn = BackendFqdn::new("acme.default.fs.read.ab12");
        assert_eq!(fqdn.base(), "acme.default.fs.read");
        let no_hash = BackendFqdn::new("acme.default.fs.read");
        assert_eq!(no_hash.base(), "acme.default.fs.read");
    }

    #[test]
    fn dependency_confidence_is_nondecreasing() {
        let mut edge = DependencyEdge::new(1.0, 1.0, Utc::now());
        let mut last = edge.confidence;
        for _ in 0..5 {
            edge.record_observation(1.0, 1.0);
            assert!(edge.confidence >= last);
            last = edge.confidence;
        }
    }
}
