//! Workspace configuration: `.pml.json` (gateway policy + cloud
//! endpoint) and `.mcp.json` (the backend roster the surrounding agent
//! host already maintains). Every field defaults so a workspace with no
//! config file at all still boots with sane behavior.

use std::collections::HashMap;
use std::path::Path;

use pml_commons::env_expand::expand_map;
use serde::{Deserialize, Serialize};

use crate::model::PermissionPolicy;

fn default_queue_capacity() -> usize {
    16
}

fn default_approval_timeout_secs() -> u64 {
    300
}

fn default_routing_endpoint() -> String {
    "https://api.pml.dev/api/v1/routing".to_string()
}

fn default_lockfile_gc_keep() -> usize {
    200
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub permissions: PermissionPolicy,

    #[serde(default = "default_queue_capacity")]
    pub max_concurrent_requests: usize,

    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: u64,

    #[serde(default = "default_routing_endpoint")]
    pub routing_endpoint: String,

    #[serde(default = "default_lockfile_gc_keep")]
    pub lockfile_gc_keep: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            permissions: PermissionPolicy::default(),
            max_concurrent_requests: default_queue_capacity(),
            approval_timeout_secs: default_approval_timeout_secs(),
            routing_endpoint: default_routing_endpoint(),
            lockfile_gc_keep: default_lockfile_gc_keep(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config at {path} is not valid JSON: {source}")]
    Parse {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl GatewayConfig {
    /// Load `.pml.json` from the workspace root, defaulting to
    /// [`GatewayConfig::default`] when the file is absent.
    pub fn load(workspace: &Path) -> Result<Self, ConfigError> {
        let path = pml_commons::paths::workspace_policy_file(workspace);
        match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|source| ConfigError::Parse { path, source }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Read { path, source }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpStdioBackendConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpRoster {
    #[serde(default, rename = "mcpServers")]
    pub servers: HashMap<String, McpStdioBackendConfig>,
}

impl McpRoster {
    /// Load `.mcp.json` from the workspace root, defaulting to an empty
    /// roster when the file is absent.
    pub fn load(workspace: &Path) -> Result<Self, ConfigError> {
        let path = pml_commons::paths::mcp_roster_file(workspace);
        match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|source| ConfigError::Parse { path, source }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Read { path, source }),
        }
    }

    /// Resolve `${VAR}` references in every backend's environment map
    /// against the process environment, logging (never erroring) on
    /// anything unresolved.
    pub fn resolved_env(&self, server_id: &str, process_env: &HashMap<String, String>) -> HashMap<String, String> {
        self.servers
            .get(server_id)
            .map(|server| expand_map(&server.env, process_env))
            .unwrap_or_default()
    }
}
