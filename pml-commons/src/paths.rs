//! Workspace-root discovery and the on-disk state layout.

use std::env;
use std::path::{Path, PathBuf};

/// Environment variable that overrides workspace-root autodetection.
pub const WORKSPACE_ENV_VAR: &str = "PML_WORKSPACE";

/// Resolve the workspace root: `PML_WORKSPACE` if set, otherwise the
/// current working directory.
pub fn workspace_root() -> PathBuf {
    match env::var_os(WORKSPACE_ENV_VAR) {
        Some(value) if !value.is_empty() => PathBuf::from(value),
        _ => env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

/// `<workspace>/.pml.json` — policy + cloud URL + workspace marker.
pub fn workspace_policy_file(workspace: &Path) -> PathBuf {
    workspace.join(".pml.json")
}

/// `<workspace>/.mcp.json` — backend roster for the surrounding agent host.
pub fn mcp_roster_file(workspace: &Path) -> PathBuf {
    workspace.join(".mcp.json")
}

/// `<workspace>/.pml/` — project-local mutable state directory.
pub fn pml_state_dir(workspace: &Path) -> PathBuf {
    workspace.join(".pml")
}

/// `<workspace>/.pml/mcp.lock` — integrity lockfile.
pub fn lockfile_path(workspace: &Path) -> PathBuf {
    pml_state_dir(workspace).join("mcp.lock")
}

/// `~/.pml/routing-cache.json` — per-user routing allowlist cache.
pub fn routing_cache_file() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".pml").join("routing-cache.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn derives_state_layout_from_workspace_root() {
        let root = Path::new("/tmp/my-workspace");
        assert_eq!(workspace_policy_file(root), Path::new("/tmp/my-workspace/.pml.json"));
        assert_eq!(mcp_roster_file(root), Path::new("/tmp/my-workspace/.mcp.json"));
        assert_eq!(lockfile_path(root), Path::new("/tmp/my-workspace/.pml/mcp.lock"));
    }
}
