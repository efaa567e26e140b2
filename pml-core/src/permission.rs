//! Permission evaluator. Pattern precedence is deny > allow > ask >
//! default-ask; `*` matches everything, `ns:*` matches by namespace
//! prefix, anything else must match the tool id exactly.

use crate::model::{PermissionPolicy, PermissionVerdict, ToolId};

/// `check` itself is infallible by construction — it always returns a
/// verdict — but callers that need to know *which* tool blocked a
/// composite capability use [`CompositeBlock`] from
/// [`infer_capability_mode`].
pub fn check(tool_id: &ToolId, policy: &PermissionPolicy) -> PermissionVerdict {
    if matches_any(tool_id, &policy.deny) {
        return PermissionVerdict::Deny;
    }
    if matches_any(tool_id, &policy.allow) {
        return PermissionVerdict::Allow;
    }
    if matches_any(tool_id, &policy.ask) {
        return PermissionVerdict::Ask;
    }
    PermissionVerdict::Ask
}

fn matches_any(tool_id: &ToolId, patterns: &[String]) -> bool {
    patterns.iter().any(|p| matches_pattern(tool_id, p))
}

fn matches_pattern(tool_id: &ToolId, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(namespace) = pattern.strip_suffix(":*") {
        return tool_id.namespace() == namespace;
    }
    pattern == tool_id.as_str()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityApprovalMode {
    /// At least one tool is unconditionally denied: the capability cannot
    /// run at all, regardless of approvals.
    Blocked,
    /// At least one tool requires a human-in-the-loop approval.
    HumanGated,
    /// Every tool is allowed outright (or the tool set is empty).
    Auto,
}

#[derive(Debug, Clone)]
pub struct CompositeBlock {
    pub mode: CapabilityApprovalMode,
    /// The first tool id that produced a non-allow verdict, if any.
    pub blocking_tool: Option<ToolId>,
}

/// Infer the composite approval mode for a capability from its tool set.
/// An empty tool set is pure compute and is always `Auto`.
pub fn infer_capability_mode(tools: &[ToolId], policy: &PermissionPolicy) -> CompositeBlock {
    if tools.is_empty() {
        return CompositeBlock {
            mode: CapabilityApprovalMode::Auto,
            blocking_tool: None,
        };
    }

    let mut gated: Option<ToolId> = None;
    for tool in tools {
        match check(tool, policy) {
            PermissionVerdict::Deny => {
                return CompositeBlock {
                    mode: CapabilityApprovalMode::Blocked,
                    blocking_tool: Some(tool.clone()),
                };
            }
            PermissionVerdict::Ask if gated.is_none() => {
                gated = Some(tool.clone());
            }
            _ => {}
        }
    }

    match gated {
        Some(tool) => CompositeBlock {
            mode: CapabilityApprovalMode::HumanGated,
            blocking_tool: Some(tool),
        },
        None => CompositeBlock {
            mode: CapabilityApprovalMode::Auto,
            blocking_tool: None,
        },
    }
}
