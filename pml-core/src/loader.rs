//! Capability loader: the central state machine a gateway request runs
//! through — permission evaluation, integrity verification against the
//! lockfile, routing resolution, and sandboxed execution of the
//! capability's code with tool calls routed back out through the RPC
//! bridge, with trace recording of the outcome. Anything that needs a
//! human decision — an ask-mode tool, a changed backend hash — suspends
//! nothing: `invoke` returns immediately with the pending workflow id,
//! and `continue_invocation` resumes the gated action once the decision
//! is in.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use pml_sandbox::protocol::{SandboxErrorCode, SandboxResult};
use pml_sandbox::{RpcBridge, RpcCall, WorkerRunner};
use serde_json::Value;
use tracing::{info, warn};

use crate::approval::{ApprovalOutcome, ApprovalStore};
use crate::error::{PmlError, Result};
use crate::lockfile::{IntegrityCheck, Lockfile};
use crate::model::{ApprovalKind, BackendType, Capability, PendingApproval, PermissionPolicy, ToolId};
use crate::permission::{infer_capability_mode, CapabilityApprovalMode};
use crate::routing::RoutingResolver;
use crate::trace::{TraceBuilder, TraceCollector};

type InvokerFuture = Pin<Box<dyn Future<Output = std::result::Result<Value, Value>> + Send>>;

/// A single resolved tool call, already routed and permission-checked,
/// ready to be dispatched to whatever backend serves it.
pub type ToolInvoker = Arc<dyn Fn(RpcCall) -> InvokerFuture + Send + Sync>;

/// Registry of known capabilities plus the shared state (permission
/// policy, approvals, routing, integrity, traces) the loader consults on
/// every invocation.
pub struct CapabilityLoader {
    capabilities: DashMap<String, Capability>,
    policy: parking_lot::RwLock<PermissionPolicy>,
    approvals: ApprovalStore,
    traces: TraceCollector,
    worker_runner: WorkerRunner,
    tool_invoker: ToolInvoker,
    routing: Arc<RoutingResolver>,
    lockfile: Arc<Mutex<Lockfile>>,
}

pub struct LoaderOutcome {
    pub value: Value,
    pub duration_ms: u64,
}

/// What `invoke` (or `continue_invocation`) produced: either the
/// capability ran to completion, or it hit something that needs a human
/// decision before it can, in which case the caller gets a workflow id to
/// resolve and replay through `continue_invocation` later.
pub enum InvokeOutcome {
    Completed(LoaderOutcome),
    ApprovalRequired {
        workflow_id: String,
        kind: ApprovalKind,
        tool_id: Option<ToolId>,
    },
}

impl CapabilityLoader {
    pub fn new(
        policy: PermissionPolicy,
        traces: TraceCollector,
        tool_invoker: ToolInvoker,
        routing: Arc<RoutingResolver>,
        lockfile: Arc<Mutex<Lockfile>>,
    ) -> Self {
        Self {
            capabilities: DashMap::new(),
            policy: parking_lot::RwLock::new(policy),
            approvals: ApprovalStore::new(),
            traces,
            worker_runner: WorkerRunner::new(pml_sandbox::DEFAULT_EXECUTION_TIMEOUT),
            tool_invoker,
            routing,
            lockfile,
        }
    }

    pub fn register(&self, capability: Capability) {
        self.capabilities.insert(capability.id.clone(), capability);
    }

    pub fn get(&self, capability_id: &str) -> Option<Capability> {
        self.capabilities.get(capability_id).map(|c| c.clone())
    }

    pub fn set_policy(&self, policy: PermissionPolicy) {
        *self.policy.write() = policy;
    }

    pub fn approvals(&self) -> &ApprovalStore {
        &self.approvals
    }

    /// Resolve a capability approval decision raised mid-execution,
    /// without resuming the gated action itself. Kept for callers that
    /// only want to record the decision; to actually run the capability
    /// once approved, use `continue_invocation`.
    pub fn resolve_approval(&self, workflow_id: &str, outcome: ApprovalOutcome) -> Result<()> {
        self.approvals
            .resolve(workflow_id, outcome)
            .map_err(|err| PmlError::UnknownWorkflow { workflow_id: err.to_string() })
    }

    /// Run a capability: evaluate permissions for its declared tool set,
    /// check backend integrity, resolve routing, then execute its
    /// compiled WASM body in the sandbox with tool calls routed through
    /// `tool_invoker`. Returns immediately with `ApprovalRequired` rather
    /// than blocking when a human decision is needed; resume with
    /// `continue_invocation` once it's made.
    pub async fn invoke(
        &self,
        capability_id: &str,
        code: Vec<u8>,
        args: Value,
        user_id: Option<String>,
    ) -> Result<InvokeOutcome> {
        let capability = self
            .get(capability_id)
            .ok_or_else(|| PmlError::ProtocolError { message: format!("unknown capability `{capability_id}`") })?;

        let policy = self.policy.read().clone();
        let decision = infer_capability_mode(&capability.tools_used, &policy);

        match decision.mode {
            CapabilityApprovalMode::Blocked => {
                let tool_id = decision.blocking_tool.map(|t| t.to_string()).unwrap_or_default();
                return Err(PmlError::PermissionDenied { tool_id });
            }
            CapabilityApprovalMode::HumanGated => {
                let tool_id = decision.blocking_tool.clone();
                let (workflow_id, _rx) = self.approvals.create(PendingApproval {
                    workflow_id: ApprovalStore::next_workflow_id(),
                    capability_id: Some(capability_id.to_string()),
                    user_id,
                    code: Some(code),
                    tool_id: tool_id.clone(),
                    args: Some(args),
                    backend_fqdn: None,
                    approval_kind: ApprovalKind::ToolPermission,
                    created_at: Utc::now(),
                });
                info!(workflow_id = %workflow_id, capability = %capability_id, "awaiting human approval");
                return Ok(InvokeOutcome::ApprovalRequired {
                    workflow_id,
                    kind: ApprovalKind::ToolPermission,
                    tool_id,
                });
            }
            CapabilityApprovalMode::Auto => {}
        }

        if let Some(required) = self.check_integrity(&capability, &code, &args, user_id.clone(), capability_id) {
            return Ok(required);
        }

        if let Some(unreachable) = self.check_routing(&capability.tools_used) {
            return Err(unreachable);
        }

        self.dispatch_and_trace(capability_id, code, args, user_id)
            .await
            .map(InvokeOutcome::Completed)
    }

    /// Resume a capability previously suspended on `workflow_id`. A
    /// rejected decision surfaces the same error `invoke` would have
    /// returned synchronously; an approved one dispatches the capability
    /// using the code, args, and caller context captured when the
    /// approval was first raised.
    pub async fn continue_invocation(&self, workflow_id: &str, approved: bool) -> Result<InvokeOutcome> {
        let pending = self
            .approvals
            .take(workflow_id)
            .map_err(|err| PmlError::UnknownWorkflow { workflow_id: err.to_string() })?;

        if !approved {
            return Err(match pending.approval_kind {
                ApprovalKind::Integrity => PmlError::IntegrityRejected {
                    fqdn: pending.backend_fqdn.map(|f| f.as_str().to_string()).unwrap_or_default(),
                },
                _ => PmlError::PermissionDenied {
                    tool_id: pending.tool_id.map(|t| t.to_string()).unwrap_or_default(),
                },
            });
        }

        if pending.approval_kind == ApprovalKind::Integrity {
            if let Some(fqdn) = &pending.backend_fqdn {
                let mut lockfile = self.lockfile.lock();
                lockfile.approve(fqdn);
                if let Err(err) = lockfile.save() {
                    warn!(error = %err, "failed to persist lockfile approval");
                }
            }
        }

        let capability_id = pending
            .capability_id
            .ok_or_else(|| PmlError::ProtocolError { message: "pending approval has no capability id".to_string() })?;
        let code = pending
            .code
            .ok_or_else(|| PmlError::ProtocolError { message: "pending approval has no capability code".to_string() })?;
        let args = pending.args.unwrap_or(Value::Null);

        if pending.approval_kind == ApprovalKind::ToolPermission {
            // Only the permission gate was cleared; integrity and
            // routing still need to pass before dispatch.
            let capability = self
                .get(&capability_id)
                .ok_or_else(|| PmlError::ProtocolError { message: format!("unknown capability `{capability_id}`") })?;
            if let Some(required) =
                self.check_integrity(&capability, &code, &args, pending.user_id.clone(), &capability_id)
            {
                return Ok(required);
            }
            if let Some(unreachable) = self.check_routing(&capability.tools_used) {
                return Err(unreachable);
            }
        }

        self.dispatch_and_trace(&capability_id, code, args, pending.user_id)
            .await
            .map(InvokeOutcome::Completed)
    }

    /// Compare the capability's declared integrity hash against the
    /// lockfile, suspending on an unapproved change. `None` means the
    /// capability is clear to dispatch (no backend association, or the
    /// hash is first-seen/unchanged/already approved).
    fn check_integrity(
        &self,
        capability: &Capability,
        code: &[u8],
        args: &Value,
        user_id: Option<String>,
        capability_id: &str,
    ) -> Option<InvokeOutcome> {
        let fqdn = capability.backend_fqdn.as_ref()?;
        let integrity = capability.integrity.as_ref()?;

        let check = self.lockfile.lock().check_and_record(fqdn, integrity.clone(), BackendType::Subprocess, Utc::now());
        if let Err(err) = self.lockfile.lock().save() {
            warn!(error = %err, "failed to persist lockfile after integrity check");
        }

        let needs_approval = match check {
            IntegrityCheck::Changed { .. } => !self.lockfile.lock().is_approved(fqdn),
            _ => false,
        };
        if !needs_approval {
            return None;
        }

        let (workflow_id, _rx) = self.approvals.create(PendingApproval {
            workflow_id: ApprovalStore::next_workflow_id(),
            capability_id: Some(capability_id.to_string()),
            user_id,
            code: Some(code.to_vec()),
            tool_id: None,
            args: Some(args.clone()),
            backend_fqdn: Some(fqdn.clone()),
            approval_kind: ApprovalKind::Integrity,
            created_at: Utc::now(),
        });
        warn!(workflow_id = %workflow_id, backend = %fqdn.as_str(), "backend integrity changed, awaiting approval");
        Some(InvokeOutcome::ApprovalRequired { workflow_id, kind: ApprovalKind::Integrity, tool_id: None })
    }

    /// Resolve every tool the capability uses to a route, failing loudly
    /// if the routing table is unavailable rather than letting dispatch
    /// silently proceed against a guess.
    fn check_routing(&self, tools_used: &[ToolId]) -> Option<PmlError> {
        for tool_id in tools_used {
            if self.routing.resolve(tool_id).is_err() {
                return Some(PmlError::BackendUnavailable {
                    backend: tool_id.to_string(),
                    reason: "routing table is unavailable".to_string(),
                });
            }
        }
        None
    }

    async fn dispatch_and_trace(
        &self,
        capability_id: &str,
        code: Vec<u8>,
        args: Value,
        user_id: Option<String>,
    ) -> Result<LoaderOutcome> {
        let mut trace = TraceBuilder::new(Some(capability_id.to_string()), user_id);
        let result = self.execute_sandboxed(code, args).await;

        let outcome = match &result {
            Ok(_) => {
                trace.record_decision(crate::model::BranchDecision {
                    node_id: "execute".to_string(),
                    outcome: "success".to_string(),
                    condition: None,
                });
                (true, None)
            }
            Err(err) => (false, Some(err.to_string())),
        };
        let finished = trace.finish(outcome.0, outcome.1);
        if let Err(err) = self.traces.record(&finished) {
            warn!(error = %err, "failed to persist execution trace");
        }

        result.map(|value| LoaderOutcome { value, duration_ms: finished.duration_ms })
    }

    async fn execute_sandboxed(&self, code: Vec<u8>, args: Value) -> Result<Value> {
        let (bridge, mut rpc_rx) = RpcBridge::new(pml_sandbox::DEFAULT_RPC_TIMEOUT);
        let invoker = self.tool_invoker.clone();
        let bridge_for_dispatch = bridge.clone();

        tokio::spawn(async move {
            while let Some(call) = rpc_rx.recv().await {
                let rpc_id = call.rpc_id.clone();
                match invoker(call).await {
                    Ok(result) => bridge_for_dispatch.resolve(&rpc_id, result),
                    Err(error) => bridge_for_dispatch.reject(&rpc_id, error),
                }
            }
        });

        let result = self.worker_runner.execute(code, args, bridge).await;
        sandbox_result_to_pml(result)
    }
}

fn sandbox_result_to_pml(result: SandboxResult) -> Result<Value> {
    match result {
        SandboxResult::Success { value, .. } => Ok(value),
        SandboxResult::Failure { error, .. } => Err(match error.code {
            SandboxErrorCode::PermissionDenied => PmlError::PermissionDenied { tool_id: error.message },
            SandboxErrorCode::ExecutionTimeout => PmlError::Timeout { elapsed_ms: 0 },
            SandboxErrorCode::RpcTimeout => PmlError::Timeout { elapsed_ms: 0 },
            SandboxErrorCode::WorkerTerminated => PmlError::SandboxViolation { message: error.message },
            SandboxErrorCode::RpcError => PmlError::ProtocolError { message: error.message },
            SandboxErrorCode::CodeError => PmlError::CodeError { message: error.message },
        }),
    }
}

/// Convenience constructor for a [`ToolInvoker`] that always denies every
/// call — used when wiring a loader that has no backends connected yet.
pub fn deny_all_invoker() -> ToolInvoker {
    Arc::new(|call: RpcCall| {
        Box::pin(async move { Err(serde_json::json!({ "message": format!("no backend registered for `{}`", call.method) })) })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ToolId;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn echo_invoker() -> ToolInvoker {
        Arc::new(|call: RpcCall| Box::pin(async move { Ok(call.args) }))
    }

    fn loader_with_policy(policy: PermissionPolicy) -> CapabilityLoader {
        let dir = tempdir().unwrap();
        let traces = TraceCollector::new(dir.path().join("traces.jsonl"));
        let routing = Arc::new(RoutingResolver::init(None));
        let lockfile = Arc::new(Mutex::new(Lockfile::load(dir.path().join("mcp.lock")).unwrap()));
        CapabilityLoader::new(policy, traces, echo_invoker(), routing, lockfile)
    }

    #[test]
    fn blocked_capability_rejects_before_touching_the_sandbox() {
        let policy = PermissionPolicy { deny: vec!["fs:*".to_string()], ..Default::default() };
        let loader = loader_with_policy(policy);
        let mut capability = Capability::new("cap-1", "Deletes a file");
        capability.tools_used = vec![ToolId::parse("fs:delete_file").unwrap()];
        loader.register(capability);

        let result = block_on(loader.invoke("cap-1", vec![], serde_json::json!({}), None));
        assert!(matches!(result, Err(PmlError::PermissionDenied { .. })));
    }

    #[test]
    fn unknown_capability_is_a_protocol_error() {
        let loader = loader_with_policy(PermissionPolicy::default());
        let result = block_on(loader.invoke("missing", vec![], serde_json::json!({}), None));
        assert!(matches!(result, Err(PmlError::ProtocolError { .. })));
    }

    #[test]
    fn auto_mode_capability_completes_without_any_approval() {
        let loader = loader_with_policy(PermissionPolicy { allow: vec!["*".to_string()], ..Default::default() });
        let mut capability = Capability::new("cap-auto", "Reads a file");
        capability.tools_used = vec![ToolId::parse("fs:read_file").unwrap()];
        loader.register(capability);

        let outcome = block_on(loader.invoke("cap-auto", vec![], serde_json::json!({"path": "a.txt"}), None)).unwrap();
        assert!(matches!(outcome, InvokeOutcome::Completed(_)));
    }

    #[test]
    fn ask_mode_capability_returns_approval_required_without_blocking() {
        let loader = loader_with_policy(PermissionPolicy { ask: vec!["github:*".to_string()], ..Default::default() });
        let mut capability = Capability::new("cap-ask", "Opens an issue");
        capability.tools_used = vec![ToolId::parse("github:create_issue").unwrap()];
        loader.register(capability);

        let outcome = block_on(loader.invoke("cap-ask", vec![], serde_json::json!({}), None)).unwrap();
        let workflow_id = match outcome {
            InvokeOutcome::ApprovalRequired { workflow_id, kind, .. } => {
                assert_eq!(kind, ApprovalKind::ToolPermission);
                workflow_id
            }
            InvokeOutcome::Completed(_) => panic!("expected an approval, got a completed outcome"),
        };
        assert_eq!(loader.approvals().pending_count(), 1);

        let resumed = block_on(loader.continue_invocation(&workflow_id, true)).unwrap();
        assert!(matches!(resumed, InvokeOutcome::Completed(_)));
        assert_eq!(loader.approvals().pending_count(), 0);
    }

    #[test]
    fn rejecting_a_pending_approval_surfaces_as_permission_denied() {
        let loader = loader_with_policy(PermissionPolicy { ask: vec!["github:*".to_string()], ..Default::default() });
        let mut capability = Capability::new("cap-ask", "Opens an issue");
        capability.tools_used = vec![ToolId::parse("github:create_issue").unwrap()];
        loader.register(capability);

        let outcome = block_on(loader.invoke("cap-ask", vec![], serde_json::json!({}), None)).unwrap();
        let workflow_id = match outcome {
            InvokeOutcome::ApprovalRequired { workflow_id, .. } => workflow_id,
            InvokeOutcome::Completed(_) => panic!("expected an approval"),
        };

        let result = block_on(loader.continue_invocation(&workflow_id, false));
        assert!(matches!(result, Err(PmlError::PermissionDenied { .. })));
    }

    fn block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(fut)
    }
}
