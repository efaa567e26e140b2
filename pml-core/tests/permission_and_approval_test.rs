use pml_core::loader::{CapabilityLoader, InvokeOutcome};
use pml_core::lockfile::Lockfile;
use pml_core::model::{ApprovalKind, Capability, PermissionPolicy, ToolId};
use pml_core::routing::RoutingResolver;
use pml_core::trace::TraceCollector;
use std::sync::Arc;

fn deny_invoker() -> pml_core::loader::ToolInvoker {
    Arc::new(|_call| Box::pin(async move { Err(serde_json::json!({"message": "unreachable"})) }))
}

fn loader(dir: &std::path::Path, policy: PermissionPolicy, invoker: pml_core::loader::ToolInvoker) -> CapabilityLoader {
    let traces = TraceCollector::new(dir.join("traces.jsonl"));
    let routing = Arc::new(RoutingResolver::init(None));
    let lockfile = Arc::new(parking_lot::Mutex::new(Lockfile::load(dir.join("mcp.lock")).unwrap()));
    CapabilityLoader::new(policy, traces, invoker, routing, lockfile)
}

#[tokio::test]
async fn denied_tool_blocks_capability_without_any_approval_prompt() {
    let dir = tempfile::tempdir().unwrap();
    let policy = PermissionPolicy {
        deny: vec!["fs:delete_file".to_string()],
        ..Default::default()
    };
    let loader = loader(dir.path(), policy, deny_invoker());

    let mut capability = Capability::new("delete-everything", "Deletes a file");
    capability.tools_used = vec![ToolId::parse("fs:delete_file").unwrap()];
    loader.register(capability);

    let result = loader.invoke("delete-everything", vec![], serde_json::json!({}), None).await;
    assert!(result.is_err());
    assert_eq!(loader.approvals().pending_count(), 0);
}

#[tokio::test]
async fn ask_mode_tool_returns_an_approval_required_outcome_that_can_be_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let policy = PermissionPolicy {
        ask: vec!["github:*".to_string()],
        ..Default::default()
    };
    let loader = loader(dir.path(), policy, deny_invoker());

    let mut capability = Capability::new("open-issue", "Opens a GitHub issue");
    capability.tools_used = vec![ToolId::parse("github:create_issue").unwrap()];
    loader.register(capability);

    // `invoke` returns immediately with the pending workflow id instead
    // of blocking the caller's task until a human decides.
    let outcome = loader
        .invoke("open-issue", vec![], serde_json::json!({}), None)
        .await
        .unwrap();
    let workflow_id = match outcome {
        InvokeOutcome::ApprovalRequired { workflow_id, kind, .. } => {
            assert_eq!(kind, ApprovalKind::ToolPermission);
            workflow_id
        }
        InvokeOutcome::Completed(_) => panic!("expected an approval, got a completed outcome"),
    };
    assert_eq!(loader.approvals().pending_count(), 1);

    let result = loader.continue_invocation(&workflow_id, false).await;
    assert!(result.is_err());
    assert_eq!(loader.approvals().pending_count(), 0);
}

#[tokio::test]
async fn ask_mode_tool_dispatches_once_continued_with_approval() {
    let dir = tempfile::tempdir().unwrap();
    let policy = PermissionPolicy {
        ask: vec!["github:*".to_string()],
        ..Default::default()
    };
    let echo_invoker: pml_core::loader::ToolInvoker = Arc::new(|call| Box::pin(async move { Ok(call.args) }));
    let loader = loader(dir.path(), policy, echo_invoker);

    let mut capability = Capability::new("open-issue", "Opens a GitHub issue");
    capability.tools_used = vec![ToolId::parse("github:create_issue").unwrap()];
    loader.register(capability);

    let outcome = loader
        .invoke("open-issue", vec![], serde_json::json!({}), None)
        .await
        .unwrap();
    let workflow_id = match outcome {
        InvokeOutcome::ApprovalRequired { workflow_id, .. } => workflow_id,
        InvokeOutcome::Completed(_) => panic!("expected an approval"),
    };

    let resumed = loader.continue_invocation(&workflow_id, true).await.unwrap();
    assert!(matches!(resumed, InvokeOutcome::Completed(_)));
}
