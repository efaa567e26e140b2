use pml_sandbox::{BridgeError, RpcBridge};
use std::time::Duration;

#[tokio::test]
async fn a_blocking_tool_call_resolves_once_the_dispatcher_answers() {
    let (bridge, mut outbound) = RpcBridge::new(Duration::from_secs(5));

    let dispatcher_bridge = bridge.clone();
    let dispatcher = tokio::spawn(async move {
        let call = outbound.recv().await.expect("worker sent an rpc call");
        assert_eq!(call.method, "fs:read_file");
        dispatcher_bridge.resolve(&call.rpc_id, serde_json::json!({"contents": "hello"}));
    });

    let bridge_for_worker = bridge.clone();
    let worker = tokio::task::spawn_blocking(move || {
        bridge_for_worker.call_tool_blocking("fs:read_file".to_string(), serde_json::json!({"path": "a.txt"}))
    });

    dispatcher.await.unwrap();
    let result = worker.await.unwrap().unwrap();
    assert_eq!(result, serde_json::json!({"contents": "hello"}));
}

#[tokio::test]
async fn a_rejected_tool_call_surfaces_as_an_rpc_error() {
    let (bridge, mut outbound) = RpcBridge::new(Duration::from_secs(5));

    let dispatcher_bridge = bridge.clone();
    tokio::spawn(async move {
        let call = outbound.recv().await.unwrap();
        dispatcher_bridge.reject(&call.rpc_id, serde_json::json!({"message": "permission denied"}));
    });

    let result = tokio::task::spawn_blocking(move || {
        bridge.call_tool_blocking("fs:delete_file".to_string(), serde_json::json!({}))
    })
    .await
    .unwrap();

    assert!(matches!(result, Err(BridgeError::RpcError(_))));
}

#[tokio::test]
async fn an_unanswered_call_times_out() {
    let (bridge, _outbound) = RpcBridge::new(Duration::from_millis(50));

    let result = tokio::task::spawn_blocking(move || {
        bridge.call_tool_blocking("fs:read_file".to_string(), serde_json::json!({}))
    })
    .await
    .unwrap();

    assert!(matches!(result, Err(BridgeError::RpcTimeout)));
}

#[tokio::test]
async fn tearing_down_the_worker_fails_every_pending_call() {
    let (bridge, _outbound) = RpcBridge::new(Duration::from_secs(5));

    let bridge_for_worker = bridge.clone();
    let worker = tokio::task::spawn_blocking(move || {
        bridge_for_worker.call_tool_blocking("fs:read_file".to_string(), serde_json::json!({}))
    });

    // Give the blocking call time to register its correlation slot.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(bridge.pending_count(), 1);
    bridge.fail_all_pending();

    let result = worker.await.unwrap();
    assert!(result.is_err());
}
