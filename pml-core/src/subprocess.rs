//! Subprocess pool: owns the lifecycle of locally-spawned backend
//! processes (stdio-transport tool providers), the line-delimited
//! JSON-RPC client that talks to them, and the backoff that covers a
//! crashed backend's reconnection. One entry per connected backend, with
//! its stderr drained into the tracing log so a crashing backend leaves a
//! trail instead of silently vanishing.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

/// Reconnection backoff schedule: `BASE * FACTOR^attempt`, capped at
/// `CEILING`, with full jitter (a uniform draw between zero and the
/// capped delay) so a fleet of backends restarting together doesn't
/// retry in lockstep.
const BACKOFF_BASE: Duration = Duration::from_millis(200);
const BACKOFF_FACTOR: u32 = 2;
const BACKOFF_MAX_ATTEMPTS: u32 = 8;
const BACKOFF_CEILING: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SubprocessSpec {
    pub server_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_directory: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SubprocessError {
    #[error("backend `{server_id}` failed to spawn after {attempts} attempts: {source}")]
    Spawn {
        server_id: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("backend `{0}` is not in the pool")]
    UnknownBackend(String),
    #[error("backend `{server_id}` rejected the call: {message}")]
    RpcError { server_id: String, message: String },
    #[error("backend `{server_id}` disconnected before answering the call")]
    Disconnected { server_id: String },
    #[error("failed to write to backend `{server_id}`'s stdin: {source}")]
    Write {
        server_id: String,
        #[source]
        source: std::io::Error,
    },
}

type PendingReplies = Arc<DashMap<u64, oneshot::Sender<Result<Value, Value>>>>;

struct Handle {
    child: Mutex<Child>,
    command_label: String,
    stdin: Mutex<ChildStdin>,
    pending: PendingReplies,
    next_request_id: AtomicU64,
}

/// Pool of running backend subprocesses, keyed by server id.
#[derive(Default)]
pub struct SubprocessPool {
    handles: DashMap<String, Handle>,
}

impl SubprocessPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a backend if it isn't already running; a no-op if it is.
    /// Retries a failed spawn with exponential backoff and full jitter
    /// before giving up.
    pub async fn ensure_started(&self, spec: &SubprocessSpec) -> Result<(), SubprocessError> {
        self.ensure_started_with_backoff(spec, BACKOFF_BASE, BACKOFF_FACTOR, BACKOFF_MAX_ATTEMPTS, BACKOFF_CEILING)
            .await
    }

    async fn ensure_started_with_backoff(
        &self,
        spec: &SubprocessSpec,
        base: Duration,
        factor: u32,
        max_attempts: u32,
        ceiling: Duration,
    ) -> Result<(), SubprocessError> {
        if self.handles.contains_key(&spec.server_id) {
            return Ok(());
        }

        let resolved_env = pml_commons::env_expand::expand_map(&spec.env, &process_env());

        let mut attempt = 0;
        let child = loop {
            attempt += 1;
            debug!(server = %spec.server_id, command = %spec.command, attempt, "spawning backend subprocess");
            match spawn_one(spec, &resolved_env) {
                Ok(child) => break child,
                Err(source) if attempt < max_attempts => {
                    let delay = backoff_delay(attempt, base, factor, ceiling);
                    warn!(server = %spec.server_id, attempt, delay_ms = delay.as_millis() as u64, error = %source, "backend spawn failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(source) => {
                    return Err(SubprocessError::Spawn { server_id: spec.server_id.clone(), attempts: attempt, source });
                }
            }
        };

        self.install(spec, child);
        Ok(())
    }

    fn install(&self, spec: &SubprocessSpec, mut child: Child) {
        if let Some(stderr) = child.stderr.take() {
            let server_id = spec.server_id.clone();
            let command_label = spec.command.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) if !line.trim().is_empty() => {
                            info!(server = %server_id, command = %command_label, line = %line, "backend stderr");
                        }
                        Ok(Some(_)) => continue,
                        Ok(None) => break,
                        Err(err) => {
                            warn!(server = %server_id, error = %err, "error reading backend stderr");
                            break;
                        }
                    }
                }
            });
        }

        let pending: PendingReplies = Arc::new(DashMap::new());
        let stdin = child.stdin.take().expect("stdin piped at spawn");
        if let Some(stdout) = child.stdout.take() {
            let server_id = spec.server_id.clone();
            let pending_for_reader = pending.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => route_response(&server_id, &line, &pending_for_reader),
                        Ok(None) => {
                            debug!(server = %server_id, "backend stdout closed");
                            break;
                        }
                        Err(err) => {
                            warn!(server = %server_id, error = %err, "error reading backend stdout");
                            break;
                        }
                    }
                }
                let ids: Vec<u64> = pending_for_reader.iter().map(|entry| *entry.key()).collect();
                for id in ids {
                    if let Some((_, tx)) = pending_for_reader.remove(&id) {
                        let _ = tx.send(Err(serde_json::json!({ "message": "backend disconnected" })));
                    }
                }
            });
        }

        self.handles.insert(
            spec.server_id.clone(),
            Handle {
                child: Mutex::new(child),
                command_label: spec.command.clone(),
                stdin: Mutex::new(stdin),
                pending,
                next_request_id: AtomicU64::new(1),
            },
        );
    }

    /// Issue a JSON-RPC `tools/call` to a running backend and wait for its
    /// response. Hides reconnection from callers: if the backend process
    /// has died, this returns [`SubprocessError::Disconnected`] rather
    /// than panicking, and a subsequent `ensure_started` transparently
    /// respawns it.
    pub async fn call(&self, server_id: &str, tool_id: &str, args: Value) -> Result<Value, SubprocessError> {
        let handle = self
            .handles
            .get(server_id)
            .ok_or_else(|| SubprocessError::UnknownBackend(server_id.to_string()))?;

        let request_id = handle.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        handle.pending.insert(request_id, tx);

        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": request_id,
            "method": "tools/call",
            "params": { "name": tool_id, "arguments": args },
        });
        let mut line = serde_json::to_string(&request).expect("request is always serializable");
        line.push('\n');

        {
            let mut stdin = handle.stdin.lock().await;
            stdin.write_all(line.as_bytes()).await.map_err(|source| SubprocessError::Write {
                server_id: server_id.to_string(),
                source,
            })?;
        }
        drop(handle);

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(SubprocessError::RpcError {
                server_id: server_id.to_string(),
                message: error.to_string(),
            }),
            Err(_canceled) => Err(SubprocessError::Disconnected { server_id: server_id.to_string() }),
        }
    }

    pub fn is_running(&self, server_id: &str) -> bool {
        self.handles.contains_key(server_id)
    }

    /// Check whether the child has exited without removing it from the
    /// pool; returns `None` if it is still running or unknown. Serves as
    /// the pool's health probe — callers poll this (or call it from a
    /// periodic task) to notice a dead backend before the next `call`.
    pub async fn exit_status(&self, server_id: &str) -> Option<std::process::ExitStatus> {
        let handle = self.handles.get(server_id)?;
        let mut child = handle.child.lock().await;
        child.try_wait().ok().flatten()
    }

    pub async fn stop(&self, server_id: &str) -> Result<(), SubprocessError> {
        let (_, handle) = self
            .handles
            .remove(server_id)
            .ok_or_else(|| SubprocessError::UnknownBackend(server_id.to_string()))?;
        let mut child = handle.child.lock().await;
        debug!(server = %server_id, command = %handle.command_label, "stopping backend subprocess");
        let _ = child.start_kill();
        let _ = child.wait().await;
        Ok(())
    }

    pub async fn stop_all(&self) {
        let server_ids: Vec<String> = self.handles.iter().map(|e| e.key().clone()).collect();
        for server_id in server_ids {
            let _ = self.stop(&server_id).await;
        }
    }

    pub fn running_count(&self) -> usize {
        self.handles.len()
    }
}

fn spawn_one(spec: &SubprocessSpec, resolved_env: &HashMap<String, String>) -> std::io::Result<Child> {
    let mut command = Command::new(&spec.command);
    command.args(&spec.args);
    command.stdin(Stdio::piped());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    if let Some(dir) = &spec.working_directory {
        command.current_dir(dir);
    }
    if !resolved_env.is_empty() {
        command.envs(resolved_env);
    }

    #[cfg(unix)]
    {
        command.process_group(0);
    }

    command.spawn()
}

fn process_env() -> HashMap<String, String> {
    std::env::vars().collect()
}

/// Full-jitter exponential backoff for the `attempt`-th retry (1-indexed):
/// a uniform draw between zero and `base * factor^(attempt-1)`, capped at
/// `ceiling`.
fn backoff_delay(attempt: u32, base: Duration, factor: u32, ceiling: Duration) -> Duration {
    let exp = base * factor.saturating_pow(attempt.saturating_sub(1));
    let capped = exp.min(ceiling);
    let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64);
    Duration::from_millis(jitter_ms)
}

fn route_response(server_id: &str, line: &str, pending: &PendingReplies) {
    if line.trim().is_empty() {
        return;
    }
    let parsed: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => {
            warn!(server = %server_id, error = %err, "backend sent a non-JSON line, ignoring");
            return;
        }
    };
    let Some(id) = parsed.get("id").and_then(Value::as_u64) else {
        debug!(server = %server_id, "backend sent a response with no correlation id, ignoring");
        return;
    };
    let Some((_, tx)) = pending.remove(&id) else {
        return;
    };
    if let Some(error) = parsed.get("error") {
        let _ = tx.send(Err(error.clone()));
    } else {
        let _ = tx.send(Ok(parsed.get("result").cloned().unwrap_or(Value::Null)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn echo_spec(server_id: &str) -> SubprocessSpec {
        SubprocessSpec {
            server_id: server_id.to_string(),
            command: "cat".to_string(),
            args: vec![],
            env: HashMap::new(),
            working_directory: None,
        }
    }

    #[tokio::test]
    async fn ensure_started_is_idempotent() {
        let pool = SubprocessPool::new();
        let spec = echo_spec("backend-a");
        pool.ensure_started(&spec).await.unwrap();
        pool.ensure_started(&spec).await.unwrap();
        assert_eq!(pool.running_count(), 1);
        pool.stop_all().await;
    }

    #[tokio::test]
    async fn stop_removes_the_backend_from_the_pool() {
        let pool = SubprocessPool::new();
        pool.ensure_started(&echo_spec("backend-b")).await.unwrap();
        pool.stop("backend-b").await.unwrap();
        assert!(!pool.is_running("backend-b"));
    }

    #[tokio::test]
    async fn stopping_unknown_backend_errors() {
        let pool = SubprocessPool::new();
        let result = pool.stop("does-not-exist").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_as_spawn_error_after_retrying() {
        let pool = SubprocessPool::new();
        let spec = SubprocessSpec {
            server_id: "bogus".to_string(),
            command: "/does/not/exist/binary".to_string(),
            args: vec![],
            env: HashMap::new(),
            working_directory: None,
        };
        // Tiny backoff parameters so the retry loop it covers runs in
        // milliseconds instead of the real ~13s worst case.
        let result = pool
            .ensure_started_with_backoff(&spec, Duration::from_millis(1), 2, 3, Duration::from_millis(4))
            .await;
        assert!(matches!(result, Err(SubprocessError::Spawn { attempts: 3, .. })));
    }

    #[test]
    fn backoff_delay_never_exceeds_the_ceiling() {
        for attempt in 1..=10 {
            let delay = backoff_delay(attempt, Duration::from_millis(200), 2, Duration::from_secs(30));
            assert!(delay <= Duration::from_secs(30));
        }
    }

    #[tokio::test]
    async fn calling_an_unknown_backend_errors() {
        let pool = SubprocessPool::new();
        let result = pool.call("does-not-exist", "fs:read", serde_json::json!({})).await;
        assert!(matches!(result, Err(SubprocessError::UnknownBackend(_))));
    }

    #[tokio::test]
    async fn call_round_trips_through_a_line_delimited_jsonrpc_echo_script() {
        // A tiny shell pipeline that echoes each request id back as the
        // result, standing in for a real stdio tool-provider backend.
        let pool = SubprocessPool::new();
        let spec = SubprocessSpec {
            server_id: "jsonrpc-echo".to_string(),
            command: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "while IFS= read -r line; do id=$(echo \"$line\" | sed -n 's/.*\"id\":\\([0-9]*\\).*/\\1/p'); echo \"{\\\"jsonrpc\\\":\\\"2.0\\\",\\\"id\\\":$id,\\\"result\\\":{\\\"ok\\\":true}}\"; done".to_string(),
            ],
            env: HashMap::new(),
            working_directory: None,
        };
        pool.ensure_started(&spec).await.unwrap();

        let result = pool.call("jsonrpc-echo", "fs:read", serde_json::json!({"path": "a.txt"})).await.unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
        pool.stop_all().await;
    }
}
