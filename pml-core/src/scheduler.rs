//! Parallel executor: runs a capability's tool calls according to the
//! DAG suggester's order, executing independent tools concurrently and
//! respecting the learned dependency edges as hard ordering
//! constraints. A tool failure skips its descendants rather than
//! aborting the whole run — independent branches and already-started
//! tasks are allowed to finish, and whatever succeeded is still
//! reported back to the caller.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;

use crate::model::ToolId;
use crate::queue::RequestQueue;

#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub tool_id: ToolId,
    pub depends_on: Vec<ToolId>,
}

#[derive(Debug, thiserror::Error, Clone)]
pub enum SchedulerError {
    #[error("tool `{0}` failed: {1}")]
    TaskFailed(ToolId, String),
    #[error("scheduler task panicked: {0}")]
    Panicked(String),
    #[error("tool `{0}` skipped: a dependency failed")]
    Skipped(ToolId),
}

/// Outcome of a scheduled run. Unlike a plain `Result`, a failure in one
/// branch of the graph doesn't discard results already produced by
/// independent or already-completed tasks.
#[derive(Debug, Clone)]
pub struct ScheduleOutcome {
    pub results: HashMap<ToolId, serde_json::Value>,
    pub errors: Vec<SchedulerError>,
    pub execution_time_ms: u64,
    pub parallelization_layers: usize,
}

impl ScheduleOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs `tasks` to completion, invoking `run_one` for each tool once its
/// dependencies have all succeeded. Independent tasks execute
/// concurrently, bounded by `queue`'s configured strategy. When a task
/// fails, its transitive dependents are marked [`SchedulerError::Skipped`]
/// instead of being scheduled; every other branch keeps running.
pub async fn execute<F, Fut>(
    tasks: Vec<ScheduledTask>,
    queue: Arc<RequestQueue>,
    run_one: F,
) -> ScheduleOutcome
where
    F: Fn(ToolId) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<serde_json::Value, String>> + Send + 'static,
{
    let started_at = Instant::now();
    let run_one = Arc::new(run_one);
    let mut pending: HashMap<ToolId, HashSet<ToolId>> =
        tasks.iter().map(|t| (t.tool_id.clone(), t.depends_on.iter().cloned().collect())).collect();
    let mut dependents: HashMap<ToolId, Vec<ToolId>> = HashMap::new();
    for task in &tasks {
        for dep in &task.depends_on {
            dependents.entry(dep.clone()).or_default().push(task.tool_id.clone());
        }
    }

    let results: Arc<parking_lot::Mutex<HashMap<ToolId, serde_json::Value>>> =
        Arc::new(parking_lot::Mutex::new(HashMap::new()));
    let errors: Arc<parking_lot::Mutex<Vec<SchedulerError>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let failed: Arc<parking_lot::Mutex<HashSet<ToolId>>> = Arc::new(parking_lot::Mutex::new(HashSet::new()));
    let skipped: Arc<parking_lot::Mutex<HashSet<ToolId>>> = Arc::new(parking_lot::Mutex::new(HashSet::new()));

    let mut started: HashSet<ToolId> = HashSet::new();
    let mut join_set: JoinSet<()> = JoinSet::new();
    let mut layers = 0usize;

    loop {
        let ready: Vec<ToolId> = pending
            .iter()
            .filter(|(tool_id, deps)| deps.is_empty() && !started.contains(*tool_id))
            .map(|(tool_id, _)| tool_id.clone())
            .collect();

        if ready.is_empty() {
            if join_set.is_empty() {
                break;
            }
        } else {
            layers += 1;
        }

        for tool_id in ready {
            started.insert(tool_id.clone());
            let run_one = run_one.clone();
            let results = results.clone();
            let errors = errors.clone();
            let failed = failed.clone();
            let queue = queue.clone();
            let tool_id_for_task = tool_id.clone();
            join_set.spawn(async move {
                let permit = match queue.admit_owned().await {
                    Ok(permit) => permit,
                    Err(err) => {
                        failed.lock().insert(tool_id_for_task.clone());
                        errors.lock().push(SchedulerError::Panicked(err.to_string()));
                        return;
                    }
                };
                match run_one(tool_id_for_task.clone()).await {
                    Ok(value) => {
                        results.lock().insert(tool_id_for_task, value);
                    }
                    Err(message) => {
                        failed.lock().insert(tool_id_for_task.clone());
                        errors.lock().push(SchedulerError::TaskFailed(tool_id_for_task, message));
                    }
                }
                drop(permit);
            });
        }

        if join_set.is_empty() {
            break;
        }
        match join_set.join_next().await {
            Some(Ok(())) => {}
            Some(Err(join_err)) => {
                errors.lock().push(SchedulerError::Panicked(join_err.to_string()));
            }
            None => {}
        }

        // Propagate completion (success or failure) to dependents, and
        // transitively skip anything downstream of a failure.
        let done: Vec<ToolId> = results
            .lock()
            .keys()
            .cloned()
            .chain(failed.lock().iter().cloned())
            .collect();
        for tool_id in &done {
            if let Some(waiting) = dependents.get(tool_id) {
                for dependent in waiting.clone() {
                    if let Some(deps) = pending.get_mut(&dependent) {
                        deps.remove(tool_id);
                    }
                }
            }
        }

        let newly_failed: Vec<ToolId> = failed.lock().iter().cloned().collect();
        for failed_tool in &newly_failed {
            skip_descendants(failed_tool, &dependents, &mut pending, &mut started, &skipped, &errors);
        }
    }

    while join_set.join_next().await.is_some() {}

    let results = Arc::try_unwrap(results).map(|m| m.into_inner()).unwrap_or_default();
    let errors = Arc::try_unwrap(errors).map(|m| m.into_inner()).unwrap_or_default();

    ScheduleOutcome {
        results,
        errors,
        execution_time_ms: started_at.elapsed().as_millis() as u64,
        parallelization_layers: layers,
    }
}

/// Walks `dependents` transitively from `failed_tool`, marking every
/// downstream task as skipped so the scheduler never starts it and
/// recording one [`SchedulerError::Skipped`] per task the first time it's
/// reached.
fn skip_descendants(
    failed_tool: &ToolId,
    dependents: &HashMap<ToolId, Vec<ToolId>>,
    pending: &mut HashMap<ToolId, HashSet<ToolId>>,
    started: &mut HashSet<ToolId>,
    skipped: &Arc<parking_lot::Mutex<HashSet<ToolId>>>,
    errors: &Arc<parking_lot::Mutex<Vec<SchedulerError>>>,
) {
    let mut frontier = vec![failed_tool.clone()];
    while let Some(tool_id) = frontier.pop() {
        let Some(waiting) = dependents.get(&tool_id) else { continue };
        for dependent in waiting {
            if !skipped.lock().insert(dependent.clone()) {
                continue;
            }
            started.insert(dependent.clone());
            pending.remove(dependent);
            errors.lock().push(SchedulerError::Skipped(dependent.clone()));
            frontier.push(dependent.clone());
        }
    }
}
