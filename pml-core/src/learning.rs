//! Learning loop: turns recorded execution traces into two kinds of
//! structural learning — SHGAT training examples (did this capability
//! match the intent it was invoked for) and dependency-edge confidence
//! updates (did this tool consistently run before that one).

use std::collections::HashMap;

use chrono::Utc;
use pml_shgat::{Graph, ShgatRanker, TrainReport, TrainingExample};

use crate::model::{DependencyEdge, ExecutionTrace, ToolId};

const DEPENDENCY_PRIOR_ALPHA: f64 = 1.0;
const DEPENDENCY_PRIOR_BETA: f64 = 1.0;

/// Derive ordered-pair dependency observations from a single trace's task
/// results, in the order they were recorded.
pub fn observe_dependencies(trace: &ExecutionTrace) -> Vec<(ToolId, ToolId)> {
    let mut pairs = Vec::new();
    for window in trace.task_results.windows(2) {
        let (before, after) = (&window[0], &window[1]);
        if before.success && after.success {
            pairs.push((before.tool_id.clone(), after.tool_id.clone()));
        }
    }
    pairs
}

/// Dependency graph keyed by `(before, after)`, updated with a Beta-prior
/// confidence whenever a trace observes that ordering.
#[derive(Default)]
pub struct DependencyModel {
    edges: HashMap<(ToolId, ToolId), DependencyEdge>,
}

impl DependencyModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest_trace(&mut self, trace: &ExecutionTrace) {
        for (before, after) in observe_dependencies(trace) {
            self.edges
                .entry((before, after))
                .or_insert_with(|| DependencyEdge::new(DEPENDENCY_PRIOR_ALPHA, DEPENDENCY_PRIOR_BETA, Utc::now()))
                .record_observation(DEPENDENCY_PRIOR_ALPHA, DEPENDENCY_PRIOR_BETA);
        }
    }

    pub fn confidence(&self, before: &ToolId, after: &ToolId) -> Option<f64> {
        self.edges.get(&(before.clone(), after.clone())).map(|e| e.confidence)
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn edges(&self) -> impl Iterator<Item = (&(ToolId, ToolId), &DependencyEdge)> {
        self.edges.iter()
    }
}

/// Turn a successful trace into a SHGAT training example: the capability
/// that actually ran is the positive candidate for the intent embedding
/// it was invoked with; `negative_candidates` are the other capability
/// ids that were in the running but did not run, supplied by the caller
/// since the candidate pool isn't recoverable from the trace alone.
pub fn build_training_example(
    trace: &ExecutionTrace,
    intent_embedding: Vec<f64>,
    negative_candidates: Vec<String>,
) -> Option<TrainingExample> {
    let capability_id = trace.capability_id.clone()?;
    if !trace.success {
        return None;
    }
    let context_tools = trace.task_results.iter().map(|t| t.tool_id.to_string()).collect();
    Some(TrainingExample {
        intent_embedding,
        context_tools,
        candidate_id: capability_id,
        negative_cap_ids: negative_candidates,
    })
}

const TRAIN_TEMPERATURE: f64 = 1.0;

/// Train the ranker on a batch of examples, returning the report for
/// logging/telemetry. A thin wrapper kept here (rather than calling
/// `ShgatRanker::train` directly from call sites) so the learning loop
/// is the single place that decides training hyperparameters.
pub fn run_training_pass(ranker: &mut ShgatRanker, graph: &Graph, examples: &[TrainingExample], evaluate_only: bool) -> TrainReport {
    ranker.train(graph, examples, None, evaluate_only, TRAIN_TEMPERATURE)
}
