//! DAG suggester: turns an intent embedding into a suggested task graph.
//! When the ranker is confident about a single capability, its own
//! tool order is lifted directly into a task chain; otherwise the
//! suggester looks for a short composition of two capabilities that
//! share tools, trading lower combined confidence for broader coverage.
//! Neither path is forced to produce anything — a caller with an intent
//! nothing in the graph is a good match for gets back "no suggestion"
//! rather than a low-quality guess.

use std::collections::{HashMap, HashSet};

use pml_shgat::{CapabilityScore, Graph, ShgatRanker};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{Capability, ToolId, ToolSchema};

/// Minimum ranker score a single capability must clear to be suggested
/// on its own. Below this, the suggester looks for a composition
/// instead of guessing from a weak single match.
pub const SINGLE_CAPABILITY_THRESHOLD: f64 = 0.5;

/// How many of the ranker's top-scoring capabilities are considered as
/// composition partners when no single one clears the threshold.
const COMPOSITION_CANDIDATES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Tool,
    Capability,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub call_name: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub input_schema: Value,
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestedDag {
    pub tasks: Vec<Task>,
    pub confidence: f64,
}

/// Suggest a task DAG for `intent_embedding`, given the ranker's current
/// scoring of every capability in `graph`. `capabilities` and
/// `tool_schemas` resolve the ranker's bare ids back to the tool lists
/// and input schemas a `Task` needs. Returns `None` when neither the
/// single-capability path nor the composition path produces at least
/// two tasks.
pub fn suggest(
    intent_embedding: &[f64],
    context: &[String],
    graph: &Graph,
    ranker: &ShgatRanker,
    capabilities: &HashMap<String, Capability>,
    tool_schemas: &HashMap<ToolId, ToolSchema>,
) -> Option<SuggestedDag> {
    let scores = ranker.score_all_capabilities(graph, intent_embedding, context);
    let best = scores.first()?;

    if best.score >= SINGLE_CAPABILITY_THRESHOLD {
        if let Some(dag) = single_capability_dag(best, capabilities, tool_schemas) {
            return Some(dag);
        }
    }

    let pool = &scores[..scores.len().min(COMPOSITION_CANDIDATES)];
    compose_from_candidates(pool, capabilities, tool_schemas)
}

/// Lift a capability's own ordered tool list into a linear task chain.
/// Confidence is the capability's own ranker score.
fn single_capability_dag(
    best: &CapabilityScore,
    capabilities: &HashMap<String, Capability>,
    tool_schemas: &HashMap<ToolId, ToolSchema>,
) -> Option<SuggestedDag> {
    let capability = capabilities.get(&best.capability_id)?;
    if capability.tools_used.len() < 2 {
        return None;
    }
    let tasks = tool_chain(&capability.tools_used, tool_schemas);
    Some(SuggestedDag { tasks, confidence: best.score.clamp(0.0, 1.0) })
}

/// Compose the best-scoring candidate with whichever other candidate
/// shares the most tools with it — the cheapest "provides" edge out of
/// the anchor — and chain both capabilities' tools in sequence.
/// Confidence decays with how little the two capabilities actually
/// share (`path_weight`), on top of their average ranker score.
fn compose_from_candidates(
    candidates: &[CapabilityScore],
    capabilities: &HashMap<String, Capability>,
    tool_schemas: &HashMap<ToolId, ToolSchema>,
) -> Option<SuggestedDag> {
    let nodes: Vec<&CapabilityScore> =
        candidates.iter().filter(|c| capabilities.contains_key(&c.capability_id)).collect();
    if nodes.len() < 2 {
        return None;
    }

    let anchor = nodes[0];
    let anchor_tools: HashSet<&ToolId> = capabilities[&anchor.capability_id].tools_used.iter().collect();

    let mut best_partner: Option<(&CapabilityScore, f64)> = None;
    for candidate in &nodes[1..] {
        let candidate_tools: HashSet<&ToolId> = capabilities[&candidate.capability_id].tools_used.iter().collect();
        let shared = anchor_tools.intersection(&candidate_tools).count();
        if shared == 0 {
            continue;
        }
        let path_weight = 1.0 / shared as f64;
        if best_partner.map(|(_, w)| path_weight < w).unwrap_or(true) {
            best_partner = Some((candidate, path_weight));
        }
    }
    let (partner, path_weight) = best_partner?;

    let mut tasks = Vec::new();
    let mut previous_task_id: Option<String> = None;
    for capability_id in [&anchor.capability_id, &partner.capability_id] {
        for tool in &capabilities[capability_id].tools_used {
            let task_id = format!("t{}", tasks.len());
            let depends_on = previous_task_id.clone().into_iter().collect();
            tasks.push(Task {
                id: task_id.clone(),
                call_name: tool.to_string(),
                task_type: TaskType::Tool,
                input_schema: schema_for(tool, tool_schemas),
                depends_on,
            });
            previous_task_id = Some(task_id);
        }
    }
    if tasks.len() < 2 {
        return None;
    }

    let avg_score = (anchor.score + partner.score) / 2.0;
    let confidence = avg_score * (-path_weight / 10.0).exp();
    Some(SuggestedDag { tasks, confidence })
}

fn tool_chain(tools: &[ToolId], tool_schemas: &HashMap<ToolId, ToolSchema>) -> Vec<Task> {
    tools
        .iter()
        .enumerate()
        .map(|(i, tool)| Task {
            id: format!("t{i}"),
            call_name: tool.to_string(),
            task_type: TaskType::Tool,
            input_schema: schema_for(tool, tool_schemas),
            depends_on: if i == 0 { Vec::new() } else { vec![format!("t{}", i - 1)] },
        })
        .collect()
}

fn schema_for(tool: &ToolId, tool_schemas: &HashMap<ToolId, ToolSchema>) -> Value {
    tool_schemas.get(tool).map(|s| s.input_schema.clone()).unwrap_or(Value::Null)
}
