//! Multi-head attention forward pass. Each capability attends
//! over its neighboring tools (and, when supplied, a recent-tool-context
//! set used as an attention boost) through `K` independent heads; a
//! head-weighted combination projected against the intent produces the
//! final score.

use crate::graph::{Graph, NodeId, NodeKind};
use crate::params::ShgatParams;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityScore {
    pub capability_id: String,
    pub score: f64,
    pub head_scores: Vec<f64>,
}

pub struct ShgatRanker {
    params: ShgatParams,
}

impl ShgatRanker {
    pub fn new(params: ShgatParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ShgatParams {
        &self.params
    }

    pub fn set_params(&mut self, params: ShgatParams) {
        self.params = params;
    }

    /// Score every capability in `graph` against intent `q`, optionally
    /// boosting attention toward the tools in `context`. Results are sorted
    /// by score descending, ties broken by capability id ascending so the
    /// same inputs always produce the same ranking.
    pub fn score_all_capabilities(
        &self,
        graph: &Graph,
        q: &[f64],
        context: &[String],
    ) -> Vec<CapabilityScore> {
        let context_ids: FxHashSet<NodeId> = context
            .iter()
            .filter_map(|id| graph.node_by_external_id(id))
            .map(|n| n.id)
            .collect();

        let intent_projected = mat_vec(&self.params.intent_proj, q);

        let mut scores: Vec<CapabilityScore> = graph
            .nodes_of_kind(NodeKind::Capability)
            .map(|cap| {
                let neighbors = graph.neighbors(cap.id);
                let head_scores: Vec<f64> = self
                    .params
                    .heads
                    .iter()
                    .map(|head| {
                        score_head(
                            head,
                            &intent_projected,
                            &cap.embedding,
                            graph,
                            &neighbors,
                            &context_ids,
                        )
                    })
                    .collect();
                let combined: f64 = head_scores
                    .iter()
                    .zip(self.params.head_weights.iter())
                    .map(|(s, w)| s * w)
                    .sum();
                CapabilityScore {
                    capability_id: cap.external_id.clone(),
                    score: combined,
                    head_scores,
                }
            })
            .collect();

        scores.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.capability_id.cmp(&b.capability_id))
        });
        scores
    }
}

fn score_head(
    head: &crate::params::HeadParams,
    intent_projected: &[f64],
    cap_embedding: &[f64],
    graph: &Graph,
    neighbors: &[(NodeId, f64)],
    context_ids: &FxHashSet<NodeId>,
) -> f64 {
    let query = mat_vec(&head.query_proj, intent_projected);
    let head_dim = query.len().max(1) as f64;

    if neighbors.is_empty() {
        // No tool neighbors (a pure-compute capability): fall back to
        // scoring the capability's own embedding directly.
        let key = mat_vec(&head.key_proj, cap_embedding);
        return dot(&query, &key) / head_dim.sqrt();
    }

    let mut logits = Vec::with_capacity(neighbors.len());
    for &(tool_id, edge_weight) in neighbors {
        let tool_embedding = graph
            .node(tool_id)
            .map(|n| n.embedding.as_slice())
            .unwrap_or(&[]);
        let key = mat_vec(&head.key_proj, tool_embedding);
        let mut logit = dot(&query, &key) / head_dim.sqrt();
        logit += edge_weight.ln_1p();
        if context_ids.contains(&tool_id) {
            logit += 1.0;
        }
        logits.push(logit);
    }

    let weights = softmax(&logits);
    let mut message = vec![0.0f64; head.value_proj.first().map(|r| r.len()).unwrap_or(0)];
    for (&(tool_id, _), &alpha) in neighbors.iter().zip(weights.iter()) {
        let tool_embedding = graph
            .node(tool_id)
            .map(|n| n.embedding.as_slice())
            .unwrap_or(&[]);
        let value = mat_vec(&head.value_proj, tool_embedding);
        for (m, v) in message.iter_mut().zip(value.iter()) {
            *m += alpha * v;
        }
    }

    dot(&query, &message) / head_dim.sqrt()
}

pub(crate) fn mat_vec(matrix: &[Vec<f64>], vec: &[f64]) -> Vec<f64> {
    if matrix.is_empty() {
        return Vec::new();
    }
    let cols = matrix[0].len();
    let mut out = vec![0.0f64; cols];
    for (row, &x) in matrix.iter().zip(vec.iter()) {
        for (o, w) in out.iter_mut().zip(row.iter()) {
            *o += w * x;
        }
    }
    out
}

pub(crate) fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub(crate) fn softmax(logits: &[f64]) -> Vec<f64> {
    if logits.is_empty() {
        return Vec::new();
    }
    let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    if sum == 0.0 || !sum.is_finite() {
        let uniform = 1.0 / logits.len() as f64;
        return vec![uniform; logits.len()];
    }
    exps.into_iter().map(|e| e / sum).collect()
}
