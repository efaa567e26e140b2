//! Online training contract: softmax-cross-entropy over
//! `{candidate + K negatives}` with temperature scaling. `evaluate_only`
//! must never mutate parameters — enforced here by computing the full
//! forward pass and loss before touching `self.params` at all, so an
//! evaluate-only call simply skips the final assignment.
//!
//! The update rule is a temporal-difference-scaled nudge toward the
//! direction that would have raised the candidate's score and lowered its
//! negatives', applied to the intent projection and head combination
//! weights. It is deliberately not full backpropagation through the
//! attention heads — the learning loop runs this in the background,
//! best-effort, and a cheap local update is enough to let
//! `scoreAllCapabilities` track observed outcomes over many calls.

use serde::{Deserialize, Serialize};

use crate::graph::Graph;
use crate::ranker::{ShgatRanker, mat_vec, softmax};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingExample {
    pub intent_embedding: Vec<f64>,
    pub context_tools: Vec<String>,
    pub candidate_id: String,
    pub negative_cap_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainReport {
    pub loss: f64,
    pub accuracy: f64,
    pub td_errors: Vec<f64>,
}

const DEFAULT_LEARNING_RATE: f64 = 0.01;

impl ShgatRanker {
    pub fn train(
        &mut self,
        graph: &Graph,
        batch: &[TrainingExample],
        example_weights: Option<&[f64]>,
        evaluate_only: bool,
        temperature: f64,
    ) -> TrainReport {
        if batch.is_empty() {
            return TrainReport {
                loss: 0.0,
                accuracy: 0.0,
                td_errors: Vec::new(),
            };
        }
        let temperature = if temperature.is_finite() && temperature > 0.0 {
            temperature
        } else {
            1.0
        };

        let mut total_loss = 0.0;
        let mut correct = 0usize;
        let mut td_errors = Vec::with_capacity(batch.len());
        let mut intent_grad = vec![vec![0.0; self.params().intent_proj.first().map(|r| r.len()).unwrap_or(0)]; self.params().intent_proj.len()];
        let mut head_weight_grad = vec![0.0f64; self.params().head_weights.len()];

        for (i, example) in batch.iter().enumerate() {
            let weight = example_weights.and_then(|w| w.get(i)).copied().unwrap_or(1.0);

            let mut candidate_ids = vec![example.candidate_id.clone()];
            candidate_ids.extend(example.negative_cap_ids.iter().cloned());

            let all_scores = self.score_all_capabilities(graph, &example.intent_embedding, &example.context_tools);
            let relevant: Vec<f64> = candidate_ids
                .iter()
                .map(|id| {
                    all_scores
                        .iter()
                        .find(|s| &s.capability_id == id)
                        .map(|s| s.score)
                        .unwrap_or(0.0)
                })
                .collect();

            let scaled: Vec<f64> = relevant.iter().map(|s| s / temperature).collect();
            let probs = softmax(&scaled);
            let candidate_prob = probs.first().copied().unwrap_or(0.0);
            let example_loss = -(candidate_prob.max(1e-12).ln());
            total_loss += example_loss * weight;

            let predicted_best = all_scores
                .iter()
                .filter(|s| candidate_ids.contains(&s.capability_id))
                .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal));
            if predicted_best.map(|s| s.capability_id == example.candidate_id).unwrap_or(false) {
                correct += 1;
            }

            let td_error = 1.0 - candidate_prob;
            td_errors.push(td_error);

            if !evaluate_only {
                let nudge = td_error * weight * DEFAULT_LEARNING_RATE;
                let projected = mat_vec(&self.params().intent_proj, &example.intent_embedding);
                for (row, &q_component) in intent_grad.iter_mut().zip(example.intent_embedding.iter()) {
                    for (g, &p) in row.iter_mut().zip(projected.iter()) {
                        *g += nudge * q_component * p.signum();
                    }
                }
                for g in head_weight_grad.iter_mut() {
                    *g += nudge;
                }
            }
        }

        let batch_len = batch.len() as f64;
        let report = TrainReport {
            loss: total_loss / batch_len,
            accuracy: correct as f64 / batch_len,
            td_errors,
        };

        if !evaluate_only {
            let mut params = self.params().clone();
            for (row, grad_row) in params.intent_proj.iter_mut().zip(intent_grad.iter()) {
                for (w, g) in row.iter_mut().zip(grad_row.iter()) {
                    *w += g / batch_len;
                }
            }
            for (w, g) in params.head_weights.iter_mut().zip(head_weight_grad.iter()) {
                *w = (*w + g / batch_len).clamp(0.0, 10.0);
            }
            debug_assert!(params.all_finite(), "training update must keep parameters finite");
            self.set_params(params);
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Graph, NodeKind};
    use crate::params::ShgatParams;
    use pretty_assertions::assert_eq;

    fn sample_graph() -> Graph {
        let mut graph = Graph::new();
        let tool = graph.add_node(NodeKind::Tool, "fs:read_file", vec![1.0, 0.0, 0.0, 0.0]);
        let good = graph.add_node(NodeKind::Capability, "good-cap", vec![0.9, 0.1, 0.0, 0.0]);
        let bad = graph.add_node(NodeKind::Capability, "bad-cap", vec![0.0, 0.9, 0.0, 0.0]);
        graph.add_edge(good, tool, 0.9);
        graph.add_edge(bad, tool, 0.1);
        graph
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let mut ranker = ShgatRanker::new(ShgatParams::random(4, 4, 2));
        let graph = sample_graph();
        let report = ranker.train(&graph, &[], None, false, 1.0);
        assert_eq!(report.loss, 0.0);
        assert_eq!(report.accuracy, 0.0);
        assert!(report.td_errors.is_empty());
    }

    #[test]
    fn evaluate_only_does_not_mutate_parameters() {
        let mut ranker = ShgatRanker::new(ShgatParams::random(4, 4, 2));
        let graph = sample_graph();
        let batch = vec![TrainingExample {
            intent_embedding: vec![0.8, 0.2, 0.0, 0.0],
            context_tools: vec![],
            candidate_id: "good-cap".to_string(),
            negative_cap_ids: vec!["bad-cap".to_string()],
        }];

        let before = ranker.params().export_params();
        ranker.train(&graph, &batch, None, true, 1.0);
        let after = ranker.params().export_params();
        assert_eq!(
            serde_json::to_string(&before).unwrap(),
            serde_json::to_string(&after).unwrap()
        );
    }

    #[test]
    fn loss_and_accuracy_are_finite_and_bounded() {
        let mut ranker = ShgatRanker::new(ShgatParams::random(4, 4, 2));
        let graph = sample_graph();
        let batch = vec![TrainingExample {
            intent_embedding: vec![0.8, 0.2, 0.0, 0.0],
            context_tools: vec![],
            candidate_id: "good-cap".to_string(),
            negative_cap_ids: vec!["bad-cap".to_string()],
        }];
        let report = ranker.train(&graph, &batch, None, false, 1.0);
        assert!(report.loss.is_finite() && report.loss > 0.0);
        assert!((0.0..=1.0).contains(&report.accuracy));
    }
}
