//! Tool index: the in-memory catalog of every tool schema discovered
//! from connected backends, plus a cosine-similarity lookup over tool
//! embeddings used to shortlist candidates before SHGAT ranking.

use dashmap::DashMap;

use crate::model::{ToolEmbedding, ToolId, ToolSchema};

#[derive(Default)]
pub struct ToolIndex {
    schemas: DashMap<ToolId, ToolSchema>,
    embeddings: DashMap<ToolId, Vec<f32>>,
}

impl ToolIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_schema(&self, schema: ToolSchema) {
        self.schemas.insert(schema.tool_id.clone(), schema);
    }

    pub fn upsert_embedding(&self, embedding: ToolEmbedding) {
        self.embeddings.insert(embedding.tool_id, embedding.vector);
    }

    pub fn schema(&self, tool_id: &ToolId) -> Option<ToolSchema> {
        self.schemas.get(tool_id).map(|entry| entry.clone())
    }

    pub fn contains(&self, tool_id: &ToolId) -> bool {
        self.schemas.contains_key(tool_id)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Remove every schema/embedding whose backend server id matches
    /// `server_id`, used when a backend disconnects or is replaced.
    pub fn remove_by_server(&self, server_id: &str) -> usize {
        let to_remove: Vec<ToolId> = self
            .schemas
            .iter()
            .filter(|entry| entry.value().server_id == server_id)
            .map(|entry| entry.key().clone())
            .collect();
        for tool_id in &to_remove {
            self.schemas.remove(tool_id);
            self.embeddings.remove(tool_id);
        }
        to_remove.len()
    }

    pub fn all_tool_ids(&self) -> Vec<ToolId> {
        self.schemas.iter().map(|e| e.key().clone()).collect()
    }

    /// Rank every tool with an embedding by cosine similarity to `query`,
    /// descending, breaking ties by tool id for determinism.
    pub fn nearest(&self, query: &[f32], top_k: usize) -> Vec<(ToolId, f32)> {
        let mut scored: Vec<(ToolId, f32)> = self
            .embeddings
            .iter()
            .map(|entry| (entry.key().clone(), cosine_similarity(query, entry.value())))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.as_str().cmp(b.0.as_str()))
        });
        scored.truncate(top_k);
        scored
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
