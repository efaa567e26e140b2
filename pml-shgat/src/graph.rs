//! Arena-indexed heterogeneous graph of tools and capabilities. Neither
//! node type owns the other; everything is a dense integer id plus
//! weighted edge triples, so the ranker, the index, and the DAG
//! suggester can all hold a `&Graph` without any of them owning the others.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Tool,
    Capability,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    /// External identifier: a `ToolId` string or a capability id string.
    pub external_id: String,
    pub embedding: Vec<f64>,
}

/// A directed, weighted "provides"/dependency edge as a
/// `(srcId, dstId, weight)` triple.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Edge {
    pub src: NodeId,
    pub dst: NodeId,
    pub weight: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Graph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    #[serde(skip)]
    out_adjacency: FxHashMap<NodeId, Vec<usize>>,
    external_index: FxHashMap<String, NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, kind: NodeKind, external_id: impl Into<String>, embedding: Vec<f64>) -> NodeId {
        let external_id = external_id.into();
        if let Some(&existing) = self.external_index.get(&external_id) {
            return existing;
        }
        let id = self.nodes.len();
        self.external_index.insert(external_id.clone(), id);
        self.nodes.push(Node {
            id,
            kind,
            external_id,
            embedding,
        });
        id
    }

    pub fn add_edge(&mut self, src: NodeId, dst: NodeId, weight: f64) {
        let edge_idx = self.edges.len();
        self.edges.push(Edge { src, dst, weight });
        self.out_adjacency.entry(src).or_default().push(edge_idx);
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_by_external_id(&self, external_id: &str) -> Option<&Node> {
        self.external_index
            .get(external_id)
            .and_then(|&id| self.nodes.get(id))
    }

    pub fn nodes_of_kind(&self, kind: NodeKind) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(move |n| n.kind == kind)
    }

    /// Outgoing neighbors `(dst, weight)` of `id`, rebuilding the adjacency
    /// cache if the graph was deserialized (the cache is `#[serde(skip)]`).
    pub fn neighbors(&self, id: NodeId) -> Vec<(NodeId, f64)> {
        match self.out_adjacency.get(&id) {
            Some(idxs) => idxs
                .iter()
                .map(|&i| (self.edges[i].dst, self.edges[i].weight))
                .collect(),
            None => self
                .edges
                .iter()
                .filter(|e| e.src == id)
                .map(|e| (e.dst, e.weight))
                .collect(),
        }
    }

    pub fn rebuild_adjacency(&mut self) {
        self.out_adjacency.clear();
        for (idx, edge) in self.edges.iter().enumerate() {
            self.out_adjacency.entry(edge.src).or_default().push(idx);
        }
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn add_node_is_idempotent_by_external_id() {
        let mut graph = Graph::new();
        let a = graph.add_node(NodeKind::Tool, "fs:read_file", vec![0.1, 0.2]);
        let b = graph.add_node(NodeKind::Tool, "fs:read_file", vec![9.9, 9.9]);
        assert_eq!(a, b);
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn neighbors_reflect_added_edges() {
        let mut graph = Graph::new();
        let cap = graph.add_node(NodeKind::Capability, "deploy", vec![0.0; 4]);
        let tool = graph.add_node(NodeKind::Tool, "fs:read_file", vec![0.0; 4]);
        graph.add_edge(cap, tool, 0.8);
        assert_eq!(graph.neighbors(cap), vec![(tool, 0.8)]);
    }
}
