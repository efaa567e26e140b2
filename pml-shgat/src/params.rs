//! Serializable SHGAT parameter set. `importParams(exportParams())` must
//! be a bit-level JSON identity, so this module keeps the on-wire
//! representation a plain, order-preserving `Vec<Vec<f64>>` structure
//! with no `HashMap`-backed reordering and no lossy numeric narrowing.

use serde::{Deserialize, Serialize};

pub type Matrix = Vec<Vec<f64>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeadParams {
    pub query_proj: Matrix,
    pub key_proj: Matrix,
    pub value_proj: Matrix,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShgatParams {
    pub embedding_dim: usize,
    pub head_dim: usize,
    pub heads: Vec<HeadParams>,
    pub head_weights: Vec<f64>,
    pub intent_proj: Matrix,
}

impl ShgatParams {
    /// Random initialization, matching the small-scale Xavier-ish spread
    /// used for attention projections.
    pub fn random(embedding_dim: usize, head_dim: usize, num_heads: usize) -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let scale = (1.0 / embedding_dim as f64).sqrt();
        let mut make_matrix = |rows: usize, cols: usize| -> Matrix {
            (0..rows)
                .map(|_| (0..cols).map(|_| rng.gen_range(-scale..scale)).collect())
                .collect()
        };

        let heads = (0..num_heads)
            .map(|_| HeadParams {
                query_proj: make_matrix(embedding_dim, head_dim),
                key_proj: make_matrix(embedding_dim, head_dim),
                value_proj: make_matrix(embedding_dim, head_dim),
            })
            .collect();

        Self {
            embedding_dim,
            head_dim,
            heads,
            head_weights: vec![1.0 / num_heads as f64; num_heads],
            intent_proj: make_matrix(embedding_dim, embedding_dim),
        }
    }

    /// Export to a JSON value. Exists as a distinct step from
    /// `serde_json::to_value` so the round-trip property reads naturally:
    /// `import_params(export_params(&p))? == p`.
    pub fn export_params(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("ShgatParams is always serializable")
    }

    pub fn import_params(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// All finite-ness checks in one place.
    pub fn all_finite(&self) -> bool {
        self.head_weights.iter().all(|v| v.is_finite())
            && matrix_finite(&self.intent_proj)
            && self
                .heads
                .iter()
                .all(|h| matrix_finite(&h.query_proj) && matrix_finite(&h.key_proj) && matrix_finite(&h.value_proj))
    }
}

fn matrix_finite(m: &Matrix) -> bool {
    m.iter().all(|row| row.iter().all(|v| v.is_finite()))
}
