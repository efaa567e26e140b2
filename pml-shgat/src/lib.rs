//! SHGAT: a multi-head attention ranker over the heterogeneous tool/
//! capability graph. Owns no references into `pml-core`'s
//! tool index or capability store — it operates purely over dense integer
//! node ids (see [`graph::Graph`]) so the two crates can evolve
//! independently.

pub mod graph;
pub mod params;
pub mod ranker;
pub mod train;

pub use graph::{Edge, Graph, Node, NodeId, NodeKind};
pub use params::{HeadParams, ShgatParams};
pub use ranker::{CapabilityScore, ShgatRanker};
pub use train::{TrainReport, TrainingExample};
