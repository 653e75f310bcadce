pub mod config;
pub mod error;
pub mod model;
pub mod node;
pub mod pipeline;

pub use error::TandemError;
pub use model::{LayerRange, ModelTopology};
pub use node::{DataAddr, Node, MASTER_RANK};
pub use pipeline::{CacheCapacity, CommToken, DType, PipelineConfig, SharedPipelineConfig};
