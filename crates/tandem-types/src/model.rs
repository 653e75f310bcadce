// Model topology as seen by the layer planner.

use serde::{Deserialize, Serialize};

// ── Layer Range ───────────────────────────────────────────────────────────────

/// Inclusive range of decoder layer indices owned by one pipeline stage.
///
/// `LayerRange { start: 0, end: 14 }` covers layers 0 through 14.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerRange {
    pub start: u32,
    pub end: u32,
}

impl LayerRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u32 {
        if self.is_empty() {
            0
        } else {
            self.end - self.start + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, layer: u32) -> bool {
        layer >= self.start && layer <= self.end
    }
}

// ── Model Topology ────────────────────────────────────────────────────────────

/// The parts of the model configuration the control plane needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTopology {
    /// Number of decoder layers.
    pub num_layers: u32,
    /// Extra next-token-prediction layers placed after the decoder stack.
    /// Zero when the model has none.
    pub num_nextn_layers: u32,
}

impl Default for ModelTopology {
    fn default() -> Self {
        Self {
            num_layers: 32,
            num_nextn_layers: 0,
        }
    }
}
