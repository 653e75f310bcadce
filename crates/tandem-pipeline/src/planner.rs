//! Contiguous layer-to-rank assignment for pipeline parallelism.
//!
//! Algorithm:
//! 1. `per = ceil(num_layers / world_size)`.
//! 2. The master (rank 0) owns `[0, per - offload_layer_num - 1]`. It also
//!    hosts scheduling and sampling, so offloaded layers leave its share.
//! 3. The remaining layers are split evenly over ranks `1..world_size` in
//!    rank order; the first `rest % (world_size - 1)` of them take one extra.
//! 4. The last rank always ends at `num_layers - 1`.
//! 5. Next-token-prediction layers, if any, follow the decoder stack and go
//!    to the last rank, which produces the final hidden state.
//!
//! Every `world_size <= num_layers` with `offload_layer_num < per` yields a
//! non-empty range per rank. A single node owns the whole model and ignores
//! the offload.

use tandem_types::LayerRange;

use crate::error::{PipelineError, Result};

/// One rank's share of the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerAssignment {
    pub rank: usize,
    pub layers: LayerRange,
    pub nextn: Option<LayerRange>,
}

/// Layers the master owns before offload.
pub fn master_share(num_layers: u32, world_size: usize) -> usize {
    (num_layers as usize).div_ceil(world_size.max(1))
}

/// Split `num_layers` decoder layers across `world_size` ranks.
pub fn plan_layers(
    num_layers: u32,
    world_size: usize,
    offload_layer_num: u32,
    num_nextn_layers: u32,
) -> Result<Vec<LayerAssignment>> {
    if world_size == 0 {
        return Err(PipelineError::Planning("world size is zero".into()));
    }
    if num_layers == 0 {
        return Err(PipelineError::Planning("model has no layers".into()));
    }
    let total = num_layers as usize;
    if total < world_size {
        return Err(PipelineError::Planning(format!(
            "{num_layers} layers cannot give each of {world_size} nodes a layer"
        )));
    }

    let nextn = (num_nextn_layers > 0)
        .then(|| LayerRange::new(num_layers, num_layers + num_nextn_layers - 1));

    if world_size == 1 {
        return Ok(vec![LayerAssignment {
            rank: 0,
            layers: LayerRange::new(0, num_layers - 1),
            nextn,
        }]);
    }

    let per = master_share(num_layers, world_size);
    let off = offload_layer_num as usize;
    if off >= per {
        return Err(PipelineError::Planning(format!(
            "offload {offload_layer_num} leaves the master no layers (share {per} of {num_layers}, {world_size} nodes)"
        )));
    }

    // total >= world_size keeps rest >= workers, so no worker range is empty.
    let master = per - off;
    let workers = world_size - 1;
    let rest = total - master;
    let (base, extra) = (rest / workers, rest % workers);

    let mut plan = Vec::with_capacity(world_size);
    plan.push(LayerAssignment {
        rank: 0,
        layers: LayerRange::new(0, (master - 1) as u32),
        nextn: None,
    });
    let mut lower = master;
    for w in 0..workers {
        let rank = w + 1;
        let len = base + usize::from(w < extra);
        let upper = lower + len - 1;
        plan.push(LayerAssignment {
            rank,
            layers: LayerRange::new(lower as u32, upper as u32),
            nextn: if rank == workers { nextn } else { None },
        });
        lower = upper + 1;
    }

    Ok(plan)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_nodes_with_offload() {
        let plan = plan_layers(32, 2, 1, 0).unwrap();
        assert_eq!(plan[0].layers, LayerRange::new(0, 14));
        assert_eq!(plan[1].layers, LayerRange::new(15, 31));
        assert!(plan.iter().all(|a| a.nextn.is_none()));
    }

    #[test]
    fn two_equal_nodes() {
        let plan = plan_layers(32, 2, 0, 0).unwrap();
        assert_eq!(plan[0].layers, LayerRange::new(0, 15));
        assert_eq!(plan[1].layers, LayerRange::new(16, 31));
    }

    #[test]
    fn single_node_gets_all() {
        let plan = plan_layers(32, 1, 3, 0).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].layers, LayerRange::new(0, 31));
    }

    #[test]
    fn uneven_split_ends_at_last_layer() {
        let plan = plan_layers(10, 3, 0, 0).unwrap();
        assert_eq!(plan[0].layers, LayerRange::new(0, 3));
        assert_eq!(plan[1].layers, LayerRange::new(4, 6));
        assert_eq!(plan[2].layers, LayerRange::new(7, 9));
    }

    #[test]
    fn more_nodes_than_full_shares() {
        let plan = plan_layers(10, 6, 0, 0).unwrap();
        let ranges: Vec<_> = plan.iter().map(|a| (a.layers.start, a.layers.end)).collect();
        assert_eq!(ranges, vec![(0, 1), (2, 3), (4, 5), (6, 7), (8, 8), (9, 9)]);
    }

    #[test]
    fn offload_spreads_over_workers() {
        let plan = plan_layers(61, 3, 1, 0).unwrap();
        assert_eq!(plan[0].layers, LayerRange::new(0, 19));
        assert_eq!(plan[1].layers, LayerRange::new(20, 40));
        assert_eq!(plan[2].layers, LayerRange::new(41, 60));
    }

    #[test]
    fn nextn_goes_to_last_rank() {
        let plan = plan_layers(61, 2, 0, 1).unwrap();
        assert!(plan[0].nextn.is_none());
        assert_eq!(plan[1].nextn, Some(LayerRange::new(61, 61)));
    }

    #[test]
    fn plans_cover_every_layer_exactly_once() {
        for num_layers in [1u32, 2, 7, 10, 32, 61, 80] {
            for world_size in 1..=8usize {
                for offload in 0..4u32 {
                    let result = plan_layers(num_layers, world_size, offload, 0);
                    let plannable = world_size <= num_layers as usize
                        && (world_size == 1 || (offload as usize) < master_share(num_layers, world_size));
                    if !plannable {
                        assert!(
                            matches!(result, Err(PipelineError::Planning(_))),
                            "({num_layers}, {world_size}, {offload}) should not plan"
                        );
                        continue;
                    }
                    let plan = result.unwrap_or_else(|e| panic!("({num_layers}, {world_size}, {offload}): {e}"));
                    assert_eq!(plan.len(), world_size);
                    let mut next = 0u32;
                    for a in &plan {
                        assert!(!a.layers.is_empty());
                        assert_eq!(a.layers.start, next, "gap or overlap at rank {}", a.rank);
                        next = a.layers.end + 1;
                    }
                    assert_eq!(next, num_layers);
                }
            }
        }
    }

    #[test]
    fn impossible_plans_fail() {
        assert!(plan_layers(3, 4, 0, 0).is_err());
        // offload would leave the master with nothing
        assert!(plan_layers(4, 2, 2, 0).is_err());
        assert!(plan_layers(0, 1, 0, 0).is_err());
        assert!(plan_layers(8, 0, 0, 0).is_err());
    }
}
