//! Cluster control channel: registration, barriers, layer and cache-capacity
//! negotiation, heartbeats.
//!
//! Rank 0 runs the [`master`] side, every other rank the [`worker`] side.
//! [`ControlChannel`] picks the side from the configured rank and exposes
//! one API; calling an operation that belongs to the other role is a usage
//! error.
//!
//! Each side keeps what it has learned from the wire in a `watch` channel.
//! Connection tasks publish updates with `send_modify`; negotiation calls
//! wait on predicates over the same view, so recording a message and waking
//! its waiter happen in one step.

mod master;
mod worker;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use uuid::Uuid;

use tandem_types::config::ControlConfig;
use tandem_types::pipeline::NO_NEXTN_LAYER;
use tandem_types::{CacheCapacity, CommToken, DataAddr, LayerRange, SharedPipelineConfig};

use crate::error::{PipelineError, Result};
use crate::state::{ControlState, Role};

use master::MasterInner;
use worker::WorkerInner;

// ── Collaborators ─────────────────────────────────────────────────────────────

/// Reports how many cache blocks this node can hold.
pub trait CacheCapacityProvider: Send + Sync {
    fn cache_capacity(&self) -> CacheCapacity;
}

impl CacheCapacityProvider for CacheCapacity {
    fn cache_capacity(&self) -> CacheCapacity {
        *self
    }
}

/// First fatal loss observed by this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLoss {
    pub rank: usize,
    pub reason: String,
}

impl fmt::Display for NodeLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rank {} lost: {}", self.rank, self.reason)
    }
}

// ── Control Channel ───────────────────────────────────────────────────────────

enum Side {
    Master(Arc<MasterInner>),
    Worker(Arc<WorkerInner>),
}

pub struct ControlChannel {
    side: Side,
}

impl ControlChannel {
    pub fn new(
        config: ControlConfig,
        pipeline: SharedPipelineConfig,
        capacity: Arc<dyn CacheCapacityProvider>,
    ) -> Result<Self> {
        config.validate()?;
        pipeline.update(|p| {
            p.world_size = config.world_size;
            p.node_rank = config.node_rank;
        });
        let side = if config.is_master() {
            Side::Master(Arc::new(MasterInner::new(config, pipeline, capacity)))
        } else {
            Side::Worker(Arc::new(WorkerInner::new(config, pipeline, capacity)))
        };
        Ok(Self { side })
    }

    pub fn role(&self) -> Role {
        match &self.side {
            Side::Master(_) => Role::Master,
            Side::Worker(_) => Role::Worker,
        }
    }

    pub fn is_master(&self) -> bool {
        self.role() == Role::Master
    }

    pub fn state(&self) -> ControlState {
        match &self.side {
            Side::Master(m) => m.state.current(),
            Side::Worker(w) => w.state.current(),
        }
    }

    /// Cluster session id: generated by the master, learned by workers on
    /// registration.
    pub fn session_id(&self) -> Option<Uuid> {
        match &self.side {
            Side::Master(m) => Some(m.session_id),
            Side::Worker(w) => w.session_id(),
        }
    }

    /// Receiver that turns `Some` on the first fatal loss.
    pub fn node_loss(&self) -> watch::Receiver<Option<NodeLoss>> {
        match &self.side {
            Side::Master(m) => m.loss.subscribe(),
            Side::Worker(w) => w.loss.subscribe(),
        }
    }

    /// Bound control address (master, after `listen`).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.side {
            Side::Master(m) => m.local_addr(),
            Side::Worker(_) => None,
        }
    }

    // ── Master-only ─────────────────────────────────────────────────────

    /// Bind the control listener and start accepting workers. Returns once
    /// the listener is bound.
    pub async fn listen(&self) -> Result<()> {
        self.master("listen")?.listen().await
    }

    pub async fn close(&self) -> Result<()> {
        self.master("close")?.close().await;
        Ok(())
    }

    /// Ranks currently registered with the master.
    pub fn members(&self) -> Result<Vec<usize>> {
        Ok(self.master("members")?.members())
    }

    // ── Worker-only ─────────────────────────────────────────────────────

    /// Dial the master once. Refusal is an error; callers retry if needed.
    pub async fn connect(&self) -> Result<()> {
        self.worker("connect")?.connect().await
    }

    /// Register this rank and its data address with the master.
    pub async fn add_node(&self) -> Result<()> {
        self.worker("add_node")?.add_node().await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.worker("disconnect")?.disconnect().await;
        Ok(())
    }

    // ── Both roles ──────────────────────────────────────────────────────

    /// Rendezvous of all ranks. Consecutive barriers are told apart by a
    /// clock index each side advances in lock-step.
    pub async fn barrier(&self) -> Result<()> {
        match &self.side {
            Side::Master(m) => m.barrier().await,
            Side::Worker(w) => w.barrier().await,
        }
    }

    /// Plan and distribute layer ranges (master) or receive this rank's
    /// assignment (worker).
    pub async fn synchronize_node_layers(&self, offload_layer_num: u32) -> Result<()> {
        match &self.side {
            Side::Master(m) => m.synchronize_node_layers(offload_layer_num).await,
            Side::Worker(w) => w.synchronize_node_layers().await,
        }
    }

    /// Agree on the cluster-wide minimum cache capacity.
    pub async fn synchronize_cache_block_num(&self) -> Result<()> {
        match &self.side {
            Side::Master(m) => m.synchronize_cache_block_num().await,
            Side::Worker(w) => w.synchronize_cache_block_num().await,
        }
    }

    /// `close` on the master, `disconnect` on a worker.
    pub async fn shutdown(&self) {
        match &self.side {
            Side::Master(m) => m.close().await,
            Side::Worker(w) => w.disconnect().await,
        }
    }

    fn master(&self, op: &'static str) -> Result<&Arc<MasterInner>> {
        match &self.side {
            Side::Master(m) => Ok(m),
            Side::Worker(_) => Err(PipelineError::WrongRole { op, role: "worker" }),
        }
    }

    fn worker(&self, op: &'static str) -> Result<&Arc<WorkerInner>> {
        match &self.side {
            Side::Worker(w) => Ok(w),
            Side::Master(_) => Err(PipelineError::WrongRole { op, role: "master" }),
        }
    }
}

// ── Shared Helpers ────────────────────────────────────────────────────────────

/// Publish the first loss only; later ones are consequences of it.
pub(crate) fn publish_loss(tx: &watch::Sender<Option<NodeLoss>>, loss: NodeLoss) -> bool {
    tx.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(loss);
            true
        } else {
            false
        }
    })
}

/// Wait until `check` yields a value for the current view. `check` sees
/// every update; the borrow is released before each await.
pub(crate) async fn wait_view<V, R, F>(tx: &watch::Sender<V>, mut check: F) -> Result<R>
where
    F: FnMut(&V) -> Option<Result<R>>,
{
    let mut rx = tx.subscribe();
    loop {
        {
            let view = rx.borrow_and_update();
            if let Some(result) = check(&*view) {
                return result;
            }
        }
        if rx.changed().await.is_err() {
            return Err(PipelineError::Closed);
        }
    }
}

/// The error a blocked negotiation call should return, if any.
pub(crate) fn interruption(
    closed: bool,
    lost: &Option<NodeLoss>,
    protocol_error: &Option<String>,
) -> Option<PipelineError> {
    if let Some(loss) = lost {
        return Some(PipelineError::NodeLost {
            rank: loss.rank,
            reason: loss.reason.clone(),
        });
    }
    if closed {
        return Some(PipelineError::Closed);
    }
    protocol_error.as_ref().map(|e| PipelineError::Protocol(e.clone()))
}

/// Record this node's layer assignment in the pipeline config.
pub(crate) fn apply_layers(
    pipeline: &SharedPipelineConfig,
    layers: LayerRange,
    nextn: Option<LayerRange>,
    downstream: DataAddr,
    token: CommToken,
) {
    pipeline.update(|p| {
        p.lower_layer_idx = layers.start;
        p.upper_layer_idx = layers.end;
        match nextn {
            Some(r) => {
                p.lower_nextn_layer_idx = r.start as i32;
                p.upper_nextn_layer_idx = r.end as i32;
            }
            None => {
                p.lower_nextn_layer_idx = NO_NEXTN_LAYER;
                p.upper_nextn_layer_idx = NO_NEXTN_LAYER;
            }
        }
        p.downstream = Some(downstream);
        p.comm_token = token;
    });
}

pub(crate) fn apply_capacity(pipeline: &SharedPipelineConfig, capacity: CacheCapacity) {
    pipeline.update(|p| {
        p.device_block_num = capacity.device_block_num;
        p.host_block_num = capacity.host_block_num;
    });
}
