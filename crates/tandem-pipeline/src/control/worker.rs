// Worker side of the control channel (rank ≥ 1).
//
// A single reader task owns the inbound half of the master connection and
// records everything in `WorkerView`; heartbeat requests are answered from
// the reader task so they keep flowing while the node computes.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tandem_net::{
    split_control, AddNodeRequest, AddNodeResponse, AllocateLayerRequest, BarrierRequest,
    CacheBlockNumRequest, CacheBlockNumResponse, ControlMessage, ControlReader, ControlWriter,
    DelNodeRequest, HeartbeatResponse,
};
use tandem_types::config::ControlConfig;
use tandem_types::{LayerRange, SharedPipelineConfig, MASTER_RANK};

use super::{
    apply_capacity, apply_layers, interruption, publish_loss, wait_view, CacheCapacityProvider,
    NodeLoss,
};
use crate::error::{PipelineError, Result};
use crate::state::{ControlState, Role, StateMachine};

type SharedWriter = Arc<AsyncMutex<ControlWriter>>;

#[derive(Debug)]
struct WorkerView {
    registration: Option<AddNodeResponse>,
    /// Highest barrier clock the master has released.
    released_clock: i32,
    allocation: Option<AllocateLayerRequest>,
    cache: Option<CacheBlockNumResponse>,
    protocol_error: Option<String>,
    lost: Option<NodeLoss>,
    closed: bool,
}

impl Default for WorkerView {
    fn default() -> Self {
        Self {
            registration: None,
            released_clock: -1,
            allocation: None,
            cache: None,
            protocol_error: None,
            lost: None,
            closed: false,
        }
    }
}

impl WorkerView {
    fn interrupted(&self) -> Option<PipelineError> {
        interruption(self.closed, &self.lost, &self.protocol_error)
    }

    fn rejected(&self) -> bool {
        self.registration.as_ref().is_some_and(|r| !r.accepted)
    }

    fn accepted(&self) -> bool {
        self.registration.as_ref().is_some_and(|r| r.accepted)
    }
}

pub(super) struct WorkerInner {
    config: ControlConfig,
    pipeline: SharedPipelineConfig,
    capacity: Arc<dyn CacheCapacityProvider>,
    pub(super) state: StateMachine,
    pub(super) loss: watch::Sender<Option<NodeLoss>>,
    view: watch::Sender<WorkerView>,
    writer: Mutex<Option<SharedWriter>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    session: Mutex<Option<Uuid>>,
    clock: AtomicI32,
}

impl WorkerInner {
    pub(super) fn new(
        config: ControlConfig,
        pipeline: SharedPipelineConfig,
        capacity: Arc<dyn CacheCapacityProvider>,
    ) -> Self {
        Self {
            config,
            pipeline,
            capacity,
            state: StateMachine::new(Role::Worker),
            loss: watch::channel(None).0,
            view: watch::channel(WorkerView::default()).0,
            writer: Mutex::new(None),
            reader_task: Mutex::new(None),
            session: Mutex::new(None),
            clock: AtomicI32::new(0),
        }
    }

    pub(super) fn session_id(&self) -> Option<Uuid> {
        *self.session.lock()
    }

    fn rank(&self) -> usize {
        self.config.node_rank
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    pub(super) async fn connect(self: &Arc<Self>) -> Result<()> {
        self.state.transition(ControlState::Connecting)?;
        if self.writer.lock().is_some() {
            return Ok(());
        }

        let addr = self.config.master_socket_string();
        let stream = TcpStream::connect(&addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = split_control(stream);
        *self.writer.lock() = Some(Arc::new(AsyncMutex::new(writer)));

        let task = tokio::spawn(self.clone().read_loop(reader));
        *self.reader_task.lock() = Some(task);
        info!(rank = self.rank(), master = %addr, "connected to master");
        Ok(())
    }

    pub(super) async fn add_node(&self) -> Result<()> {
        let rank = self.rank();
        let req = AddNodeRequest::new(rank, &self.config.data_addr)?;
        self.send(&ControlMessage::AddNodeRequest(req)).await?;

        let registration = wait_view(&self.view, |v| {
            if let Some(reg) = &v.registration {
                return Some(if reg.accepted {
                    Ok(reg.clone())
                } else {
                    Err(PipelineError::Rejected { rank })
                });
            }
            v.interrupted().map(Err)
        })
        .await?;

        let session = Uuid::from_bytes(registration.session_id);
        *self.session.lock() = Some(session);
        self.state.transition(ControlState::Registered)?;
        info!(rank, session_id = %session, data_addr = %self.config.data_addr, "registered with master");
        Ok(())
    }

    pub(super) async fn disconnect(&self) {
        if self.state.current().is_terminal() {
            return;
        }
        let was_registered = {
            let mut registered = false;
            self.view.send_modify(|v| {
                registered = v.accepted();
                v.closed = true;
            });
            registered
        };

        if was_registered {
            let bye = ControlMessage::DelNodeRequest(DelNodeRequest { node_rank: self.rank() as u64 });
            if let Err(e) = self.send(&bye).await {
                warn!(rank = self.rank(), %e, "could not notify master of departure");
            }
        }
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
        self.writer.lock().take();
        let _ = self.state.transition(ControlState::Disconnected);
        info!(rank = self.rank(), "disconnected from master");
    }

    async fn send(&self, msg: &ControlMessage) -> Result<()> {
        let writer = self.writer.lock().clone();
        let writer = writer.ok_or_else(|| PipelineError::Protocol("not connected to master".into()))?;
        let mut w = writer.lock().await;
        w.send(msg).await?;
        Ok(())
    }

    // ── Negotiation ─────────────────────────────────────────────────────

    pub(super) async fn barrier(&self) -> Result<()> {
        // A barrier after negotiation leaves the node Ready again.
        let resume = self.state.current();
        self.state.transition(ControlState::BarrierWait)?;
        let clock = self.clock.load(Ordering::SeqCst);
        let req = BarrierRequest {
            node_rank: self.rank() as i32,
            clock_idx: clock,
        };
        self.send(&ControlMessage::BarrierRequest(req)).await?;

        wait_view(&self.view, |v| {
            if v.released_clock >= clock {
                return Some(Ok(()));
            }
            v.interrupted().map(Err)
        })
        .await?;
        self.clock.fetch_add(1, Ordering::SeqCst);
        if resume == ControlState::Ready {
            self.state.transition(ControlState::Ready)?;
        }
        debug!(rank = self.rank(), clock_idx = clock, "barrier passed");
        Ok(())
    }

    pub(super) async fn synchronize_node_layers(&self) -> Result<()> {
        self.state.transition(ControlState::LayerSync)?;
        let req = wait_view(&self.view, |v| {
            if let Some(req) = &v.allocation {
                return Some(Ok(req.clone()));
            }
            v.interrupted().map(Err)
        })
        .await?;
        self.view.send_modify(|v| v.allocation = None);

        let layers = LayerRange::new(req.lower_layer_idx.into(), req.upper_layer_idx.into());
        let nextn = match (req.lower_nextn_layer_idx, req.upper_nextn_layer_idx) {
            (lo, hi) if lo >= 0 && hi >= lo => Some(LayerRange::new(lo as u32, hi as u32)),
            _ => None,
        };
        let downstream = req.downstream()?;
        info!(
            rank = self.rank(),
            lower = layers.start,
            upper = layers.end,
            downstream = %downstream,
            "layer assignment received"
        );
        apply_layers(&self.pipeline, layers, nextn, downstream, req.collective_comm_token);
        Ok(())
    }

    pub(super) async fn synchronize_cache_block_num(&self) -> Result<()> {
        self.state.transition(ControlState::BlockSync)?;
        let local = self.capacity.cache_capacity();
        let req = CacheBlockNumRequest::new(self.rank(), local);
        self.send(&ControlMessage::CacheBlockNumRequest(req)).await?;

        let resp = wait_view(&self.view, |v| {
            if let Some(resp) = &v.cache {
                return Some(Ok(*resp));
            }
            v.interrupted().map(Err)
        })
        .await?;
        self.view.send_modify(|v| v.cache = None);

        let agreed = resp.capacity();
        apply_capacity(&self.pipeline, agreed);
        self.state.transition(ControlState::Ready)?;
        info!(
            rank = self.rank(),
            device_block_num = agreed.device_block_num,
            host_block_num = agreed.host_block_num,
            "cache capacity agreed"
        );
        Ok(())
    }

    // ── Inbound ─────────────────────────────────────────────────────────

    async fn read_loop(self: Arc<Self>, mut reader: ControlReader) {
        loop {
            match reader.recv().await {
                Ok(Some(msg)) => {
                    if let Err(e) = self.handle_message(msg).await {
                        self.record_protocol_error(e.to_string());
                        break;
                    }
                }
                Ok(None) => {
                    let expected = {
                        let v = self.view.borrow();
                        v.closed || v.rejected()
                    };
                    if !expected {
                        self.record_loss("control connection closed by master".into());
                    }
                    break;
                }
                Err(e) if e.is_protocol() => {
                    self.record_protocol_error(e.to_string());
                    break;
                }
                Err(e) => {
                    if !self.view.borrow().closed {
                        self.record_loss(e.to_string());
                    }
                    break;
                }
            }
        }
    }

    async fn handle_message(&self, msg: ControlMessage) -> Result<()> {
        match msg {
            ControlMessage::AddNodeResponse(resp) => {
                if resp.node_rank as usize != self.rank() {
                    return Err(PipelineError::Protocol(format!(
                        "registration answer for rank {}",
                        resp.node_rank
                    )));
                }
                self.view.send_modify(|v| v.registration = Some(resp));
            }
            ControlMessage::BarrierResponse(resp) => {
                self.view.send_modify(|v| {
                    v.released_clock = v.released_clock.max(resp.clock_idx);
                });
            }
            ControlMessage::AllocateLayerRequest(req) => {
                self.view.send_modify(|v| v.allocation = Some(req));
            }
            ControlMessage::CacheBlockNumResponse(resp) => {
                self.view.send_modify(|v| v.cache = Some(resp));
            }
            ControlMessage::HeartbeatRequest(_) => {
                let pong = ControlMessage::HeartbeatResponse(HeartbeatResponse {
                    node_rank: self.rank() as u64,
                });
                if let Err(e) = self.send(&pong).await {
                    warn!(rank = self.rank(), %e, "heartbeat reply failed");
                }
            }
            other => {
                return Err(PipelineError::Protocol(format!(
                    "unexpected {} from master",
                    other.packet_type()
                )))
            }
        }
        Ok(())
    }

    fn record_loss(&self, reason: String) {
        let loss = NodeLoss { rank: MASTER_RANK, reason };
        if publish_loss(&self.loss, loss.clone()) {
            warn!(rank = self.rank(), reason = %loss.reason, "lost master");
        }
        self.view.send_modify(|v| {
            v.lost.get_or_insert(loss);
        });
    }

    fn record_protocol_error(&self, reason: String) {
        warn!(rank = self.rank(), %reason, "protocol violation from master");
        self.view.send_modify(|v| {
            v.protocol_error.get_or_insert(reason);
        });
    }
}
