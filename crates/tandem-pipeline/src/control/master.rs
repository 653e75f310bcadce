// Master side of the control channel (rank 0).
//
// One task accepts connections, one task per connection reads a worker's
// messages, one task drives heartbeats. Negotiation calls run on the
// caller's task and wait on `MasterView`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, try_join_all};
use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tandem_net::{
    encode_host, split_control, AddNodeResponse, AllocateLayerRequest, BarrierResponse,
    ControlMessage, ControlReader, ControlWriter, HeartbeatRequest,
};
use tandem_types::config::ControlConfig;
use tandem_types::{CacheCapacity, CommToken, DataAddr, SharedPipelineConfig, MASTER_RANK};

use super::{
    apply_capacity, apply_layers, interruption, publish_loss, wait_view, CacheCapacityProvider,
    NodeLoss,
};
use crate::error::{PipelineError, Result};
use crate::heartbeat::HeartbeatMonitor;
use crate::planner::{plan_layers, LayerAssignment};
use crate::state::{ControlState, Role, StateMachine};

type SharedWriter = Arc<AsyncMutex<ControlWriter>>;

// ── View ──────────────────────────────────────────────────────────────────────

/// What the master has learned from its workers.
#[derive(Debug, Default)]
struct MasterView {
    /// Registered workers and their data listeners.
    members: BTreeMap<usize, DataAddr>,
    /// `clock_idx → ranks that reached that barrier`
    arrivals: HashMap<i32, HashSet<usize>>,
    block_reports: HashMap<usize, CacheCapacity>,
    protocol_error: Option<String>,
    lost: Option<NodeLoss>,
    closed: bool,
}

impl MasterView {
    fn interrupted(&self) -> Option<PipelineError> {
        interruption(self.closed, &self.lost, &self.protocol_error)
    }

    fn complete(&self, world_size: usize) -> bool {
        self.members.len() + 1 == world_size
    }
}

// ── Master ────────────────────────────────────────────────────────────────────

pub(super) struct MasterInner {
    config: ControlConfig,
    pipeline: SharedPipelineConfig,
    capacity: Arc<dyn CacheCapacityProvider>,
    pub(super) session_id: Uuid,
    pub(super) state: StateMachine,
    pub(super) loss: watch::Sender<Option<NodeLoss>>,
    view: watch::Sender<MasterView>,
    writers: Mutex<HashMap<usize, SharedWriter>>,
    heartbeat: Mutex<HeartbeatMonitor>,
    clock: AtomicI32,
    local_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MasterInner {
    pub(super) fn new(
        config: ControlConfig,
        pipeline: SharedPipelineConfig,
        capacity: Arc<dyn CacheCapacityProvider>,
    ) -> Self {
        let heartbeat = HeartbeatMonitor::from_config(&config.heartbeat);
        Self {
            config,
            pipeline,
            capacity,
            session_id: Uuid::new_v4(),
            state: StateMachine::new(Role::Master),
            loss: watch::channel(None).0,
            view: watch::channel(MasterView::default()).0,
            writers: Mutex::new(HashMap::new()),
            heartbeat: Mutex::new(heartbeat),
            clock: AtomicI32::new(0),
            local_addr: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub(super) fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub(super) fn members(&self) -> Vec<usize> {
        self.view.borrow().members.keys().copied().collect()
    }

    fn is_closed(&self) -> bool {
        self.view.borrow().closed
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    pub(super) async fn listen(self: &Arc<Self>) -> Result<()> {
        self.state.transition(ControlState::Listening)?;
        let listener = TcpListener::bind(self.config.master_socket_string()).await?;
        let bound = listener.local_addr()?;
        *self.local_addr.lock() = Some(bound);
        info!(
            addr = %bound,
            world_size = self.config.world_size,
            session_id = %self.session_id,
            "control channel listening"
        );

        let accept = tokio::spawn(self.clone().accept_loop(listener));
        let heartbeat = tokio::spawn(self.clone().heartbeat_loop());
        self.tasks.lock().extend([accept, heartbeat]);
        Ok(())
    }

    pub(super) async fn close(&self) {
        if self.state.current().is_terminal() {
            return;
        }
        let _ = self.state.transition(ControlState::Closing);
        self.view.send_modify(|v| v.closed = true);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.writers.lock().clear();
        self.heartbeat.lock().clear();
        let _ = self.state.transition(ControlState::Closed);
        info!(session_id = %self.session_id, "control channel closed");
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "control connection accepted");
                    let task = tokio::spawn(self.clone().serve_connection(stream, peer));
                    let mut tasks = self.tasks.lock();
                    tasks.retain(|t| !t.is_finished());
                    tasks.push(task);
                }
                Err(e) => warn!(%e, "control accept failed"),
            }
        }
    }

    // ── Per-connection ──────────────────────────────────────────────────

    async fn serve_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let (mut reader, writer) = split_control(stream);
        let writer = Arc::new(AsyncMutex::new(writer));
        let rank = match self.register(&mut reader, &writer).await {
            Ok(rank) => rank,
            Err(e) => {
                warn!(%peer, %e, "registration refused, closing connection");
                return;
            }
        };

        loop {
            match reader.recv().await {
                Ok(Some(msg)) => match self.handle_message(rank, msg) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        self.record_protocol_error(rank, e.to_string());
                        break;
                    }
                },
                Ok(None) => {
                    if !self.is_closed() {
                        self.record_loss(rank, "control connection closed".into());
                    }
                    break;
                }
                Err(e) if e.is_protocol() => {
                    self.record_protocol_error(rank, e.to_string());
                    break;
                }
                Err(e) => {
                    if !self.is_closed() {
                        self.record_loss(rank, e.to_string());
                    }
                    break;
                }
            }
        }
    }

    /// Expect `AddNodeRequest` first; admit the rank or refuse it.
    async fn register(&self, reader: &mut ControlReader, writer: &SharedWriter) -> Result<usize> {
        let req = match reader.recv().await? {
            Some(ControlMessage::AddNodeRequest(req)) => req,
            Some(other) => {
                return Err(PipelineError::Protocol(format!(
                    "expected AddNodeRequest, got {}",
                    other.packet_type()
                )))
            }
            None => return Err(PipelineError::Protocol("closed before registering".into())),
        };
        let rank = req.node_rank as usize;

        let verdict = match req.data_addr() {
            Ok(addr) => self.admit(rank, addr.clone(), writer).map(|()| addr),
            Err(e) => Err(e.to_string()),
        };

        let accepted = verdict.is_ok();
        let resp = ControlMessage::AddNodeResponse(AddNodeResponse {
            node_rank: req.node_rank,
            accepted,
            session_id: *self.session_id.as_bytes(),
        });
        let sent = writer.lock().await.send(&resp).await;

        let data_addr = verdict.map_err(PipelineError::Protocol)?;
        if let Err(e) = sent {
            self.remove_member(rank);
            return Err(e.into());
        }
        self.heartbeat.lock().register(rank);
        info!(rank, data_addr = %data_addr, "node registered");
        Ok(rank)
    }

    /// Check the rank and record the member in one step.
    fn admit(&self, rank: usize, addr: DataAddr, writer: &SharedWriter) -> std::result::Result<(), String> {
        let world_size = self.config.world_size;
        let mut refusal = None;
        self.view.send_if_modified(|v| {
            refusal = if v.closed {
                Some("master is closing".to_string())
            } else if rank == MASTER_RANK || rank >= world_size {
                Some(format!("rank {rank} out of range 1..{world_size}"))
            } else if v.members.contains_key(&rank) {
                Some(format!("rank {rank} already registered"))
            } else {
                None
            };
            if refusal.is_some() {
                return false;
            }
            self.writers.lock().insert(rank, writer.clone());
            v.members.insert(rank, addr);
            true
        });
        refusal.map_or(Ok(()), Err)
    }

    /// Returns `false` when the worker left gracefully.
    fn handle_message(&self, rank: usize, msg: ControlMessage) -> Result<bool> {
        match msg {
            ControlMessage::BarrierRequest(req) => {
                check_sender(rank, req.node_rank as usize)?;
                debug!(rank, clock_idx = req.clock_idx, "barrier arrival");
                self.view.send_modify(|v| {
                    v.arrivals.entry(req.clock_idx).or_default().insert(rank);
                });
            }
            ControlMessage::CacheBlockNumRequest(req) => {
                check_sender(rank, req.node_rank as usize)?;
                let reported = req.capacity();
                debug!(
                    rank,
                    device_block_num = reported.device_block_num,
                    host_block_num = reported.host_block_num,
                    "cache capacity reported"
                );
                self.view.send_modify(|v| {
                    v.block_reports.insert(rank, reported);
                });
            }
            ControlMessage::HeartbeatResponse(resp) => {
                check_sender(rank, resp.node_rank as usize)?;
                self.heartbeat.lock().record_heartbeat(rank);
            }
            ControlMessage::DelNodeRequest(req) => {
                check_sender(rank, req.node_rank as usize)?;
                self.remove_member(rank);
                info!(rank, "node departed");
                return Ok(false);
            }
            other => {
                return Err(PipelineError::Protocol(format!(
                    "unexpected {} from rank {rank}",
                    other.packet_type()
                )))
            }
        }
        Ok(true)
    }

    fn remove_member(&self, rank: usize) {
        self.writers.lock().remove(&rank);
        self.heartbeat.lock().remove(rank);
        self.view.send_modify(|v| {
            v.members.remove(&rank);
            v.block_reports.remove(&rank);
            for arrived in v.arrivals.values_mut() {
                arrived.remove(&rank);
            }
        });
    }

    fn record_loss(&self, rank: usize, reason: String) {
        let loss = NodeLoss { rank, reason };
        if publish_loss(&self.loss, loss.clone()) {
            error!(rank, reason = %loss.reason, "node lost");
        }
        self.view.send_modify(|v| {
            v.lost.get_or_insert(loss);
        });
    }

    fn record_protocol_error(&self, rank: usize, reason: String) {
        warn!(rank, %reason, "protocol violation, dropping connection");
        self.remove_member(rank);
        self.view.send_modify(|v| {
            v.protocol_error.get_or_insert(format!("rank {rank}: {reason}"));
        });
    }

    // ── Outbound ────────────────────────────────────────────────────────

    async fn send_to(&self, rank: usize, msg: &ControlMessage) -> Result<()> {
        let writer = self.writers.lock().get(&rank).cloned();
        let writer = writer.ok_or_else(|| PipelineError::Protocol(format!("rank {rank} is not registered")))?;
        let mut w = writer.lock().await;
        w.send(msg).await?;
        Ok(())
    }

    async fn broadcast(&self, msg: &ControlMessage) -> Result<()> {
        let ranks: Vec<usize> = self.writers.lock().keys().copied().collect();
        try_join_all(ranks.into_iter().map(|rank| self.send_to(rank, msg))).await?;
        Ok(())
    }

    // ── Negotiation ─────────────────────────────────────────────────────

    pub(super) async fn barrier(&self) -> Result<()> {
        // A barrier after negotiation leaves the node Ready again.
        let resume = self.state.current();
        self.state.transition(ControlState::BarrierWait)?;
        let clock = self.clock.load(Ordering::SeqCst);
        let world_size = self.config.world_size;

        wait_view(&self.view, |v| {
            if let Some(e) = v.interrupted() {
                return Some(Err(e));
            }
            let arrived = v.arrivals.get(&clock);
            let all_arrived = v
                .members
                .keys()
                .all(|rank| arrived.is_some_and(|a| a.contains(rank)));
            (v.complete(world_size) && all_arrived).then_some(Ok(()))
        })
        .await?;

        self.broadcast(&ControlMessage::BarrierResponse(BarrierResponse { clock_idx: clock }))
            .await?;
        self.view.send_modify(|v| {
            v.arrivals.remove(&clock);
        });
        self.clock.fetch_add(1, Ordering::SeqCst);
        if resume == ControlState::Ready {
            self.state.transition(ControlState::Ready)?;
        }
        info!(clock_idx = clock, "barrier released");
        Ok(())
    }

    pub(super) async fn synchronize_node_layers(&self, offload_layer_num: u32) -> Result<()> {
        self.state.transition(ControlState::LayerSync)?;
        let world_size = self.config.world_size;
        let members = wait_view(&self.view, |v| {
            if let Some(e) = v.interrupted() {
                return Some(Err(e));
            }
            v.complete(world_size).then(|| Ok(v.members.clone()))
        })
        .await?;

        let model = self.config.model;
        let plan = plan_layers(model.num_layers, world_size, offload_layer_num, model.num_nextn_layers)?;
        let token = CommToken::generate();

        for assignment in &plan {
            let next = (assignment.rank + 1) % world_size;
            let downstream = if next == MASTER_RANK {
                self.config.data_addr.clone()
            } else {
                members
                    .get(&next)
                    .cloned()
                    .ok_or_else(|| PipelineError::Protocol(format!("rank {next} is not registered")))?
            };

            if assignment.rank == MASTER_RANK {
                apply_layers(&self.pipeline, assignment.layers, assignment.nextn, downstream.clone(), token);
            } else {
                let req = layer_request(assignment, &downstream, token)?;
                self.send_to(assignment.rank, &ControlMessage::AllocateLayerRequest(req))
                    .await?;
            }
            info!(
                rank = assignment.rank,
                lower = assignment.layers.start,
                upper = assignment.layers.end,
                downstream = %downstream,
                "layers assigned"
            );
        }
        Ok(())
    }

    pub(super) async fn synchronize_cache_block_num(&self) -> Result<()> {
        self.state.transition(ControlState::BlockSync)?;
        let world_size = self.config.world_size;
        let local = self.capacity.cache_capacity();

        let agreed = wait_view(&self.view, |v| {
            if let Some(e) = v.interrupted() {
                return Some(Err(e));
            }
            let all_reported = v.members.keys().all(|rank| v.block_reports.contains_key(rank));
            (v.complete(world_size) && all_reported).then(|| {
                Ok(v.members
                    .keys()
                    .filter_map(|rank| v.block_reports.get(rank))
                    .fold(local, |acc, c| acc.min(*c)))
            })
        })
        .await?;

        self.broadcast(&ControlMessage::CacheBlockNumResponse(agreed.into()))
            .await?;
        self.view.send_modify(|v| v.block_reports.clear());
        apply_capacity(&self.pipeline, agreed);
        self.state.transition(ControlState::Ready)?;
        info!(
            device_block_num = agreed.device_block_num,
            host_block_num = agreed.host_block_num,
            "cache capacity agreed"
        );
        Ok(())
    }

    // ── Heartbeat ───────────────────────────────────────────────────────

    async fn heartbeat_loop(self: Arc<Self>) {
        let (interval, timeout) = {
            let hb = self.heartbeat.lock();
            (hb.interval(), hb.timeout())
        };
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if self.is_closed() || self.loss.borrow().is_some() {
                break;
            }

            let targets: Vec<(usize, SharedWriter)> = self
                .writers
                .lock()
                .iter()
                .map(|(rank, w)| (*rank, w.clone()))
                .collect();
            let sends = targets.into_iter().map(|(rank, writer)| async move {
                let req = ControlMessage::HeartbeatRequest(HeartbeatRequest { node_rank: rank as u64 });
                (rank, send_heartbeat(rank, &*writer, &req, interval).await)
            });
            for (rank, delivery) in join_all(sends).await {
                if delivery == Delivery::Stalled {
                    // A cancelled write may have left half a frame behind.
                    self.writers.lock().remove(&rank);
                }
            }

            let timed_out = self.heartbeat.lock().check_timeouts();
            if let Some(rank) = timed_out.first() {
                self.record_loss(*rank, format!("no heartbeat within {timeout:?}"));
                break;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Sent,
    Failed,
    Stalled,
}

/// Send one heartbeat, giving up after `limit`. A peer that stopped draining
/// its socket stalls the write; that counts as a missed heartbeat.
async fn send_heartbeat<W>(rank: usize, writer: &AsyncMutex<ControlWriter<W>>, req: &ControlMessage, limit: Duration) -> Delivery
where
    W: AsyncWrite + Unpin,
{
    match tokio::time::timeout(limit, async { writer.lock().await.send(req).await }).await {
        Ok(Ok(())) => Delivery::Sent,
        Ok(Err(e)) => {
            warn!(rank, %e, "heartbeat send failed");
            Delivery::Failed
        }
        Err(_) => {
            warn!(rank, ?limit, "heartbeat send stalled");
            Delivery::Stalled
        }
    }
}

fn check_sender(conn_rank: usize, claimed: usize) -> Result<()> {
    if conn_rank != claimed {
        return Err(PipelineError::Protocol(format!(
            "rank {conn_rank} sent a message claiming rank {claimed}"
        )));
    }
    Ok(())
}

fn layer_request(a: &LayerAssignment, downstream: &DataAddr, token: CommToken) -> Result<AllocateLayerRequest> {
    let wire = |v: u32| {
        u16::try_from(v).map_err(|_| PipelineError::Planning(format!("layer index {v} exceeds wire range")))
    };
    let nextn = |v: Option<u32>| match v {
        Some(v) => i16::try_from(v)
            .map_err(|_| PipelineError::Planning(format!("nextn layer index {v} exceeds wire range"))),
        None => Ok(-1),
    };
    Ok(AllocateLayerRequest {
        lower_layer_idx: wire(a.layers.start)?,
        upper_layer_idx: wire(a.layers.end)?,
        lower_nextn_layer_idx: nextn(a.nextn.map(|r| r.start))?,
        upper_nextn_layer_idx: nextn(a.nextn.map(|r| r.end))?,
        downstream_host: encode_host(&downstream.host)?,
        downstream_port: downstream.port,
        collective_comm_token: token,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn heartbeat_to_a_peer_that_never_reads_is_missed() {
        // The far end is kept open but never read, so the pipe fills up.
        let (near, _far) = tokio::io::duplex(64);
        let writer = AsyncMutex::new(ControlWriter::new(near));
        let req = ControlMessage::HeartbeatRequest(HeartbeatRequest { node_rank: 1 });
        let limit = Duration::from_millis(50);

        let outcomes = tokio::time::timeout(Duration::from_secs(5), async {
            let mut outcomes = Vec::new();
            for _ in 0..8 {
                outcomes.push(send_heartbeat(1, &writer, &req, limit).await);
            }
            outcomes
        })
        .await
        .unwrap();
        assert_eq!(outcomes[0], Delivery::Sent);
        assert_eq!(outcomes.last(), Some(&Delivery::Stalled));
    }

    #[tokio::test]
    async fn heartbeat_to_a_closed_peer_fails() {
        let (near, far) = tokio::io::duplex(64);
        drop(far);
        let writer = AsyncMutex::new(ControlWriter::new(near));
        let req = ControlMessage::HeartbeatRequest(HeartbeatRequest { node_rank: 2 });
        let delivery = send_heartbeat(2, &writer, &req, Duration::from_millis(50)).await;
        assert_eq!(delivery, Delivery::Failed);
    }
}
