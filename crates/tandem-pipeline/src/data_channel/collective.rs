// Device-to-device transport over a collective-communication backend.
//
// The backend is a blocking point-to-point interface, so both directions run
// on dedicated OS threads. Per hidden unit the sender posts the header, then
// one transfer per non-empty tensor in tensor-parallel rank order: decode
// tensors first, prefill tensors second. The receiver mirrors that order.

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use tandem_net::HiddenUnitHeader;

use crate::buffer_pool::HiddenUnitBufferPool;
use crate::device::{DeviceContext, DevicePtr};
use crate::error::{PipelineError, Result};
use crate::queue::BlockingQueue;

// ── Backend Interface ─────────────────────────────────────────────────────────

/// Point-to-point channel between this stage and its pipeline neighbours.
/// Every call blocks until the transfer completes.
pub trait CollectiveComm: Send + Sync {
    fn send_header(&self, header: &HiddenUnitHeader) -> Result<()>;

    /// `None` once the backend has been aborted.
    fn recv_header(&self) -> Result<Option<HiddenUnitHeader>>;

    fn send(&self, src: DevicePtr, bytes: usize) -> Result<()>;

    fn recv(&self, dst: DevicePtr, bytes: usize) -> Result<()>;

    /// Unblock every pending call.
    fn abort(&self);
}

// ── In-process Backend ────────────────────────────────────────────────────────

enum Frame {
    Header(HiddenUnitHeader),
    Data(Vec<u8>),
}

/// Backend that connects two endpoints in the same process by copying
/// through host memory. Used for single-host pipelines and tests.
pub struct LocalComm {
    ctx: Arc<DeviceContext>,
    outbox: Arc<BlockingQueue<Frame>>,
    inbox: Arc<BlockingQueue<Frame>>,
}

impl LocalComm {
    /// Two connected endpoints: what `a` sends, `b` receives, and back.
    pub fn pair(ctx_a: Arc<DeviceContext>, ctx_b: Arc<DeviceContext>) -> (Self, Self) {
        let a_to_b = Arc::new(BlockingQueue::new());
        let b_to_a = Arc::new(BlockingQueue::new());
        (
            Self { ctx: ctx_a, outbox: a_to_b.clone(), inbox: b_to_a.clone() },
            Self { ctx: ctx_b, outbox: b_to_a, inbox: a_to_b },
        )
    }

    fn next_frame(&self) -> Result<Frame> {
        self.inbox
            .get()
            .ok_or_else(|| PipelineError::Collective("communicator aborted".into()))
    }
}

impl CollectiveComm for LocalComm {
    fn send_header(&self, header: &HiddenUnitHeader) -> Result<()> {
        if self.outbox.is_stopped() {
            return Err(PipelineError::Collective("communicator aborted".into()));
        }
        self.outbox.put(Frame::Header(*header));
        Ok(())
    }

    fn recv_header(&self) -> Result<Option<HiddenUnitHeader>> {
        match self.inbox.get() {
            None => Ok(None),
            Some(Frame::Header(h)) => Ok(Some(h)),
            Some(Frame::Data(d)) => Err(PipelineError::Collective(format!(
                "expected a header, got {} data bytes",
                d.len()
            ))),
        }
    }

    fn send(&self, src: DevicePtr, bytes: usize) -> Result<()> {
        let mut staged = vec![0u8; bytes];
        self.ctx.copy_to_host(&mut staged, src, 0)?;
        if self.outbox.is_stopped() {
            return Err(PipelineError::Collective("communicator aborted".into()));
        }
        self.outbox.put(Frame::Data(staged));
        Ok(())
    }

    fn recv(&self, dst: DevicePtr, bytes: usize) -> Result<()> {
        match self.next_frame()? {
            Frame::Data(d) if d.len() == bytes => self.ctx.copy_to_device(dst, 0, &d),
            Frame::Data(d) => Err(PipelineError::Collective(format!(
                "expected {bytes} bytes, got {}",
                d.len()
            ))),
            Frame::Header(_) => Err(PipelineError::Collective("expected data, got a header".into())),
        }
    }

    fn abort(&self) {
        self.outbox.stop();
        self.inbox.stop();
    }
}

// ── Channel ───────────────────────────────────────────────────────────────────

pub struct CollectiveDataChannel {
    comm: Arc<dyn CollectiveComm>,
    pool: Arc<HiddenUnitBufferPool>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl CollectiveDataChannel {
    pub fn new(comm: Arc<dyn CollectiveComm>, pool: Arc<HiddenUnitBufferPool>) -> Self {
        Self {
            comm,
            pool,
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn listen(&self) -> Result<()> {
        let (comm, pool) = (self.comm.clone(), self.pool.clone());
        let handle = thread::Builder::new()
            .name("tandem-coll-recv".into())
            .spawn(move || recv_loop(comm, pool))?;
        self.threads.lock().push(handle);
        info!("collective data channel receiving");
        Ok(())
    }

    pub fn connect(&self) -> Result<()> {
        let (comm, pool) = (self.comm.clone(), self.pool.clone());
        let handle = thread::Builder::new()
            .name("tandem-coll-send".into())
            .spawn(move || send_loop(comm, pool))?;
        self.threads.lock().push(handle);
        info!("collective data channel sending");
        Ok(())
    }

    pub fn stop(&self) {
        self.pool.stop();
        self.comm.abort();
        for handle in self.threads.lock().drain(..) {
            if handle.join().is_err() {
                error!("collective transfer thread panicked");
            }
        }
    }
}

impl Drop for CollectiveDataChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

fn send_loop(comm: Arc<dyn CollectiveComm>, pool: Arc<HiddenUnitBufferPool>) {
    while let Some(dev) = pool.get_from_send_queue() {
        let header = pool.header_for(&dev);
        let sent = (|| {
            comm.send_header(&header)?;
            let (decode_bytes, prefill_bytes) = (dev.decode_bytes(), dev.prefill_bytes());
            if decode_bytes > 0 {
                for t in &dev.tensors {
                    comm.send(t.ptr(), decode_bytes)?;
                }
            }
            if prefill_bytes > 0 {
                for t in &dev.prefill_tensors {
                    comm.send(t.ptr(), prefill_bytes)?;
                }
            }
            Ok::<_, PipelineError>(())
        })();
        pool.free_device_buffer(dev);

        match sent {
            Ok(()) => {
                debug!(schedule_id = header.schedule_id, "hidden unit sent");
                pool.notify_send_finished();
            }
            Err(e) => {
                if !pool.is_stopped() {
                    error!(%e, schedule_id = header.schedule_id, "collective send failed, stopping pool");
                    pool.stop();
                }
                break;
            }
        }
    }
    debug!("collective send thread exiting");
}

fn recv_loop(comm: Arc<dyn CollectiveComm>, pool: Arc<HiddenUnitBufferPool>) {
    while pool.wait_until_ready_to_recv() {
        let header = match comm.recv_header() {
            Ok(Some(h)) => h,
            Ok(None) => break,
            Err(e) => {
                error!(%e, "collective header receive failed");
                pool.stop();
                break;
            }
        };
        let mut dev = match pool.get_device_buffer() {
            Ok(dev) => dev,
            Err(e) => {
                error!(%e, "no device buffer for received hidden unit");
                pool.stop();
                break;
            }
        };

        let received = pool.apply_header(&mut dev, &header).and_then(|(decode_bytes, prefill_bytes)| {
            if decode_bytes > 0 {
                for t in &dev.tensors {
                    comm.recv(t.ptr(), decode_bytes)?;
                }
            }
            if prefill_bytes > 0 {
                for t in &dev.prefill_tensors {
                    comm.recv(t.ptr(), prefill_bytes)?;
                }
            }
            Ok(())
        });

        match received {
            Ok(()) => {
                debug!(schedule_id = header.schedule_id, "hidden unit received");
                pool.put_to_device_recv_queue(dev);
            }
            Err(e) => {
                pool.free_device_buffer(dev);
                if !pool.is_stopped() {
                    error!(%e, schedule_id = header.schedule_id, "collective receive failed, stopping pool");
                    pool.stop();
                }
                break;
            }
        }
    }
    debug!("collective receive thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDeviceRuntime;
    use tandem_types::config::BufferPoolConfig;
    use tandem_types::DType;

    fn pool() -> Arc<HiddenUnitBufferPool> {
        let ctx = Arc::new(DeviceContext::new(Arc::new(HostDeviceRuntime::new(2))));
        let config = BufferPoolConfig {
            tensor_parallel_size: 2,
            max_token_num: 4,
            hidden_unit_size: 8,
            dtype: DType::F16,
        };
        Arc::new(HiddenUnitBufferPool::new(config, ctx).unwrap())
    }

    #[test]
    fn local_comm_moves_device_bytes() {
        let ctx = Arc::new(DeviceContext::new(Arc::new(HostDeviceRuntime::new(1))));
        let (a, b) = LocalComm::pair(ctx.clone(), ctx.clone());
        let src = ctx.alloc(0, 4).unwrap();
        let dst = ctx.alloc(0, 4).unwrap();
        ctx.copy_to_device(src, 0, &[1, 2, 3, 4]).unwrap();

        a.send_header(&HiddenUnitHeader::default()).unwrap();
        a.send(src, 4).unwrap();
        assert_eq!(b.recv_header().unwrap(), Some(HiddenUnitHeader::default()));
        b.recv(dst, 4).unwrap();

        let mut out = [0u8; 4];
        ctx.copy_to_host(&mut out, dst, 0).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);

        a.abort();
        assert_eq!(b.recv_header().unwrap(), None);
    }

    #[test]
    fn hidden_unit_crosses_between_pools() {
        let (up, down) = (pool(), pool());
        let (a, b) = LocalComm::pair(up.device_context().clone(), down.device_context().clone());
        let sender = CollectiveDataChannel::new(Arc::new(a), up.clone());
        let receiver = CollectiveDataChannel::new(Arc::new(b), down.clone());
        receiver.listen().unwrap();
        sender.connect().unwrap();

        let payload: Vec<u8> = (0..2 * 8 * 2).map(|i| i as u8).collect();
        let mut dev = up.get_device_buffer().unwrap();
        up.apply_header(
            &mut dev,
            &HiddenUnitHeader {
                schedule_id: 9,
                tensor_parallel: 2,
                decode_shape: [2, 8],
                prefill_shape: [0, 0],
            },
        )
        .unwrap();
        for t in &dev.tensors {
            t.write(&payload).unwrap();
        }
        up.put_to_send_queue(dev).unwrap();

        let got = down.get_from_device_recv_queue(9).unwrap();
        assert!(got.decode_enabled && !got.prefill_enabled);
        for t in &got.tensors {
            let mut out = vec![0u8; payload.len()];
            t.read(&mut out).unwrap();
            assert_eq!(out, payload);
        }

        sender.stop();
        receiver.stop();
        assert!(up.is_stopped() && down.is_stopped());
    }
}
