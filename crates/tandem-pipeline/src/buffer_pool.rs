//! Pooled hidden-unit buffers and the queues that move them between the
//! model thread and the data channel.
//!
//! ```text
//!  model ──put_to_send_queue──▶ [send] ──▶ transport ──▶ wire
//!    ▲          (blocks until notify_send_finished)         │
//!    │                                                      ▼
//!  get_from_device_recv_queue(id) ◀── [recv, keyed] ◀── transport
//!         (grants one receive credit)      (waits for a credit)
//! ```
//!
//! Every buffer is owned by exactly one queue or one caller at a time.
//! Buffers are never dropped in steady state; they cycle back to the free
//! queues and are reused.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use tandem_net::{HiddenUnitHeader, HIDDEN_UNIT_HEADER_LEN};
use tandem_types::config::BufferPoolConfig;
use tandem_types::TandemError;

use crate::buffer::{HiddenUnitDeviceBuffer, HiddenUnitHostBuffer, Packet};
use crate::device::{DeviceContext, DeviceTensor};
use crate::error::{PipelineError, Result};
use crate::queue::{BlockingQueue, KeyedBlockingQueue};
use crate::waiter::{CreditGate, Waiter};

pub type DeviceBuffer = Box<HiddenUnitDeviceBuffer>;
pub type HostPacket = Box<Packet>;

pub struct HiddenUnitBufferPool {
    config: BufferPoolConfig,
    ctx: Arc<DeviceContext>,

    free_device: BlockingQueue<DeviceBuffer>,
    free_host: BlockingQueue<HostPacket>,
    send_device: BlockingQueue<DeviceBuffer>,
    recv_device: KeyedBlockingQueue<u64, DeviceBuffer>,
    recv_host: BlockingQueue<HostPacket>,

    send_waiter: Waiter,
    /// Serializes producers so only one send is in flight.
    send_lock: Mutex<()>,
    recv_gate: CreditGate,

    next_buffer_id: AtomicU64,
    allocated_device: AtomicUsize,
    allocated_host: AtomicUsize,
    stopped: AtomicBool,
}

impl HiddenUnitBufferPool {
    pub fn new(config: BufferPoolConfig, ctx: Arc<DeviceContext>) -> Result<Self> {
        config.validate()?;
        if config.tensor_parallel_size > ctx.device_count() {
            return Err(PipelineError::Config(TandemError::Config(format!(
                "tensor parallel size {} exceeds {} available devices",
                config.tensor_parallel_size,
                ctx.device_count()
            ))));
        }
        Ok(Self {
            config,
            ctx,
            free_device: BlockingQueue::new(),
            free_host: BlockingQueue::new(),
            send_device: BlockingQueue::new(),
            recv_device: KeyedBlockingQueue::new(),
            recv_host: BlockingQueue::new(),
            send_waiter: Waiter::new(),
            send_lock: Mutex::new(()),
            recv_gate: CreditGate::new(),
            next_buffer_id: AtomicU64::new(0),
            allocated_device: AtomicUsize::new(0),
            allocated_host: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &BufferPoolConfig {
        &self.config
    }

    pub fn device_context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    // ── Device buffers ──────────────────────────────────────────────────

    /// Take a free device buffer, allocating a new one on a pool miss.
    pub fn get_device_buffer(&self) -> Result<DeviceBuffer> {
        if let Some(buf) = self.free_device.try_get() {
            return Ok(buf);
        }
        let buf = self.allocate_device_buffer()?;
        let allocated = self.allocated_device.fetch_add(1, Ordering::Relaxed) + 1;
        info!(buffer_id = buf.buffer_id, allocated, "device buffer pool miss, allocated new buffer");
        Ok(buf)
    }

    fn allocate_device_buffer(&self) -> Result<DeviceBuffer> {
        let shape = [self.config.max_token_num, self.config.hidden_unit_size];
        let tp = self.config.tensor_parallel_size;
        let mut tensors = Vec::with_capacity(tp);
        let mut prefill_tensors = Vec::with_capacity(tp);
        for rank in 0..tp {
            tensors.push(DeviceTensor::allocate(&self.ctx, rank, self.config.dtype, shape)?);
            prefill_tensors.push(DeviceTensor::allocate(&self.ctx, rank, self.config.dtype, shape)?);
        }
        Ok(Box::new(HiddenUnitDeviceBuffer {
            buffer_id: self.next_buffer_id.fetch_add(1, Ordering::Relaxed),
            schedule_id: 0,
            tensors,
            prefill_tensors,
            decode_enabled: false,
            prefill_enabled: false,
        }))
    }

    pub fn free_device_buffer(&self, mut buf: DeviceBuffer) {
        buf.decode_enabled = false;
        buf.prefill_enabled = false;
        self.free_device.put(buf);
    }

    /// Fill the free queue with `n` buffers so steady state never misses.
    pub fn pre_allocate_device_buffers(&self, n: usize) -> Result<()> {
        for _ in 0..n {
            let buf = self.allocate_device_buffer()?;
            self.allocated_device.fetch_add(1, Ordering::Relaxed);
            self.free_device.put(buf);
        }
        debug!(n, free = self.free_device.len(), "device buffers pre-allocated");
        Ok(())
    }

    // ── Host buffers ────────────────────────────────────────────────────

    /// Take a free host packet, allocating one sized for the maximum payload
    /// on a pool miss.
    pub fn get_host_buffer(&self) -> HostPacket {
        if let Some(packet) = self.free_host.try_get() {
            return packet;
        }
        let max_tensor = self.config.max_tensor_bytes();
        let body = HiddenUnitHostBuffer {
            header: HiddenUnitHeader {
                schedule_id: 0,
                tensor_parallel: self.config.tensor_parallel_size as u64,
                decode_shape: [self.config.max_token_num as u64, self.config.hidden_unit_size as u64],
                prefill_shape: [0, 0],
            },
            data: vec![0u8; 2 * max_tensor],
        };
        let allocated = self.allocated_host.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(allocated, bytes = 2 * max_tensor, "host packet pool miss");
        Box::new(Packet::hidden_unit(body))
    }

    pub fn free_host_buffer(&self, packet: HostPacket) {
        self.free_host.put(packet);
    }

    pub fn put_to_host_recv_queue(&self, packet: HostPacket) {
        self.recv_host.put(packet);
    }

    /// `None` once stopped.
    pub fn get_from_host_recv_queue(&self) -> Option<HostPacket> {
        self.recv_host.get()
    }

    /// Header plus decode and prefill payload bytes.
    pub fn host_packet_size(&self, packet: &Packet) -> Result<usize> {
        Ok(HIDDEN_UNIT_HEADER_LEN + packet.body.payload_len(self.config.dtype.element_bytes())?)
    }

    // ── Send path ───────────────────────────────────────────────────────

    /// Hand `buf` to the transport and block until it has been marshalled.
    ///
    /// Ownership passes to the transport, which returns the buffer to the
    /// free queue once its bytes are on their way.
    pub fn put_to_send_queue(&self, buf: DeviceBuffer) -> Result<()> {
        if self.is_stopped() {
            self.free_device.put(buf);
            return Err(PipelineError::Stopped);
        }
        let _in_flight = self.send_lock.lock();
        self.send_waiter.arm(1);
        self.send_device.put(buf);
        if self.send_waiter.wait() {
            Ok(())
        } else {
            Err(PipelineError::Stopped)
        }
    }

    /// Next buffer to transmit. `None` once stopped.
    pub fn get_from_send_queue(&self) -> Option<DeviceBuffer> {
        self.send_device.get()
    }

    /// Release the producer blocked in `put_to_send_queue`. Extra calls
    /// before the next put are ignored.
    pub fn notify_send_finished(&self) {
        if !self.send_waiter.notify() {
            debug!("send-finished notification with no send in flight");
        }
    }

    // ── Receive path ────────────────────────────────────────────────────

    pub fn put_to_device_recv_queue(&self, buf: DeviceBuffer) {
        let schedule_id = buf.schedule_id;
        self.recv_device.put(schedule_id, buf);
    }

    /// Declare intent to receive, then block for the buffer tagged
    /// `schedule_id`. `None` once stopped.
    pub fn get_from_device_recv_queue(&self, schedule_id: u64) -> Option<DeviceBuffer> {
        self.recv_gate.grant();
        self.recv_device.get(&schedule_id)
    }

    /// Transport side of receive admission: consume one consumer credit.
    /// `false` once stopped.
    pub fn wait_until_ready_to_recv(&self) -> bool {
        self.recv_gate.acquire()
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.send_waiter.stop();
        self.recv_gate.stop();
        self.free_device.stop();
        self.free_host.stop();
        self.send_device.stop();
        self.recv_device.stop();
        self.recv_host.stop();
        info!(
            device_buffers = self.allocated_device.load(Ordering::Relaxed),
            host_packets = self.allocated_host.load(Ordering::Relaxed),
            "hidden-unit buffer pool stopped"
        );
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    // ── Stats ───────────────────────────────────────────────────────────

    pub fn allocated_device_buffers(&self) -> usize {
        self.allocated_device.load(Ordering::Relaxed)
    }

    pub fn allocated_host_buffers(&self) -> usize {
        self.allocated_host.load(Ordering::Relaxed)
    }

    pub fn free_device_len(&self) -> usize {
        self.free_device.len()
    }

    pub fn free_host_len(&self) -> usize {
        self.free_host.len()
    }

    // ── Marshalling ─────────────────────────────────────────────────────

    /// Shape `dev` after `header`: schedule id, per-rank shapes and flags.
    /// Returns `(decode_bytes, prefill_bytes)` of the payload that follows.
    /// `dev` is left untouched when the header does not fit it.
    pub fn apply_header(&self, dev: &mut HiddenUnitDeviceBuffer, header: &HiddenUnitHeader) -> Result<(usize, usize)> {
        let layout = self.layout_for(dev, header)?;
        Ok(self.commit_layout(dev, header, &layout))
    }

    fn layout_for(&self, dev: &HiddenUnitDeviceBuffer, header: &HiddenUnitHeader) -> Result<PayloadLayout> {
        let element_bytes = self.config.dtype.element_bytes();
        header.payload_len(element_bytes)?;
        let layout = PayloadLayout {
            decode_shape: usize_shape(header.decode_shape)?,
            prefill_shape: usize_shape(header.prefill_shape)?,
            decode_elements: header.decode_elements()?,
            prefill_elements: header.prefill_elements()?,
            element_bytes,
        };
        let fits = |tensors: &[DeviceTensor], elements: usize| tensors.iter().all(|t| elements <= t.capacity_elements());
        if !fits(dev.tensors.as_slice(), layout.decode_elements)
            || !fits(dev.prefill_tensors.as_slice(), layout.prefill_elements)
        {
            return Err(PipelineError::Protocol(format!(
                "shapes {:?} + {:?} exceed buffer capacity of {} x {}",
                header.decode_shape, header.prefill_shape, self.config.max_token_num, self.config.hidden_unit_size
            )));
        }
        Ok(layout)
    }

    fn commit_layout(&self, dev: &mut HiddenUnitDeviceBuffer, header: &HiddenUnitHeader, layout: &PayloadLayout) -> (usize, usize) {
        for t in dev.tensors.iter_mut() {
            t.shape = layout.decode_shape;
        }
        for t in dev.prefill_tensors.iter_mut() {
            t.shape = layout.prefill_shape;
        }
        dev.schedule_id = header.schedule_id;
        dev.decode_enabled = layout.decode_elements > 0;
        dev.prefill_enabled = layout.prefill_elements > 0;
        (
            layout.decode_elements * layout.element_bytes,
            layout.prefill_elements * layout.element_bytes,
        )
    }

    /// Header describing the in-use part of `dev`.
    pub fn header_for(&self, dev: &HiddenUnitDeviceBuffer) -> HiddenUnitHeader {
        let shape_of = |enabled: bool, t: Option<&DeviceTensor>| match (enabled, t) {
            (true, Some(t)) => [t.shape[0] as u64, t.shape[1] as u64],
            _ => [0, 0],
        };
        HiddenUnitHeader {
            schedule_id: dev.schedule_id,
            tensor_parallel: dev.tensor_parallel_size() as u64,
            decode_shape: shape_of(dev.decode_enabled, dev.tensors.first()),
            prefill_shape: shape_of(dev.prefill_enabled, dev.prefill_tensors.first()),
        }
    }

    /// Upload a received host buffer into every tensor-parallel rank.
    pub fn convert_host_buffer_to_device(&self, dev: &mut HiddenUnitDeviceBuffer, host: &HiddenUnitHostBuffer) -> Result<()> {
        let layout = self.layout_for(dev, &host.header)?;
        let needed = (layout.decode_elements + layout.prefill_elements) * layout.element_bytes;
        if host.data.len() < needed {
            return Err(PipelineError::Protocol(format!(
                "host payload holds {} bytes, header implies {needed}",
                host.data.len()
            )));
        }
        let (decode_bytes, prefill_bytes) = self.commit_layout(dev, &host.header, &layout);
        let (decode, rest) = host.data.split_at(decode_bytes);
        let prefill = &rest[..prefill_bytes];
        if decode_bytes > 0 {
            for t in &dev.tensors {
                t.write(decode)?;
            }
        }
        if prefill_bytes > 0 {
            for t in &dev.prefill_tensors {
                t.write(prefill)?;
            }
        }
        Ok(())
    }

    /// Download `dev` into `host`. Ranks hold identical activations after
    /// the all-reduce, so only rank 0 is read.
    pub fn convert_device_buffer_to_host(&self, host: &mut HiddenUnitHostBuffer, dev: &HiddenUnitDeviceBuffer) -> Result<()> {
        host.header = self.header_for(dev);
        let decode_bytes = dev.decode_bytes();
        let prefill_bytes = dev.prefill_bytes();
        if host.data.len() < decode_bytes + prefill_bytes {
            host.data.resize(decode_bytes + prefill_bytes, 0);
        }
        let (decode, rest) = host.data.split_at_mut(decode_bytes);
        if let (true, Some(t)) = (decode_bytes > 0, dev.tensors.first()) {
            t.read(decode)?;
        }
        if let (true, Some(t)) = (prefill_bytes > 0, dev.prefill_tensors.first()) {
            t.read(&mut rest[..prefill_bytes])?;
        }
        Ok(())
    }
}

/// Validated shapes of one header against one device buffer.
struct PayloadLayout {
    decode_shape: [usize; 2],
    prefill_shape: [usize; 2],
    decode_elements: usize,
    prefill_elements: usize,
    element_bytes: usize,
}

fn usize_shape(shape: [u64; 2]) -> Result<[usize; 2]> {
    let dim = |d: u64| {
        usize::try_from(d).map_err(|_| PipelineError::Protocol(format!("shape {shape:?} exceeds the address space")))
    };
    Ok([dim(shape[0])?, dim(shape[1])?])
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDeviceRuntime;
    use std::thread;
    use std::time::Duration;
    use tandem_types::DType;

    fn pool_with(tp: usize, budget: Option<usize>) -> Arc<HiddenUnitBufferPool> {
        let mut runtime = HostDeviceRuntime::new(tp);
        if let Some(b) = budget {
            runtime = runtime.with_budget(b);
        }
        let ctx = Arc::new(DeviceContext::new(Arc::new(runtime)));
        let config = BufferPoolConfig {
            tensor_parallel_size: tp,
            max_token_num: 4,
            hidden_unit_size: 8,
            dtype: DType::F16,
        };
        Arc::new(HiddenUnitBufferPool::new(config, ctx).unwrap())
    }

    fn pool() -> Arc<HiddenUnitBufferPool> {
        pool_with(2, None)
    }

    #[test]
    fn device_buffer_is_reused() {
        let pool = pool();
        let buf = pool.get_device_buffer().unwrap();
        let id = buf.buffer_id;
        assert_eq!(pool.allocated_device_buffers(), 1);
        pool.free_device_buffer(buf);
        assert_eq!(pool.free_device_len(), 1);

        let again = pool.get_device_buffer().unwrap();
        assert_eq!(again.buffer_id, id);
        assert_eq!(pool.allocated_device_buffers(), 1);
    }

    #[test]
    fn free_clears_flags() {
        let pool = pool();
        let mut buf = pool.get_device_buffer().unwrap();
        buf.decode_enabled = true;
        buf.prefill_enabled = true;
        pool.free_device_buffer(buf);
        let buf = pool.get_device_buffer().unwrap();
        assert!(!buf.decode_enabled && !buf.prefill_enabled);
    }

    #[test]
    fn allocation_failure_surfaces() {
        // One tp=1 buffer is two 64-byte tensors.
        let pool = pool_with(1, Some(128));
        let _first = pool.get_device_buffer().unwrap();
        let err = pool.get_device_buffer().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn pre_allocation_fills_free_queue() {
        let pool = pool();
        pool.pre_allocate_device_buffers(3).unwrap();
        assert_eq!(pool.free_device_len(), 3);
        assert_eq!(pool.allocated_device_buffers(), 3);
        let _b = pool.get_device_buffer().unwrap();
        assert_eq!(pool.allocated_device_buffers(), 3);
    }

    #[test]
    fn host_buffer_header_is_stamped() {
        let pool = pool();
        let packet = pool.get_host_buffer();
        assert_eq!(packet.body.header.tensor_parallel, 2);
        assert_eq!(packet.body.header.decode_shape, [4, 8]);
        assert_eq!(packet.body.data.len(), 2 * 4 * 8 * 2);
        pool.free_host_buffer(packet);
        assert_eq!(pool.free_host_len(), 1);
        let _ = pool.get_host_buffer();
        assert_eq!(pool.allocated_host_buffers(), 1);
    }

    fn spawn_send(pool: &Arc<HiddenUnitBufferPool>) -> thread::JoinHandle<Result<()>> {
        let pool = pool.clone();
        thread::spawn(move || {
            let buf = pool.get_device_buffer()?;
            pool.put_to_send_queue(buf)
        })
    }

    #[test]
    fn send_blocks_until_notify() {
        let pool = pool();
        // Nothing in flight: ignored.
        pool.notify_send_finished();

        let producer = spawn_send(&pool);
        let buf = pool.get_from_send_queue().unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(!producer.is_finished());
        pool.free_device_buffer(buf);
        pool.notify_send_finished();
        assert!(producer.join().unwrap().is_ok());

        // A duplicate notify after completion must not pre-release the next put.
        pool.notify_send_finished();
        let producer = spawn_send(&pool);
        let buf = pool.get_from_send_queue().unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(!producer.is_finished());
        pool.free_device_buffer(buf);
        pool.notify_send_finished();
        assert!(producer.join().unwrap().is_ok());
        assert_eq!(pool.allocated_device_buffers(), 1);
    }

    #[test]
    fn keyed_recv_returns_requested_schedule() {
        let pool = pool();
        let consumer = {
            let pool = pool.clone();
            thread::spawn(move || pool.get_from_device_recv_queue(2).map(|b| b.schedule_id))
        };

        assert!(pool.wait_until_ready_to_recv());
        let mut other = pool.get_device_buffer().unwrap();
        other.schedule_id = 1;
        pool.put_to_device_recv_queue(other);
        thread::sleep(Duration::from_millis(10));
        assert!(!consumer.is_finished());

        let mut wanted = pool.get_device_buffer().unwrap();
        wanted.schedule_id = 2;
        pool.put_to_device_recv_queue(wanted);
        assert_eq!(consumer.join().unwrap(), Some(2));
        assert_eq!(pool.get_from_device_recv_queue(1).map(|b| b.schedule_id), Some(1));
    }

    #[test]
    fn stop_releases_everyone() {
        let pool = pool();
        let sender = {
            let pool = pool.clone();
            thread::spawn(move || {
                let buf = pool.get_device_buffer()?;
                pool.put_to_send_queue(buf)
            })
        };
        let receiver = {
            let pool = pool.clone();
            thread::spawn(move || pool.get_from_device_recv_queue(9).is_none())
        };
        let transport = {
            let pool = pool.clone();
            thread::spawn(move || {
                // Drain the one buffer, then block on the empty queue.
                let _buf = pool.get_from_send_queue();
                pool.get_from_send_queue().is_none()
            })
        };
        let admission = {
            let pool = pool.clone();
            thread::spawn(move || {
                while pool.wait_until_ready_to_recv() {}
                true
            })
        };

        thread::sleep(Duration::from_millis(20));
        pool.stop();
        pool.stop();

        assert!(matches!(sender.join().unwrap(), Err(PipelineError::Stopped)));
        assert!(receiver.join().unwrap());
        assert!(transport.join().unwrap());
        assert!(admission.join().unwrap());
        assert!(pool.is_stopped());
        assert!(pool.get_from_host_recv_queue().is_none());
    }

    #[test]
    fn host_device_round_trip_is_byte_exact() {
        let pool = pool();
        let mut host = pool.get_host_buffer();
        host.body.header = HiddenUnitHeader {
            schedule_id: 11,
            tensor_parallel: 2,
            decode_shape: [2, 8],
            prefill_shape: [3, 8],
        };
        let payload: Vec<u8> = (0..(5 * 8 * 2) as u32).map(|i| (i * 7 % 251) as u8).collect();
        host.body.data[..payload.len()].copy_from_slice(&payload);
        assert_eq!(pool.host_packet_size(&host).unwrap(), HIDDEN_UNIT_HEADER_LEN + payload.len());

        let mut dev = pool.get_device_buffer().unwrap();
        pool.convert_host_buffer_to_device(&mut dev, &host.body).unwrap();
        assert_eq!(dev.schedule_id, 11);
        assert!(dev.decode_enabled && dev.prefill_enabled);

        // Every rank got the decode payload.
        let mut rank1 = vec![0u8; 32];
        dev.tensors[1].read(&mut rank1).unwrap();
        assert_eq!(rank1, payload[..32]);

        let mut out = pool.get_host_buffer();
        pool.convert_device_buffer_to_host(&mut out.body, &dev).unwrap();
        assert_eq!(out.body.header, host.body.header);
        assert_eq!(out.body.data[..payload.len()], payload[..]);
    }

    #[test]
    fn decode_only_skips_prefill() {
        let pool = pool();
        let mut dev = pool.get_device_buffer().unwrap();
        let host = HiddenUnitHostBuffer {
            header: HiddenUnitHeader {
                schedule_id: 3,
                tensor_parallel: 2,
                decode_shape: [1, 8],
                prefill_shape: [0, 0],
            },
            data: vec![9u8; 16],
        };
        pool.convert_host_buffer_to_device(&mut dev, &host).unwrap();
        assert!(dev.decode_enabled);
        assert!(!dev.prefill_enabled);
        assert_eq!(pool.header_for(&dev).prefill_shape, [0, 0]);
    }

    #[test]
    fn oversized_header_rejected() {
        let pool = pool();
        let mut dev = pool.get_device_buffer().unwrap();
        let host = HiddenUnitHostBuffer {
            header: HiddenUnitHeader {
                schedule_id: 1,
                tensor_parallel: 2,
                decode_shape: [5, 8],
                prefill_shape: [0, 0],
            },
            data: vec![0u8; 80],
        };
        assert!(pool.convert_host_buffer_to_device(&mut dev, &host).is_err());
    }

    #[test]
    fn rejected_header_leaves_buffer_untouched() {
        let pool = pool();
        let mut dev = pool.get_device_buffer().unwrap();
        let good = HiddenUnitHeader {
            schedule_id: 4,
            tensor_parallel: 2,
            decode_shape: [2, 8],
            prefill_shape: [1, 8],
        };
        pool.apply_header(&mut dev, &good).unwrap();

        // decode fits, prefill does not
        let bad = HiddenUnitHeader {
            schedule_id: 5,
            decode_shape: [1, 8],
            prefill_shape: [5, 8],
            ..good
        };
        let err = pool.apply_header(&mut dev, &bad).unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Protocol);
        assert_eq!(dev.schedule_id, 4);
        assert_eq!(pool.header_for(&dev), good);

        // shape product overflows
        let huge = HiddenUnitHeader {
            decode_shape: [1 << 32, 1 << 32],
            ..good
        };
        let err = pool.apply_header(&mut dev, &huge).unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Protocol);
        assert_eq!(pool.header_for(&dev), good);

        // payload shorter than the shapes claim
        let host = HiddenUnitHostBuffer {
            header: HiddenUnitHeader { schedule_id: 6, ..good },
            data: vec![0u8; 8],
        };
        assert!(pool.convert_host_buffer_to_device(&mut dev, &host).is_err());
        assert_eq!(dev.schedule_id, 4);
    }
}
