//! Device memory collaborators.
//!
//! The pool never talks to a device SDK directly. It goes through a
//! [`DeviceRuntime`] held by an explicit [`DeviceContext`], which also
//! initializes each device lazily on first use. [`HostDeviceRuntime`] backs
//! "device" memory with host allocations for CPU runs and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use tandem_types::DType;

use crate::error::{PipelineError, Result};

// ── Runtime Interface ─────────────────────────────────────────────────────────

/// Opaque handle to a device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr {
    pub device_id: usize,
    pub addr: u64,
}

/// Destination of a copy.
#[derive(Debug)]
pub enum CopyDst<'a> {
    Host(&'a mut [u8]),
    Device { ptr: DevicePtr, offset: usize },
}

/// Source of a copy.
#[derive(Debug, Clone, Copy)]
pub enum CopySrc<'a> {
    Host(&'a [u8]),
    Device { ptr: DevicePtr, offset: usize },
}

pub trait DeviceRuntime: Send + Sync {
    fn device_count(&self) -> usize;

    /// Make `device_id` current for the calling thread.
    fn set_device(&self, device_id: usize) -> Result<()>;

    fn malloc(&self, device_id: usize, bytes: usize) -> Result<DevicePtr>;

    fn free(&self, ptr: DevicePtr) -> Result<()>;

    /// Copy `bytes` from `src` to `dst`. Host slices must hold at least `bytes`.
    fn memcpy(&self, dst: CopyDst<'_>, src: CopySrc<'_>, bytes: usize) -> Result<()>;
}

// ── Host-backed Runtime ───────────────────────────────────────────────────────

struct HostHeap {
    blocks: HashMap<u64, (usize, Vec<u8>)>,
    allocated_bytes: usize,
}

/// [`DeviceRuntime`] whose "devices" are plain host allocations.
///
/// An optional byte budget makes allocation fail once exceeded, which is how
/// tests exercise pool exhaustion.
pub struct HostDeviceRuntime {
    device_count: usize,
    budget: Option<usize>,
    next_addr: AtomicU64,
    heap: Mutex<HostHeap>,
}

impl HostDeviceRuntime {
    pub fn new(device_count: usize) -> Self {
        Self {
            device_count,
            budget: None,
            next_addr: AtomicU64::new(0x1000),
            heap: Mutex::new(HostHeap {
                blocks: HashMap::new(),
                allocated_bytes: 0,
            }),
        }
    }

    pub fn with_budget(mut self, bytes: usize) -> Self {
        self.budget = Some(bytes);
        self
    }

    pub fn allocated_bytes(&self) -> usize {
        self.heap.lock().allocated_bytes
    }

    pub fn live_allocations(&self) -> usize {
        self.heap.lock().blocks.len()
    }

    fn check_device(&self, device_id: usize) -> Result<()> {
        if device_id >= self.device_count {
            return Err(PipelineError::Device(format!(
                "device {device_id} out of range ({} devices)",
                self.device_count
            )));
        }
        Ok(())
    }
}

fn device_range(heap: &HostHeap, ptr: DevicePtr, offset: usize, bytes: usize) -> Result<()> {
    let (device_id, block) = heap
        .blocks
        .get(&ptr.addr)
        .ok_or_else(|| PipelineError::Device(format!("unknown allocation {:#x}", ptr.addr)))?;
    if *device_id != ptr.device_id {
        return Err(PipelineError::Device(format!(
            "allocation {:#x} belongs to device {device_id}, not {}",
            ptr.addr, ptr.device_id
        )));
    }
    if offset + bytes > block.len() {
        return Err(PipelineError::Device(format!(
            "copy of {bytes} bytes at offset {offset} overruns allocation of {} bytes",
            block.len()
        )));
    }
    Ok(())
}

impl DeviceRuntime for HostDeviceRuntime {
    fn device_count(&self) -> usize {
        self.device_count
    }

    fn set_device(&self, device_id: usize) -> Result<()> {
        self.check_device(device_id)
    }

    fn malloc(&self, device_id: usize, bytes: usize) -> Result<DevicePtr> {
        self.check_device(device_id)?;
        let mut heap = self.heap.lock();
        if let Some(budget) = self.budget {
            if heap.allocated_bytes + bytes > budget {
                return Err(PipelineError::Allocation(format!(
                    "device {device_id}: {bytes} bytes requested, {} of {budget} in use",
                    heap.allocated_bytes
                )));
            }
        }
        let addr = self.next_addr.fetch_add(bytes.max(1) as u64, Ordering::Relaxed);
        heap.blocks.insert(addr, (device_id, vec![0u8; bytes]));
        heap.allocated_bytes += bytes;
        Ok(DevicePtr { device_id, addr })
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        let mut heap = self.heap.lock();
        match heap.blocks.remove(&ptr.addr) {
            Some((_, block)) => {
                heap.allocated_bytes -= block.len();
                Ok(())
            }
            None => Err(PipelineError::Device(format!("double free of {:#x}", ptr.addr))),
        }
    }

    fn memcpy(&self, dst: CopyDst<'_>, src: CopySrc<'_>, bytes: usize) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        let mut heap = self.heap.lock();
        match (dst, src) {
            (CopyDst::Device { ptr, offset }, CopySrc::Host(data)) => {
                device_range(&heap, ptr, offset, bytes)?;
                let src = data.get(..bytes).ok_or_else(|| {
                    PipelineError::Device(format!("host source holds {} of {bytes} bytes", data.len()))
                })?;
                if let Some((_, block)) = heap.blocks.get_mut(&ptr.addr) {
                    block[offset..offset + bytes].copy_from_slice(src);
                }
            }
            (CopyDst::Host(data), CopySrc::Device { ptr, offset }) => {
                device_range(&heap, ptr, offset, bytes)?;
                let len = data.len();
                let dst = data.get_mut(..bytes).ok_or_else(|| {
                    PipelineError::Device(format!("host destination holds {len} of {bytes} bytes"))
                })?;
                if let Some((_, block)) = heap.blocks.get(&ptr.addr) {
                    dst.copy_from_slice(&block[offset..offset + bytes]);
                }
            }
            (CopyDst::Device { ptr: dst, offset: dst_off }, CopySrc::Device { ptr: src, offset: src_off }) => {
                device_range(&heap, dst, dst_off, bytes)?;
                device_range(&heap, src, src_off, bytes)?;
                let staged = heap
                    .blocks
                    .get(&src.addr)
                    .map(|(_, b)| b[src_off..src_off + bytes].to_vec())
                    .unwrap_or_default();
                if let Some((_, block)) = heap.blocks.get_mut(&dst.addr) {
                    block[dst_off..dst_off + bytes].copy_from_slice(&staged);
                }
            }
            (CopyDst::Host(dst), CopySrc::Host(src)) => {
                drop(heap);
                let n = bytes.min(dst.len()).min(src.len());
                dst[..n].copy_from_slice(&src[..n]);
            }
        }
        Ok(())
    }
}

// ── Device Context ────────────────────────────────────────────────────────────

/// Owns the runtime and tracks which devices have been initialized.
pub struct DeviceContext {
    runtime: Arc<dyn DeviceRuntime>,
    initialized: Mutex<Vec<bool>>,
}

impl DeviceContext {
    pub fn new(runtime: Arc<dyn DeviceRuntime>) -> Self {
        let count = runtime.device_count();
        Self {
            runtime,
            initialized: Mutex::new(vec![false; count]),
        }
    }

    pub fn device_count(&self) -> usize {
        self.runtime.device_count()
    }

    pub fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        &self.runtime
    }

    /// Select `device_id`, initializing it the first time it is touched.
    pub fn ensure_device(&self, device_id: usize) -> Result<()> {
        let mut init = self.initialized.lock();
        let first_use = match init.get_mut(device_id) {
            Some(flag) => !std::mem::replace(flag, true),
            None => {
                return Err(PipelineError::Device(format!(
                    "device {device_id} out of range ({} devices)",
                    init.len()
                )))
            }
        };
        self.runtime.set_device(device_id)?;
        if first_use {
            debug!(device_id, "device initialized");
        }
        Ok(())
    }

    pub fn alloc(&self, device_id: usize, bytes: usize) -> Result<DevicePtr> {
        self.ensure_device(device_id)?;
        self.runtime.malloc(device_id, bytes)
    }

    pub fn free(&self, ptr: DevicePtr) -> Result<()> {
        self.runtime.free(ptr)
    }

    pub fn copy_to_device(&self, dst: DevicePtr, offset: usize, src: &[u8]) -> Result<()> {
        self.ensure_device(dst.device_id)?;
        self.runtime
            .memcpy(CopyDst::Device { ptr: dst, offset }, CopySrc::Host(src), src.len())
    }

    pub fn copy_to_host(&self, dst: &mut [u8], src: DevicePtr, offset: usize) -> Result<()> {
        self.ensure_device(src.device_id)?;
        let bytes = dst.len();
        self.runtime
            .memcpy(CopyDst::Host(dst), CopySrc::Device { ptr: src, offset }, bytes)
    }
}

// ── Device Tensor ─────────────────────────────────────────────────────────────

/// A `[tokens, hidden]` tensor on one device. Capacity is fixed at
/// allocation; `shape` tracks the part currently in use. The allocation is
/// returned to the runtime on drop.
pub struct DeviceTensor {
    pub device_id: usize,
    pub dtype: DType,
    pub shape: [usize; 2],
    capacity_elements: usize,
    ptr: DevicePtr,
    ctx: Arc<DeviceContext>,
}

impl DeviceTensor {
    pub fn allocate(ctx: &Arc<DeviceContext>, device_id: usize, dtype: DType, shape: [usize; 2]) -> Result<Self> {
        let (capacity_elements, bytes) = shape[0]
            .checked_mul(shape[1])
            .and_then(|n| Some((n, n.checked_mul(dtype.element_bytes())?)))
            .ok_or_else(|| PipelineError::Allocation(format!("tensor shape {shape:?} overflows")))?;
        let ptr = ctx.alloc(device_id, bytes)?;
        Ok(Self {
            device_id,
            dtype,
            shape,
            capacity_elements,
            ptr,
            ctx: ctx.clone(),
        })
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn capacity_elements(&self) -> usize {
        self.capacity_elements
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_elements * self.dtype.element_bytes()
    }

    pub fn elements(&self) -> usize {
        self.shape[0] * self.shape[1]
    }

    /// Bytes covered by the current shape.
    pub fn used_bytes(&self) -> usize {
        self.elements() * self.dtype.element_bytes()
    }

    pub fn set_shape(&mut self, shape: [usize; 2]) -> Result<()> {
        let fits = shape[0]
            .checked_mul(shape[1])
            .is_some_and(|n| n <= self.capacity_elements);
        if !fits {
            return Err(PipelineError::Protocol(format!(
                "shape {shape:?} exceeds tensor capacity of {} elements",
                self.capacity_elements
            )));
        }
        self.shape = shape;
        Ok(())
    }

    pub fn write(&self, src: &[u8]) -> Result<()> {
        self.ctx.copy_to_device(self.ptr, 0, src)
    }

    pub fn read(&self, dst: &mut [u8]) -> Result<()> {
        self.ctx.copy_to_host(dst, self.ptr, 0)
    }
}

impl std::fmt::Debug for DeviceTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceTensor")
            .field("device_id", &self.device_id)
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("addr", &format_args!("{:#x}", self.ptr.addr))
            .finish()
    }
}

impl Drop for DeviceTensor {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.free(self.ptr) {
            warn!(device_id = self.device_id, %e, "failed to release device tensor");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(devices: usize) -> Arc<DeviceContext> {
        Arc::new(DeviceContext::new(Arc::new(HostDeviceRuntime::new(devices))))
    }

    #[test]
    fn tensor_write_read() {
        let ctx = ctx(2);
        let t = DeviceTensor::allocate(&ctx, 1, DType::F16, [4, 8]).unwrap();
        assert_eq!(t.capacity_bytes(), 64);

        let data: Vec<u8> = (0..64u8).collect();
        t.write(&data).unwrap();
        let mut back = vec![0u8; 64];
        t.read(&mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn tensor_drop_frees_memory() {
        let runtime = Arc::new(HostDeviceRuntime::new(1));
        let ctx = Arc::new(DeviceContext::new(runtime.clone()));
        {
            let _t = DeviceTensor::allocate(&ctx, 0, DType::F32, [2, 2]).unwrap();
            assert_eq!(runtime.allocated_bytes(), 16);
        }
        assert_eq!(runtime.allocated_bytes(), 0);
        assert_eq!(runtime.live_allocations(), 0);
    }

    #[test]
    fn budget_exhaustion() {
        let runtime = Arc::new(HostDeviceRuntime::new(1).with_budget(100));
        let ctx = Arc::new(DeviceContext::new(runtime));
        let _a = DeviceTensor::allocate(&ctx, 0, DType::F16, [5, 8]).unwrap();
        let err = DeviceTensor::allocate(&ctx, 0, DType::F16, [5, 8]).unwrap_err();
        assert!(matches!(err, PipelineError::Allocation(_)));
    }

    #[test]
    fn out_of_range_device() {
        let ctx = ctx(1);
        assert!(ctx.ensure_device(0).is_ok());
        assert!(ctx.ensure_device(1).is_err());
    }

    #[test]
    fn shape_bounded_by_capacity() {
        let ctx = ctx(1);
        let mut t = DeviceTensor::allocate(&ctx, 0, DType::F16, [4, 8]).unwrap();
        assert!(t.set_shape([2, 8]).is_ok());
        assert_eq!(t.used_bytes(), 32);
        assert!(t.set_shape([5, 8]).is_err());
    }

    #[test]
    fn overflowing_shape_is_refused() {
        let ctx = ctx(1);
        let mut t = DeviceTensor::allocate(&ctx, 0, DType::F16, [4, 8]).unwrap();
        let err = t.set_shape([usize::MAX, 2]).unwrap_err();
        assert!(matches!(err, PipelineError::Protocol(_)));
        assert_eq!(t.shape, [4, 8]);

        let err = DeviceTensor::allocate(&ctx, 0, DType::F16, [usize::MAX, 2]).unwrap_err();
        assert!(matches!(err, PipelineError::Allocation(_)));
    }
}
