//! `tandem-pipeline`: distributed coordination for pipeline-parallel
//! inference.
//!
//! This crate moves activations and agreements between nodes; it does not
//! run the model. Three pieces cooperate:
//!
//! - [`control`]: rank 0 is the master. Workers register, the cluster
//!   rendezvouses at barriers, the master assigns contiguous layer ranges
//!   and the cluster agrees on a common cache capacity. Heartbeats detect
//!   lost nodes afterwards.
//! - [`buffer_pool`]: pooled device and host buffers for hidden units and
//!   the blocking queues between the model thread and the transport.
//! - [`data_channel`]: ships hidden units to the downstream stage over TCP
//!   or a collective-communication backend.
//!
//! ```text
//! ┌─────────────┐  hidden  ┌─────────────┐  hidden  ┌─────────────┐
//! │   rank 0    │─────────▶│   rank 1    │─────────▶│   rank 2    │
//! │ layers 0-9  │  units   │ layers 10-20│  units   │ layers 21-31│
//! └─────────────┘          └─────────────┘          └─────────────┘
//!        ▲                                                 │
//!        └─────────────────────────────────────────────────┘
//! ```

pub mod buffer;
pub mod buffer_pool;
pub mod control;
pub mod data_channel;
pub mod device;
pub mod error;
pub mod heartbeat;
pub mod planner;
pub mod queue;
pub mod state;
pub mod waiter;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use buffer::{HiddenUnitDeviceBuffer, HiddenUnitHostBuffer, Packet};
pub use buffer_pool::{DeviceBuffer, HiddenUnitBufferPool, HostPacket};
pub use control::{CacheCapacityProvider, ControlChannel, NodeLoss};
pub use data_channel::{
    CollectiveComm, CollectiveDataChannel, DataChannel, DataChannelFactory, LocalComm, TcpDataChannel,
};
pub use device::{DeviceContext, DevicePtr, DeviceRuntime, DeviceTensor, HostDeviceRuntime};
pub use error::{ErrorClass, PipelineError, Result};
pub use heartbeat::HeartbeatMonitor;
pub use planner::{plan_layers, LayerAssignment};
pub use state::{ControlState, Role};
