// Configuration structs. Plain values with defaults; the binary maps CLI
// arguments onto them and every component receives what it needs explicitly.

use std::fmt;
use std::time::Duration;

use crate::error::{Result, TandemError};
use crate::model::ModelTopology;
use crate::node::{validate_host, DataAddr, MASTER_RANK};
use crate::pipeline::DType;

// ── Control plane ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Time between master-initiated heartbeat rounds.
    pub interval: Duration,
    /// A rank is declared lost after `interval * timeout_factor` of silence.
    pub timeout_factor: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            timeout_factor: 3,
        }
    }
}

impl HeartbeatConfig {
    pub fn timeout(&self) -> Duration {
        self.interval * self.timeout_factor
    }
}

#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Master control listener host. Workers connect here.
    pub master_host: String,
    /// Master control listener port. 0 = OS-assigned (master only).
    pub master_port: u16,
    /// Total number of nodes, master included.
    pub world_size: usize,
    /// This node's rank; 0 is the master.
    pub node_rank: usize,
    /// This node's data-channel listener.
    pub data_addr: DataAddr,
    pub model: ModelTopology,
    pub heartbeat: HeartbeatConfig,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            master_host: "127.0.0.1".into(),
            master_port: 0,
            world_size: 1,
            node_rank: MASTER_RANK,
            data_addr: DataAddr::new("127.0.0.1", 0),
            model: ModelTopology::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl ControlConfig {
    pub fn is_master(&self) -> bool {
        self.node_rank == MASTER_RANK
    }

    /// `host:port` of the master control listener.
    pub fn master_socket_string(&self) -> String {
        format!("{}:{}", self.master_host, self.master_port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.world_size == 0 {
            return Err(TandemError::Config("world_size must be at least 1".into()));
        }
        if self.node_rank >= self.world_size {
            return Err(TandemError::Config(format!(
                "node_rank {} out of range for world_size {}",
                self.node_rank, self.world_size
            )));
        }
        if self.model.num_layers == 0 {
            return Err(TandemError::Config("model has no layers".into()));
        }
        if (self.model.num_layers as usize) < self.world_size {
            return Err(TandemError::Config(format!(
                "{} layers cannot be split across {} nodes",
                self.model.num_layers, self.world_size
            )));
        }
        if self.heartbeat.timeout_factor == 0 {
            return Err(TandemError::Config("heartbeat timeout_factor must be non-zero".into()));
        }
        validate_host(&self.master_host)?;
        self.data_addr.validate()
    }

    pub fn with_rank(mut self, node_rank: usize, world_size: usize) -> Self {
        self.node_rank = node_rank;
        self.world_size = world_size;
        self
    }

    pub fn with_master(mut self, host: impl Into<String>, port: u16) -> Self {
        self.master_host = host.into();
        self.master_port = port;
        self
    }

    pub fn with_data_addr(mut self, data_addr: DataAddr) -> Self {
        self.data_addr = data_addr;
        self
    }

    pub fn with_model(mut self, model: ModelTopology) -> Self {
        self.model = model;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

// ── Buffer pool ───────────────────────────────────────────────────────────────

/// Shape parameters for pooled hidden-unit buffers.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Devices per node; one tensor per device in every device buffer.
    pub tensor_parallel_size: usize,
    /// Maximum tokens per inference step (first tensor dimension).
    pub max_token_num: usize,
    /// Hidden dimension (`head_num * size_per_head`).
    pub hidden_unit_size: usize,
    pub dtype: DType,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            tensor_parallel_size: 1,
            max_token_num: 256,
            hidden_unit_size: 4096,
            dtype: DType::F16,
        }
    }
}

impl BufferPoolConfig {
    /// Bytes of one full-capacity tensor (one payload kind, one rank).
    pub fn max_tensor_bytes(&self) -> usize {
        self.max_token_num * self.hidden_unit_size * self.dtype.element_bytes()
    }

    pub fn validate(&self) -> Result<()> {
        if self.tensor_parallel_size == 0 || self.max_token_num == 0 || self.hidden_unit_size == 0 {
            return Err(TandemError::Config(format!(
                "buffer shape must be non-zero: tp={}, max_token_num={}, hidden_unit_size={}",
                self.tensor_parallel_size, self.max_token_num, self.hidden_unit_size
            )));
        }
        Ok(())
    }
}

// ── Data channel ──────────────────────────────────────────────────────────────

/// Environment variable that forces the socket transport.
pub const TCP_OVERRIDE_ENV: &str = "USE_TCP_DATA_CHANNEL";

/// Transport used to move hidden units between pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataTransport {
    /// Length-prefixed frames over TCP, staged through host memory.
    Tcp,
    /// Device-to-device transfers through a collective-communication backend.
    Collective,
}

impl DataTransport {
    /// Resolve once at startup from [`TCP_OVERRIDE_ENV`] and backend availability.
    pub fn resolve(collective_available: bool) -> Self {
        let value = std::env::var(TCP_OVERRIDE_ENV).ok();
        Self::resolve_with(value.as_deref(), collective_available)
    }

    pub fn resolve_with(override_value: Option<&str>, collective_available: bool) -> Self {
        let forced_tcp = matches!(
            override_value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
            Some("1" | "true" | "yes" | "on")
        );
        if forced_tcp || !collective_available {
            Self::Tcp
        } else {
            Self::Collective
        }
    }
}

impl fmt::Display for DataTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Collective => write!(f, "collective"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DataChannelConfig {
    /// Where the socket transport accepts upstream connections. Port 0 picks
    /// a free port; read the bound one back from the channel.
    pub listen_addr: DataAddr,
    /// Attempts to reach the downstream listener before giving up.
    pub connect_retries: u32,
    /// Pause between attempts.
    pub connect_backoff: Duration,
}

impl Default for DataChannelConfig {
    fn default() -> Self {
        Self {
            listen_addr: DataAddr::new("127.0.0.1", 0),
            connect_retries: 50,
            connect_backoff: Duration::from_millis(200),
        }
    }
}
