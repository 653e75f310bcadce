//! Data channels: move hidden units from this stage's send queue to the
//! downstream stage, and from the upstream stage into this stage's receive
//! queue.
//!
//! Two transports share the [`HiddenUnitBufferPool`] protocol:
//!
//! - [`TcpDataChannel`] stages buffers through host memory and sends
//!   `DataHiddenUnit` frames over a socket.
//! - [`CollectiveDataChannel`] hands device pointers to a
//!   [`CollectiveComm`] backend for device-to-device transfer.
//!
//! The transport is chosen once at startup ([`DataTransport::resolve`]) and
//! built by [`DataChannelFactory`].

mod collective;
mod tcp;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use tandem_types::config::{DataChannelConfig, DataTransport};
use tandem_types::{SharedPipelineConfig, TandemError};

use crate::buffer_pool::HiddenUnitBufferPool;
use crate::error::Result;

pub use collective::{CollectiveComm, CollectiveDataChannel, LocalComm};
pub use tcp::TcpDataChannel;

// ── Data Channel ──────────────────────────────────────────────────────────────

pub enum DataChannel {
    Tcp(TcpDataChannel),
    Collective(CollectiveDataChannel),
}

impl DataChannel {
    pub fn transport(&self) -> DataTransport {
        match self {
            Self::Tcp(_) => DataTransport::Tcp,
            Self::Collective(_) => DataTransport::Collective,
        }
    }

    /// Start receiving from upstream. Call before the control plane
    /// advertises this node's data address.
    pub async fn listen(&self) -> Result<()> {
        match self {
            Self::Tcp(c) => c.listen().await,
            Self::Collective(c) => c.listen(),
        }
    }

    /// Start sending to the downstream recorded in the pipeline config.
    pub async fn connect(&self) -> Result<()> {
        match self {
            Self::Tcp(c) => c.connect().await,
            Self::Collective(c) => c.connect(),
        }
    }

    /// Bound listener address (socket transport only).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(c) => c.local_addr(),
            Self::Collective(_) => None,
        }
    }

    /// Stop the transport and the pool it serves. Idempotent.
    pub fn stop(&self) {
        match self {
            Self::Tcp(c) => c.stop(),
            Self::Collective(c) => c.stop(),
        }
    }
}

// ── Factory ───────────────────────────────────────────────────────────────────

pub struct DataChannelFactory {
    config: DataChannelConfig,
}

impl DataChannelFactory {
    pub fn new(config: DataChannelConfig) -> Self {
        Self { config }
    }

    pub fn create(
        &self,
        transport: DataTransport,
        pool: Arc<HiddenUnitBufferPool>,
        pipeline: SharedPipelineConfig,
        collective: Option<Arc<dyn CollectiveComm>>,
    ) -> Result<DataChannel> {
        let channel = match transport {
            DataTransport::Tcp => DataChannel::Tcp(TcpDataChannel::new(self.config.clone(), pool, pipeline)),
            DataTransport::Collective => {
                let comm = collective.ok_or_else(|| {
                    TandemError::Config("collective transport selected without a backend".into())
                })?;
                DataChannel::Collective(CollectiveDataChannel::new(comm, pool))
            }
        };
        info!(%transport, "data channel created");
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceContext, HostDeviceRuntime};
    use tandem_types::config::BufferPoolConfig;
    use tandem_types::PipelineConfig;

    fn pool() -> Arc<HiddenUnitBufferPool> {
        let ctx = Arc::new(DeviceContext::new(Arc::new(HostDeviceRuntime::new(1))));
        Arc::new(HiddenUnitBufferPool::new(BufferPoolConfig::default(), ctx).unwrap())
    }

    #[test]
    fn factory_picks_transport() {
        let factory = DataChannelFactory::new(DataChannelConfig::default());
        let pipeline = SharedPipelineConfig::new(PipelineConfig::default());

        let tcp = factory.create(DataTransport::Tcp, pool(), pipeline.clone(), None).unwrap();
        assert_eq!(tcp.transport(), DataTransport::Tcp);

        let err = factory
            .create(DataTransport::Collective, pool(), pipeline.clone(), None)
            .err()
            .unwrap();
        assert!(!err.is_fatal());

        let ctx = pool().device_context().clone();
        let (a, _b) = LocalComm::pair(ctx.clone(), ctx);
        let coll = factory
            .create(DataTransport::Collective, pool(), pipeline, Some(Arc::new(a)))
            .unwrap();
        assert_eq!(coll.transport(), DataTransport::Collective);
        assert!(coll.local_addr().is_none());
    }
}
