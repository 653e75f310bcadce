//! Tandem node binary: brings one pipeline stage into the cluster.
//!
//! ```bash
//! # rank 0, two-node cluster
//! RUST_LOG=info cargo run --bin tandem-node -- --world-size 2 --data-port 7000 \
//!     master --port 29500
//!
//! # rank 1
//! RUST_LOG=info cargo run --bin tandem-node -- --world-size 2 --data-port 7001 \
//!     worker --rank 1 --master-host 192.168.1.10 --master-port 29500
//! ```
//!
//! The node negotiates layers and cache capacity, opens its data channel to
//! the downstream stage, then idles until a peer is lost or Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tandem_pipeline::{
    plan_layers, ControlChannel, DataChannel, DataChannelFactory, DeviceContext, HiddenUnitBufferPool,
    HostDeviceRuntime,
};
use tandem_types::config::{
    BufferPoolConfig, ControlConfig, DataChannelConfig, DataTransport, HeartbeatConfig,
};
use tandem_types::{CacheCapacity, DType, DataAddr, ModelTopology, PipelineConfig, SharedPipelineConfig};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "tandem-node",
    version = env!("CARGO_PKG_VERSION"),
    about   = "Tandem: pipeline-parallel inference node"
)]
struct Cli {
    #[command(flatten)]
    node: NodeArgs,

    #[command(subcommand)]
    role: RoleCommand,
}

#[derive(Args)]
struct NodeArgs {
    /// Total number of nodes, master included.
    #[arg(long)]
    world_size: usize,

    /// Host this node's data channel binds and advertises.
    #[arg(long, default_value = "127.0.0.1")]
    data_host: String,

    /// Data channel port; 0 picks a free one.
    #[arg(long, default_value_t = 0)]
    data_port: u16,

    #[arg(long, default_value_t = 32)]
    num_layers: u32,

    #[arg(long, default_value_t = 0)]
    nextn_layers: u32,

    /// Layers moved off the master onto rank 1.
    #[arg(long, default_value_t = 0)]
    offload_layers: u32,

    /// Cache blocks this node can hold on device.
    #[arg(long, default_value_t = 1024)]
    device_blocks: usize,

    /// Cache blocks this node can hold in host memory.
    #[arg(long, default_value_t = 4096)]
    host_blocks: usize,

    #[arg(long, default_value_t = 1)]
    tensor_parallel: usize,

    #[arg(long, default_value_t = 256)]
    max_tokens: usize,

    #[arg(long, default_value_t = 4096)]
    hidden_size: usize,

    #[arg(long, default_value = "f16")]
    dtype: DType,

    #[arg(long, default_value_t = 3000)]
    heartbeat_ms: u64,
}

#[derive(Subcommand)]
enum RoleCommand {
    /// Run rank 0: accept workers and drive negotiation.
    Master {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        #[arg(long, default_value_t = 29500)]
        port: u16,
    },

    /// Join a master as `rank`.
    Worker {
        #[arg(long)]
        rank: usize,

        #[arg(long)]
        master_host: String,

        #[arg(long, default_value_t = 29500)]
        master_port: u16,

        /// Attempts to reach the master before giving up.
        #[arg(long, default_value_t = 50)]
        connect_retries: u32,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // Default log level: INFO. Override with RUST_LOG=tandem_pipeline=debug etc.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let args = &cli.node;

    // Refuse a layer split the master could not plan before touching the network.
    plan_layers(args.num_layers, args.world_size, args.offload_layers, args.nextn_layers)
        .context("invalid layer split")?;

    // ── Buffer pool and data channel ─────────────────────────────────────

    let pool_config = BufferPoolConfig {
        tensor_parallel_size: args.tensor_parallel,
        max_token_num: args.max_tokens,
        hidden_unit_size: args.hidden_size,
        dtype: args.dtype,
    };
    let ctx = Arc::new(DeviceContext::new(Arc::new(HostDeviceRuntime::new(args.tensor_parallel))));
    let pool = Arc::new(HiddenUnitBufferPool::new(pool_config, ctx)?);

    // No collective backend is linked into this binary.
    let transport = DataTransport::resolve(false);
    let pipeline = SharedPipelineConfig::new(PipelineConfig::default());
    let factory = DataChannelFactory::new(DataChannelConfig {
        listen_addr: DataAddr::new(args.data_host.clone(), args.data_port),
        ..DataChannelConfig::default()
    });
    let data = factory.create(transport, pool.clone(), pipeline.clone(), None)?;
    data.listen().await?;
    let data_port = data.local_addr().map_or(args.data_port, |a| a.port());

    // ── Control channel ──────────────────────────────────────────────────

    let mut config = ControlConfig::default()
        .with_data_addr(DataAddr::new(args.data_host.clone(), data_port))
        .with_model(ModelTopology {
            num_layers: args.num_layers,
            num_nextn_layers: args.nextn_layers,
        })
        .with_heartbeat(HeartbeatConfig {
            interval: Duration::from_millis(args.heartbeat_ms),
            ..HeartbeatConfig::default()
        });
    let mut connect_retries = 0;
    match &cli.role {
        RoleCommand::Master { host, port } => {
            config = config.with_rank(0, args.world_size).with_master(host.clone(), *port);
        }
        RoleCommand::Worker { rank, master_host, master_port, connect_retries: retries } => {
            config = config
                .with_rank(*rank, args.world_size)
                .with_master(master_host.clone(), *master_port);
            connect_retries = *retries;
        }
    }

    let capacity = CacheCapacity::new(args.device_blocks, args.host_blocks);
    let control = ControlChannel::new(config, pipeline.clone(), Arc::new(capacity))?;

    let outcome = bring_up(&control, &data, args.offload_layers, connect_retries).await;
    if let Err(e) = outcome {
        error!(%e, "cluster bring-up failed");
        data.stop();
        control.shutdown().await;
        return Err(e);
    }

    let p = pipeline.snapshot();
    info!(
        rank = p.node_rank,
        world_size = p.world_size,
        lower = p.lower_layer_idx,
        upper = p.upper_layer_idx,
        device_block_num = p.device_block_num,
        host_block_num = p.host_block_num,
        %transport,
        "node ready, press Ctrl-C to stop"
    );

    // ── Steady state ─────────────────────────────────────────────────────

    let mut loss = control.node_loss();
    let result = tokio::select! {
        changed = loss.wait_for(|l| l.is_some()) => {
            let reason = match changed {
                Ok(l) => l.as_ref().map(|l| l.to_string()).unwrap_or_default(),
                Err(_) => "control channel dropped".to_string(),
            };
            error!(%reason, "node lost, tearing down");
            Err(anyhow::anyhow!("cluster degraded: {reason}"))
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C, shutting down");
            Ok(())
        }
    };

    data.stop();
    control.shutdown().await;
    result
}

// ── Bring-up ──────────────────────────────────────────────────────────────────

async fn bring_up(control: &ControlChannel, data: &DataChannel, offload: u32, connect_retries: u32) -> Result<()> {
    if control.is_master() {
        control.listen().await?;
        if let Some(addr) = control.local_addr() {
            info!(%addr, "waiting for workers");
        }
    } else {
        connect_with_retry(control, connect_retries).await?;
        control.add_node().await.context("registration")?;
    }

    control.barrier().await?;
    control.synchronize_node_layers(offload).await.context("layer negotiation")?;
    control.barrier().await?;
    control.synchronize_cache_block_num().await.context("cache negotiation")?;

    data.connect().await.context("connecting data channel downstream")?;
    control.barrier().await?;
    Ok(())
}

async fn connect_with_retry(control: &ControlChannel, retries: u32) -> Result<()> {
    const BACKOFF: Duration = Duration::from_millis(500);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match control.connect().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < retries => {
                warn!(attempt, %e, "master not reachable yet");
                tokio::time::sleep(BACKOFF).await;
            }
            Err(e) => bail!("could not reach master after {attempt} attempts: {e}"),
        }
    }
}
