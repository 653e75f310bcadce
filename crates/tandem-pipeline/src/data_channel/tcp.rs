// Socket transport for hidden units.
//
// Send: a task pulls from the pool's send queue (on the blocking pool),
// downloads rank 0 into a host packet, writes one frame, then releases the
// producer.
//
// Receive: one task per upstream connection reads each frame header, checks
// it, reads the payload straight into a pooled host packet and queues it; an upload thread waits for a consumer credit, copies each
// packet into a device buffer and hands it to the keyed receive queue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use tandem_net::{read_hidden_unit_header, write_hidden_unit, HIDDEN_UNIT_HEADER_LEN};
use tandem_types::config::DataChannelConfig;
use tandem_types::{SharedPipelineConfig, TandemError};

use crate::buffer_pool::HiddenUnitBufferPool;
use crate::error::{PipelineError, Result};

pub struct TcpDataChannel {
    config: DataChannelConfig,
    pool: Arc<HiddenUnitBufferPool>,
    pipeline: SharedPipelineConfig,
    local_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    upload: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TcpDataChannel {
    pub fn new(config: DataChannelConfig, pool: Arc<HiddenUnitBufferPool>, pipeline: SharedPipelineConfig) -> Self {
        Self {
            config,
            pool,
            pipeline,
            local_addr: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            upload: Mutex::new(None),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    // ── Receive ─────────────────────────────────────────────────────────

    pub async fn listen(&self) -> Result<()> {
        let addr = self.config.listen_addr.socket_string();
        let listener = TcpListener::bind(&addr).await?;
        let bound = listener.local_addr()?;
        *self.local_addr.lock() = Some(bound);

        let pool = self.pool.clone();
        let upload = thread::Builder::new()
            .name("tandem-upload".into())
            .spawn(move || upload_loop(pool))?;
        *self.upload.lock() = Some(upload);

        let accept = tokio::spawn(accept_loop(listener, self.pool.clone()));
        self.tasks.lock().push(accept);
        info!(addr = %bound, "data channel listening");
        Ok(())
    }

    // ── Send ────────────────────────────────────────────────────────────

    /// Dial the downstream stage, retrying while it comes up.
    pub async fn connect(&self) -> Result<()> {
        let downstream = self
            .pipeline
            .snapshot()
            .downstream
            .ok_or_else(|| TandemError::Config("no downstream assigned; synchronize layers first".into()))?;
        let addr = downstream.socket_string();

        let mut attempt = 0;
        let stream = loop {
            attempt += 1;
            match TcpStream::connect(&addr).await {
                Ok(stream) => break stream,
                Err(e) if attempt < self.config.connect_retries => {
                    debug!(%addr, attempt, %e, "downstream not reachable yet");
                    tokio::time::sleep(self.config.connect_backoff).await;
                }
                Err(e) => {
                    warn!(%addr, attempt, %e, "giving up on downstream");
                    return Err(PipelineError::ConnectFailed { addr, attempts: attempt });
                }
            }
        };
        stream.set_nodelay(true)?;

        let send = tokio::spawn(send_loop(stream, self.pool.clone()));
        self.tasks.lock().push(send);
        info!(%addr, attempts = attempt, "data channel connected downstream");
        Ok(())
    }

    pub fn stop(&self) {
        self.pool.stop();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(upload) = self.upload.lock().take() {
            if upload.join().is_err() {
                error!("upload thread panicked");
            }
        }
    }
}

impl Drop for TcpDataChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Loops ─────────────────────────────────────────────────────────────────────

/// Connection tasks live in a `JoinSet`, so aborting this task aborts them.
async fn accept_loop(listener: TcpListener, pool: Arc<HiddenUnitBufferPool>) {
    let mut connections = JoinSet::new();
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                info!(%peer, "upstream data connection accepted");
                while connections.try_join_next().is_some() {}
                connections.spawn(recv_loop(stream, peer, pool.clone()));
            }
            Err(e) => warn!(%e, "data accept failed"),
        }
    }
}

async fn recv_loop(mut stream: TcpStream, peer: SocketAddr, pool: Arc<HiddenUnitBufferPool>) {
    let element_bytes = pool.config().dtype.element_bytes();
    let max_payload = 2 * pool.config().max_tensor_bytes();

    while !pool.is_stopped() {
        let (header, len) = match read_hidden_unit_header(&mut stream, max_payload).await {
            Ok(Some(next)) => next,
            Ok(None) => {
                info!(%peer, "upstream data connection closed");
                return;
            }
            Err(e) if e.is_protocol() => {
                error!(%peer, %e, "malformed hidden-unit frame");
                pool.stop();
                return;
            }
            Err(e) => {
                warn!(%peer, %e, "upstream data connection failed");
                return;
            }
        };
        match header.payload_len(element_bytes) {
            Ok(expected) if expected == len => {}
            Ok(expected) => {
                error!(%peer, got = len, expected, "hidden-unit payload size mismatch");
                pool.stop();
                return;
            }
            Err(e) => {
                error!(%peer, %e, "malformed hidden-unit header");
                pool.stop();
                return;
            }
        }

        // The payload lands directly in a pooled packet.
        let mut packet = pool.get_host_buffer();
        let body = &mut packet.body;
        if body.data.len() < len {
            body.data.resize(len, 0);
        }
        let read = stream.read_exact(&mut body.data[..len]).await;
        if let Err(e) = read {
            warn!(%peer, %e, "upstream data connection failed mid-frame");
            pool.free_host_buffer(packet);
            return;
        }
        body.header = header;
        packet.size = HIDDEN_UNIT_HEADER_LEN + len;
        debug!(%peer, schedule_id = header.schedule_id, bytes = packet.size, "hidden unit received");
        pool.put_to_host_recv_queue(packet);
    }
}

fn upload_loop(pool: Arc<HiddenUnitBufferPool>) {
    while let Some(packet) = pool.get_from_host_recv_queue() {
        if !pool.wait_until_ready_to_recv() {
            pool.free_host_buffer(packet);
            break;
        }
        let mut dev = match pool.get_device_buffer() {
            Ok(dev) => dev,
            Err(e) => {
                error!(%e, "no device buffer for received hidden unit");
                pool.free_host_buffer(packet);
                pool.stop();
                break;
            }
        };
        let uploaded = pool.convert_host_buffer_to_device(&mut dev, &packet.body);
        pool.free_host_buffer(packet);
        match uploaded {
            Ok(()) => pool.put_to_device_recv_queue(dev),
            Err(e) => {
                error!(%e, schedule_id = dev.schedule_id, "hidden-unit upload failed");
                pool.free_device_buffer(dev);
                pool.stop();
                break;
            }
        }
    }
    debug!("upload thread exiting");
}

async fn send_loop(mut stream: TcpStream, pool: Arc<HiddenUnitBufferPool>) {
    let element_bytes = pool.config().dtype.element_bytes();
    loop {
        let source = pool.clone();
        let dev = match tokio::task::spawn_blocking(move || source.get_from_send_queue()).await {
            Ok(Some(dev)) => dev,
            Ok(None) => break,
            Err(e) => {
                error!(%e, "send queue reader failed");
                pool.stop();
                break;
            }
        };

        let mut packet = pool.get_host_buffer();
        let staged = pool.convert_device_buffer_to_host(&mut packet.body, &dev);
        let schedule_id = dev.schedule_id;
        pool.free_device_buffer(dev);
        if let Err(e) = staged {
            error!(%e, schedule_id, "hidden-unit download failed");
            pool.free_host_buffer(packet);
            pool.stop();
            break;
        }

        let len = match packet.body.payload_len(element_bytes) {
            Ok(len) => len,
            Err(e) => {
                error!(%e, schedule_id, "hidden-unit header overflows");
                pool.free_host_buffer(packet);
                pool.stop();
                break;
            }
        };
        packet.size = HIDDEN_UNIT_HEADER_LEN + len;
        let written = write_hidden_unit(&mut stream, &packet.body.header, &packet.body.data[..len]).await;
        pool.free_host_buffer(packet);
        match written {
            Ok(()) => {
                debug!(schedule_id, bytes = HIDDEN_UNIT_HEADER_LEN + len, "hidden unit sent");
                pool.notify_send_finished();
            }
            Err(e) => {
                error!(%e, schedule_id, "hidden-unit write failed, stopping pool");
                pool.stop();
                break;
            }
        }
    }
    debug!("send loop exiting");
}
