// tandem-net::codec: control message codec and the framed reader/writer
// halves used by one control connection.
//
// Wire format: [u32 BE packet_type][u32 BE body_len][bincode body]
// Bincode runs with fixed-width little-endian integers so each message type
// has a constant body size.

use bincode::config::{Configuration, Fixint, LittleEndian};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::control_message::*;
use crate::error::{NetError, Result};
use crate::packet::{read_frame, write_frame, PacketType, MAX_CONTROL_BODY};

pub(crate) type WireConfig = Configuration<LittleEndian, Fixint>;

pub(crate) fn wire_config() -> WireConfig {
    bincode::config::standard().with_fixed_int_encoding()
}

pub(crate) fn encode_body<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, wire_config()).map_err(|e| NetError::Encode(e.to_string()))
}

pub(crate) fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    let (value, read) = bincode::serde::decode_from_slice(body, wire_config())
        .map_err(|e| NetError::Decode(e.to_string()))?;
    if read != body.len() {
        return Err(NetError::Decode(format!(
            "{} trailing bytes after message",
            body.len() - read
        )));
    }
    Ok(value)
}

// ── Control Message ───────────────────────────────────────────────────────────

/// One decoded control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    BarrierRequest(BarrierRequest),
    BarrierResponse(BarrierResponse),
    AllocateLayerRequest(AllocateLayerRequest),
    AddNodeRequest(AddNodeRequest),
    AddNodeResponse(AddNodeResponse),
    DelNodeRequest(DelNodeRequest),
    CacheBlockNumRequest(CacheBlockNumRequest),
    CacheBlockNumResponse(CacheBlockNumResponse),
    HeartbeatRequest(HeartbeatRequest),
    HeartbeatResponse(HeartbeatResponse),
}

impl ControlMessage {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::BarrierRequest(_) => PacketType::BarrierRequest,
            Self::BarrierResponse(_) => PacketType::BarrierResponse,
            Self::AllocateLayerRequest(_) => PacketType::AllocateLayerRequest,
            Self::AddNodeRequest(_) => PacketType::AddNodeRequest,
            Self::AddNodeResponse(_) => PacketType::AddNodeResponse,
            Self::DelNodeRequest(_) => PacketType::DelNodeRequest,
            Self::CacheBlockNumRequest(_) => PacketType::CacheBlockNumRequest,
            Self::CacheBlockNumResponse(_) => PacketType::CacheBlockNumResponse,
            Self::HeartbeatRequest(_) => PacketType::HeartbeatRequest,
            Self::HeartbeatResponse(_) => PacketType::HeartbeatResponse,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Self::BarrierRequest(m) => encode_body(m),
            Self::BarrierResponse(m) => encode_body(m),
            Self::AllocateLayerRequest(m) => encode_body(m),
            Self::AddNodeRequest(m) => encode_body(m),
            Self::AddNodeResponse(m) => encode_body(m),
            Self::DelNodeRequest(m) => encode_body(m),
            Self::CacheBlockNumRequest(m) => encode_body(m),
            Self::CacheBlockNumResponse(m) => encode_body(m),
            Self::HeartbeatRequest(m) => encode_body(m),
            Self::HeartbeatResponse(m) => encode_body(m),
        }
    }

    pub fn decode(packet_type: PacketType, body: &[u8]) -> Result<Self> {
        let msg = match packet_type {
            PacketType::BarrierRequest => Self::BarrierRequest(decode_body(body)?),
            PacketType::BarrierResponse => Self::BarrierResponse(decode_body(body)?),
            PacketType::AllocateLayerRequest => Self::AllocateLayerRequest(decode_body(body)?),
            PacketType::AddNodeRequest => Self::AddNodeRequest(decode_body(body)?),
            PacketType::AddNodeResponse => Self::AddNodeResponse(decode_body(body)?),
            PacketType::DelNodeRequest => Self::DelNodeRequest(decode_body(body)?),
            PacketType::CacheBlockNumRequest => Self::CacheBlockNumRequest(decode_body(body)?),
            PacketType::CacheBlockNumResponse => Self::CacheBlockNumResponse(decode_body(body)?),
            PacketType::HeartbeatRequest => Self::HeartbeatRequest(decode_body(body)?),
            PacketType::HeartbeatResponse => Self::HeartbeatResponse(decode_body(body)?),
            PacketType::DataHiddenUnit => {
                return Err(NetError::UnexpectedPacket {
                    expected: "control message".into(),
                    got: packet_type.to_string(),
                })
            }
        };
        Ok(msg)
    }
}

// ── Framed Halves ─────────────────────────────────────────────────────────────

/// Read half of a control connection.
pub struct ControlReader<R = OwnedReadHalf> {
    io: R,
}

impl<R: AsyncRead + Unpin> ControlReader<R> {
    pub fn new(io: R) -> Self {
        Self { io }
    }

    /// Next message, or `None` once the peer has closed the connection.
    pub async fn recv(&mut self) -> Result<Option<ControlMessage>> {
        let Some((packet_type, body)) = read_frame(&mut self.io, MAX_CONTROL_BODY).await? else {
            return Ok(None);
        };
        let msg = ControlMessage::decode(packet_type, &body)?;
        tracing::debug!(%packet_type, len = body.len(), "control frame received");
        Ok(Some(msg))
    }
}

/// Write half of a control connection.
pub struct ControlWriter<W = OwnedWriteHalf> {
    io: W,
}

impl<W: AsyncWrite + Unpin> ControlWriter<W> {
    pub fn new(io: W) -> Self {
        Self { io }
    }

    pub async fn send(&mut self, msg: &ControlMessage) -> Result<()> {
        let body = msg.encode()?;
        let packet_type = msg.packet_type();
        write_frame(&mut self.io, packet_type, &[body.as_slice()]).await?;
        tracing::debug!(%packet_type, len = body.len(), "control frame sent");
        Ok(())
    }
}

/// Split a connected stream into framed control halves.
pub fn split_control(stream: TcpStream) -> (ControlReader, ControlWriter) {
    let _ = stream.set_nodelay(true);
    let (read, write) = stream.into_split();
    (ControlReader::new(read), ControlWriter::new(write))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_types::{CommToken, DataAddr};

    #[test]
    fn fixed_body_sizes() {
        let barrier = ControlMessage::BarrierRequest(BarrierRequest { node_rank: 1, clock_idx: 4 });
        assert_eq!(barrier.encode().unwrap().len(), 8);

        let add = AddNodeRequest::new(1, &DataAddr::new("10.0.0.2", 9001)).unwrap();
        assert_eq!(ControlMessage::AddNodeRequest(add).encode().unwrap().len(), 8 + 16 + 2);

        let alloc = AllocateLayerRequest {
            lower_layer_idx: 15,
            upper_layer_idx: 31,
            lower_nextn_layer_idx: -1,
            upper_nextn_layer_idx: -1,
            downstream_host: encode_host("10.0.0.1").unwrap(),
            downstream_port: 9000,
            collective_comm_token: CommToken::generate(),
        };
        let body = ControlMessage::AllocateLayerRequest(alloc).encode().unwrap();
        assert_eq!(body.len(), 2 + 2 + 2 + 2 + 16 + 2 + 128);
        // little-endian fixed ints
        assert_eq!(&body[..2], &15u16.to_le_bytes());
        assert_eq!(&body[4..6], &(-1i16).to_le_bytes());
    }

    #[test]
    fn layer_request_decodes() {
        let token = CommToken::generate();
        let alloc = AllocateLayerRequest {
            lower_layer_idx: 15,
            upper_layer_idx: 31,
            lower_nextn_layer_idx: 32,
            upper_nextn_layer_idx: 32,
            downstream_host: encode_host("10.0.0.1").unwrap(),
            downstream_port: 9000,
            collective_comm_token: token,
        };
        let msg = ControlMessage::AllocateLayerRequest(alloc);
        let decoded = ControlMessage::decode(PacketType::AllocateLayerRequest, &msg.encode().unwrap()).unwrap();
        let ControlMessage::AllocateLayerRequest(got) = decoded else {
            panic!("wrong variant");
        };
        assert_eq!(got.collective_comm_token, token);
        assert_eq!(got.downstream().unwrap(), DataAddr::new("10.0.0.1", 9000));
    }

    #[test]
    fn truncated_body_rejected() {
        let body = ControlMessage::HeartbeatRequest(HeartbeatRequest { node_rank: 2 })
            .encode()
            .unwrap();
        assert!(ControlMessage::decode(PacketType::HeartbeatRequest, &body[..4]).is_err());
        assert!(ControlMessage::decode(PacketType::BarrierResponse, &body).is_err());
        assert!(ControlMessage::decode(PacketType::DataHiddenUnit, &body).is_err());
    }

    #[tokio::test]
    async fn reader_writer_over_duplex() {
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = ControlWriter::new(a);
        let mut reader = ControlReader::new(b);

        let sent = ControlMessage::CacheBlockNumResponse(CacheBlockNumResponse {
            device_block_num: 6,
            host_block_num: 4,
        });
        writer.send(&sent).await.unwrap();
        assert_eq!(reader.recv().await.unwrap(), Some(sent));

        drop(writer);
        assert_eq!(reader.recv().await.unwrap(), None);
    }
}
