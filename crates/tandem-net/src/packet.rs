// tandem-net::packet: packet type tags and the frame layer shared by the
// control and data channels.
//
// Wire format: [u32 BE packet_type][u32 BE body_len][body]
// The length is checked against a per-channel limit before the body buffer
// is allocated, so a corrupt or hostile peer cannot force a huge allocation.

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{NetError, Result};

/// Control bodies are a few hundred bytes at most.
pub const MAX_CONTROL_BODY: usize = 1024 * 1024;

/// Bytes in the frame prefix: type tag plus body length.
pub const FRAME_PREFIX_LEN: usize = 8;

// ── Packet Type ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketType {
    BarrierRequest = 1,
    BarrierResponse = 2,
    AllocateLayerRequest = 3,
    AddNodeRequest = 4,
    AddNodeResponse = 5,
    DelNodeRequest = 6,
    CacheBlockNumRequest = 7,
    CacheBlockNumResponse = 8,
    HeartbeatRequest = 9,
    HeartbeatResponse = 10,

    /// Hidden-unit transfer on the data channel.
    DataHiddenUnit = 100,
}

impl PacketType {
    pub fn from_u32(v: u32) -> Result<Self> {
        let ty = match v {
            1 => Self::BarrierRequest,
            2 => Self::BarrierResponse,
            3 => Self::AllocateLayerRequest,
            4 => Self::AddNodeRequest,
            5 => Self::AddNodeResponse,
            6 => Self::DelNodeRequest,
            7 => Self::CacheBlockNumRequest,
            8 => Self::CacheBlockNumResponse,
            9 => Self::HeartbeatRequest,
            10 => Self::HeartbeatResponse,
            100 => Self::DataHiddenUnit,
            other => return Err(NetError::UnknownPacketType(other)),
        };
        Ok(ty)
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn is_control(self) -> bool {
        self != Self::DataHiddenUnit
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── Frame I/O ─────────────────────────────────────────────────────────────────

/// Read a frame prefix: packet type and declared body length. Returns
/// `Ok(None)` when the peer closed the stream before a new frame started.
pub async fn read_frame_prefix<T>(io: &mut T) -> Result<Option<(PacketType, usize)>>
where
    T: AsyncRead + Unpin,
{
    let mut prefix = [0u8; FRAME_PREFIX_LEN];
    match io.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let raw_type = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
    let len = u32::from_be_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]) as usize;
    Ok(Some((PacketType::from_u32(raw_type)?, len)))
}

/// Read one frame. Returns `Ok(None)` when the peer closed the stream
/// before a new frame started.
pub async fn read_frame<T>(io: &mut T, max_body: usize) -> Result<Option<(PacketType, Vec<u8>)>>
where
    T: AsyncRead + Unpin,
{
    let Some((packet_type, len)) = read_frame_prefix(io).await? else {
        return Ok(None);
    };
    if len > max_body {
        return Err(NetError::FrameTooLarge { len, max: max_body });
    }

    let mut body = vec![0u8; len];
    io.read_exact(&mut body).await?;
    Ok(Some((packet_type, body)))
}

/// Write one frame whose body is the concatenation of `parts`.
///
/// Taking the body in pieces lets the data channel send header and tensor
/// payload without first copying them into one buffer.
pub async fn write_frame<T>(io: &mut T, packet_type: PacketType, parts: &[&[u8]]) -> Result<()>
where
    T: AsyncWrite + Unpin,
{
    let total: usize = parts.iter().map(|p| p.len()).sum();
    let len = u32::try_from(total).map_err(|_| NetError::FrameTooLarge {
        len: total,
        max: u32::MAX as usize,
    })?;

    let mut prefix = [0u8; FRAME_PREFIX_LEN];
    prefix[..4].copy_from_slice(&packet_type.as_u32().to_be_bytes());
    prefix[4..].copy_from_slice(&len.to_be_bytes());

    io.write_all(&prefix).await?;
    for part in parts {
        io.write_all(part).await?;
    }
    io.flush().await?;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, PacketType::BarrierRequest, &[b"ab".as_slice(), b"cd".as_slice()]).await.unwrap();
        assert_eq!(buf.len(), FRAME_PREFIX_LEN + 4);
        assert_eq!(&buf[..4], &1u32.to_be_bytes());
        assert_eq!(&buf[4..8], &4u32.to_be_bytes());

        let (ty, body) = read_frame(&mut buf.as_slice(), MAX_CONTROL_BODY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ty, PacketType::BarrierRequest);
        assert_eq!(body, b"abcd");
    }

    #[tokio::test]
    async fn eof_before_frame_is_none() {
        let empty: &[u8] = &[];
        let mut reader = empty;
        assert!(read_frame(&mut reader, MAX_CONTROL_BODY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&PacketType::AddNodeRequest.as_u32().to_be_bytes());
        buf.extend_from_slice(&((MAX_CONTROL_BODY as u32) + 1).to_be_bytes());
        let err = read_frame(&mut buf.as_slice(), MAX_CONTROL_BODY).await.unwrap_err();
        assert!(matches!(err, NetError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn unknown_type_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&77u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        let err = read_frame(&mut buf.as_slice(), MAX_CONTROL_BODY).await.unwrap_err();
        assert!(matches!(err, NetError::UnknownPacketType(77)));
    }
}
