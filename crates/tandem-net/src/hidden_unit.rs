// tandem-net::hidden_unit: header codec and frame helpers for hidden-unit
// transfers on the data channel.
//
// Body layout: [48-byte header][decode bytes][prefill bytes]
// Header fields are u64 little-endian: schedule_id, tensor_parallel,
// decode_shape[2], prefill_shape[2].

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::codec::{decode_body, encode_body};
use crate::error::{NetError, Result};
use crate::packet::{read_frame_prefix, write_frame, PacketType};

pub const HIDDEN_UNIT_HEADER_LEN: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HiddenUnitHeader {
    pub schedule_id: u64,
    pub tensor_parallel: u64,
    /// `[tokens, hidden]` of the decode payload; `[0, 0]` when absent.
    pub decode_shape: [u64; 2],
    /// `[tokens, hidden]` of the prefill payload; `[0, 0]` when absent.
    pub prefill_shape: [u64; 2],
}

fn elements(shape: [u64; 2]) -> Result<usize> {
    shape[0]
        .checked_mul(shape[1])
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| NetError::Payload(format!("shape {shape:?} overflows")))
}

impl HiddenUnitHeader {
    pub fn decode_elements(&self) -> Result<usize> {
        elements(self.decode_shape)
    }

    pub fn prefill_elements(&self) -> Result<usize> {
        elements(self.prefill_shape)
    }

    /// Payload bytes implied by the shapes for the given element size.
    pub fn payload_len(&self, element_bytes: usize) -> Result<usize> {
        self.decode_elements()?
            .checked_add(self.prefill_elements()?)
            .and_then(|n| n.checked_mul(element_bytes))
            .ok_or_else(|| {
                NetError::Payload(format!(
                    "shapes {:?} + {:?} overflow the payload length",
                    self.decode_shape, self.prefill_shape
                ))
            })
    }

    pub fn to_bytes(&self) -> Result<[u8; HIDDEN_UNIT_HEADER_LEN]> {
        let body = encode_body(self)?;
        body.as_slice()
            .try_into()
            .map_err(|_| NetError::Encode(format!("hidden-unit header encoded to {} bytes", body.len())))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HIDDEN_UNIT_HEADER_LEN {
            return Err(NetError::Payload(format!(
                "header is {} bytes, expected {HIDDEN_UNIT_HEADER_LEN}",
                bytes.len()
            )));
        }
        decode_body(bytes)
    }
}

/// Send one hidden unit as a `DataHiddenUnit` frame.
pub async fn write_hidden_unit<T>(io: &mut T, header: &HiddenUnitHeader, payload: &[u8]) -> Result<()>
where
    T: AsyncWrite + Unpin,
{
    let header_bytes = header.to_bytes()?;
    write_frame(io, PacketType::DataHiddenUnit, &[header_bytes.as_slice(), payload]).await
}

/// Read the frame prefix and hidden-unit header of the next frame, leaving
/// the payload on the stream. Returns the header and the payload length the
/// frame declares; the caller reads exactly that many bytes next. `None` when
/// the sender closed the stream.
///
/// `max_payload` bounds the declared payload; anything larger is a protocol
/// error rather than an allocation.
pub async fn read_hidden_unit_header<T>(io: &mut T, max_payload: usize) -> Result<Option<(HiddenUnitHeader, usize)>>
where
    T: AsyncRead + Unpin,
{
    let Some((packet_type, len)) = read_frame_prefix(io).await? else {
        return Ok(None);
    };
    if packet_type != PacketType::DataHiddenUnit {
        return Err(NetError::UnexpectedPacket {
            expected: PacketType::DataHiddenUnit.to_string(),
            got: packet_type.to_string(),
        });
    }
    if len < HIDDEN_UNIT_HEADER_LEN {
        return Err(NetError::Payload(format!("body of {len} bytes has no header")));
    }
    let max = HIDDEN_UNIT_HEADER_LEN.saturating_add(max_payload);
    if len > max {
        return Err(NetError::FrameTooLarge { len, max });
    }
    let mut header = [0u8; HIDDEN_UNIT_HEADER_LEN];
    io.read_exact(&mut header).await?;
    let header = HiddenUnitHeader::from_bytes(&header)?;
    Ok(Some((header, len - HIDDEN_UNIT_HEADER_LEN)))
}

/// Receive one hidden unit into a fresh buffer. `None` when the sender
/// closed the stream.
pub async fn read_hidden_unit<T>(io: &mut T, max_payload: usize) -> Result<Option<(HiddenUnitHeader, Vec<u8>)>>
where
    T: AsyncRead + Unpin,
{
    let Some((header, len)) = read_hidden_unit_header(io, max_payload).await? else {
        return Ok(None);
    };
    let mut payload = vec![0u8; len];
    io.read_exact(&mut payload).await?;
    Ok(Some((header, payload)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> HiddenUnitHeader {
        HiddenUnitHeader {
            schedule_id: 7,
            tensor_parallel: 2,
            decode_shape: [3, 4],
            prefill_shape: [0, 0],
        }
    }

    #[test]
    fn header_layout_is_little_endian_u64() {
        let bytes = header().to_bytes().unwrap();
        assert_eq!(bytes.len(), HIDDEN_UNIT_HEADER_LEN);
        assert_eq!(&bytes[..8], &7u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &2u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &3u64.to_le_bytes());
        assert_eq!(HiddenUnitHeader::from_bytes(&bytes).unwrap(), header());
        assert!(HiddenUnitHeader::from_bytes(&bytes[..40]).is_err());
    }

    #[test]
    fn payload_len_from_shapes() {
        let h = HiddenUnitHeader {
            prefill_shape: [5, 4],
            ..header()
        };
        assert_eq!(h.payload_len(2).unwrap(), (12 + 20) * 2);
    }

    #[test]
    fn oversized_shape_is_a_payload_error() {
        let h = HiddenUnitHeader {
            decode_shape: [1 << 32, 1 << 32],
            ..header()
        };
        let decoded = HiddenUnitHeader::from_bytes(&h.to_bytes().unwrap()).unwrap();
        assert!(matches!(decoded.decode_elements(), Err(NetError::Payload(_))));
        assert!(matches!(decoded.payload_len(2), Err(NetError::Payload(_))));

        let h = HiddenUnitHeader {
            decode_shape: [1 << 31, 1 << 31],
            prefill_shape: [1 << 31, 1 << 31],
            ..header()
        };
        assert!(h.payload_len(2).is_err());
    }

    #[tokio::test]
    async fn frame_carries_header_and_payload() {
        let payload: Vec<u8> = (0..24u8).collect();
        let mut wire = Vec::new();
        write_hidden_unit(&mut wire, &header(), &payload).await.unwrap();

        let (got_header, got_payload) = read_hidden_unit(&mut wire.as_slice(), 1024)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got_header, header());
        assert_eq!(got_payload, payload);

        assert!(read_hidden_unit(&mut wire.as_slice(), 8).await.is_err());
    }

    #[tokio::test]
    async fn header_read_leaves_payload_on_stream() {
        let payload: Vec<u8> = (0..24u8).collect();
        let mut wire = Vec::new();
        write_hidden_unit(&mut wire, &header(), &payload).await.unwrap();

        let mut reader = wire.as_slice();
        let (got, len) = read_hidden_unit_header(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(got, header());
        assert_eq!(len, payload.len());
        assert_eq!(reader, payload.as_slice());
    }

    #[tokio::test]
    async fn short_or_foreign_frames_are_rejected() {
        let mut wire = Vec::new();
        write_frame(&mut wire, PacketType::DataHiddenUnit, &[[0u8; 10].as_slice()]).await.unwrap();
        let err = read_hidden_unit_header(&mut wire.as_slice(), 1024).await.unwrap_err();
        assert!(matches!(err, NetError::Payload(_)));

        let mut wire = Vec::new();
        write_frame(&mut wire, PacketType::BarrierRequest, &[[0u8; 8].as_slice()]).await.unwrap();
        let err = read_hidden_unit_header(&mut wire.as_slice(), 1024).await.unwrap_err();
        assert!(matches!(err, NetError::UnexpectedPacket { .. }));
        assert!(err.is_protocol());
    }
}
