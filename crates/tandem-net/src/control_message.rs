// tandem-net::control_message: fixed-layout control channel messages.
//
// Every struct here is encoded with bincode fixed-int little-endian, so the
// body size of each message type is constant. Hosts travel as NUL-padded
// 16-byte fields.

use serde::{Deserialize, Serialize};

use tandem_types::node::{validate_host, HOST_FIELD_LEN};
use tandem_types::{CacheCapacity, CommToken, DataAddr};

use crate::error::{NetError, Result};

pub type HostField = [u8; HOST_FIELD_LEN];

/// Pack a host string into its fixed wire field.
pub fn encode_host(host: &str) -> Result<HostField> {
    validate_host(host)?;
    let mut field = [0u8; HOST_FIELD_LEN];
    field[..host.len()].copy_from_slice(host.as_bytes());
    Ok(field)
}

/// Unpack a host field, stopping at the first NUL.
pub fn decode_host(field: &HostField) -> Result<String> {
    let end = field.iter().position(|b| *b == 0).unwrap_or(HOST_FIELD_LEN);
    let host = std::str::from_utf8(&field[..end])
        .map_err(|e| NetError::Decode(format!("host field is not utf-8: {e}")))?;
    if host.is_empty() {
        return Err(NetError::Decode("empty host field".into()));
    }
    Ok(host.to_string())
}

// ── Barrier ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierRequest {
    pub node_rank: i32,
    pub clock_idx: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierResponse {
    pub clock_idx: i32,
}

// ── Layer Allocation ──────────────────────────────────────────────────────────

/// Master to worker: the worker's layer range, its downstream data address
/// and the collective-communication token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateLayerRequest {
    pub lower_layer_idx: u16,
    pub upper_layer_idx: u16,

    /// `-1` when the receiver holds no next-token-prediction layers.
    pub lower_nextn_layer_idx: i16,
    pub upper_nextn_layer_idx: i16,

    pub downstream_host: HostField,
    pub downstream_port: u16,

    pub collective_comm_token: CommToken,
}

impl AllocateLayerRequest {
    pub fn downstream(&self) -> Result<DataAddr> {
        Ok(DataAddr::new(decode_host(&self.downstream_host)?, self.downstream_port))
    }
}

// ── Membership ────────────────────────────────────────────────────────────────

/// Worker to master: registration with the worker's data listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddNodeRequest {
    pub node_rank: u64,
    pub data_host: HostField,
    pub data_port: u16,
}

impl AddNodeRequest {
    pub fn new(node_rank: usize, data_addr: &DataAddr) -> Result<Self> {
        Ok(Self {
            node_rank: node_rank as u64,
            data_host: encode_host(&data_addr.host)?,
            data_port: data_addr.port,
        })
    }

    pub fn data_addr(&self) -> Result<DataAddr> {
        Ok(DataAddr::new(decode_host(&self.data_host)?, self.data_port))
    }
}

/// Master to worker: registration verdict. `session_id` is the master's
/// cluster session, carried so both sides log the same identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddNodeResponse {
    pub node_rank: u64,
    pub accepted: bool,
    pub session_id: [u8; 16],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelNodeRequest {
    pub node_rank: u64,
}

// ── Cache Capacity ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheBlockNumRequest {
    pub node_rank: u64,
    pub device_block_num: u64,
    pub host_block_num: u64,
}

impl CacheBlockNumRequest {
    pub fn new(node_rank: usize, capacity: CacheCapacity) -> Self {
        Self {
            node_rank: node_rank as u64,
            device_block_num: capacity.device_block_num as u64,
            host_block_num: capacity.host_block_num as u64,
        }
    }

    pub fn capacity(&self) -> CacheCapacity {
        CacheCapacity::new(self.device_block_num as usize, self.host_block_num as usize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheBlockNumResponse {
    pub device_block_num: u64,
    pub host_block_num: u64,
}

impl CacheBlockNumResponse {
    pub fn capacity(&self) -> CacheCapacity {
        CacheCapacity::new(self.device_block_num as usize, self.host_block_num as usize)
    }
}

impl From<CacheCapacity> for CacheBlockNumResponse {
    fn from(c: CacheCapacity) -> Self {
        Self {
            device_block_num: c.device_block_num as u64,
            host_block_num: c.host_block_num as u64,
        }
    }
}

// ── Heartbeat ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_rank: u64,
}

/// Echoes the request's rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub node_rank: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_field_packing() {
        let field = encode_host("10.1.2.3").unwrap();
        assert_eq!(&field[..8], b"10.1.2.3");
        assert!(field[8..].iter().all(|b| *b == 0));
        assert_eq!(decode_host(&field).unwrap(), "10.1.2.3");

        assert!(encode_host("a-name-that-is-too-long").is_err());
        assert!(decode_host(&[0u8; HOST_FIELD_LEN]).is_err());
    }

    #[test]
    fn full_width_host_decodes() {
        let field = encode_host("255.255.255.255").unwrap();
        assert_eq!(decode_host(&field).unwrap(), "255.255.255.255");
    }

    #[test]
    fn add_node_addr() {
        let req = AddNodeRequest::new(3, &DataAddr::new("192.168.0.7", 8123)).unwrap();
        assert_eq!(req.node_rank, 3);
        assert_eq!(req.data_addr().unwrap(), DataAddr::new("192.168.0.7", 8123));
    }
}
