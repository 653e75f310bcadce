// Cluster-wide negotiated pipeline state and the value types it carries.
//
// Shared across tandem-net (wire messages) and tandem-pipeline (control
// channel, buffer pool).

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, TandemError};
use crate::model::LayerRange;
use crate::node::DataAddr;

// ── Tensor Dtype ─────────────────────────────────────────────────────────────

/// Element type of hidden-unit tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DType {
    F16 = 0,
    BF16 = 1,
    F32 = 2,
    Fp8E4M3 = 3,
}

impl DType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::F16),
            1 => Some(Self::BF16),
            2 => Some(Self::F32),
            3 => Some(Self::Fp8E4M3),
            _ => None,
        }
    }

    /// Bytes per element for this dtype.
    pub fn element_bytes(&self) -> usize {
        match self {
            Self::Fp8E4M3 => 1,
            Self::F16 | Self::BF16 => 2,
            Self::F32 => 4,
        }
    }
}

impl FromStr for DType {
    type Err = TandemError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fp16" | "f16" | "float16" => Ok(Self::F16),
            "bf16" | "bfloat16" => Ok(Self::BF16),
            "fp32" | "f32" | "float32" => Ok(Self::F32),
            "fp8" | "fp8_e4m3" => Ok(Self::Fp8E4M3),
            other => Err(TandemError::UnknownDtype(other.to_string())),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::F16 => "fp16",
            Self::BF16 => "bf16",
            Self::F32 => "fp32",
            Self::Fp8E4M3 => "fp8_e4m3",
        };
        f.write_str(name)
    }
}

// ── Collective Token ─────────────────────────────────────────────────────────

pub const COMM_TOKEN_LEN: usize = 128;

/// Opaque handshake blob that lets every rank join the same collective
/// communication group. Generated once by the master and broadcast verbatim.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CommToken(pub [u8; COMM_TOKEN_LEN]);

impl CommToken {
    /// Fresh random token from the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; COMM_TOKEN_LEN];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; COMM_TOKEN_LEN] = bytes
            .try_into()
            .map_err(|_| TandemError::TokenLength(bytes.len()))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; COMM_TOKEN_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl Default for CommToken {
    fn default() -> Self {
        Self([0u8; COMM_TOKEN_LEN])
    }
}

impl fmt::Debug for CommToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommToken(")?;
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "…)")
    }
}

// Serialized as a fixed 128-element tuple so the wire layout has no length prefix.
impl Serialize for CommToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(COMM_TOKEN_LEN)?;
        for b in &self.0 {
            tuple.serialize_element(b)?;
        }
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for CommToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_tuple(COMM_TOKEN_LEN, CommTokenVisitor)
    }
}

struct CommTokenVisitor;

impl<'de> Visitor<'de> for CommTokenVisitor {
    type Value = CommToken;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{COMM_TOKEN_LEN} token bytes")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<CommToken, A::Error> {
        let mut bytes = [0u8; COMM_TOKEN_LEN];
        for (i, slot) in bytes.iter_mut().enumerate() {
            *slot = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(i, &self))?;
        }
        Ok(CommToken(bytes))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<CommToken, E> {
        CommToken::from_slice(v).map_err(|_| E::invalid_length(v.len(), &self))
    }
}

// ── Cache Capacity ───────────────────────────────────────────────────────────

/// Number of KV-cache blocks a node can hold on device and on host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheCapacity {
    pub device_block_num: usize,
    pub host_block_num: usize,
}

impl CacheCapacity {
    pub fn new(device_block_num: usize, host_block_num: usize) -> Self {
        Self { device_block_num, host_block_num }
    }

    /// Element-wise minimum: the smallest node bounds the whole cluster.
    pub fn min(self, other: Self) -> Self {
        Self {
            device_block_num: self.device_block_num.min(other.device_block_num),
            host_block_num: self.host_block_num.min(other.host_block_num),
        }
    }
}

// ── Pipeline Config ──────────────────────────────────────────────────────────

/// Sentinel for "no next-token-prediction layers on this node".
pub const NO_NEXTN_LAYER: i32 = -1;

/// Negotiated per-node pipeline state.
///
/// Zero-valued at process start, filled in once by the control channel's
/// negotiation sequence, then read by model execution and cache management.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub world_size: usize,
    pub node_rank: usize,

    /// Inclusive decoder layer range owned by this node.
    pub lower_layer_idx: u32,
    pub upper_layer_idx: u32,

    /// Inclusive next-token-prediction layer range, `NO_NEXTN_LAYER` when absent.
    pub lower_nextn_layer_idx: i32,
    pub upper_nextn_layer_idx: i32,

    /// Cluster-wide agreed cache capacity.
    pub device_block_num: usize,
    pub host_block_num: usize,

    /// Where this node's data channel sends hidden units.
    pub downstream: Option<DataAddr>,

    pub comm_token: CommToken,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            world_size: 0,
            node_rank: 0,
            lower_layer_idx: 0,
            upper_layer_idx: 0,
            lower_nextn_layer_idx: NO_NEXTN_LAYER,
            upper_nextn_layer_idx: NO_NEXTN_LAYER,
            device_block_num: 0,
            host_block_num: 0,
            downstream: None,
            comm_token: CommToken::default(),
        }
    }
}

impl PipelineConfig {
    pub fn layer_range(&self) -> LayerRange {
        LayerRange::new(self.lower_layer_idx, self.upper_layer_idx)
    }

    pub fn nextn_range(&self) -> Option<LayerRange> {
        if self.lower_nextn_layer_idx < 0 || self.upper_nextn_layer_idx < 0 {
            return None;
        }
        Some(LayerRange::new(
            self.lower_nextn_layer_idx as u32,
            self.upper_nextn_layer_idx as u32,
        ))
    }

    pub fn cache_capacity(&self) -> CacheCapacity {
        CacheCapacity::new(self.device_block_num, self.host_block_num)
    }
}

/// Handle to the node's [`PipelineConfig`], owned by whoever builds the node
/// and injected into the control channel and its readers.
#[derive(Debug, Clone, Default)]
pub struct SharedPipelineConfig {
    inner: Arc<RwLock<PipelineConfig>>,
}

impl SharedPipelineConfig {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> PipelineConfig {
        self.inner.read().clone()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut PipelineConfig) -> R) -> R {
        f(&mut self.inner.write())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_element_bytes() {
        assert_eq!(DType::F16.element_bytes(), 2);
        assert_eq!(DType::BF16.element_bytes(), 2);
        assert_eq!(DType::F32.element_bytes(), 4);
        assert_eq!(DType::Fp8E4M3.element_bytes(), 1);
        assert!(DType::from_u8(9).is_none());
    }

    #[test]
    fn dtype_parse() {
        assert_eq!("bf16".parse::<DType>().unwrap(), DType::BF16);
        assert_eq!("FP32".parse::<DType>().unwrap(), DType::F32);
        assert!("int4".parse::<DType>().is_err());
    }

    #[test]
    fn comm_token_generation() {
        let a = CommToken::generate();
        let b = CommToken::generate();
        assert!(!a.is_zero());
        assert_ne!(a, b);
        assert!(CommToken::default().is_zero());
        assert!(CommToken::from_slice(&[1u8; 12]).is_err());
    }

    #[test]
    fn capacity_min() {
        let agreed = CacheCapacity::new(10, 8).min(CacheCapacity::new(6, 4));
        assert_eq!(agreed, CacheCapacity::new(6, 4));
    }

    #[test]
    fn nextn_sentinel() {
        let mut cfg = PipelineConfig::default();
        assert!(cfg.nextn_range().is_none());
        cfg.lower_nextn_layer_idx = 32;
        cfg.upper_nextn_layer_idx = 32;
        assert_eq!(cfg.nextn_range(), Some(LayerRange::new(32, 32)));
    }

    #[test]
    fn shared_config_update() {
        let shared = SharedPipelineConfig::default();
        shared.update(|c| c.device_block_num = 6);
        assert_eq!(shared.snapshot().device_block_num, 6);
    }
}
