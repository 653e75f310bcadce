//! Hidden-unit buffers as they move between the model, the pool and the
//! data channels.

use tandem_net::{HiddenUnitHeader, PacketType, HIDDEN_UNIT_HEADER_LEN};

use crate::device::DeviceTensor;
use crate::error::Result;

/// Activations for one inference step, one tensor per tensor-parallel rank.
#[derive(Debug)]
pub struct HiddenUnitDeviceBuffer {
    /// Pool-assigned identity, stable across reuse.
    pub buffer_id: u64,
    pub schedule_id: u64,
    /// Decode tensors, indexed by tensor-parallel rank.
    pub tensors: Vec<DeviceTensor>,
    /// Prefill tensors, indexed by tensor-parallel rank.
    pub prefill_tensors: Vec<DeviceTensor>,
    pub decode_enabled: bool,
    pub prefill_enabled: bool,
}

impl HiddenUnitDeviceBuffer {
    pub fn tensor_parallel_size(&self) -> usize {
        self.tensors.len()
    }

    /// Bytes of decode payload currently in use.
    pub fn decode_bytes(&self) -> usize {
        match (self.decode_enabled, self.tensors.first()) {
            (true, Some(t)) => t.used_bytes(),
            _ => 0,
        }
    }

    /// Bytes of prefill payload currently in use.
    pub fn prefill_bytes(&self) -> usize {
        match (self.prefill_enabled, self.prefill_tensors.first()) {
            (true, Some(t)) => t.used_bytes(),
            _ => 0,
        }
    }
}

/// Host staging form: fixed header plus decode bytes then prefill bytes.
#[derive(Debug, Clone, Default)]
pub struct HiddenUnitHostBuffer {
    pub header: HiddenUnitHeader,
    /// Sized for the maximum payload; only the prefix implied by the
    /// header shapes is meaningful.
    pub data: Vec<u8>,
}

impl HiddenUnitHostBuffer {
    pub fn payload_len(&self, element_bytes: usize) -> Result<usize> {
        Ok(self.header.payload_len(element_bytes)?)
    }
}

/// A pooled host packet ready for (or fresh from) the wire.
#[derive(Debug, Clone)]
pub struct Packet {
    pub packet_type: PacketType,
    /// Header plus payload bytes actually in use.
    pub size: usize,
    pub body: HiddenUnitHostBuffer,
}

impl Packet {
    pub fn hidden_unit(body: HiddenUnitHostBuffer) -> Self {
        Self {
            packet_type: PacketType::DataHiddenUnit,
            size: HIDDEN_UNIT_HEADER_LEN,
            body,
        }
    }
}
