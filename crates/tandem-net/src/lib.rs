//! `tandem-net`: wire layer for the Tandem control and data channels.
//!
//! Both channels share one frame shape, `[u32 BE type][u32 BE len][body]`.
//! Control bodies are fixed-layout bincode structs; data bodies are a 48-byte
//! hidden-unit header followed by the raw tensor payload.

// ── Module declarations ───────────────────────────────────────────────────────

pub mod codec;
pub mod control_message;
pub mod error;
pub mod hidden_unit;
pub mod packet;

// ── Public re-exports ─────────────────────────────────────────────────────────

pub use codec::{split_control, ControlMessage, ControlReader, ControlWriter};
pub use control_message::{
    decode_host, encode_host, AddNodeRequest, AddNodeResponse, AllocateLayerRequest,
    BarrierRequest, BarrierResponse, CacheBlockNumRequest, CacheBlockNumResponse,
    DelNodeRequest, HeartbeatRequest, HeartbeatResponse,
};
pub use error::{NetError, Result};
pub use hidden_unit::{
    read_hidden_unit, read_hidden_unit_header, write_hidden_unit, HiddenUnitHeader, HIDDEN_UNIT_HEADER_LEN,
};
pub use packet::{read_frame, read_frame_prefix, write_frame, PacketType, MAX_CONTROL_BODY};
