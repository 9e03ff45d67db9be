//! RTMP wire protocol: handshake, chunk stream, AMF0 commands, FLV framing
//! and tag-header inspection.

pub mod amf;
pub mod chunk;
pub mod codec;
pub mod flv;
pub mod handshake;
pub mod session;

pub use chunk::{ChunkHeader, ChunkStream, Message};

// ---------------------------------------------------------------------------
// Message type ids (RTMP 1.0 §5.4, §6.2, §7)
// ---------------------------------------------------------------------------

pub const TYPE_SET_CHUNK_SIZE: u8 = 1;
pub const TYPE_ABORT: u8 = 2;
pub const TYPE_ACK: u8 = 3;
pub const TYPE_WINDOW_ACK: u8 = 5;
pub const TYPE_SET_PEER_BW: u8 = 6;

pub const TYPE_AUDIO: u8 = 8;
pub const TYPE_VIDEO: u8 = 9;

pub const TYPE_AMF3_COMMAND: u8 = 17;
pub const TYPE_AMF0_COMMAND: u8 = 20;

/// Default chunk payload size until a SetChunkSize message changes it.
pub const DEFAULT_CHUNK_SIZE: u32 = 128;

/// True for the two AMF command message types.
pub fn is_command_type(type_id: u8) -> bool {
    type_id == TYPE_AMF0_COMMAND || type_id == TYPE_AMF3_COMMAND
}
