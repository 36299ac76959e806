//! Burrow protocol definitions
//!
//! Control-channel messages, the frame codec used on control and work
//! connections, and the per-tunnel transport options shared by both peers.

pub mod codec;
pub mod duration_secs;
pub mod messages;
pub mod options;

pub use codec::{read_message, write_message, CodecError, TunnelCodec};
pub use messages::ControlMessage;
pub use options::TransportOptions;

/// Protocol version, checked by the server on login
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;
