//! Outpost protocol definitions
//!
//! This crate defines the envelope exchanged between the controller and its
//! agents, the length-prefixed wire codec, and the typed payloads carried in
//! envelope bodies.

pub mod codec;
pub mod envelope;
pub mod messages;

pub use codec::{CodecError, EnvelopeCodec};
pub use envelope::{Envelope, MessageKind};
pub use messages::*;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum serialized envelope size (16MB)
pub const MAX_ENVELOPE_SIZE: usize = 16 * 1024 * 1024;

/// Size of the little-endian length prefix in front of every envelope
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Tunnel identifier, unique within one connection
pub type TunnelId = u64;
