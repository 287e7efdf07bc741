//! # Entanglement Protocol
//!
//! Wire-level types for the Entanglement mesh synchronization runtime.
//!
//! This crate provides:
//! - Frame header encoding and a buffered frame decoder
//! - Flag constants and critical-flag validation
//! - `SyncMessage`, the JSON object carried by every frame, with meta-key accessors
//! - `DestHash`, the 32-byte peer identity
//!
//! This is a pure protocol crate with no I/O operations.
//!
//! ## Frame layout
//!
//! ```text
//! +----------------+----------------+---------------------------+
//! | length: u32 BE | flags: u32 BE  | payload: UTF-8 JSON object |
//! +----------------+----------------+---------------------------+
//! ```
//!
//! `length` never exceeds [`MAX_FRAME_LEN`]. Flag bit 0 is
//! [`RESPONSE_NEEDED`]; bits 1-15 are critical and bits 16-31 may be ignored.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod dest_hash;
mod error;
mod frame;
mod message;

pub use dest_hash::DestHash;
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{
    Frame, FrameDecoder, FrameHeader, CRITICAL_FLAGS, HEADER_LEN, MAX_FRAME_LEN, RESPONSE_NEEDED,
    UNDERSTOOD_FLAGS,
};
pub use message::{meta, SyncMessage, DEFAULT_OPERATION};
