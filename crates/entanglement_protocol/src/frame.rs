//! Length and flag prefixed frames.

use crate::error::{ProtocolError, ProtocolResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the frame header in bytes.
pub const HEADER_LEN: usize = 8;

/// Largest payload a frame may carry.
pub const MAX_FRAME_LEN: usize = 65536;

/// The sender expects a response to this frame.
pub const RESPONSE_NEEDED: u32 = 1;

/// Bits that a receiver must understand or drop the connection.
pub const CRITICAL_FLAGS: u32 = 0xffff;

/// Flag bits this implementation understands.
pub const UNDERSTOOD_FLAGS: u32 = RESPONSE_NEEDED;

/// The fixed eight byte header in front of every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length in bytes.
    pub length: u32,
    /// Flag word.
    pub flags: u32,
}

impl FrameHeader {
    /// Creates a header.
    pub fn new(length: u32, flags: u32) -> Self {
        Self { length, flags }
    }

    /// Encodes the header as two big-endian words.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&self.length.to_be_bytes());
        out[4..].copy_from_slice(&self.flags.to_be_bytes());
        out
    }

    /// Parses and validates a header.
    ///
    /// Fails if the length is over [`MAX_FRAME_LEN`] or if any critical bit
    /// outside [`UNDERSTOOD_FLAGS`] is set.
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> ProtocolResult<Self> {
        let length = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let flags = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if length as usize > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge {
                length: length as usize,
                max: MAX_FRAME_LEN,
            });
        }
        check_flags(flags)?;
        Ok(Self { length, flags })
    }

    /// Returns true if the sender asked for a response.
    pub fn response_needed(&self) -> bool {
        self.flags & RESPONSE_NEEDED != 0
    }
}

fn check_flags(flags: u32) -> ProtocolResult<()> {
    let unknown = flags & CRITICAL_FLAGS & !UNDERSTOOD_FLAGS;
    if unknown != 0 {
        return Err(ProtocolError::UnknownCriticalFlags { flags: unknown });
    }
    Ok(())
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Flag word from the header.
    pub flags: u32,
    /// Raw payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a frame.
    pub fn new(payload: impl Into<Bytes>, flags: u32) -> Self {
        Self {
            flags,
            payload: payload.into(),
        }
    }

    /// Returns true if the sender asked for a response.
    pub fn response_needed(&self) -> bool {
        self.flags & RESPONSE_NEEDED != 0
    }

    /// Serializes header and payload into one buffer.
    pub fn encode(&self) -> ProtocolResult<Bytes> {
        let length = self.payload.len();
        if length > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge {
                length,
                max: MAX_FRAME_LEN,
            });
        }
        let mut out = BytesMut::with_capacity(HEADER_LEN + length);
        out.put_slice(&FrameHeader::new(length as u32, self.flags).encode());
        out.put_slice(&self.payload);
        Ok(out.freeze())
    }
}

/// Reassembles frames from a byte stream.
///
/// Bytes are appended to a caller-owned buffer; [`FrameDecoder::decode_one`]
/// consumes at most one complete frame per call.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    header: Option<FrameHeader>,
}

impl FrameDecoder {
    /// Creates a decoder waiting for a header.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes the next frame if the buffer holds all of it.
    ///
    /// A header is validated as soon as its eight bytes arrive, so an
    /// oversized or critically-flagged frame fails before its payload is read.
    pub fn decode_one(&mut self, buf: &mut BytesMut) -> ProtocolResult<Option<Frame>> {
        let header = match self.header {
            Some(header) => header,
            None => {
                if buf.len() < HEADER_LEN {
                    return Ok(None);
                }
                let mut raw = [0u8; HEADER_LEN];
                raw.copy_from_slice(&buf[..HEADER_LEN]);
                let header = FrameHeader::parse(&raw)?;
                buf.advance(HEADER_LEN);
                self.header = Some(header);
                header
            }
        };

        let length = header.length as usize;
        if buf.len() < length {
            buf.reserve(length - buf.len());
            return Ok(None);
        }
        self.header = None;
        Ok(Some(Frame {
            flags: header.flags,
            payload: buf.split_to(length).freeze(),
        }))
    }
}
