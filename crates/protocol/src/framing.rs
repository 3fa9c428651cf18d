//! Frame codec for the channel's control/data split.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 4 bytes: magic bytes "TETH"
//! - 4 bytes: content length (big-endian, includes kind byte)
//! - 1 byte: frame kind (0 = data, 1 = control)
//! - N bytes: payload
//!
//! Control payloads are the JSON handshake messages; data payloads are
//! opaque to the transport. Over a raw socket frames are delimited purely
//! by the length field, so decoding works from an accumulation buffer via
//! [`FrameCodec::try_decode`]. Compression is not a frame concern: framed
//! sockets compress whole encoded frames at the message layer instead.

use crate::error::{ProtocolError, Result};

/// Magic bytes identifying a Tether frame.
pub const FRAME_MAGIC: [u8; 4] = *b"TETH";

/// Maximum frame size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame header size: 4 (magic) + 4 (length) + 1 (kind) = 9 bytes.
pub const FRAME_HEADER_SIZE: usize = 9;

/// Whether a frame carries application payload or protocol control traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Opaque application payload.
    Data,
    /// Protocol management traffic (handshake, disconnect notices).
    Control,
}

impl FrameKind {
    /// Parse a kind from its wire byte.
    #[inline]
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(FrameKind::Data),
            1 => Ok(FrameKind::Control),
            other => Err(ProtocolError::Deserialization(format!(
                "invalid frame kind: {other:#04x}"
            ))),
        }
    }

    /// Wire byte for this kind.
    #[inline]
    pub fn as_byte(self) -> u8 {
        match self {
            FrameKind::Data => 0,
            FrameKind::Control => 1,
        }
    }
}

/// A frame containing a kind marker and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Control or data.
    pub kind: FrameKind,
    /// The payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a data frame.
    pub fn data(payload: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Data,
            payload,
        }
    }

    /// Create a control frame.
    pub fn control(payload: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Control,
            payload,
        }
    }
}

/// Encoder and decoder for frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new frame codec.
    pub fn new() -> Self {
        Self
    }

    /// Encode a frame into bytes.
    ///
    /// The frame format is:
    /// - 4 bytes: magic "TETH"
    /// - 4 bytes: length of (kind + payload) in big-endian
    /// - 1 byte: kind
    /// - N bytes: payload
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        let payload = &frame.payload;

        if payload.len() > MAX_FRAME_SIZE - FRAME_HEADER_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len() + FRAME_HEADER_SIZE,
                max: MAX_FRAME_SIZE,
            });
        }

        // Content length counts the kind byte plus the payload
        let content_len = 1 + payload.len();

        let mut output = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        output.extend_from_slice(&FRAME_MAGIC);
        output.extend_from_slice(&(content_len as u32).to_be_bytes());
        output.push(frame.kind.as_byte());
        output.extend_from_slice(payload);

        Ok(output)
    }

    /// Decode a frame from bytes.
    ///
    /// Returns the decoded frame and the number of bytes consumed.
    pub fn decode(&self, data: &[u8]) -> Result<(Frame, usize)> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::Deserialization(format!(
                "insufficient data for frame header: need {} bytes, have {}",
                FRAME_HEADER_SIZE,
                data.len()
            )));
        }

        self.validate_prefix(data)?;

        let length_bytes: [u8; 4] = data[4..8].try_into().unwrap();
        let content_len = u32::from_be_bytes(length_bytes) as usize;

        if data.len() < 8 + content_len {
            return Err(ProtocolError::Deserialization(format!(
                "insufficient data for frame: need {} bytes, have {}",
                8 + content_len,
                data.len()
            )));
        }

        if content_len < 1 {
            return Err(ProtocolError::Deserialization(
                "invalid frame: content length must be at least 1 for kind byte".to_string(),
            ));
        }

        let kind = FrameKind::from_byte(data[8])?;
        let payload = data[9..8 + content_len].to_vec();

        Ok((Frame { kind, payload }, 8 + content_len))
    }

    /// Try to decode a frame from bytes, returning None if there isn't enough data.
    ///
    /// This is the entry point for streaming decode over an accumulation
    /// buffer: partial input is not an error, but bad magic or an oversized
    /// length claim is reported eagerly.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Frame, usize)>> {
        if data.len() < FRAME_HEADER_SIZE {
            // A corrupt magic should not wait for more bytes
            if data.len() >= 4 {
                self.check_magic(data)?;
            }
            return Ok(None);
        }

        self.validate_prefix(data)?;

        let length_bytes: [u8; 4] = data[4..8].try_into().unwrap();
        let content_len = u32::from_be_bytes(length_bytes) as usize;

        if data.len() < 8 + content_len {
            return Ok(None);
        }

        self.decode(data).map(Some)
    }

    /// Validate magic and length-claim of a buffer known to hold a header.
    fn validate_prefix(&self, data: &[u8]) -> Result<()> {
        self.check_magic(data)?;

        let length_bytes: [u8; 4] = data[4..8].try_into().unwrap();
        let content_len = u32::from_be_bytes(length_bytes) as usize;

        let total_frame_size = 8 + content_len;
        if total_frame_size > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: total_frame_size,
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(())
    }

    fn check_magic(&self, data: &[u8]) -> Result<()> {
        let magic = &data[0..4];
        if magic != FRAME_MAGIC {
            return Err(ProtocolError::InvalidFrameMagic {
                expected: u32::from_be_bytes(FRAME_MAGIC),
                got: u32::from_be_bytes([magic[0], magic[1], magic[2], magic[3]]),
            });
        }
        Ok(())
    }
}
