//! # Tether Protocol Library
//!
//! This crate provides the wire-level definitions for the Tether resumable
//! session transport.
//!
//! ## Overview
//!
//! The protocol crate is the foundation of Tether's communication layer,
//! providing:
//!
//! - **Control Messages**: The tagged JSON handshake vocabulary (`auth`,
//!   `sign`, `connectionType`, `error`, `disconnect`)
//! - **Frame Codec**: Length-prefixed framing with a control/data split
//! - **Resumable Compression**: Per-message deflate whose decompressor
//!   state can be recorded and replayed into a successor socket
//! - **Error Types**: One error enum shared by every layer
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │      Control / Data Payloads            │  JSON / opaque bytes
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  Length-prefixed, kind byte
//! ├─────────────────────────────────────────┤
//! │      Per-Message Deflate (optional)     │  Sync-flushed, seedable
//! ├─────────────────────────────────────────┤
//! │      Transport (TCP / WebSocket)        │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ControlMessage, Frame, FrameCodec, FrameKind};
//!
//! // Build the opening handshake challenge
//! let sign = ControlMessage::sign("a1b2c3d4");
//! let payload = sign.to_json().unwrap();
//!
//! // Wrap it in a control frame for transport
//! let codec = FrameCodec::new();
//! let frame_bytes = codec.encode(&Frame::control(payload)).unwrap();
//!
//! // The receiving side decodes from an accumulation buffer
//! let (frame, consumed) = codec.decode(&frame_bytes).unwrap();
//! assert_eq!(frame.kind, FrameKind::Control);
//! assert_eq!(consumed, frame_bytes.len());
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Handshake control message definitions
//! - [`framing`]: Frame codec with the control/data split
//! - [`deflate`]: Seedable streaming compression state
//! - [`error`]: Error types

pub mod deflate;
pub mod error;
pub mod framing;
pub mod messages;

pub use deflate::{MessageDeflater, MessageInflater, DEFLATE_TRAILER};
pub use error::{ProtocolError, Result};
pub use framing::{Frame, FrameCodec, FrameKind, FRAME_HEADER_SIZE, FRAME_MAGIC, MAX_FRAME_SIZE};
pub use messages::{ConnectHeader, ControlMessage, OpaqueFields};
