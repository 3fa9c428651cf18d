//! # Tether Daemon Library
//!
//! This crate provides the daemon (server) side of Tether, a session
//! layer that keeps logical connections alive across transport drops.
//!
//! ## Overview
//!
//! The daemon accepts raw TCP and WebSocket clients on a single port and
//! wraps each in a resumable session. It provides:
//!
//! - **Transport Sockets**: Raw TCP and WebSocket framing behind one interface
//! - **Session Channels**: Control/data split with ordered buffering across reconnects
//! - **Handshake Controller**: Challenge auth and connection-type resolution
//! - **Session Registry**: Token-indexed lookup, reconnect claims, expiry sweeps
//! - **Session Server**: Accept loop, transport sniffing, session adoption
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Session Server                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────────┐       ┌────────────────────────────────┐  │
//! │  │    Handshake     │       │        Session Registry        │  │
//! │  │    Controller    │       │   (token → session channel)    │  │
//! │  └──────────────────┘       └────────────────────────────────┘  │
//! │                                                                  │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                     Session Channels                       │ │
//! │  │        (buffering, close notices, socket adoption)         │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! │                                                                  │
//! │  ┌───────────────────┐  ┌───────────────────────────────────┐  │
//! │  │   Raw Transport   │  │        WebSocket Transport        │  │
//! │  └───────────────────┘  └───────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, EchoHandler, SessionServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Load or fall back to default configuration
//!     let config = Config::load_default()?;
//!     config.validate()?;
//!
//!     let server = SessionServer::bind(
//!         &config.server.listen_addr,
//!         EchoHandler,
//!         config.server_options(),
//!     )
//!     .await?;
//!
//!     // Serves until the cancellation token fires
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`socket`]: Transport socket over raw TCP or WebSocket
//! - [`channel`]: Persistent session channel with reconnect buffering
//! - [`handshake`]: Connection handshake state machine
//! - [`registry`]: Token-indexed session registry
//! - [`connection`]: Connection handler trait and built-ins
//! - [`server`]: TCP accept loop and session establishment

pub mod channel;
pub mod config;
pub mod connection;
pub mod handshake;
pub mod registry;
pub mod server;
pub mod socket;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::{Config, ConfigError};

// Re-export socket types for convenience
pub use socket::{SocketOptions, SocketReader, SocketWriter, TransportSocket};

// Re-export channel types for convenience
pub use channel::{ChannelConfig, DetachedSocket, RejectedSocket, SessionChannel};

// Re-export handshake types for convenience
pub use handshake::{
    Authenticator, ConnectionRequest, HandshakeController, PermissiveAuthenticator,
    DEFAULT_HANDSHAKE_TIMEOUT_MS,
};

// Re-export registry types for convenience
pub use registry::SessionRegistry;

// Re-export connection types for convenience
pub use connection::{ConnectionHandler, EchoHandler};

// Re-export server types for convenience
pub use server::{ServerOptions, SessionServer};
