//! Handshake state machine, one run per physical connection attempt.
//!
//! The controller drives `AwaitingAuth -> AwaitingConnectionType` and exits
//! `Resolved` with the client's connection-type request, or `Failed` with a
//! typed reason (timeout, lost connection, protocol violation, rejected
//! credentials). A `connectionType` sent before the authenticator has
//! accepted an `auth` message is a protocol violation; the auth step cannot
//! be skipped. A failed attempt is not fatal to the logical session; the
//! client may retry on a fresh physical connection.
//!
//! Constructing the controller attaches the channel's control and close
//! listeners synchronously. Adopt the socket after construction and the
//! client's first message cannot slip past unobserved, however early it
//! arrives. At most one controller may be attached to a channel at a time.

use std::sync::Arc;
use std::time::Duration;

use protocol::{ControlMessage, OpaqueFields, ProtocolError, Result};
use rand::RngCore;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::channel::SessionChannel;

pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

const CHALLENGE_BYTES: usize = 16;

/// A resolved handshake: the payload channel kind the client asked for,
/// plus any extra request members it sent.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionRequest {
    pub value: String,
    pub fields: OpaqueFields,
}

/// Accept/reject decision for an `auth` message. The handshake does not
/// interpret credential material itself.
pub trait Authenticator: Send + Sync {
    /// Returns `Err` with a human-readable reason to reject.
    fn verify(&self, fields: &OpaqueFields, challenge: &str)
        -> std::result::Result<(), String>;
}

/// Accepts every `auth` message. The default until a deployment supplies
/// real credential checking.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissiveAuthenticator;

impl Authenticator for PermissiveAuthenticator {
    fn verify(&self, _fields: &OpaqueFields, _challenge: &str)
        -> std::result::Result<(), String> {
        Ok(())
    }
}

impl<T: Authenticator + ?Sized> Authenticator for Arc<T> {
    fn verify(&self, fields: &OpaqueFields, challenge: &str)
        -> std::result::Result<(), String> {
        (**self).verify(fields, challenge)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakePhase {
    AwaitingAuth,
    AwaitingConnectionType,
    Resolved,
    Failed,
}

/// Drives the handshake over an already-constructed session channel.
pub struct HandshakeController<A> {
    channel: Arc<SessionChannel>,
    authenticator: A,
    timeout: Duration,
    challenge: String,
    control_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    close_rx: mpsc::UnboundedReceiver<()>,
}

impl<A: Authenticator> HandshakeController<A> {
    /// Attach to `channel` and prepare a fresh challenge. Takes over the
    /// channel's control and close listener slots immediately.
    pub fn new(channel: Arc<SessionChannel>, authenticator: A, timeout: Duration) -> Self {
        let control_rx = channel.listen_control();
        let close_rx = channel.listen_close();
        Self {
            channel,
            authenticator,
            timeout,
            challenge: generate_challenge(),
            control_rx,
            close_rx,
        }
    }

    /// Run the handshake to a terminal state. Cleanup (listener detach,
    /// timer cancel) happens exactly once, on every exit path alike.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<ConnectionRequest> {
        let outcome = self.event_loop(&cancel).await;

        self.channel.clear_control_listener();
        self.channel.clear_close_listener();

        let terminal = match &outcome {
            Ok(request) => {
                debug!(
                    token = %self.channel.token(),
                    connection_type = %request.value,
                    "handshake resolved"
                );
                HandshakePhase::Resolved
            }
            Err(err) => {
                debug!(token = %self.channel.token(), error = %err, "handshake failed");
                HandshakePhase::Failed
            }
        };
        trace!(phase = ?terminal, "handshake finished");
        outcome
    }

    async fn event_loop(&mut self, cancel: &CancellationToken) -> Result<ConnectionRequest> {
        let deadline = Instant::now() + self.timeout;
        let mut phase = HandshakePhase::AwaitingAuth;

        // The client's opening message may already be in flight, so the
        // challenge goes out before waiting on anything.
        self.send_challenge()?;

        loop {
            tokio::select! {
                payload = self.control_rx.recv() => {
                    let Some(payload) = payload else {
                        return Err(ProtocolError::ConnectionLost);
                    };
                    if let Some(request) = self.handle_message(&mut phase, payload)? {
                        return Ok(request);
                    }
                }
                _ = self.close_rx.recv() => {
                    return Err(ProtocolError::ConnectionLost);
                }
                _ = sleep_until(deadline) => {
                    return Err(ProtocolError::Timeout(format!(
                        "handshake not resolved within {:?} (phase {phase:?})",
                        self.timeout
                    )));
                }
                _ = cancel.cancelled() => {
                    return Err(ProtocolError::ConnectionLost);
                }
            }
        }
    }

    fn handle_message(
        &self,
        phase: &mut HandshakePhase,
        payload: Vec<u8>,
    ) -> Result<Option<ConnectionRequest>> {
        let msg = match ControlMessage::from_json(&payload) {
            Ok(msg) => msg,
            Err(err) => {
                return Err(ProtocolError::ProtocolViolation {
                    reason: err.to_string(),
                    payload,
                });
            }
        };

        match msg {
            ControlMessage::Auth { fields } => {
                if let Err(reason) = self.authenticator.verify(&fields, &self.challenge) {
                    return Err(ProtocolError::AuthRejected(reason));
                }
                // Re-issue the challenge: a client that connected before
                // our listener attached may have missed the first one.
                self.send_challenge()?;
                trace!(phase = ?phase, "auth accepted");
                *phase = HandshakePhase::AwaitingConnectionType;
                Ok(None)
            }
            ControlMessage::ConnectionType { value, fields } => {
                // The authenticator must have passed judgement first; a
                // client cannot skip straight to the request.
                if *phase == HandshakePhase::AwaitingAuth {
                    return Err(ProtocolError::ProtocolViolation {
                        reason: "connectionType received before auth".to_string(),
                        payload,
                    });
                }
                *phase = HandshakePhase::Resolved;
                Ok(Some(ConnectionRequest { value, fields }))
            }
            other => Err(ProtocolError::ProtocolViolation {
                reason: format!(
                    "unexpected {} message during handshake",
                    other.message_type()
                ),
                payload,
            }),
        }
    }

    fn send_challenge(&self) -> Result<()> {
        self.channel
            .send_control(&ControlMessage::sign(&self.challenge))
            .map_err(|_| ProtocolError::ConnectionLost)
    }
}

fn generate_challenge() -> String {
    let mut bytes = [0u8; CHALLENGE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
