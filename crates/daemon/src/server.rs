//! TCP accept loop and connection establishment.
//!
//! The server listens on one TCP port and sniffs each connection: an HTTP
//! `GET` means a WebSocket upgrade carrying its options as query
//! parameters, anything else is a raw stream opening with one
//! newline-terminated JSON header. Either way the connection lands in a
//! [`TransportSocket`] and runs the same handshake.
//!
//! Every handshake runs on a scratch channel. Fresh sessions keep it and
//! enter the registry; a reconnect first retires whatever socket the
//! claimed session still holds, then detaches the authenticated socket and
//! offers it to the session, whose generation check settles races between
//! simultaneous reconnect attempts.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use protocol::{ConnectHeader, ControlMessage, Frame, FrameCodec, ProtocolError, Result};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{ChannelConfig, SessionChannel};
use crate::connection::ConnectionHandler;
use crate::handshake::{
    Authenticator, ConnectionRequest, HandshakeController, PermissiveAuthenticator,
    DEFAULT_HANDSHAKE_TIMEOUT_MS,
};
use crate::registry::SessionRegistry;
use crate::socket::{SocketOptions, TransportSocket};

/// How long a dropped session may wait for its client to come back.
const DEFAULT_RECONNECT_GRACE_SECS: u64 = 300;

/// How often the registry sweeps for expired sessions.
const DEFAULT_REAPER_INTERVAL_SECS: u64 = 30;

/// Upper bound on the raw-mode connect header line.
const MAX_HEADER_LINE: usize = 8192;

/// Grace for in-flight teardown writes after the accept loop stops.
const SHUTDOWN_DRAIN_MS: u64 = 200;

/// Tunables fixed at server construction.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Budget for connection establishment, and again for the handshake.
    pub handshake_timeout: Duration,
    /// Keepalive settings applied to every session channel.
    pub channel: ChannelConfig,
    /// How long a disconnected session survives awaiting a reconnect.
    pub reconnect_grace: Duration,
    /// Sweep period for expired sessions.
    pub reaper_interval: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            channel: ChannelConfig::default(),
            reconnect_grace: Duration::from_secs(DEFAULT_RECONNECT_GRACE_SECS),
            reaper_interval: Duration::from_secs(DEFAULT_REAPER_INTERVAL_SECS),
        }
    }
}

impl ServerOptions {
    /// Sets the establishment and handshake budget.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets how long a disconnected session waits for its client.
    pub fn with_reconnect_grace(mut self, grace: Duration) -> Self {
        self.reconnect_grace = grace;
        self
    }

    /// Sets the sweep period for expired sessions.
    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// Sets the keepalive probe interval and pong deadline.
    pub fn with_keepalive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.channel = ChannelConfig {
            keepalive_interval: interval,
            keepalive_timeout: timeout,
        };
        self
    }
}

/// Accepts connections and runs each one through establishment, handshake,
/// and the configured payload handler.
pub struct SessionServer<H> {
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    handler: Arc<H>,
    authenticator: Arc<dyn Authenticator>,
    options: ServerOptions,
    cancel: CancellationToken,
}

impl<H: ConnectionHandler + 'static> SessionServer<H> {
    /// Bind to `addr`. Credential checks default to accept-all; see
    /// [`Self::with_authenticator`].
    pub async fn bind(addr: &str, handler: H, options: ServerOptions) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "session server listening");
        Ok(Self {
            listener,
            registry: Arc::new(SessionRegistry::new()),
            handler: Arc::new(handler),
            authenticator: Arc::new(PermissiveAuthenticator),
            options,
            cancel: CancellationToken::new(),
        })
    }

    /// Replaces the accept-all authenticator.
    pub fn with_authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.authenticator = Arc::new(authenticator);
        self
    }

    /// The bound address; useful after binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle to the session registry.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Token that stops the accept loop and every session when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Serve until the cancellation token fires, then notify and destroy
    /// every live session.
    pub async fn run(self) -> Result<()> {
        self.registry
            .start_reaper_task(self.options.reaper_interval, self.options.reconnect_grace);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    debug!(%peer, "inbound connection");
                    let registry = Arc::clone(&self.registry);
                    let handler = Arc::clone(&self.handler);
                    let authenticator = Arc::clone(&self.authenticator);
                    let options = self.options.clone();
                    let cancel = self.cancel.clone();
                    tokio::spawn(async move {
                        let outcome = handle_connection(
                            stream,
                            registry,
                            handler,
                            authenticator,
                            options,
                            cancel,
                        )
                        .await;
                        if let Err(e) = outcome {
                            debug!(%peer, error = %e, "connection ended");
                        }
                    });
                }
                _ = self.cancel.cancelled() => break,
            }
        }

        info!("session server shutting down");
        self.registry.destroy_all("server shutting down");
        sleep(Duration::from_millis(SHUTDOWN_DRAIN_MS)).await;
        Ok(())
    }
}

/// A reconnect attempt's target, captured while the socket was being
/// established. The generation is re-checked at adoption.
struct ReconnectClaim {
    channel: Arc<SessionChannel>,
    expected_generation: u64,
}

/// An accepted connection after transport negotiation but before the
/// handshake.
struct Established {
    socket: TransportSocket,
    options: SocketOptions,
    residue: Vec<u8>,
    claim: Option<ReconnectClaim>,
}

async fn handle_connection<H: ConnectionHandler + 'static>(
    stream: TcpStream,
    registry: Arc<SessionRegistry>,
    handler: Arc<H>,
    authenticator: Arc<dyn Authenticator>,
    options: ServerOptions,
    cancel: CancellationToken,
) -> Result<()> {
    let established = timeout(options.handshake_timeout, establish(stream, &registry))
        .await
        .map_err(|_| ProtocolError::Timeout("connection establishment".into()))??;

    let token = established.options.reconnection_token.clone();
    let staging = Arc::new(SessionChannel::new(token.clone(), options.channel.clone()));
    let controller = HandshakeController::new(
        Arc::clone(&staging),
        Arc::clone(&authenticator),
        options.handshake_timeout,
    );
    if let Err(rejected) = staging.adopt_socket(0, established.socket, established.residue) {
        return Err(rejected.error);
    }
    let claim = established.claim;

    let request = match controller.run(cancel.clone()).await {
        Ok(request) => request,
        Err(err) => {
            let reason = match &err {
                ProtocolError::ConnectionLost => None,
                other => Some(other.to_string()),
            };
            match claim {
                // The attempt may have consumed part of the client's
                // compressed stream; the claimed session needs the
                // extended inflate record before the socket goes away.
                Some(claim) => abandon_resume(staging, claim, reason.as_deref()).await,
                None => staging.destroy(reason.as_deref()),
            }
            return Err(err);
        }
    };

    match claim {
        Some(claim) => {
            // The session keeps the handler it resolved at first connect;
            // the repeated connectionType only re-proves the client.
            debug!(%token, connection_type = %request.value, "reconnect handshake resolved");
            resume_session(staging, claim, &token).await
        }
        None => {
            if request.value != handler.connection_type() {
                let reason = format!("unsupported connection type: {}", request.value);
                staging.destroy(Some(&reason));
                return Err(ProtocolError::ProtocolViolation {
                    reason,
                    payload: Vec::new(),
                });
            }
            if let Err(err) = registry.register(Arc::clone(&staging)) {
                warn!(%token, "rejected duplicate token for a fresh session");
                staging.destroy(Some(&err.to_string()));
                return Err(err);
            }
            info!(%token, connection_type = %request.value, "session established");
            run_session(staging, handler, request, cancel, registry).await
        }
    }
}

/// A reconnect attempt failed after its staging socket may have consumed
/// part of the client's compressed stream. Hand the extended inflate record
/// back to the claimed session so the client's next attempt still finds a
/// matching seed, then notify the peer and close.
async fn abandon_resume(
    staging: Arc<SessionChannel>,
    claim: ReconnectClaim,
    reason: Option<&str>,
) {
    match staging.detach_socket().await {
        Ok(mut detached) => {
            if let Some(record) = detached.socket.recorded_inflate_bytes() {
                claim
                    .channel
                    .store_retired_record(claim.expected_generation, record.to_vec());
            }
            if let Some(reason) = reason {
                write_control(&mut detached.socket, &ControlMessage::error(reason)).await;
            }
            write_control(&mut detached.socket, &ControlMessage::Disconnect).await;
            let _ = detached.socket.close().await;
            staging.destroy(None);
        }
        Err(_) => {
            // The staging socket was already lost; its reader parked the
            // record on the staging channel.
            let (_, record) = staging.reconnect_snapshot();
            if let Some(record) = record {
                claim
                    .channel
                    .store_retired_record(claim.expected_generation, record);
            }
            staging.destroy(reason.as_deref());
        }
    }
}

/// Attach a freshly authenticated socket to the session that claimed it.
async fn resume_session(
    staging: Arc<SessionChannel>,
    claim: ReconnectClaim,
    token: &str,
) -> Result<()> {
    let detached = staging.detach_socket().await?;

    // Frames the staging reader decoded after the handshake resolved belong
    // to the resumed session: control notices held for the next listener
    // and early payload frames alike. Re-encoding them ahead of the
    // undecoded residue reproduces the arrival byte stream.
    let codec = FrameCodec::new();
    let mut residue = Vec::new();
    for payload in staging.drain_inbound_control() {
        residue.extend_from_slice(&codec.encode(&Frame::control(payload))?);
    }
    for payload in staging.drain_inbound_data() {
        residue.extend_from_slice(&codec.encode(&Frame::data(payload))?);
    }
    residue.extend_from_slice(&detached.residue);
    staging.dispose();

    match claim
        .channel
        .adopt_socket(claim.expected_generation, detached.socket, residue)
    {
        Ok(()) => {
            info!(%token, "session resumed");
            Ok(())
        }
        Err(mut rejected) => {
            warn!(%token, error = %rejected.error, "reconnect refused at adoption");
            let notice = match &rejected.error {
                // Destroyed while the handshake ran, likely reaped
                ProtocolError::SocketClosed => "session expired".to_string(),
                other => other.to_string(),
            };
            refuse(&mut rejected.socket, &notice).await;
            Err(rejected.error)
        }
    }
}

/// What ended the session's control stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlOutcome {
    /// The client sent a `disconnect` notice.
    Disconnect,
    /// The stream closed without one.
    Closed,
}

async fn watch_session_control(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> ControlOutcome {
    while let Some(payload) = rx.recv().await {
        match ControlMessage::from_json(&payload) {
            Ok(ControlMessage::Disconnect) => return ControlOutcome::Disconnect,
            Ok(other) => debug!(
                message_type = other.message_type(),
                "ignoring mid-session control message"
            ),
            Err(e) => debug!(error = %e, "undecodable mid-session control payload"),
        }
    }
    ControlOutcome::Closed
}

/// Drive the payload handler for the life of the logical session.
async fn run_session<H: ConnectionHandler>(
    channel: Arc<SessionChannel>,
    handler: Arc<H>,
    request: ConnectionRequest,
    cancel: CancellationToken,
    registry: Arc<SessionRegistry>,
) -> Result<()> {
    let token = channel.token().to_string();
    let mut control_rx = channel.listen_control();

    tokio::select! {
        outcome = watch_session_control(&mut control_rx) => {
            registry.remove(&token);
            if outcome == ControlOutcome::Disconnect {
                debug!(%token, "client ended the session");
            }
            channel.destroy(None);
            Ok(())
        }
        result = handler.run(Arc::clone(&channel), request, cancel.clone()) => {
            if cancel.is_cancelled() {
                // The registry-wide teardown owns shutdown messaging
                return Ok(());
            }
            registry.remove(&token);
            match result {
                Ok(()) => {
                    debug!(%token, "handler finished");
                    channel.destroy(None);
                    Ok(())
                }
                Err(err) => {
                    warn!(%token, error = %err, "handler failed");
                    channel.destroy(Some(&err.to_string()));
                    Err(err)
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Establishment
// ---------------------------------------------------------------------------

/// Sniff the transport, negotiate it, and resolve any reconnect claim.
async fn establish(stream: TcpStream, registry: &SessionRegistry) -> Result<Established> {
    let mut probe = [0u8; 4];
    loop {
        let n = stream.peek(&mut probe).await?;
        if n >= probe.len() {
            break;
        }
        if n == 0 {
            return Err(ProtocolError::SocketClosed);
        }
        // Partial first packet; wait for the rest
        sleep(Duration::from_millis(5)).await;
    }

    if &probe == b"GET " {
        establish_framed(stream, registry).await
    } else {
        establish_raw(stream, registry).await
    }
}

/// Upgrade to WebSocket and read the connection options from the request
/// query string.
async fn establish_framed(stream: TcpStream, registry: &SessionRegistry) -> Result<Established> {
    let mut query: Option<String> = None;
    let ws = tokio_tungstenite::accept_hdr_async(
        stream,
        |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
            query = request.uri().query().map(str::to_owned);
            Ok(response)
        },
    )
    .await
    .map_err(|e| ProtocolError::SocketError(format!("websocket upgrade failed: {e}")))?;

    let mut options = parse_query(query.as_deref().unwrap_or(""));

    if options.reconnection_token.is_empty() {
        let mut socket = TransportSocket::framed(ws, &options)?;
        refuse(&mut socket, "missing reconnection token").await;
        return Err(ProtocolError::ProtocolViolation {
            reason: "missing reconnection token".into(),
            payload: Vec::new(),
        });
    }

    let claim = if options.reconnection {
        match registry.lookup(&options.reconnection_token) {
            Some(channel) => {
                // A half-open predecessor is retired first so the snapshot
                // reflects its surrendered inflate record. Generation and
                // seed are captured together; a stale pair loses the
                // adoption race instead of desyncing.
                channel.retire_socket().await;
                let (expected_generation, seed) = channel.reconnect_snapshot();
                options.seed_inflate_bytes = seed;
                Some(ReconnectClaim {
                    channel,
                    expected_generation,
                })
            }
            None => {
                let token = options.reconnection_token.clone();
                let mut socket = TransportSocket::framed(ws, &options)?;
                refuse(&mut socket, "unknown session").await;
                return Err(ProtocolError::UnknownSession { token });
            }
        }
    } else {
        None
    };

    let socket = TransportSocket::framed(ws, &options)?;
    Ok(Established {
        socket,
        options,
        residue: Vec::new(),
        claim,
    })
}

/// Read the raw-mode connect header line; bytes past the newline are frame
/// data and come back as residue.
async fn establish_raw(mut stream: TcpStream, registry: &SessionRegistry) -> Result<Established> {
    let mut buf: Vec<u8> = Vec::with_capacity(256);
    let newline = loop {
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            break pos;
        }
        if buf.len() > MAX_HEADER_LINE {
            let mut socket = TransportSocket::raw(stream);
            refuse(&mut socket, "connection header too long").await;
            return Err(ProtocolError::ProtocolViolation {
                reason: "connection header too long".into(),
                payload: Vec::new(),
            });
        }
        let mut chunk = [0u8; 256];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProtocolError::SocketClosed);
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let residue = buf.split_off(newline + 1);
    let header = match ConnectHeader::from_line(&buf) {
        Ok(header) => header,
        Err(e) => {
            let mut socket = TransportSocket::raw(stream);
            refuse(&mut socket, "invalid connection header").await;
            return Err(ProtocolError::ProtocolViolation {
                reason: format!("invalid connection header: {e}"),
                payload: buf,
            });
        }
    };

    if header.reconnection_token.is_empty() {
        let mut socket = TransportSocket::raw(stream);
        refuse(&mut socket, "missing reconnection token").await;
        return Err(ProtocolError::ProtocolViolation {
            reason: "missing reconnection token".into(),
            payload: Vec::new(),
        });
    }

    let claim = if header.reconnection {
        match registry.lookup(&header.reconnection_token) {
            Some(channel) => {
                // Same fencing as the framed path: a half-open predecessor
                // surrenders its queue before the generation is captured.
                channel.retire_socket().await;
                let (expected_generation, _) = channel.reconnect_snapshot();
                Some(ReconnectClaim {
                    channel,
                    expected_generation,
                })
            }
            None => {
                let mut socket = TransportSocket::raw(stream);
                refuse(&mut socket, "unknown session").await;
                return Err(ProtocolError::UnknownSession {
                    token: header.reconnection_token,
                });
            }
        }
    } else {
        None
    };

    let options = SocketOptions {
        reconnection_token: header.reconnection_token,
        reconnection: header.reconnection,
        skip_framing: true,
        enable_compression: false,
        seed_inflate_bytes: None,
    };
    Ok(Established {
        socket: TransportSocket::raw(stream),
        options,
        residue,
        claim,
    })
}

/// Query parameters accepted on the WebSocket upgrade path.
fn parse_query(query: &str) -> SocketOptions {
    let mut options = SocketOptions::default();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "reconnectionToken" => options.reconnection_token = value.into_owned(),
            "reconnection" => options.reconnection = value == "true",
            "compression" => options.enable_compression = value == "true",
            _ => {}
        }
    }
    options
}

/// Best-effort control write straight to a socket outside any channel.
async fn write_control(socket: &mut TransportSocket, msg: &ControlMessage) {
    let codec = FrameCodec::new();
    if let Ok(payload) = msg.to_json() {
        if let Ok(bytes) = codec.encode(&Frame::control(payload)) {
            let _ = socket.write(&bytes).await;
        }
    }
}

/// Tell the peer why it is being turned away, then close. Best-effort.
async fn refuse(socket: &mut TransportSocket, reason: &str) {
    write_control(socket, &ControlMessage::error(reason)).await;
    let _ = socket.close().await;
}
