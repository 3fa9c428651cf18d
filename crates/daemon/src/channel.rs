//! Persistent session channel over replaceable physical sockets.
//!
//! A [`SessionChannel`] outlives the sockets beneath it. Outbound traffic is
//! frame-encoded and handed to the current socket's pump task; while no
//! socket is attached, encoded frames queue in order and flush as soon as
//! the next socket is adopted, before anything sent after the adoption.
//! Inbound frames are decoded by a reader task and dispatched to the
//! control or data listener slot; frames arriving while a slot is empty
//! are held and delivered to the next listener in arrival order.
//!
//! Each attached socket runs exactly one pump task (writes, keepalive) and
//! one reader task (reads, frame decode). Socket replacement is guarded by
//! a generation counter: an adoption carrying a stale expected generation
//! lost a reconnect race and is rejected with `DuplicateReconnection`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use protocol::{ControlMessage, Frame, FrameCodec, FrameKind, ProtocolError, Result};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::socket::{SocketReader, SocketWriter, TransportSocket};

const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 30;
const DEFAULT_KEEPALIVE_TIMEOUT_SECS: u64 = 10;

/// Tuning for a channel's socket pumps.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// How often framed sockets are pinged.
    pub keepalive_interval: Duration,
    /// Grace beyond the interval before a silent peer counts as lost.
    pub keepalive_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(DEFAULT_KEEPALIVE_INTERVAL_SECS),
            keepalive_timeout: Duration::from_secs(DEFAULT_KEEPALIVE_TIMEOUT_SECS),
        }
    }
}

/// A socket handed back by [`SessionChannel::detach_socket`], together with
/// bytes that were read but not yet decoded into a frame.
#[derive(Debug)]
pub struct DetachedSocket {
    pub socket: TransportSocket,
    pub residue: Vec<u8>,
}

/// An adoption refusal. The socket comes back untouched so the caller can
/// tell the peer why before closing it.
#[derive(Debug)]
pub struct RejectedSocket {
    pub error: ProtocolError,
    pub socket: TransportSocket,
    pub residue: Vec<u8>,
}

enum PumpCommand {
    /// An encoded frame to write.
    Send(Vec<u8>),
    /// Stop both tasks and hand the reassembled socket back.
    Detach(oneshot::Sender<DetachedSocket>),
    /// Close the socket; queued writes flush best-effort, or requeue when
    /// the pump was halted.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderStop {
    Run,
    Detach,
    Closed,
}

struct PumpHandle {
    generation: u64,
    cmd_tx: mpsc::UnboundedSender<PumpCommand>,
    /// Raised when the socket is presumed dead or being replaced; the pump
    /// stops writing and diverts queued sends to the requeue path.
    halt: Arc<AtomicBool>,
}

struct Inner {
    generation: u64,
    pump: Option<PumpHandle>,
    /// Encoded frames awaiting a socket, oldest first.
    pending: VecDeque<Vec<u8>>,
    /// Control payloads received while no control listener was attached.
    inbound_control: VecDeque<Vec<u8>>,
    /// Data payloads received while no data listener was attached.
    inbound_data: VecDeque<Vec<u8>>,
    /// Inflate record of the most recently lost socket.
    retired_inflate: Option<Vec<u8>>,
    control_listener: Option<mpsc::UnboundedSender<Vec<u8>>>,
    data_listener: Option<mpsc::UnboundedSender<Vec<u8>>>,
    close_listener: Option<mpsc::UnboundedSender<()>>,
    disconnected_at: Option<Instant>,
    disposed: bool,
    destroyed: bool,
}

/// A logical session surviving physical socket interruptions.
pub struct SessionChannel {
    token: String,
    config: ChannelConfig,
    codec: FrameCodec,
    inner: Mutex<Inner>,
}

impl SessionChannel {
    /// Create a channel with no socket attached.
    pub fn new(token: impl Into<String>, config: ChannelConfig) -> Self {
        Self {
            token: token.into(),
            config,
            codec: FrameCodec::new(),
            inner: Mutex::new(Inner {
                generation: 0,
                pump: None,
                pending: VecDeque::new(),
                inbound_control: VecDeque::new(),
                inbound_data: VecDeque::new(),
                retired_inflate: None,
                control_listener: None,
                data_listener: None,
                close_listener: None,
                disconnected_at: None,
                disposed: false,
                destroyed: false,
            }),
        }
    }

    /// The reconnection token this channel is registered under.
    pub fn token(&self) -> &str {
        &self.token
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Send a control message. Queues while no socket is attached; never
    /// blocks the caller past frame encoding.
    pub fn send_control(&self, msg: &ControlMessage) -> Result<()> {
        let payload = msg.to_json().map_err(ProtocolError::from)?;
        self.send_frame(Frame::control(payload))
    }

    /// Send opaque application payload, same queueing rules as control.
    pub fn send_data(&self, payload: &[u8]) -> Result<()> {
        self.send_frame(Frame::data(payload.to_vec()))
    }

    /// Best-effort disconnect notice; failures are swallowed.
    pub fn send_disconnect(&self) {
        if let Err(err) = self.send_control(&ControlMessage::Disconnect) {
            debug!(token = %self.token, error = %err, "disconnect notice not sent");
        }
    }

    fn send_frame(&self, frame: Frame) -> Result<()> {
        let bytes = self.codec.encode(&frame)?;
        let mut inner = self.lock();
        if inner.destroyed {
            return Err(ProtocolError::SocketClosed);
        }
        match &inner.pump {
            Some(handle) => handle
                .cmd_tx
                .send(PumpCommand::Send(bytes))
                .map_err(|_| ProtocolError::SocketClosed),
            None => {
                inner.pending.push_back(bytes);
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Listener slots
    // -----------------------------------------------------------------------

    /// Register the control listener, replacing any previous one. Received
    /// values are raw control payload bytes. Payloads that arrived while no
    /// listener was attached are delivered first, in arrival order. On a
    /// destroyed channel the returned receiver is already closed.
    pub fn listen_control(&self) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        if !inner.destroyed {
            for payload in inner.inbound_control.drain(..) {
                let _ = tx.send(payload);
            }
            inner.control_listener = Some(tx);
        }
        rx
    }

    /// Clear the control listener slot.
    pub fn clear_control_listener(&self) {
        self.lock().control_listener = None;
    }

    /// Register the data listener, replacing any previous one. Data
    /// payloads that arrived before any listener attached are delivered
    /// first, in arrival order. On a destroyed channel the returned
    /// receiver is already closed.
    pub fn listen_data(&self) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        if !inner.destroyed {
            for payload in inner.inbound_data.drain(..) {
                let _ = tx.send(payload);
            }
            inner.data_listener = Some(tx);
        }
        rx
    }

    /// Clear the data listener slot.
    pub fn clear_data_listener(&self) {
        self.lock().data_listener = None;
    }

    /// Take the control payloads held for a not-yet-attached listener,
    /// oldest first. Used when a channel is retired before any listener
    /// claims them, so the payloads can follow the socket elsewhere.
    pub fn drain_inbound_control(&self) -> Vec<Vec<u8>> {
        self.lock().inbound_control.drain(..).collect()
    }

    /// Take the data payloads held for a not-yet-attached listener, oldest
    /// first. Same role as [`Self::drain_inbound_control`], for the payload
    /// plane.
    pub fn drain_inbound_data(&self) -> Vec<Vec<u8>> {
        self.lock().inbound_data.drain(..).collect()
    }

    /// Register the close listener. Fires exactly once per physical socket
    /// loss; a loss does not imply the logical session is dead. On a
    /// destroyed channel the returned receiver is already closed.
    pub fn listen_close(&self) -> mpsc::UnboundedReceiver<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        if !inner.destroyed {
            inner.close_listener = Some(tx);
        }
        rx
    }

    /// Clear the close listener slot.
    pub fn clear_close_listener(&self) {
        self.lock().close_listener = None;
    }

    /// Number of occupied listener slots.
    pub fn listener_count(&self) -> usize {
        let inner = self.lock();
        [
            inner.control_listener.is_some(),
            inner.data_listener.is_some(),
            inner.close_listener.is_some(),
        ]
        .iter()
        .filter(|occupied| **occupied)
        .count()
    }

    // -----------------------------------------------------------------------
    // Socket lifecycle
    // -----------------------------------------------------------------------

    /// Whether a physical socket is currently attached.
    pub fn is_attached(&self) -> bool {
        self.lock().pump.is_some()
    }

    /// When the last socket was lost, if currently detached.
    pub fn disconnected_since(&self) -> Option<Instant> {
        self.lock().disconnected_at
    }

    /// Current socket generation. Bumped on every adoption.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Atomically capture what a reconnect attempt needs: the generation to
    /// present at adoption and the retired socket's inflate record.
    pub fn reconnect_snapshot(&self) -> (u64, Option<Vec<u8>>) {
        let inner = self.lock();
        (inner.generation, inner.retired_inflate.clone())
    }

    /// Adopt a new physical socket. `expected_generation` must match the
    /// value captured when the reconnect attempt began; a mismatch means
    /// another socket won the race. Pending frames flush to the new socket
    /// ahead of anything sent afterwards. A refused socket is returned to
    /// the caller unharmed.
    pub fn adopt_socket(
        self: &Arc<Self>,
        expected_generation: u64,
        socket: TransportSocket,
        residue: Vec<u8>,
    ) -> std::result::Result<(), RejectedSocket> {
        let (generation, cmd_rx, halt) = {
            let mut inner = self.lock();
            if inner.destroyed {
                return Err(RejectedSocket {
                    error: ProtocolError::SocketClosed,
                    socket,
                    residue,
                });
            }
            if inner.generation != expected_generation {
                return Err(RejectedSocket {
                    error: ProtocolError::DuplicateReconnection {
                        token: self.token.clone(),
                    },
                    socket,
                    residue,
                });
            }
            // A half-open predecessor is halted so its queued frames
            // requeue instead of vanishing into the dead socket
            if let Some(old) = inner.pump.take() {
                old.halt.store(true, Ordering::Release);
                let _ = old.cmd_tx.send(PumpCommand::Close);
            }
            inner.generation += 1;
            let generation = inner.generation;

            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            for bytes in inner.pending.drain(..) {
                let _ = cmd_tx.send(PumpCommand::Send(bytes));
            }
            let halt = Arc::new(AtomicBool::new(false));
            inner.pump = Some(PumpHandle {
                generation,
                cmd_tx,
                halt: halt.clone(),
            });
            inner.disconnected_at = None;
            inner.retired_inflate = None;
            (generation, cmd_rx, halt)
        };

        debug!(token = %self.token, generation, "socket adopted");
        spawn_socket_tasks(self, generation, socket, residue, cmd_rx, halt);
        Ok(())
    }

    /// Detach the current socket for adoption elsewhere, reassembled with
    /// any undecoded read residue. No close event fires.
    pub async fn detach_socket(&self) -> Result<DetachedSocket> {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.lock();
            if inner.destroyed {
                return Err(ProtocolError::SocketClosed);
            }
            let handle = inner.pump.take().ok_or(ProtocolError::SocketClosed)?;
            handle
                .cmd_tx
                .send(PumpCommand::Detach(tx))
                .map_err(|_| ProtocolError::SocketClosed)?;
        }
        rx.await.map_err(|_| ProtocolError::SocketClosed)
    }

    /// Forcibly retire the attached socket ahead of a reconnect adoption:
    /// the pump stops writing immediately, frames it never wrote return to
    /// the pending queue, and the socket's inflate record is surrendered as
    /// seed material. The peer is not notified and no close event fires.
    /// No-op while nothing is attached.
    pub async fn retire_socket(&self) {
        let (tx, rx) = oneshot::channel();
        let generation = {
            let mut inner = self.lock();
            let Some(handle) = inner.pump.take() else {
                return;
            };
            inner.disconnected_at = Some(Instant::now());
            handle.halt.store(true, Ordering::Release);
            let generation = handle.generation;
            if handle.cmd_tx.send(PumpCommand::Detach(tx)).is_err() {
                // Pump already exiting; the loss path keeps the record.
                return;
            }
            generation
        };
        match rx.await {
            Ok(mut detached) => {
                if let Some(record) = detached.socket.recorded_inflate_bytes() {
                    self.store_retired_record(generation, record.to_vec());
                }
                let _ = detached.socket.close().await;
                debug!(token = %self.token, generation, "socket retired for reconnect");
            }
            Err(_) => {
                // Socket died mid-retire; the reader stored the record on
                // its way out.
            }
        }
    }

    /// Tear down channel bookkeeping: listener slots only, not the socket.
    /// The socket stays usable so a caller can push one last control
    /// message before closing.
    pub fn dispose(&self) {
        let mut inner = self.lock();
        inner.control_listener = None;
        inner.data_listener = None;
        inner.close_listener = None;
        inner.disposed = true;
    }

    /// Whether [`Self::dispose`] has run.
    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    /// Whether [`Self::destroy`] has run.
    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    /// Terminate the logical session. With a reason, an `error` control
    /// message is attempted first; a `disconnect` notice follows; write
    /// failures are swallowed and the socket closes regardless.
    pub fn destroy(&self, reason: Option<&str>) {
        let mut inner = self.lock();
        if inner.destroyed {
            return;
        }
        inner.destroyed = true;

        if let Some(handle) = inner.pump.take() {
            if let Some(reason) = reason {
                if let Ok(bytes) = self.encode_control(&ControlMessage::error(reason)) {
                    let _ = handle.cmd_tx.send(PumpCommand::Send(bytes));
                }
            }
            if let Ok(bytes) = self.encode_control(&ControlMessage::Disconnect) {
                let _ = handle.cmd_tx.send(PumpCommand::Send(bytes));
            }
            let _ = handle.cmd_tx.send(PumpCommand::Close);
        }

        if !inner.pending.is_empty() {
            warn!(
                token = %self.token,
                dropped = inner.pending.len(),
                "destroying channel with undeliverable queued messages"
            );
            inner.pending.clear();
        }

        inner.control_listener = None;
        inner.data_listener = None;
        inner.close_listener = None;
        inner.inbound_control.clear();
        inner.inbound_data.clear();
        inner.disposed = true;
        debug!(token = %self.token, reason = reason.unwrap_or("none"), "channel destroyed");
    }

    fn encode_control(&self, msg: &ControlMessage) -> Result<Vec<u8>> {
        let payload = msg.to_json().map_err(ProtocolError::from)?;
        self.codec.encode(&Frame::control(payload))
    }

    // -----------------------------------------------------------------------
    // Task callbacks
    // -----------------------------------------------------------------------

    /// Record socket loss: requeue unwritten frames, mark disconnected, and
    /// fire the close event. The frames belong to the logical session, not
    /// the socket, so they are requeued even when this loss report is stale
    /// or the pump was already taken; only the bookkeeping is skipped then.
    fn complete_socket_loss(
        &self,
        generation: u64,
        unsent: Vec<Vec<u8>>,
        cmd_rx: &mut mpsc::UnboundedReceiver<PumpCommand>,
    ) {
        let mut frames = unsent;
        while let Ok(cmd) = cmd_rx.try_recv() {
            if let PumpCommand::Send(bytes) = cmd {
                frames.push(bytes);
            }
        }

        let close_listener = {
            let mut inner = self.lock();
            if inner.destroyed {
                if !frames.is_empty() {
                    warn!(
                        token = %self.token,
                        dropped = frames.len(),
                        "discarding unsent frames of a destroyed channel"
                    );
                }
                return;
            }
            let stale = inner.generation != generation;
            if stale && !frames.is_empty() {
                warn!(
                    token = %self.token,
                    generation,
                    requeued = frames.len(),
                    "requeueing frames from a superseded socket"
                );
            }
            while let Some(bytes) = frames.pop() {
                inner.pending.push_front(bytes);
            }
            if stale {
                return;
            }
            if inner.pump.take().is_none() {
                // Detached or retired concurrently; whoever took the pump
                // owns the disconnect bookkeeping.
                return;
            }

            inner.disconnected_at = Some(Instant::now());
            inner.close_listener.clone()
        };

        debug!(token = %self.token, generation, "socket lost");
        if let Some(tx) = close_listener {
            let _ = tx.send(());
        }
    }

    /// Return frames a halted pump never wrote to the head of the pending
    /// queue, ahead of anything queued since the pump was taken.
    fn requeue_unsent(&self, generation: u64, mut frames: Vec<Vec<u8>>) {
        if frames.is_empty() {
            return;
        }
        let mut inner = self.lock();
        if inner.destroyed {
            warn!(
                token = %self.token,
                dropped = frames.len(),
                "discarding unsent frames of a destroyed channel"
            );
            return;
        }
        if inner.generation != generation {
            warn!(
                token = %self.token,
                generation,
                requeued = frames.len(),
                "requeueing frames from a superseded socket"
            );
        }
        while let Some(bytes) = frames.pop() {
            inner.pending.push_front(bytes);
        }
    }

    /// Retain a lost socket's inflate record as seed material for the next
    /// reconnect. Ignored when an adoption has superseded `generation`.
    pub(crate) fn store_retired_record(&self, generation: u64, record: Vec<u8>) {
        let mut inner = self.lock();
        if inner.generation == generation && !inner.destroyed {
            inner.retired_inflate = Some(record);
        }
    }

    fn dispatch_frame(&self, frame: Frame) {
        let mut inner = self.lock();
        match frame.kind {
            FrameKind::Control => match inner.control_listener.as_ref() {
                Some(tx) => {
                    if tx.send(frame.payload).is_err() {
                        inner.control_listener = None;
                    }
                }
                // Control frames can land in the gap between listeners,
                // e.g. a disconnect coalesced with the message that ended
                // the handshake. Hold them for the next listener.
                None => inner.inbound_control.push_back(frame.payload),
            },
            FrameKind::Data => match inner.data_listener.as_ref() {
                Some(tx) => {
                    if tx.send(frame.payload).is_err() {
                        inner.data_listener = None;
                    }
                }
                // Data may arrive before the payload handler attaches;
                // hold it instead of dropping.
                None => inner.inbound_data.push_back(frame.payload),
            },
        }
    }
}

impl std::fmt::Debug for SessionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("SessionChannel")
            .field("token", &self.token)
            .field("generation", &inner.generation)
            .field("attached", &inner.pump.is_some())
            .field("pending", &inner.pending.len())
            .field("destroyed", &inner.destroyed)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Socket tasks
// ---------------------------------------------------------------------------

fn spawn_socket_tasks(
    channel: &Arc<SessionChannel>,
    generation: u64,
    socket: TransportSocket,
    residue: Vec<u8>,
    cmd_rx: mpsc::UnboundedReceiver<PumpCommand>,
    halt: Arc<AtomicBool>,
) {
    let (writer, reader) = socket.split();
    let (reader_stop_tx, reader_stop_rx) = watch::channel(ReaderStop::Run);
    let (loss_tx, loss_rx) = watch::channel(false);
    let (back_tx, back_rx) = oneshot::channel();
    let config = channel.config.clone();

    let weak = Arc::downgrade(channel);
    tokio::spawn(run_socket_reader(
        weak.clone(),
        generation,
        reader,
        residue,
        reader_stop_rx,
        back_tx,
        loss_tx,
    ));
    tokio::spawn(run_socket_pump(
        weak,
        generation,
        writer,
        cmd_rx,
        reader_stop_tx,
        back_rx,
        loss_rx,
        config,
        halt,
    ));
}

enum ReaderExit {
    HandBack,
    Stopped,
    Loss,
}

async fn run_socket_reader(
    channel: Weak<SessionChannel>,
    generation: u64,
    mut reader: SocketReader,
    residue: Vec<u8>,
    mut stop_rx: watch::Receiver<ReaderStop>,
    back_tx: oneshot::Sender<(SocketReader, Vec<u8>)>,
    loss_tx: watch::Sender<bool>,
) {
    let codec = FrameCodec::new();
    let mut buf = residue;

    let exit = loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    break ReaderExit::Stopped;
                }
                match *stop_rx.borrow() {
                    ReaderStop::Run => continue,
                    ReaderStop::Detach => break ReaderExit::HandBack,
                    ReaderStop::Closed => break ReaderExit::Stopped,
                }
            }
            result = reader.read() => match result {
                Ok(Some(chunk)) => {
                    buf.extend_from_slice(&chunk);
                    if let Err(err) = drain_frames(&channel, &codec, &mut buf) {
                        warn!(generation, error = %err, "inbound frame stream corrupt");
                        break ReaderExit::Loss;
                    }
                }
                Ok(None) => {
                    debug!(generation, "socket closed by peer");
                    break ReaderExit::Loss;
                }
                Err(err) => {
                    debug!(generation, error = %err, "socket read failed");
                    break ReaderExit::Loss;
                }
            }
        }
    };

    match exit {
        ReaderExit::HandBack => {
            let _ = back_tx.send((reader, buf));
        }
        ReaderExit::Loss => {
            if let Some(channel) = channel.upgrade() {
                if let Some(record) = reader.take_record() {
                    channel.store_retired_record(generation, record);
                }
            }
            let _ = loss_tx.send(true);
        }
        ReaderExit::Stopped => {
            // The pump is closing the socket; still keep the record in
            // case a reconnect follows.
            if let Some(channel) = channel.upgrade() {
                if let Some(record) = reader.take_record() {
                    channel.store_retired_record(generation, record);
                }
            }
        }
    }
}

fn drain_frames(
    channel: &Weak<SessionChannel>,
    codec: &FrameCodec,
    buf: &mut Vec<u8>,
) -> Result<()> {
    while let Some((frame, consumed)) = codec.try_decode(buf)? {
        buf.drain(..consumed);
        match channel.upgrade() {
            Some(channel) => channel.dispatch_frame(frame),
            None => return Ok(()),
        }
    }
    Ok(())
}

enum PumpExit {
    Loss,
    Close,
    Detach(oneshot::Sender<DetachedSocket>),
}

#[allow(clippy::too_many_arguments)]
async fn run_socket_pump(
    channel: Weak<SessionChannel>,
    generation: u64,
    mut writer: SocketWriter,
    mut cmd_rx: mpsc::UnboundedReceiver<PumpCommand>,
    reader_stop_tx: watch::Sender<ReaderStop>,
    back_rx: oneshot::Receiver<(SocketReader, Vec<u8>)>,
    mut loss_rx: watch::Receiver<bool>,
    config: ChannelConfig,
    halt: Arc<AtomicBool>,
) {
    let last_pong = writer.last_pong();
    let mut keepalive = tokio::time::interval(config.keepalive_interval);
    keepalive.tick().await; // the first tick fires immediately

    // Frames accepted but never written; they rejoin the channel's queue
    // on the way out instead of dying with the socket.
    let mut unsent: Vec<Vec<u8>> = Vec::new();

    let exit = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(PumpCommand::Send(bytes)) => {
                    if halt.load(Ordering::Acquire) {
                        unsent.push(bytes);
                        continue;
                    }
                    if let Err(err) = writer.write(&bytes).await {
                        warn!(generation, error = %err, "socket write failed");
                        unsent.push(bytes);
                        break PumpExit::Loss;
                    }
                }
                Some(PumpCommand::Detach(reply)) => break PumpExit::Detach(reply),
                Some(PumpCommand::Close) | None => break PumpExit::Close,
            },
            _ = keepalive.tick() => {
                if let Some(last_pong) = &last_pong {
                    if halt.load(Ordering::Acquire) {
                        continue;
                    }
                    let silent_for = last_pong.read().await.elapsed();
                    if silent_for > config.keepalive_interval + config.keepalive_timeout {
                        warn!(generation, ?silent_for, "keepalive expired, dropping socket");
                        break PumpExit::Loss;
                    }
                    if let Err(err) = writer.ping().await {
                        debug!(generation, error = %err, "keepalive ping failed");
                        break PumpExit::Loss;
                    }
                }
            }
            _ = loss_rx.changed() => break PumpExit::Loss,
        }
    };

    match exit {
        PumpExit::Loss => {
            if let Some(channel) = channel.upgrade() {
                channel.complete_socket_loss(generation, unsent, &mut cmd_rx);
            }
            let _ = reader_stop_tx.send(ReaderStop::Closed);
            let _ = writer.close().await;
        }
        PumpExit::Close => {
            while let Ok(cmd) = cmd_rx.try_recv() {
                if let PumpCommand::Send(bytes) = cmd {
                    unsent.push(bytes);
                }
            }
            if halt.load(Ordering::Acquire) {
                // Halted means the socket is being replaced; writing the
                // tail to it would lose the frames.
                if let Some(channel) = channel.upgrade() {
                    channel.requeue_unsent(generation, unsent);
                }
            } else {
                // Flush whatever is still queued, best-effort, then close
                for bytes in unsent {
                    let _ = writer.write(&bytes).await;
                }
            }
            let _ = reader_stop_tx.send(ReaderStop::Closed);
            let _ = writer.close().await;
        }
        PumpExit::Detach(reply) => {
            let _ = reader_stop_tx.send(ReaderStop::Detach);
            if let Some(channel) = channel.upgrade() {
                channel.requeue_unsent(generation, unsent);
            }
            match back_rx.await {
                Ok((reader, residue)) => match TransportSocket::reunite(writer, reader) {
                    Ok(socket) => {
                        let _ = reply.send(DetachedSocket { socket, residue });
                    }
                    Err(err) => {
                        warn!(generation, error = %err, "socket reassembly failed");
                    }
                },
                Err(_) => {
                    if let Some(channel) = channel.upgrade() {
                        channel.complete_socket_loss(generation, Vec::new(), &mut cmd_rx);
                    }
                    let _ = writer.close().await;
                }
            }
        }
    }
}
