//! Transport socket abstraction over raw TCP and WebSocket framing.
//!
//! A [`TransportSocket`] presents one interface over the two ways a client
//! can connect: a bare TCP stream (`Raw`) or a WebSocket-framed stream
//! (`Framed`), optionally compressed per message. Writes carry opaque byte
//! chunks (already frame-encoded by the channel layer); reads yield chunks
//! until a clean close (`Ok(None)`) or a terminal error.
//!
//! Compressed framed sockets own the seedable inflate state from
//! [`protocol::deflate`]: at construction the inflater replays the bytes a
//! predecessor socket already consumed, and everything fed afterwards is
//! recorded for the next successor.

use std::sync::Arc;
use std::time::Instant;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{MessageDeflater, MessageInflater, ProtocolError, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::trace;

/// Read buffer size for raw sockets.
const RAW_READ_CHUNK: usize = 8192;

/// Connection options fixed at socket acceptance.
#[derive(Debug, Clone, Default)]
pub struct SocketOptions {
    /// Opaque token correlating physical connections into one logical
    /// session.
    pub reconnection_token: String,
    /// True when resuming an existing session rather than starting fresh.
    pub reconnection: bool,
    /// True selects the `Raw` variant; no WebSocket framing.
    pub skip_framing: bool,
    /// Per-message compression; framed sockets only.
    pub enable_compression: bool,
    /// Raw inflate history of the predecessor socket; framed compressed
    /// reconnects only.
    pub seed_inflate_bytes: Option<Vec<u8>>,
}

// ---------------------------------------------------------------------------
// Whole-socket type
// ---------------------------------------------------------------------------

/// A physical connection, owned exclusively.
#[derive(Debug)]
pub enum TransportSocket {
    /// Bare TCP; bytes pass through untouched.
    Raw(RawSocket),
    /// WebSocket-framed TCP, optionally compressed per message.
    Framed(FramedSocket),
}

/// Bare TCP transport.
#[derive(Debug)]
pub struct RawSocket {
    stream: TcpStream,
    closed: bool,
}

/// WebSocket transport with optional per-message deflate.
#[derive(Debug)]
pub struct FramedSocket {
    ws: WebSocketStream<TcpStream>,
    inflater: Option<MessageInflater>,
    deflater: Option<MessageDeflater>,
    last_pong: Arc<RwLock<Instant>>,
    closed: bool,
}

impl TransportSocket {
    /// Wrap a bare TCP stream.
    pub fn raw(stream: TcpStream) -> Self {
        TransportSocket::Raw(RawSocket {
            stream,
            closed: false,
        })
    }

    /// Wrap an upgraded WebSocket stream, seeding the inflater when the
    /// options carry a predecessor's record.
    pub fn framed(ws: WebSocketStream<TcpStream>, options: &SocketOptions) -> Result<Self> {
        let (inflater, deflater) = if options.enable_compression {
            let inflater = match &options.seed_inflate_bytes {
                Some(seed) => MessageInflater::with_seed(seed)?,
                None => MessageInflater::new(),
            };
            (Some(inflater), Some(MessageDeflater::new()))
        } else {
            (None, None)
        };
        Ok(TransportSocket::Framed(FramedSocket {
            ws,
            inflater,
            deflater,
            last_pong: Arc::new(RwLock::new(Instant::now())),
            closed: false,
        }))
    }

    /// The underlying OS-level stream, independent of variant.
    pub fn raw_handle(&self) -> &TcpStream {
        match self {
            TransportSocket::Raw(s) => &s.stream,
            TransportSocket::Framed(s) => s.ws.get_ref(),
        }
    }

    /// Send opaque bytes. Fails with `SocketClosed` once the socket has
    /// been closed; otherwise the write is complete from the caller's
    /// perspective.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            TransportSocket::Raw(s) => {
                if s.closed {
                    return Err(ProtocolError::SocketClosed);
                }
                s.stream.write_all(bytes).await?;
                Ok(())
            }
            TransportSocket::Framed(s) => {
                if s.closed {
                    return Err(ProtocolError::SocketClosed);
                }
                let msg = encode_ws_payload(&mut s.deflater, bytes)?;
                s.ws.send(msg).await.map_err(map_ws_error)
            }
        }
    }

    /// Receive the next chunk. `Ok(None)` is a clean close; an error is
    /// terminal for this socket.
    pub async fn read(&mut self) -> Result<Option<Vec<u8>>> {
        match self {
            TransportSocket::Raw(s) => read_raw_chunk(&mut s.stream).await,
            TransportSocket::Framed(s) => loop {
                let item = s.ws.next().await;
                match map_ws_item(item, &mut s.inflater, &s.last_pong)? {
                    WsRead::Chunk(bytes) => return Ok(Some(bytes)),
                    WsRead::Closed => return Ok(None),
                    WsRead::Skip => continue,
                }
            },
        }
    }

    /// Flush best-effort and release the OS handle. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        match self {
            TransportSocket::Raw(s) => {
                if !s.closed {
                    s.closed = true;
                    let _ = s.stream.shutdown().await;
                }
                Ok(())
            }
            TransportSocket::Framed(s) => {
                if !s.closed {
                    s.closed = true;
                    let _ = s.ws.close(None).await;
                }
                Ok(())
            }
        }
    }

    /// Keepalive probe; no-op on raw sockets.
    pub async fn ping(&mut self) -> Result<()> {
        match self {
            TransportSocket::Raw(_) => Ok(()),
            TransportSocket::Framed(s) => {
                if s.closed {
                    return Err(ProtocolError::SocketClosed);
                }
                s.ws.send(WsMessage::Ping(Vec::new())).await.map_err(map_ws_error)
            }
        }
    }

    /// Timestamp of the most recent pong; `None` for raw sockets.
    pub fn last_pong(&self) -> Option<Arc<RwLock<Instant>>> {
        match self {
            TransportSocket::Raw(_) => None,
            TransportSocket::Framed(s) => Some(s.last_pong.clone()),
        }
    }

    /// Cumulative raw bytes fed to the inflater, seed included. `None`
    /// unless this is a compressed framed socket.
    pub fn recorded_inflate_bytes(&self) -> Option<&[u8]> {
        match self {
            TransportSocket::Raw(_) => None,
            TransportSocket::Framed(s) => s.inflater.as_ref().map(|i| i.recorded()),
        }
    }

    /// Split into independently owned write and read halves, so a sink
    /// task and a reader task can run concurrently.
    pub fn split(self) -> (SocketWriter, SocketReader) {
        match self {
            TransportSocket::Raw(s) => {
                let (read, write) = s.stream.into_split();
                (
                    SocketWriter::Raw {
                        write,
                        closed: s.closed,
                    },
                    SocketReader::Raw { read },
                )
            }
            TransportSocket::Framed(s) => {
                let (sink, stream) = s.ws.split();
                (
                    SocketWriter::Framed {
                        sink,
                        deflater: s.deflater,
                        last_pong: s.last_pong.clone(),
                        closed: s.closed,
                    },
                    SocketReader::Framed {
                        stream,
                        inflater: s.inflater,
                        last_pong: s.last_pong,
                    },
                )
            }
        }
    }

    /// Reassemble a socket from the halves produced by [`Self::split`].
    pub fn reunite(writer: SocketWriter, reader: SocketReader) -> Result<Self> {
        match (writer, reader) {
            (SocketWriter::Raw { write, closed }, SocketReader::Raw { read }) => {
                let stream = read.reunite(write).map_err(|_| {
                    ProtocolError::SocketError("socket halves from different connections".into())
                })?;
                Ok(TransportSocket::Raw(RawSocket { stream, closed }))
            }
            (
                SocketWriter::Framed {
                    sink,
                    deflater,
                    last_pong,
                    closed,
                },
                SocketReader::Framed {
                    stream, inflater, ..
                },
            ) => {
                let ws = sink.reunite(stream).map_err(|_| {
                    ProtocolError::SocketError("socket halves from different connections".into())
                })?;
                Ok(TransportSocket::Framed(FramedSocket {
                    ws,
                    inflater,
                    deflater,
                    last_pong,
                    closed,
                }))
            }
            _ => Err(ProtocolError::SocketError(
                "socket halves from different connections".into(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Split halves
// ---------------------------------------------------------------------------

/// Write half of a split socket.
#[derive(Debug)]
pub enum SocketWriter {
    Raw {
        write: OwnedWriteHalf,
        closed: bool,
    },
    Framed {
        sink: SplitSink<WebSocketStream<TcpStream>, WsMessage>,
        deflater: Option<MessageDeflater>,
        last_pong: Arc<RwLock<Instant>>,
        closed: bool,
    },
}

impl SocketWriter {
    /// Send opaque bytes, compressing when this socket negotiated it.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            SocketWriter::Raw { write, closed } => {
                if *closed {
                    return Err(ProtocolError::SocketClosed);
                }
                write.write_all(bytes).await?;
                Ok(())
            }
            SocketWriter::Framed {
                sink,
                deflater,
                closed,
                ..
            } => {
                if *closed {
                    return Err(ProtocolError::SocketClosed);
                }
                let msg = encode_ws_payload(deflater, bytes)?;
                sink.send(msg).await.map_err(map_ws_error)
            }
        }
    }

    /// Keepalive probe; no-op on raw sockets.
    pub async fn ping(&mut self) -> Result<()> {
        match self {
            SocketWriter::Raw { .. } => Ok(()),
            SocketWriter::Framed { sink, closed, .. } => {
                if *closed {
                    return Err(ProtocolError::SocketClosed);
                }
                sink.send(WsMessage::Ping(Vec::new())).await.map_err(map_ws_error)
            }
        }
    }

    /// Most recent pong timestamp; `None` for raw sockets.
    pub fn last_pong(&self) -> Option<Arc<RwLock<Instant>>> {
        match self {
            SocketWriter::Raw { .. } => None,
            SocketWriter::Framed { last_pong, .. } => Some(last_pong.clone()),
        }
    }

    /// Close the write direction best-effort. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        match self {
            SocketWriter::Raw { write, closed } => {
                if !*closed {
                    *closed = true;
                    let _ = write.shutdown().await;
                }
                Ok(())
            }
            SocketWriter::Framed { sink, closed, .. } => {
                if !*closed {
                    *closed = true;
                    let _ = sink.send(WsMessage::Close(None)).await;
                    let _ = sink.flush().await;
                }
                Ok(())
            }
        }
    }
}

/// Read half of a split socket.
#[derive(Debug)]
pub enum SocketReader {
    Raw {
        read: OwnedReadHalf,
    },
    Framed {
        stream: SplitStream<WebSocketStream<TcpStream>>,
        inflater: Option<MessageInflater>,
        last_pong: Arc<RwLock<Instant>>,
    },
}

impl SocketReader {
    /// Receive the next chunk; `Ok(None)` is a clean close.
    pub async fn read(&mut self) -> Result<Option<Vec<u8>>> {
        match self {
            SocketReader::Raw { read } => read_raw_chunk(read).await,
            SocketReader::Framed {
                stream,
                inflater,
                last_pong,
            } => loop {
                let item = stream.next().await;
                match map_ws_item(item, inflater, last_pong)? {
                    WsRead::Chunk(bytes) => return Ok(Some(bytes)),
                    WsRead::Closed => return Ok(None),
                    WsRead::Skip => continue,
                }
            },
        }
    }

    /// Consume the reader, yielding the inflate record for the channel to
    /// retain as seed material. `None` for uncompressed sockets.
    pub fn take_record(self) -> Option<Vec<u8>> {
        match self {
            SocketReader::Raw { .. } => None,
            SocketReader::Framed { inflater, .. } => inflater.map(|i| i.recorded().to_vec()),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared read/write plumbing
// ---------------------------------------------------------------------------

enum WsRead {
    Chunk(Vec<u8>),
    Closed,
    Skip,
}

async fn read_raw_chunk<R: AsyncReadExt + Unpin>(read: &mut R) -> Result<Option<Vec<u8>>> {
    let mut chunk = vec![0u8; RAW_READ_CHUNK];
    let n = read.read(&mut chunk).await?;
    if n == 0 {
        return Ok(None);
    }
    chunk.truncate(n);
    Ok(Some(chunk))
}

fn encode_ws_payload(
    deflater: &mut Option<MessageDeflater>,
    bytes: &[u8],
) -> Result<WsMessage> {
    let body = match deflater {
        Some(deflater) => deflater.deflate(bytes)?,
        None => bytes.to_vec(),
    };
    Ok(WsMessage::Binary(body))
}

fn map_ws_item(
    item: Option<std::result::Result<WsMessage, WsError>>,
    inflater: &mut Option<MessageInflater>,
    last_pong: &Arc<RwLock<Instant>>,
) -> Result<WsRead> {
    match item {
        None => Ok(WsRead::Closed),
        Some(Ok(WsMessage::Binary(body))) => {
            let bytes = match inflater {
                Some(inflater) => inflater.inflate(&body)?,
                None => body,
            };
            Ok(WsRead::Chunk(bytes))
        }
        Some(Ok(WsMessage::Text(text))) => Ok(WsRead::Chunk(text.into_bytes())),
        Some(Ok(WsMessage::Pong(_))) => {
            if let Ok(mut guard) = last_pong.try_write() {
                *guard = Instant::now();
            }
            Ok(WsRead::Skip)
        }
        Some(Ok(WsMessage::Ping(_))) => {
            // tungstenite queues the pong reply internally
            trace!("received ping");
            Ok(WsRead::Skip)
        }
        Some(Ok(WsMessage::Close(_))) => Ok(WsRead::Closed),
        Some(Ok(WsMessage::Frame(_))) => Ok(WsRead::Skip),
        Some(Err(err)) => Err(map_ws_error(err)),
    }
}

fn map_ws_error(err: WsError) -> ProtocolError {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => ProtocolError::SocketClosed,
        WsError::Io(io_err) => io_err.into(),
        other => ProtocolError::SocketError(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn raw_pair() -> (TransportSocket, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (TransportSocket::raw(server), client)
    }

    async fn framed_pair(compression: bool) -> (TransportSocket, TransportSocket) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let connect = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (ws, _) = tokio_tungstenite::client_async("ws://localhost/", stream)
                .await
                .unwrap();
            ws
        });
        let (server_stream, _) = listener.accept().await.unwrap();
        let server_ws = tokio_tungstenite::accept_async(server_stream).await.unwrap();
        let client_ws = connect.await.unwrap();

        let options = SocketOptions {
            enable_compression: compression,
            ..Default::default()
        };
        (
            TransportSocket::framed(server_ws, &options).unwrap(),
            TransportSocket::framed(client_ws, &options).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_raw_write_reaches_peer() {
        let (mut socket, mut peer) = raw_pair().await;

        socket.write(b"hello over tcp").await.unwrap();
        let mut buf = vec![0u8; 64];
        let n = peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello over tcp");
    }

    #[tokio::test]
    async fn test_raw_read_yields_chunks_then_clean_close() {
        let (mut socket, mut peer) = raw_pair().await;

        peer.write_all(b"chunk one").await.unwrap();
        let chunk = socket.read().await.unwrap();
        assert_eq!(chunk.as_deref(), Some(&b"chunk one"[..]));

        drop(peer);
        assert_eq!(socket.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_raw_close_is_idempotent() {
        let (mut socket, _peer) = raw_pair().await;

        socket.close().await.unwrap();
        socket.close().await.unwrap();
        assert!(matches!(
            socket.write(b"late").await,
            Err(ProtocolError::SocketClosed)
        ));
    }

    #[tokio::test]
    async fn test_framed_roundtrip_uncompressed() {
        let (mut server, mut client) = framed_pair(false).await;

        client.write(b"framed payload").await.unwrap();
        let chunk = server.read().await.unwrap();
        assert_eq!(chunk.as_deref(), Some(&b"framed payload"[..]));
    }

    #[tokio::test]
    async fn test_framed_roundtrip_compressed() {
        let (mut server, mut client) = framed_pair(true).await;

        let payload = b"compress me compress me compress me".to_vec();
        client.write(&payload).await.unwrap();
        let chunk = server.read().await.unwrap();
        assert_eq!(chunk.as_deref(), Some(&payload[..]));

        // The receiving side recorded the raw bytes it fed its inflater
        let recorded = server.recorded_inflate_bytes().unwrap();
        assert!(!recorded.is_empty());
    }

    #[tokio::test]
    async fn test_framed_close_is_clean_for_peer() {
        let (mut server, mut client) = framed_pair(false).await;

        client.close().await.unwrap();
        assert_eq!(server.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_raw_handle_exposes_peer_addr() {
        let (socket, peer) = raw_pair().await;
        assert_eq!(
            socket.raw_handle().peer_addr().unwrap(),
            peer.local_addr().unwrap()
        );
    }

    #[tokio::test]
    async fn test_split_reunite_roundtrip() {
        let (server, mut client) = framed_pair(false).await;

        let (mut writer, reader) = server.split();
        writer.write(b"via writer half").await.unwrap();
        let chunk = client.read().await.unwrap();
        assert_eq!(chunk.as_deref(), Some(&b"via writer half"[..]));

        let mut whole = TransportSocket::reunite(writer, reader).unwrap();
        whole.write(b"via reunited socket").await.unwrap();
        let chunk = client.read().await.unwrap();
        assert_eq!(chunk.as_deref(), Some(&b"via reunited socket"[..]));
    }

    #[tokio::test]
    async fn test_mismatched_halves_rejected() {
        let (raw, _peer) = raw_pair().await;
        let (framed, _other) = framed_pair(false).await;

        let (raw_writer, _raw_reader) = raw.split();
        let (_framed_writer, framed_reader) = framed.split();
        assert!(TransportSocket::reunite(raw_writer, framed_reader).is_err());
    }

    #[tokio::test]
    async fn test_uncompressed_socket_has_no_record() {
        let (server, _client) = framed_pair(false).await;
        assert!(server.recorded_inflate_bytes().is_none());

        let (reader_socket, _peer) = raw_pair().await;
        let (_w, reader) = reader_socket.split();
        assert!(reader.take_record().is_none());
    }
}
