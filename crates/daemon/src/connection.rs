//! Payload handlers bound to a channel once its connection type resolves.
//!
//! The handshake only negotiates *that* a channel of some kind will open;
//! the payload logic itself is pluggable. A handler takes over the channel
//! after the handshake and runs for the life of the logical session,
//! surviving socket swaps underneath it.

use std::future::Future;
use std::sync::Arc;

use protocol::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::channel::SessionChannel;
use crate::handshake::ConnectionRequest;

/// Payload logic selected by the resolved `connectionType` value.
pub trait ConnectionHandler: Send + Sync {
    /// The `connectionType` value this handler serves.
    fn connection_type(&self) -> &str;

    /// Drives the payload until the session ends or `cancel` fires. The
    /// `Send` bound lets the server spawn handlers it only knows
    /// generically.
    fn run(
        &self,
        channel: Arc<SessionChannel>,
        request: ConnectionRequest,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Built-in demonstration payload: every data message comes straight back.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl ConnectionHandler for EchoHandler {
    fn connection_type(&self) -> &str {
        "echo"
    }

    async fn run(
        &self,
        channel: Arc<SessionChannel>,
        request: ConnectionRequest,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut data_rx = channel.listen_data();
        info!(
            token = %channel.token(),
            connection_type = %request.value,
            "echo handler attached"
        );

        loop {
            tokio::select! {
                payload = data_rx.recv() => match payload {
                    Some(payload) => {
                        trace!(bytes = payload.len(), "echoing payload");
                        if channel.send_data(&payload).is_err() {
                            // Channel destroyed underneath us
                            break;
                        }
                    }
                    None => break,
                },
                _ = cancel.cancelled() => break,
            }
        }

        debug!(token = %channel.token(), "echo handler finished");
        Ok(())
    }
}
