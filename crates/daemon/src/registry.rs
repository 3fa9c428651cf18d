//! Registry mapping reconnection tokens to live session channels.
//!
//! The registry is the only state shared across sessions. Reconnect races
//! are resolved deterministically: each attempt captures the channel's
//! generation up front and adoption rejects stale generations, so of two
//! sockets claiming the same token exactly one wins.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use protocol::{ProtocolError, Result};
use tracing::{debug, info};

use crate::channel::SessionChannel;

/// Thread-safe token-to-channel map, shared by every connection task.
pub struct SessionRegistry {
    channels: DashMap<String, Arc<SessionChannel>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Registers a channel under its token. A token already held by a live
    /// session is refused; the claimant must pick a fresh token.
    pub fn register(&self, channel: Arc<SessionChannel>) -> Result<()> {
        let token = channel.token().to_string();
        match self.channels.entry(token) {
            Entry::Occupied(entry) => Err(ProtocolError::DuplicateReconnection {
                token: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                debug!(token = %channel.token(), "session registered");
                entry.insert(channel);
                Ok(())
            }
        }
    }

    /// Looks up a live channel by token.
    pub fn lookup(&self, token: &str) -> Option<Arc<SessionChannel>> {
        self.channels
            .get(token)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Removes a channel without destroying it.
    pub fn remove(&self, token: &str) -> Option<Arc<SessionChannel>> {
        self.channels.remove(token).map(|(_, channel)| channel)
    }

    /// Number of registered sessions.
    pub fn count(&self) -> usize {
        self.channels.len()
    }

    /// Destroys and removes channels that have been disconnected longer
    /// than `grace`, plus any that were destroyed behind the registry's
    /// back. Returns how many were reaped.
    pub fn reap_disconnected(&self, grace: Duration) -> usize {
        let mut expired = Vec::new();
        for entry in self.channels.iter() {
            let channel = entry.value();
            if channel.is_destroyed() {
                expired.push(entry.key().clone());
            } else if let Some(since) = channel.disconnected_since() {
                if since.elapsed() > grace {
                    expired.push(entry.key().clone());
                }
            }
        }

        let mut reaped = 0;
        for token in expired {
            if let Some((token, channel)) = self.channels.remove(&token) {
                channel.destroy(Some("reconnection grace period expired"));
                info!(%token, "reaped expired session");
                reaped += 1;
            }
        }
        reaped
    }

    /// Starts a background task that periodically reaps expired sessions.
    pub fn start_reaper_task(self: &Arc<Self>, interval: Duration, grace: Duration) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                registry.reap_disconnected(grace);
            }
        });
    }

    /// Destroys every registered session, notifying peers with `reason`.
    /// Used at server shutdown.
    pub fn destroy_all(&self, reason: &str) {
        let tokens: Vec<String> = self.channels.iter().map(|entry| entry.key().clone()).collect();
        for token in tokens {
            if let Some((token, channel)) = self.channels.remove(&token) {
                channel.destroy(Some(reason));
                debug!(%token, "session destroyed at shutdown");
            }
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use crate::socket::TransportSocket;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn channel(token: &str) -> Arc<SessionChannel> {
        Arc::new(SessionChannel::new(token, ChannelConfig::default()))
    }

    async fn raw_pair() -> (TransportSocket, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (TransportSocket::raw(server), client)
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = SessionRegistry::new();
        let ch = channel("tok-a");
        registry.register(ch.clone()).unwrap();

        let found = registry.lookup("tok-a").unwrap();
        assert!(Arc::ptr_eq(&found, &ch));
        assert_eq!(registry.count(), 1);
        assert!(registry.lookup("tok-b").is_none());
    }

    #[tokio::test]
    async fn test_register_duplicate_token_rejected() {
        let registry = SessionRegistry::new();
        registry.register(channel("tok-a")).unwrap();

        let err = registry.register(channel("tok-a")).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::DuplicateReconnection { token } if token == "tok-a"
        ));
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn test_remove_does_not_destroy() {
        let registry = SessionRegistry::new();
        registry.register(channel("tok-a")).unwrap();

        let removed = registry.remove("tok-a").unwrap();
        assert!(!removed.is_destroyed());
        assert_eq!(registry.count(), 0);
        assert!(registry.remove("tok-a").is_none());
    }

    #[tokio::test]
    async fn test_reap_destroys_only_expired() {
        let registry = SessionRegistry::new();

        // One channel loses its socket, the other stays attached
        let expired = channel("tok-expired");
        let mut close_rx = expired.listen_close();
        let (socket, peer) = raw_pair().await;
        expired.adopt_socket(0, socket, Vec::new()).unwrap();
        drop(peer);
        timeout(WAIT, close_rx.recv()).await.unwrap().unwrap();

        let attached = channel("tok-attached");
        let (socket, _peer) = raw_pair().await;
        attached.adopt_socket(0, socket, Vec::new()).unwrap();

        registry.register(expired.clone()).unwrap();
        registry.register(attached.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let reaped = registry.reap_disconnected(Duration::from_millis(1));
        assert_eq!(reaped, 1);
        assert!(expired.is_destroyed());
        assert!(!attached.is_destroyed());
        assert_eq!(registry.count(), 1);
        assert!(registry.lookup("tok-attached").is_some());
    }

    #[tokio::test]
    async fn test_reap_respects_grace_period() {
        let registry = SessionRegistry::new();
        let ch = channel("tok-a");
        let mut close_rx = ch.listen_close();
        let (socket, peer) = raw_pair().await;
        ch.adopt_socket(0, socket, Vec::new()).unwrap();
        drop(peer);
        timeout(WAIT, close_rx.recv()).await.unwrap().unwrap();
        registry.register(ch.clone()).unwrap();

        // Still inside the grace window
        assert_eq!(registry.reap_disconnected(Duration::from_secs(300)), 0);
        assert!(!ch.is_destroyed());
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn test_destroy_all_notifies_and_clears() {
        let registry = SessionRegistry::new();
        let a = channel("tok-a");
        let b = channel("tok-b");
        registry.register(a.clone()).unwrap();
        registry.register(b.clone()).unwrap();

        registry.destroy_all("server shutting down");
        assert!(a.is_destroyed());
        assert!(b.is_destroyed());
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_race_has_exactly_one_winner() {
        let registry = SessionRegistry::new();
        let ch = channel("tok-contested");
        let mut close_rx = ch.listen_close();
        let (socket, peer) = raw_pair().await;
        ch.adopt_socket(0, socket, Vec::new()).unwrap();
        registry.register(ch.clone()).unwrap();

        drop(peer);
        timeout(WAIT, close_rx.recv()).await.unwrap().unwrap();

        // Two reconnect attempts race: both capture the same snapshot
        let contested = registry.lookup("tok-contested").unwrap();
        let (generation_a, _) = contested.reconnect_snapshot();
        let (generation_b, _) = contested.reconnect_snapshot();
        assert_eq!(generation_a, generation_b);

        let (first, _peer_a) = raw_pair().await;
        let (second, _peer_b) = raw_pair().await;
        contested
            .adopt_socket(generation_a, first, Vec::new())
            .unwrap();
        let rejected = contested
            .adopt_socket(generation_b, second, Vec::new())
            .unwrap_err();
        assert!(matches!(
            &rejected.error,
            ProtocolError::DuplicateReconnection { token } if token == "tok-contested"
        ));
        assert!(contested.is_attached());
    }
}
