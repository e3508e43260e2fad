//! Peer Transport Port
//!
//! The generic "send to peer(s)" primitive consumed by the replication core.
//! Inbound traffic is delivered through a `HandlerRegistry`.

use crate::replication::types::{Message, Peer};
use async_trait::async_trait;

/// Transport level failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("peer {0} is unknown or unreachable")]
    Unreachable(String),
    #[error("request to {0} timed out")]
    Timeout(String),
    #[error("peer rejected the request: {0}")]
    Rejected(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("codec error: {0}")]
    Codec(String),
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// This node.
    fn local(&self) -> &Peer;

    /// Live remote peers, with their zone metadata.
    fn peers(&self) -> Vec<Peer>;

    /// Fire-and-forget delivery to each of `peers`. Returns how many sends
    /// were handed to the network.
    async fn send(&self, peers: &[Peer], message: Message) -> usize;

    /// Request/response exchange with one peer.
    async fn send_to_with_response(
        &self,
        peer: &Peer,
        message: Message,
    ) -> Result<Vec<u8>, TransportError>;

    /// Live remote peers in the local zone.
    fn zone_peers(&self) -> Vec<Peer> {
        let zone = self.local().zone.clone();
        self.peers()
            .into_iter()
            .filter(|p| p.same_zone(&zone))
            .collect()
    }
}
