//! In-process transport
//!
//! Connects several nodes living in one process through their handler
//! registries. Delivery is synchronous: `send` returns once every target
//! handler has run, which keeps multi-node tests deterministic.

use crate::domain::ports::{PeerTransport, TransportError};
use crate::replication::dispatch::HandlerRegistry;
use crate::replication::types::{Message, NodeId, Peer};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

struct LoopbackNode {
    peer: Peer,
    registry: Arc<HandlerRegistry>,
    online: bool,
}

#[derive(Default)]
pub struct LoopbackNetwork {
    nodes: RwLock<HashMap<NodeId, LoopbackNode>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a node to the network and return its transport.
    pub fn attach(self: &Arc<Self>, peer: Peer, registry: Arc<HandlerRegistry>) -> LoopbackTransport {
        self.nodes.write().insert(
            peer.node_id.clone(),
            LoopbackNode {
                peer: peer.clone(),
                registry,
                online: true,
            },
        );
        LoopbackTransport {
            network: self.clone(),
            local: peer,
        }
    }

    pub fn detach(&self, node_id: &NodeId) {
        self.nodes.write().remove(node_id);
    }

    /// Simulate a partition: an offline node neither sends nor receives.
    pub fn set_online(&self, node_id: &NodeId, online: bool) {
        if let Some(node) = self.nodes.write().get_mut(node_id) {
            node.online = online;
        }
    }

    fn is_online(&self, node_id: &NodeId) -> bool {
        self.nodes.read().get(node_id).map(|n| n.online).unwrap_or(false)
    }

    fn registry(&self, node_id: &NodeId) -> Option<Arc<HandlerRegistry>> {
        self.nodes
            .read()
            .get(node_id)
            .filter(|n| n.online)
            .map(|n| n.registry.clone())
    }
}

pub struct LoopbackTransport {
    network: Arc<LoopbackNetwork>,
    local: Peer,
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    fn local(&self) -> &Peer {
        &self.local
    }

    fn peers(&self) -> Vec<Peer> {
        if !self.network.is_online(&self.local.node_id) {
            return Vec::new();
        }
        let mut peers: Vec<Peer> = self
            .network
            .nodes
            .read()
            .values()
            .filter(|n| n.online && n.peer.node_id != self.local.node_id)
            .map(|n| n.peer.clone())
            .collect();
        peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        peers
    }

    async fn send(&self, peers: &[Peer], message: Message) -> usize {
        if !self.network.is_online(&self.local.node_id) {
            return 0;
        }

        let mut sent = 0;
        for peer in peers {
            if let Some(registry) = self.network.registry(&peer.node_id) {
                registry.dispatch(self.local.clone(), message.clone()).await;
                sent += 1;
            }
        }
        sent
    }

    async fn send_to_with_response(
        &self,
        peer: &Peer,
        message: Message,
    ) -> Result<Vec<u8>, TransportError> {
        if !self.network.is_online(&self.local.node_id) {
            return Err(TransportError::Connection("local node is offline".into()));
        }
        let registry = self
            .network
            .registry(&peer.node_id)
            .ok_or_else(|| TransportError::Unreachable(peer.to_string()))?;
        registry.dispatch_with_reply(self.local.clone(), message).await
    }
}
