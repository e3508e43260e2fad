//! Handler Registry
//!
//! Routes inbound mesh messages to the handler registered for their topic
//! and drives the periodic gossip callbacks. Transports own a registry and
//! call `dispatch`/`dispatch_with_reply` for every frame they receive.

use crate::domain::ports::TransportError;
use crate::replication::types::{Message, Peer, Topic};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

type GossipHandler = Arc<dyn Fn(Peer, Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;
type ReplyHandler =
    Arc<dyn Fn(Peer, Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, TransportError>> + Send + Sync>;
type TickHandler = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Handler table shared by a transport and the replication engine.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<Topic, GossipHandler>>,
    reply_handlers: RwLock<HashMap<Topic, ReplyHandler>>,
    tickers: RwLock<Vec<(String, TickHandler)>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fire-and-forget handler. Replaces any previous one.
    pub fn handle_func<F, Fut>(&self, topic: Topic, handler: F)
    where
        F: Fn(Peer, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: GossipHandler = Arc::new(move |from, payload| Box::pin(handler(from, payload)));
        self.handlers.write().insert(topic, handler);
    }

    /// Register a request/response handler. Replaces any previous one.
    pub fn handle_func_with_reply<F, Fut>(&self, topic: Topic, handler: F)
    where
        F: Fn(Peer, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>, TransportError>> + Send + 'static,
    {
        let handler: ReplyHandler =
            Arc::new(move |from, payload| Box::pin(handler(from, payload)));
        self.reply_handlers.write().insert(topic, handler);
    }

    /// Register a callback run on every gossip tick.
    pub fn handle_gossip_func<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: TickHandler = Arc::new(move || Box::pin(handler()));
        self.tickers.write().push((name.into(), handler));
    }

    /// Deliver a fire-and-forget message. Returns false when no handler exists.
    pub async fn dispatch(&self, from: Peer, message: Message) -> bool {
        let handler = self.handlers.read().get(&message.topic).cloned();
        match handler {
            Some(handler) => {
                handler(from, message.payload).await;
                true
            }
            None => {
                tracing::debug!("no handler for {} from {}", message.topic, from);
                false
            }
        }
    }

    /// Deliver a request and produce its response.
    pub async fn dispatch_with_reply(
        &self,
        from: Peer,
        message: Message,
    ) -> Result<Vec<u8>, TransportError> {
        let handler = self.reply_handlers.read().get(&message.topic).cloned();
        match handler {
            Some(handler) => handler(from, message.payload).await,
            None => Err(TransportError::Rejected(format!(
                "no reply handler for {}",
                message.topic
            ))),
        }
    }

    /// Run every registered tick callback concurrently.
    pub async fn tick(&self) {
        let tickers: Vec<_> = self
            .tickers
            .read()
            .iter()
            .map(|(name, handler)| (name.clone(), handler.clone()))
            .collect();

        futures::future::join_all(tickers.into_iter().map(|(name, handler)| async move {
            tracing::trace!("gossip tick: {}", name);
            handler().await;
        }))
        .await;
    }

    pub fn has_handler(&self, topic: &Topic) -> bool {
        self.handlers.read().contains_key(topic)
    }

    pub fn has_reply_handler(&self, topic: &Topic) -> bool {
        self.reply_handlers.read().contains_key(topic)
    }

    pub fn ticker_count(&self) -> usize {
        self.tickers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::types::EntityKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn peer() -> Peer {
        Peer::new("node-2", "eu")
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_topic() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        registry.handle_func(Topic::gossip(EntityKind::Group), move |_, payload| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(payload.len(), Ordering::SeqCst);
            }
        });

        let delivered = registry
            .dispatch(peer(), Message::new(Topic::gossip(EntityKind::Group), vec![1, 2, 3]))
            .await;
        assert!(delivered);
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        let delivered = registry
            .dispatch(peer(), Message::new(Topic::gossip(EntityKind::Role), vec![1]))
            .await;
        assert!(!delivered);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_dispatch_with_reply() {
        let registry = HandlerRegistry::new();
        registry.handle_func_with_reply(Topic::full_sync(EntityKind::User), |from, payload| async move {
            let mut out = from.zone.into_bytes();
            out.extend(payload);
            Ok(out)
        });

        let reply = registry
            .dispatch_with_reply(peer(), Message::new(Topic::full_sync(EntityKind::User), vec![b'!']))
            .await
            .unwrap();
        assert_eq!(reply, b"eu!");
    }

    #[tokio::test]
    async fn test_dispatch_with_reply_unknown_topic() {
        let registry = HandlerRegistry::new();
        let result = registry
            .dispatch_with_reply(peer(), Message::new(Topic::full_sync(EntityKind::User), vec![]))
            .await;
        assert!(matches!(result, Err(TransportError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_tick_runs_all_callbacks() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for name in ["groups", "roles", "users"] {
            let counter = hits.clone();
            registry.handle_gossip_func(name, move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        assert_eq!(registry.ticker_count(), 3);
        registry.tick().await;
        registry.tick().await;
        assert_eq!(hits.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_registration_queries() {
        let registry = HandlerRegistry::new();
        let topic = Topic::gossip(EntityKind::Volume);
        assert!(!registry.has_handler(&topic));
        registry.handle_func(topic, |_, _| async {});
        assert!(registry.has_handler(&topic));
        assert!(!registry.has_reply_handler(&topic));
    }
}
