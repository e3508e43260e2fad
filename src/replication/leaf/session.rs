//! Leaf sessions on the origin
//!
//! Each attached leaf owns a bounded outbound queue drained by a writer
//! task. Producers never wait on a slow leaf: when the queue is full the
//! frame is dropped and logged. The writer retries each frame according to
//! its `RetryPolicy` before giving up on it.

use crate::infrastructure::RetryPolicy;
use crate::replication::entity::{LeafContext, Replicated};
use crate::replication::leaf::protocol::{encode_frame, LeafError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// Capacity of each leaf session's outbound queue.
pub const SESSION_QUEUE_CAPACITY: usize = 100;

/// Outbound half of a leaf link.
#[async_trait]
pub trait LeafSink: Send {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), LeafError>;
    async fn close(&mut self);
}

/// Inbound half of a leaf link. `None` means the peer closed the link.
#[async_trait]
pub trait LeafStream: Send {
    async fn recv(&mut self) -> Option<Result<Vec<u8>, LeafError>>;
}

/// In-memory link end backed by channels.
pub struct ChannelSink(mpsc::UnboundedSender<Vec<u8>>);

pub struct ChannelStream(mpsc::UnboundedReceiver<Vec<u8>>);

#[async_trait]
impl LeafSink for ChannelSink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), LeafError> {
        self.0.send(frame).map_err(|_| LeafError::Closed)
    }

    async fn close(&mut self) {}
}

#[async_trait]
impl LeafStream for ChannelStream {
    async fn recv(&mut self) -> Option<Result<Vec<u8>, LeafError>> {
        self.0.recv().await.map(Ok)
    }
}

/// Two connected in-memory link ends, `(origin side, leaf side)`.
pub fn channel_link() -> ((ChannelStream, ChannelSink), (ChannelStream, ChannelSink)) {
    let (to_leaf, from_origin) = mpsc::unbounded_channel();
    let (to_origin, from_leaf) = mpsc::unbounded_channel();
    (
        (ChannelStream(from_leaf), ChannelSink(to_leaf)),
        (ChannelStream(from_origin), ChannelSink(to_origin)),
    )
}

/// Handle to one registered session.
#[derive(Clone)]
pub struct LeafSession {
    pub id: Uuid,
    pub context: LeafContext,
    tx: mpsc::Sender<Vec<u8>>,
}

impl LeafSession {
    /// Queue a frame without waiting. Returns false if it was dropped.
    pub fn try_send(&self, frame: Vec<u8>) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("leaf session {} queue full, dropping frame", self.id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("leaf session {} closed, dropping frame", self.id);
                false
            }
        }
    }

    /// Queue a frame, waiting for room. Used by the full-sync stream.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), LeafError> {
        self.tx.send(frame).await.map_err(|_| LeafError::Closed)
    }
}

/// Table of attached leaf sessions.
pub struct LeafHub {
    sessions: RwLock<HashMap<Uuid, LeafSession>>,
    retry: RetryPolicy,
}

impl LeafHub {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            retry,
        }
    }

    /// Attach a leaf and start its writer.
    pub fn register(&self, context: LeafContext, sink: Box<dyn LeafSink>) -> LeafSession {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(SESSION_QUEUE_CAPACITY);
        let session = LeafSession {
            id: Uuid::new_v4(),
            context,
            tx,
        };

        let sink = Arc::new(Mutex::new(sink));
        let retry = self.retry;
        let id = session.id;
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let result = retry
                    .run(|_| {
                        let sink = sink.clone();
                        let frame = frame.clone();
                        async move { sink.lock().await.send(frame).await }
                    })
                    .await;
                if let Err(e) = result {
                    tracing::error!("leaf session {}: giving up on frame: {}", id, e);
                }
            }
            sink.lock().await.close().await;
            tracing::debug!("leaf session {} writer stopped", id);
        });

        tracing::info!(
            "leaf session {} attached for user {} in zone {}",
            session.id,
            session.context.user_id,
            session.context.zone
        );
        self.sessions.write().insert(session.id, session.clone());
        session
    }

    /// Detach a session. Its writer stops once the queue drains.
    pub fn unregister(&self, id: &Uuid) {
        if self.sessions.write().remove(id).is_some() {
            tracing::info!("leaf session {} detached", id);
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Drop every session.
    pub fn close_all(&self) {
        self.sessions.write().clear();
    }

    /// Push a batch to every session allowed to see some of it.
    pub fn fan_out<E: Replicated>(&self, batch: &[E]) {
        let Some(kind) = E::LEAF_MESSAGE else {
            return;
        };

        let sessions: Vec<LeafSession> = self.sessions.read().values().cloned().collect();
        for session in sessions {
            let visible: Vec<E> = batch
                .iter()
                .filter(|e| e.replicable())
                .filter_map(|e| e.leaf_view(&session.context))
                .collect();
            if visible.is_empty() {
                continue;
            }

            match encode_frame(kind, &visible) {
                Ok(frame) => {
                    session.try_send(frame);
                }
                Err(e) => tracing::error!("failed to encode {:?} for leaf: {}", kind, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{Group, TemplateVar, User};
    use crate::replication::leaf::protocol::{decode_frame, decode_payload, LeafMessageType};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn context(user_id: &str) -> LeafContext {
        LeafContext { zone: "eu".into(), user_id: user_id.into() }
    }

    async fn next_frame(stream: &mut ChannelStream) -> Vec<u8> {
        tokio::time::timeout(Duration::from_secs(1), stream.recv())
            .await
            .expect("frame in time")
            .expect("link open")
            .unwrap()
    }

    #[tokio::test]
    async fn test_fan_out_reaches_session() {
        let hub = LeafHub::new(RetryPolicy::default());
        let ((_origin_stream, origin_sink), (mut leaf_stream, _leaf_sink)) = channel_link();
        hub.register(context("u1"), Box::new(origin_sink));

        hub.fan_out(&[Group { id: "g1".into(), ..Default::default() }]);

        let frame = next_frame(&mut leaf_stream).await;
        let (kind, payload) = decode_frame(&frame).unwrap();
        assert_eq!(kind, LeafMessageType::GossipGroup);
        let groups: Vec<Group> = decode_payload(payload).unwrap();
        assert_eq!(groups[0].id, "g1");
    }

    #[tokio::test]
    async fn test_fan_out_filters_by_tenant() {
        let hub = LeafHub::new(RetryPolicy::default());
        let ((_o1, sink1), (mut leaf1, _)) = channel_link();
        let ((_o2, sink2), (mut leaf2, _)) = channel_link();
        hub.register(context("u1"), Box::new(sink1));
        hub.register(context("u2"), Box::new(sink2));

        hub.fan_out(&[User { id: "u1".into(), ..Default::default() }]);

        let frame = next_frame(&mut leaf1).await;
        assert_eq!(decode_frame(&frame).unwrap().0, LeafMessageType::GossipUser);
        let nothing = tokio::time::timeout(Duration::from_millis(50), leaf2.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_fan_out_scrubs_local_vars() {
        let hub = LeafHub::new(RetryPolicy::default());
        let ((_o, sink), (mut leaf, _)) = channel_link();
        hub.register(context("u1"), Box::new(sink));

        hub.fan_out(&[TemplateVar {
            id: "v1".into(),
            value: "secret".into(),
            local: true,
            ..Default::default()
        }]);

        let frame = next_frame(&mut leaf).await;
        let vars: Vec<TemplateVar> = decode_payload(decode_frame(&frame).unwrap().1).unwrap();
        assert!(vars[0].value.is_empty());
        assert!(vars[0].is_deleted);
    }

    #[tokio::test]
    async fn test_full_queue_drops_frames() {
        struct StuckSink;

        #[async_trait]
        impl LeafSink for StuckSink {
            async fn send(&mut self, _frame: Vec<u8>) -> Result<(), LeafError> {
                std::future::pending().await
            }
            async fn close(&mut self) {}
        }

        let hub = LeafHub::new(RetryPolicy::default());
        let session = hub.register(context("u1"), Box::new(StuckSink));

        // One frame is held by the writer, the rest fill the queue.
        let accepted = (0..SESSION_QUEUE_CAPACITY + 10)
            .filter(|_| session.try_send(vec![0]))
            .count();
        assert!(accepted <= SESSION_QUEUE_CAPACITY + 1);
        assert!(!session.try_send(vec![0]));
    }

    #[tokio::test]
    async fn test_writer_retries_then_gives_up() {
        struct FlakySink(Arc<AtomicU32>);

        #[async_trait]
        impl LeafSink for FlakySink {
            async fn send(&mut self, _frame: Vec<u8>) -> Result<(), LeafError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(LeafError::Link("reset".into()))
            }
            async fn close(&mut self) {}
        }

        let attempts = Arc::new(AtomicU32::new(0));
        let hub = LeafHub::new(RetryPolicy::new(3, Duration::from_millis(1)));
        let session = hub.register(context("u1"), Box::new(FlakySink(attempts.clone())));

        assert!(session.try_send(vec![1]));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unregister() {
        let hub = LeafHub::new(RetryPolicy::default());
        let ((_o, sink), _leaf) = channel_link();
        let session = hub.register(context("u1"), Box::new(sink));
        assert_eq!(hub.session_count(), 1);
        hub.unregister(&session.id);
        assert_eq!(hub.session_count(), 0);
    }
}
