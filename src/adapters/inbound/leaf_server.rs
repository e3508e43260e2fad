//! Leaf Federation Endpoint
//!
//! Origin-side HTTP endpoint leaves connect to. The request must carry a
//! valid API token as a bearer credential (401 otherwise) and must be a
//! WebSocket upgrade (426 otherwise). The upgraded socket is handed to the
//! origin protocol driver.

use crate::adapters::outbound::LEAF_PATH;
use crate::replication::leaf::{
    authenticate_leaf, serve_leaf, LeafError, LeafSink, LeafStream, OriginState,
};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

pub fn router(state: Arc<OriginState>) -> Router {
    Router::new()
        .route(LEAF_PATH, get(leaf_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the leaf endpoint on `listener` until `shutdown` fires.
#[cfg_attr(coverage_nightly, coverage(off))]
pub async fn serve(
    listener: TcpListener,
    state: Arc<OriginState>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    tracing::info!("leaf endpoint listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

async fn leaf_handler(
    State(state): State<Arc<OriginState>>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let user = match authenticate_leaf(&state.stores, token).await {
        Ok(user) => user,
        Err(e) => {
            tracing::warn!("leaf authentication failed: {}", e);
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!("leaf request without upgrade: {}", e);
            return StatusCode::UPGRADE_REQUIRED.into_response();
        }
    };

    tracing::info!("leaf connected for user {}", user.id);
    ws.on_upgrade(move |socket: WebSocket| async move {
        let (write, read) = socket.split();
        let user_id = user.id.clone();
        match serve_leaf(state, user, SocketStream(read), SocketSink(write)).await {
            Ok(()) => tracing::info!("leaf for user {} disconnected", user_id),
            Err(e) => tracing::warn!("leaf for user {} dropped: {}", user_id, e),
        }
    })
}

struct SocketSink(SplitSink<WebSocket, Message>);

struct SocketStream(SplitStream<WebSocket>);

#[async_trait]
impl LeafSink for SocketSink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), LeafError> {
        self.0
            .send(Message::Binary(frame))
            .await
            .map_err(|e| LeafError::Link(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.0.close().await;
    }
}

#[async_trait]
impl LeafStream for SocketStream {
    async fn recv(&mut self) -> Option<Result<Vec<u8>, LeafError>> {
        loop {
            match self.0.next().await? {
                Ok(Message::Binary(frame)) => return Some(Ok(frame)),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(LeafError::Link(e.to_string()))),
            }
        }
    }
}
