//! WebSocket Leaf Link
//!
//! Leaf-side connection to an origin's `/cluster/leaf` endpoint. Frames
//! travel as binary WebSocket messages; the API token goes in the
//! `Authorization` header.

use crate::replication::leaf::{LeafError, LeafSink, LeafStream};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

/// Path of the leaf endpoint on the origin.
pub const LEAF_PATH: &str = "/cluster/leaf";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct OriginSink(SplitSink<Socket, Message>);

pub struct OriginStream(SplitStream<Socket>);

/// Map an origin base URL to its leaf WebSocket endpoint.
pub fn leaf_endpoint(origin_url: &str) -> Result<Url, LeafError> {
    let mut url =
        Url::parse(origin_url).map_err(|e| LeafError::Link(format!("bad origin url: {}", e)))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(LeafError::Link(format!("unsupported origin scheme {}", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| LeafError::Link("cannot rewrite origin scheme".into()))?;

    let path = format!("{}{}", url.path().trim_end_matches('/'), LEAF_PATH);
    url.set_path(&path);
    Ok(url)
}

/// Open a link to the origin, authenticated with `token`.
#[cfg_attr(coverage_nightly, coverage(off))]
pub async fn connect_origin(
    origin_url: &str,
    token: &str,
) -> Result<(OriginStream, OriginSink), LeafError> {
    let url = leaf_endpoint(origin_url)?;
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| LeafError::Link(e.to_string()))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| LeafError::Link(format!("bad token: {}", e)))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    tracing::debug!("connecting to origin {}", url);
    let (socket, _) = connect_async(request)
        .await
        .map_err(|e| LeafError::Link(e.to_string()))?;
    let (write, read) = socket.split();
    tracing::info!("connected to origin {}", url);

    Ok((OriginStream(read), OriginSink(write)))
}

#[async_trait]
impl LeafSink for OriginSink {
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
impl LeafStream for OriginStream {
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
