//! QUIC Transport
//!
//! Peer-to-peer delivery of replication messages over QUIC (via Quinn).
//! Unidirectional streams carry fire-and-forget gossip; bidirectional
//! streams carry full-sync requests and their replies. Peers are addressed
//! by node id and resolved through the membership table.
//!
//! Uses Sans-IO pattern: framing and frame authentication are separated from
//! I/O for testability.

use crate::domain::ports::{PeerTransport, TransportError};
use crate::replication::config::{ReplicationConfig, TransportAuth};
use crate::replication::dispatch::HandlerRegistry;
use crate::replication::membership::MembershipService;
use crate::replication::types::{Message, NodeId, Peer};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use quinn::{ClientConfig, Connection, Endpoint, ServerConfig};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest frame accepted from a peer.
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

const SERVER_NAME: &str = "localhost";

type HmacSha256 = Hmac<Sha256>;

// ==================== Sans-IO Functions ====================

/// Authenticated wrapper around a bincode body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub body: Vec<u8>,
    pub tag: Vec<u8>,
}

/// Answer to a request, sent back on the same bidirectional stream.
pub type Reply = Result<Vec<u8>, String>;

fn auth_tag(auth: &TransportAuth, body: &[u8]) -> Result<Vec<u8>, TransportError> {
    match auth {
        TransportAuth::None => Ok(Vec::new()),
        TransportAuth::SharedKey(key) => {
            let mut mac = HmacSha256::new_from_slice(key)
                .map_err(|e| TransportError::Codec(format!("invalid cluster key: {}", e)))?;
            mac.update(body);
            Ok(mac.finalize().into_bytes().to_vec())
        }
        TransportAuth::BearerToken(token) => Ok(token.as_bytes().to_vec()),
    }
}

fn verify_tag(auth: &TransportAuth, body: &[u8], tag: &[u8]) -> bool {
    match auth {
        TransportAuth::None => true,
        TransportAuth::SharedKey(key) => match HmacSha256::new_from_slice(key) {
            Ok(mut mac) => {
                mac.update(body);
                mac.verify_slice(tag).is_ok()
            }
            Err(_) => false,
        },
        TransportAuth::BearerToken(token) => constant_time_eq(token.as_bytes(), tag),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Serialize and authenticate `value` (Sans-IO pattern).
pub fn seal<T: Serialize>(auth: &TransportAuth, value: &T) -> Result<Vec<u8>, TransportError> {
    let body = bincode::serialize(value).map_err(|e| TransportError::Codec(e.to_string()))?;
    let tag = auth_tag(auth, &body)?;
    bincode::serialize(&Envelope { body, tag }).map_err(|e| TransportError::Codec(e.to_string()))
}

/// Check the tag and deserialize the body (Sans-IO pattern).
pub fn open<T: serde::de::DeserializeOwned>(
    auth: &TransportAuth,
    data: &[u8],
) -> Result<T, TransportError> {
    let envelope: Envelope =
        bincode::deserialize(data).map_err(|e| TransportError::Codec(e.to_string()))?;
    if !verify_tag(auth, &envelope.body, &envelope.tag) {
        return Err(TransportError::Rejected("frame authentication failed".into()));
    }
    bincode::deserialize(&envelope.body).map_err(|e| TransportError::Codec(e.to_string()))
}

/// Prefix `data` with its big-endian u32 length.
pub fn encode_frame(data: &[u8]) -> Result<Vec<u8>, TransportError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(TransportError::Codec(format!("frame too large: {} bytes", data.len())));
    }
    let mut frame = Vec::with_capacity(4 + data.len());
    frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
    frame.extend_from_slice(data);
    Ok(frame)
}

/// Decode a length from the first 4 bytes.
pub fn decode_length(buf: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*buf)
}

/// Read one length-prefixed frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, TransportError> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?;
    let len = decode_length(&len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::Codec(format!("frame too large: {} bytes", len)));
    }

    let mut data = vec![0u8; len];
    reader
        .read_exact(&mut data)
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?;
    Ok(data)
}

fn connection_error<E: std::fmt::Display>(e: E) -> TransportError {
    TransportError::Connection(e.to_string())
}

// ==================== Service ====================

/// QUIC implementation of the peer transport.
pub struct TransportService {
    local: Peer,
    bind_addr: SocketAddr,
    auth: TransportAuth,
    request_timeout: Duration,
    membership: Arc<MembershipService>,
    registry: Arc<HandlerRegistry>,
    endpoint: RwLock<Option<Endpoint>>,
    connections: RwLock<HashMap<NodeId, Connection>>,
    shutdown: AtomicBool,
}

impl TransportService {
    pub fn new(
        config: &ReplicationConfig,
        membership: Arc<MembershipService>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            local: Peer::new(config.node_id.clone(), config.zone.clone()),
            bind_addr: config.transport_addr,
            auth: config.auth.clone(),
            request_timeout: config.request_timeout,
            membership,
            registry,
            endpoint: RwLock::new(None),
            connections: RwLock::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.read().as_ref().and_then(|e| e.local_addr().ok())
    }

    /// Close the endpoint and every cached connection.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.connections.write().clear();
        if let Some(endpoint) = self.endpoint.write().take() {
            endpoint.close(0u32.into(), b"shutdown");
        }
    }

    /// Bind the endpoint and start accepting peers. Returns the bound address.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, TransportError> {
        let cert = rcgen::generate_simple_self_signed(vec![
            self.local.node_id.to_string(),
            SERVER_NAME.to_string(),
        ])
        .map_err(connection_error)?;

        let cert_chain = vec![rustls::pki_types::CertificateDer::from(cert.cert.der().to_vec())];
        let private_key = rustls::pki_types::PrivateKeyDer::try_from(cert.key_pair.serialize_der())
            .map_err(|e| TransportError::Connection(format!("failed to parse private key: {}", e)))?;

        let server_crypto = quinn::rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(connection_error)?;
        let server_config = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
                .map_err(connection_error)?,
        ));

        // Peers present self-signed certificates; frames are authenticated separately.
        let client_crypto = quinn::rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth();
        let client_config = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
                .map_err(connection_error)?,
        ));

        let mut endpoint = Endpoint::server(server_config, self.bind_addr).map_err(connection_error)?;
        endpoint.set_default_client_config(client_config);
        let bound = endpoint.local_addr().map_err(connection_error)?;
        *self.endpoint.write() = Some(endpoint.clone());
        tracing::info!("transport listening on {}", bound);

        let this = self.clone();
        tokio::spawn(async move {
            while let Some(incoming) = endpoint.accept().await {
                if this.is_shutdown() {
                    break;
                }
                let this = this.clone();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(conn) => this.handle_connection(conn).await,
                        Err(e) => tracing::warn!("failed to accept connection: {}", e),
                    }
                });
            }
            tracing::debug!("transport accept loop stopped");
        });

        Ok(bound)
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn handle_connection(self: Arc<Self>, conn: Connection) {
        let remote = conn.remote_address();
        tracing::debug!("peer connected from {}", remote);

        loop {
            tokio::select! {
                uni = conn.accept_uni() => match uni {
                    Ok(mut recv) => {
                        let this = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = this.handle_uni(&mut recv).await {
                                tracing::debug!("dropping gossip frame from {}: {}", remote, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::debug!("connection from {} closed: {}", remote, e);
                        break;
                    }
                },
                bi = conn.accept_bi() => match bi {
                    Ok((mut send, mut recv)) => {
                        let this = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = this.handle_bi(&mut send, &mut recv).await {
                                tracing::debug!("request from {} failed: {}", remote, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::debug!("connection from {} closed: {}", remote, e);
                        break;
                    }
                },
            }
        }
    }

    async fn handle_uni(&self, recv: &mut quinn::RecvStream) -> Result<(), TransportError> {
        let frame = read_frame(recv).await?;
        let (sender, message): (Peer, Message) = open(&self.auth, &frame)?;
        if !self.registry.dispatch(sender, message).await {
            tracing::debug!("no handler for gossip frame");
        }
        Ok(())
    }

    async fn handle_bi(
        &self,
        send: &mut quinn::SendStream,
        recv: &mut quinn::RecvStream,
    ) -> Result<(), TransportError> {
        let frame = read_frame(recv).await?;
        let (sender, message): (Peer, Message) = open(&self.auth, &frame)?;
        let reply: Reply = self
            .registry
            .dispatch_with_reply(sender, message)
            .await
            .map_err(|e| e.to_string());

        let frame = encode_frame(&seal(&self.auth, &reply)?)?;
        send.write_all(&frame).await.map_err(connection_error)?;
        send.finish().map_err(connection_error)?;
        Ok(())
    }

    /// Cached connection to `peer`, dialing it if needed.
    async fn connection(&self, peer: &Peer) -> Result<Connection, TransportError> {
        if let Some(conn) = self.connections.read().get(&peer.node_id) {
            if conn.close_reason().is_none() {
                return Ok(conn.clone());
            }
        }

        let addr = self
            .membership
            .transport_addr_of(&peer.node_id)
            .ok_or_else(|| TransportError::Unreachable(peer.to_string()))?;
        let endpoint = self
            .endpoint
            .read()
            .clone()
            .ok_or_else(|| TransportError::Connection("transport not started".into()))?;

        let conn = endpoint
            .connect(addr, SERVER_NAME)
            .map_err(connection_error)?
            .await
            .map_err(|e| TransportError::Unreachable(format!("{} at {}: {}", peer, addr, e)))?;
        self.connections.write().insert(peer.node_id.clone(), conn.clone());
        Ok(conn)
    }

    async fn send_one(&self, peer: &Peer, frame: &[u8]) -> Result<(), TransportError> {
        let conn = self.connection(peer).await?;
        let mut stream = conn.open_uni().await.map_err(connection_error)?;
        stream.write_all(frame).await.map_err(connection_error)?;
        stream.finish().map_err(connection_error)?;
        Ok(())
    }

    async fn request(&self, peer: &Peer, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        let conn = self.connection(peer).await?;
        let (mut send, mut recv) = conn.open_bi().await.map_err(connection_error)?;
        send.write_all(frame).await.map_err(connection_error)?;
        send.finish().map_err(connection_error)?;

        let response = read_frame(&mut recv).await?;
        let reply: Reply = open(&self.auth, &response)?;
        reply.map_err(TransportError::Rejected)
    }

    fn frame_for(&self, message: Message) -> Result<Vec<u8>, TransportError> {
        encode_frame(&seal(&self.auth, &(self.local.clone(), message))?)
    }
}

#[async_trait]
impl PeerTransport for TransportService {
    fn local(&self) -> &Peer {
        &self.local
    }

    fn peers(&self) -> Vec<Peer> {
        self.membership.peers()
    }

    async fn send(&self, peers: &[Peer], message: Message) -> usize {
        let frame = match self.frame_for(message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("failed to frame message: {}", e);
                return 0;
            }
        };

        let results = futures::future::join_all(peers.iter().map(|p| self.send_one(p, &frame))).await;
        let mut sent = 0;
        for (peer, result) in peers.iter().zip(results) {
            match result {
                Ok(()) => sent += 1,
                Err(e) => tracing::debug!("gossip to {} failed: {}", peer, e),
            }
        }
        sent
    }

    async fn send_to_with_response(
        &self,
        peer: &Peer,
        message: Message,
    ) -> Result<Vec<u8>, TransportError> {
        let frame = self.frame_for(message)?;
        tokio::time::timeout(self.request_timeout, self.request(peer, &frame))
            .await
            .map_err(|_| TransportError::Timeout(peer.to_string()))?
    }
}

/// Skip server certificate verification for self-signed certs in cluster.
#[derive(Debug)]
struct SkipServerVerification;

#[cfg_attr(coverage_nightly, coverage(off))]
impl quinn::rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<quinn::rustls::client::danger::ServerCertVerified, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &quinn::rustls::DigitallySignedStruct,
    ) -> Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &quinn::rustls::DigitallySignedStruct,
    ) -> Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<quinn::rustls::SignatureScheme> {
        vec![
            quinn::rustls::SignatureScheme::RSA_PKCS1_SHA256,
            quinn::rustls::SignatureScheme::RSA_PKCS1_SHA384,
            quinn::rustls::SignatureScheme::RSA_PKCS1_SHA512,
            quinn::rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            quinn::rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            quinn::rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            quinn::rustls::SignatureScheme::RSA_PSS_SHA256,
            quinn::rustls::SignatureScheme::RSA_PSS_SHA384,
            quinn::rustls::SignatureScheme::RSA_PSS_SHA512,
            quinn::rustls::SignatureScheme::ED25519,
        ]
    }
}
