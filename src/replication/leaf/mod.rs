//! Leaf Federation
//!
//! A hierarchical push protocol, separate from the peer mesh. An origin
//! serves authenticated leaves a filtered view of its state; a leaf merges
//! what it receives and never pushes back.

mod client;
mod origin;
mod protocol;
mod session;

pub use client::{LeafClient, LeafClientConfig};
pub use origin::{authenticate_leaf, serve_leaf, stream_full_sync, LeafAuthError, OriginState};
pub use protocol::{
    control_frame, decode_frame, decode_payload, encode_frame, LeafError, LeafMessageType,
    Register, RegisterResponse,
};
pub use session::{
    channel_link, ChannelSink, ChannelStream, LeafHub, LeafSession, LeafSink, LeafStream,
    SESSION_QUEUE_CAPACITY,
};
