//! Adapters Layer
//!
//! Inbound: the origin's leaf endpoint.
//! Outbound: entity stores, the role cache and the leaf-side link.

pub mod inbound;
pub mod outbound;
