mod entity_store;
mod merge_observer;
mod peer_transport;
mod role_cache;

pub use entity_store::{EntityStore, EntityStores, StoreError};
pub use merge_observer::MergeObserver;
pub use peer_transport::{PeerTransport, TransportError};
pub use role_cache::RoleCache;
