mod leaf_server;

pub use leaf_server::{router as leaf_router, serve as serve_leaf_endpoint};
