//! Infrastructure Layer
//!
//! Runtime pieces shared by the replication core.

pub mod retry;
pub mod shutdown;
pub mod work_queue;

pub use retry::RetryPolicy;
pub use shutdown::{shutdown_signal, ShutdownController, TaskGuard};
pub use work_queue::WorkQueue;
