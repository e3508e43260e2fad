//! Merge Observer Port
//!
//! Side effects triggered after the merge path writes a record locally.

use async_trait::async_trait;

/// Notified once per record written by a merge.
///
/// `previous` is the local record that was overwritten, or `None` when the
/// record was seen for the first time.
#[async_trait]
pub trait MergeObserver<E>: Send + Sync {
    async fn merged(&self, previous: Option<E>, current: &E);
}
