//! Cooperative yielding to the host.
//!
//! Long local operations (bulk writes, paged reads) run on the same
//! executor as the UI host. They hand control back between chunks through a
//! [`HostScheduler`] so input and painting keep up.

use async_trait::async_trait;

#[async_trait]
pub trait HostScheduler: Send + Sync {
    /// Lets other ready work run before resuming.
    async fn yield_now(&self);

    /// Resumes after the host's next frame. Hosts without a paint loop
    /// just yield.
    async fn next_paint(&self) {
        self.yield_now().await;
    }
}

/// Scheduler backed by the tokio executor.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

#[async_trait]
impl HostScheduler for TokioScheduler {
    async fn yield_now(&self) {
        tokio::task::yield_now().await;
    }
}
