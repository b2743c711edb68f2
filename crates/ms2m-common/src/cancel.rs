//! ---
//! ms2m_section: "01-core-functionality"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Shared primitives and utilities for the migration runtime."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
//! Cancellation-aware futures.
//!
//! Every network call made while driving a migration races against the
//! process-wide [`CancellationToken`] so that shutdown aborts in-flight I/O
//! promptly instead of waiting for the per-call timeout.

use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Error returned when a future lost the race against its cancellation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Extension trait racing a future against a [`CancellationToken`].
#[async_trait]
pub trait OrCancelExt: Sized {
    /// Output of the wrapped future.
    type Output;

    /// Returns `Ok(output)` when the future completes first, or
    /// `Err(Cancelled)` once the token fires.
    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, Cancelled>;
}

#[async_trait]
impl<F> OrCancelExt for F
where
    F: Future + Send,
    F::Output: Send,
{
    type Output = F::Output;

    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, Cancelled> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(Cancelled),
            output = self => Ok(output),
        }
    }
}
