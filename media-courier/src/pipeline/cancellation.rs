//! Cancellation helpers shared by the pipeline stages.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Fail fast at a stage boundary.
pub fn ensure_not_cancelled(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Race `fut` against the token. When the token wins, `fut` is dropped and
/// [`Error::Cancelled`] is returned.
pub async fn race_cancellation<T, F>(token: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}
