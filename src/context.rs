//! Cancellation helpers
//!
//! Every long-running operation takes a `CancellationToken` as its
//! context. Deadlines are expressed by cancelling the token.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Run `fut` unless `ctx` is cancelled first
pub async fn cancellable<T, F>(ctx: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if ctx.is_cancelled() {
        return Err(Error::Cancelled);
    }
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

/// Child of `parent` that is cancelled after `timeout`.
///
/// The returned guard stops the timer when dropped.
pub fn with_deadline(
    parent: &CancellationToken,
    timeout: Duration,
) -> (CancellationToken, tokio_util::sync::DropGuard) {
    let ctx = parent.child_token();
    let timer_ctx = ctx.clone();
    let stop = CancellationToken::new();
    let stop_timer = stop.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => timer_ctx.cancel(),
            _ = stop_timer.cancelled() => {}
        }
    });
    (ctx, stop.drop_guard())
}
