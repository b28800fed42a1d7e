//! The one timeout race used at every suspension point: JSON-RPC calls,
//! native tool handlers and provider round trips all go through [`race`].

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Why a raced future did not produce its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Interrupted {
    #[error("timed out after {}s", .0.as_secs_f32())]
    TimedOut(Duration),
    #[error("cancelled")]
    Cancelled,
}

/// Drive `fut` until it completes, `duration` elapses, or `cancel` fires.
///
/// Cancellation wins ties so a disconnect is never reported as a timeout.
pub async fn race<F>(duration: Duration, cancel: &CancellationToken, fut: F) -> Result<F::Output, Interrupted>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupted::Cancelled),
        res = tokio::time::timeout(duration, fut) => res.map_err(|_| Interrupted::TimedOut(duration)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_before_deadline() {
        let token = CancellationToken::new();
        let out = race(Duration::from_secs(1), &token, async { 7 }).await;
        assert_eq!(out, Ok(7));
    }

    #[tokio::test]
    async fn times_out() {
        let token = CancellationToken::new();
        let out = race(
            Duration::from_millis(20),
            &token,
            tokio::time::sleep(Duration::from_secs(5)),
        )
        .await;
        assert_eq!(out, Err(Interrupted::TimedOut(Duration::from_millis(20))));
    }

    #[tokio::test]
    async fn cancellation_wins() {
        let token = CancellationToken::new();
        token.cancel();
        let out = race(Duration::from_secs(5), &token, async { 1 }).await;
        assert_eq!(out, Err(Interrupted::Cancelled));
    }
}
