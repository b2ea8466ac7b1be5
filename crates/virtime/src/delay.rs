use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::DelayError;

/// Waits `ms` of *real* time, regardless of any installed virtual clock.
///
/// This is the escape hatch for tests that must wait on genuine
/// asynchronous boundaries while virtual time is driven independently.
/// A token observed as already cancelled fails fast; cancellation during
/// the wait tears the sleep down and rejects.
pub async fn delay(ms: u64, cancel: Option<&CancellationToken>) -> Result<(), DelayError> {
    match cancel {
        Some(token) => {
            if token.is_cancelled() {
                return Err(DelayError::Cancelled);
            }
            tokio::select! {
                _ = token.cancelled() => Err(DelayError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(()),
            }
        }
        None => {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn resolves_after_the_real_wait() {
        let wait = tokio::spawn(delay(100, None));
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(wait.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn already_cancelled_token_fails_fast() {
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(delay(10_000, Some(&token)).await, Err(DelayError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_the_wait_rejects() {
        let token = CancellationToken::new();
        let watched = token.clone();
        let wait = tokio::spawn(async move { delay(10_000, Some(&watched)).await });
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(50)).await;
        token.cancel();
        assert_eq!(wait.await.unwrap(), Err(DelayError::Cancelled));
    }
}
