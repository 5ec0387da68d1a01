//! Bounded retry for optimistic-lock conflicts

use std::future::Future;
use std::time::Duration;

use agicash_common::Error;
use bitcoin::secp256k1::rand::{self, Rng};

/// Attempts per transition, including the first
const MAX_ATTEMPTS: u32 = 3;

/// Run a transition, retrying on [`Error::Concurrency`] with jitter.
///
/// The closure must re-read the record on each call so the retry sees
/// the winner's version. Non-retryable errors surface immediately.
pub async fn with_retry<T, F, Fut>(mut operation: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < MAX_ATTEMPTS => {
                let jitter = rand::thread_rng().gen_range(10..50);
                tracing::debug!(attempt, "version conflict, retrying in {jitter}ms");
                tokio::time::sleep(Duration::from_millis(jitter)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn retries_concurrency_until_bound() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Error> = with_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(Error::Concurrency {
                    record: "test",
                    id: "1".to_string(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_fails_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Error> = with_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::InsufficientBalance) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_after_conflict() {
        let calls = AtomicU32::new(0);
        let result = with_retry(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(Error::Concurrency {
                        record: "test",
                        id: "1".to_string(),
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 1);
    }
}
