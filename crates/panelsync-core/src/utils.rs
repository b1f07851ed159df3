/*!
 * Async helpers shared by the PanelSync crates.
 */
use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Run a future with a timeout
///
/// # Arguments
///
/// * `duration` - The timeout duration
/// * `future` - The future to run
///
/// # Returns
///
/// The result of the future, or a timeout error if the timeout is reached
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!("Operation timed out after {:?}", duration))),
    }
}

/// Poll `condition` until it holds, checking at most `attempts` times
///
/// The condition is checked before each sleep, so a condition that already
/// holds returns immediately. Returns whether the condition was met.
pub async fn poll_until<F>(interval: Duration, attempts: u32, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..attempts {
        if condition() {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    condition()
}

/// Spawn a task that logs its outcome
///
/// # Arguments
///
/// * `name` - A name for the task (for logging)
/// * `fut` - The future to run
pub fn spawn_and_log<F, T, E>(name: &str, fut: F) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = std::result::Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let task_name = name.to_string();
    tokio::spawn(async move {
        match fut.await {
            Ok(_) => {
                debug!("Task '{}' completed successfully", task_name);
            }
            Err(e) => {
                warn!("Task '{}' failed: {}", task_name, e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result = with_timeout(Duration::from_secs(1), async { Ok::<_, Error>(42) }).await;
        assert_eq!(assert_ok!(result), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, Error>(42)
        })
        .await;
        assert!(matches!(assert_err!(result), Error::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_immediate() {
        let start = tokio::time::Instant::now();
        assert!(poll_until(Duration::from_millis(100), 20, || true).await);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_eventually() {
        let checks = Arc::new(AtomicU32::new(0));
        let counter = checks.clone();
        let start = tokio::time::Instant::now();

        let met = poll_until(Duration::from_millis(100), 20, move || {
            counter.fetch_add(1, Ordering::SeqCst) >= 3
        })
        .await;

        assert!(met);
        assert_eq!(checks.load(Ordering::SeqCst), 4);
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert!(start.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_gives_up() {
        let start = tokio::time::Instant::now();
        assert!(!poll_until(Duration::from_millis(100), 20, || false).await);
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_millis(2100));
    }

    #[tokio::test]
    async fn test_spawn_and_log() {
        let ok = spawn_and_log("ok", async { Ok::<_, Error>(()) });
        let failed = spawn_and_log("failed", async { Err::<(), _>(Error::other("boom")) });
        assert_ok!(ok.await);
        assert_ok!(failed.await);
    }
}
