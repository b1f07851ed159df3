/*!
 * Keyed debouncing on the tokio timer.
 *
 * Each key owns at most one pending timer. Scheduling again for a key aborts
 * the previous timer, so only the last action scheduled inside a window runs,
 * once, when the window closes.
 */
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::{Error, Result};

struct Pending {
    generation: u64,
    handle: JoinHandle<()>,
}

type PendingMap<K> = Arc<Mutex<HashMap<K, Pending>>>;

/// Per-key trailing-edge debouncer
pub struct Debouncer<K> {
    pending: PendingMap<K>,
    generation: AtomicU64,
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    /// Create an empty debouncer
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Run `action` once `window` has passed without another call for `key`
    ///
    /// Must be called from within a tokio runtime.
    pub fn debounce<F>(&self, key: K, window: Duration, action: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| Error::runtime("Failed to lock debounce timers"))?;

        if let Some(previous) = pending.remove(&key) {
            previous.handle.abort();
            trace!("Superseded pending action for {:?}", key);
        }

        let timers = self.pending.clone();
        let timer_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            {
                let Ok(mut timers) = timers.lock() else {
                    return;
                };
                match timers.get(&timer_key) {
                    Some(entry) if entry.generation == generation => {
                        timers.remove(&timer_key);
                    }
                    _ => return,
                }
            }
            action.await;
        });

        pending.insert(key, Pending { generation, handle });
        Ok(())
    }

    /// Drop the pending action for `key`, returning whether one existed
    pub fn cancel(&self, key: &K) -> bool {
        let Ok(mut pending) = self.pending.lock() else {
            return false;
        };
        match pending.remove(key) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Drop every pending action
    pub fn cancel_all(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            for (_, entry) in pending.drain() {
                entry.handle.abort();
            }
        }
    }

    /// Number of keys with a timer still running
    pub fn pending(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl<K> Default for Debouncer<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Debug for Debouncer<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self.pending.lock().map(|p| p.len()).unwrap_or(0);
        f.debug_struct("Debouncer").field("pending", &pending).finish()
    }
}

impl<K> Drop for Debouncer<K> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            for (_, entry) in pending.drain() {
                entry.handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    const WINDOW: Duration = Duration::from_millis(250);

    fn recorder() -> Arc<StdMutex<Vec<String>>> {
        Arc::new(StdMutex::new(Vec::new()))
    }

    fn record(log: &Arc<StdMutex<Vec<String>>>, value: String) -> impl Future<Output = ()> {
        let log = log.clone();
        async move {
            log.lock().unwrap().push(value);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_value_wins() -> Result<()> {
        let debouncer = Debouncer::new();
        let log = recorder();

        for i in 1..=5 {
            debouncer.debounce("topic", WINDOW, record(&log, format!("v{}", i)))?;
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        assert!(log.lock().unwrap().is_empty());

        tokio::time::sleep(WINDOW).await;
        assert_eq!(*log.lock().unwrap(), vec!["v5".to_string()]);
        assert_eq!(debouncer.pending(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() -> Result<()> {
        let debouncer = Debouncer::new();
        let log = recorder();

        debouncer.debounce("a", WINDOW, record(&log, "a1".into()))?;
        debouncer.debounce("b", WINDOW, record(&log, "b1".into()))?;
        debouncer.debounce("a", WINDOW, record(&log, "a2".into()))?;
        assert_eq!(debouncer.pending(), 2);

        tokio::time::sleep(WINDOW * 2).await;
        let mut seen = log.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["a2".to_string(), "b1".to_string()]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() -> Result<()> {
        let debouncer = Debouncer::new();
        let log = recorder();

        debouncer.debounce("a", WINDOW, record(&log, "a1".into()))?;
        assert!(debouncer.cancel(&"a"));
        assert!(!debouncer.cancel(&"a"));

        tokio::time::sleep(WINDOW * 2).await;
        assert!(log.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_windows_each_fire() -> Result<()> {
        let debouncer = Debouncer::new();
        let log = recorder();

        debouncer.debounce("a", WINDOW, record(&log, "first".into()))?;
        tokio::time::sleep(WINDOW * 2).await;
        debouncer.debounce("a", WINDOW, record(&log, "second".into()))?;
        tokio::time::sleep(WINDOW * 2).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["first".to_string(), "second".to_string()]
        );
        Ok(())
    }
}
