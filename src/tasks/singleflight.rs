// De-duplicated execution. Callers racing on the same id all receive the
// leader's result, success or failure; the operation itself runs once.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tokio::sync::oneshot;

/// Failure shared between the leader and every waiting caller.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{0}")]
pub struct SharedError(pub Arc<anyhow::Error>);

impl From<anyhow::Error> for SharedError {
    fn from(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }
}

type Waiters<V> = Vec<oneshot::Sender<Result<V, SharedError>>>;

pub struct SingleFlight<V: Clone> {
    inflight: Mutex<HashMap<String, Waiters<V>>>,
}

impl<V: Clone> Default for SingleFlight<V> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Clone + Send + 'static> SingleFlight<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fut` under `id`, or wait on the invocation already running
    /// under it. The id must be equivalence-stable: two calls with the same
    /// id must describe the same work.
    pub async fn run<F>(&self, id: &str, fut: F) -> Result<V, SharedError>
    where
        F: Future<Output = anyhow::Result<V>>,
    {
        let waiter = {
            let mut inflight = self.inflight.lock().unwrap();
            match inflight.get_mut(id) {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    inflight.insert(id.to_owned(), Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            return match rx.await {
                Ok(result) => result,
                // leader dropped mid-flight, surface as a failure
                Err(_) => Err(SharedError::from(anyhow::anyhow!(
                    "coalesced operation abandoned"
                ))),
            };
        }

        let result = fut.await.map_err(SharedError::from);

        let waiters = self
            .inflight
            .lock()
            .unwrap()
            .remove(id)
            .unwrap_or_default();
        for tx in waiters {
            _ = tx.send(result.clone());
        }

        result
    }
}

/// Single-flight with successful results memoized in an LRU.
pub struct CachingSingleFlight<V: Clone> {
    cache: Mutex<LruCache<String, V>>,
    flight: SingleFlight<V>,
}

impl<V: Clone + Send + 'static> CachingSingleFlight<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
            flight: SingleFlight::new(),
        }
    }

    pub async fn run<F>(&self, id: &str, fut: F) -> Result<V, SharedError>
    where
        F: Future<Output = anyhow::Result<V>>,
    {
        if let Some(hit) = self.cache.lock().unwrap().get(id).cloned() {
            return Ok(hit);
        }

        let value = self.flight.run(id, fut).await?;
        self.cache
            .lock()
            .unwrap()
            .put(id.to_owned(), value.clone());
        Ok(value)
    }

    pub fn remove(&self, id: &str) {
        self.cache.lock().unwrap().pop(id);
    }

    /// Drop every entry whose key starts with `prefix`. Used for per-repo
    /// invalidation where keys are `account/repo/branch`.
    pub fn remove_prefix(&self, prefix: &str) {
        let mut cache = self.cache.lock().unwrap();
        let stale: Vec<String> = cache
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            cache.pop(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let flight = Arc::new(SingleFlight::<String>::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let flight = Arc::clone(&flight);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                flight
                    .run("artifact", async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(40)).await;
                        Ok("payload".to_owned())
                    })
                    .await
            }));
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "payload");
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_shared() {
        let flight = Arc::new(SingleFlight::<()>::new());

        let leader = {
            let flight = Arc::clone(&flight);
            tokio::spawn(async move {
                flight
                    .run("boom", async {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        anyhow::bail!("backing store went away")
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let follower = flight.run("boom", async { Ok(()) }).await;

        assert!(leader.await.unwrap().is_err());
        assert!(follower.is_err());
    }

    #[tokio::test]
    async fn cached_results_skip_execution() {
        let cached = CachingSingleFlight::<u32>::new(8);
        let runs = AtomicUsize::new(0);

        for _ in 0..3 {
            let got = cached
                .run("k", async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await
                .unwrap();
            assert_eq!(got, 7);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        cached.remove("k");
        cached
            .run("k", async {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn prefix_removal_evicts_matching_keys() {
        let cached = CachingSingleFlight::<u32>::new(8);
        for key in ["a/r/main", "a/r/dev", "b/r/main"] {
            cached.run(key, async { Ok(1) }).await.unwrap();
        }
        cached.remove_prefix("a/r/");

        let runs = AtomicUsize::new(0);
        cached
            .run("b/r/main", async {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0, "b/r/main should still be cached");
    }
}
