// Named FIFO queues. Work submitted under the same name runs one at a time
// in submission order; the queue entry goes away once it has drained.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::debug;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(thiserror::Error, Debug)]
#[error("queued operation was dropped before completing")]
pub struct QueueDropped;

#[derive(Default)]
pub struct TaskQueues {
    inner: Mutex<HashMap<String, VecDeque<Job>>>,
}

impl TaskQueues {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Submit an operation under `name` and wait for its result. Operations
    /// sharing a name never overlap and complete in submission order.
    pub async fn run<F, T>(self: &Arc<Self>, name: &str, fut: F) -> Result<T, QueueDropped>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            _ = tx.send(fut.await);
        });

        let start_drain = {
            let mut inner = self.inner.lock().unwrap();
            match inner.get_mut(name) {
                Some(pending) => {
                    pending.push_back(job);
                    false
                }
                None => {
                    inner.insert(name.to_owned(), VecDeque::from([job]));
                    true
                }
            }
        };

        if start_drain {
            let queues = Arc::clone(self);
            let name = name.to_owned();
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut inner = queues.inner.lock().unwrap();
                        match inner.get_mut(&name).and_then(VecDeque::pop_front) {
                            Some(job) => job,
                            None => {
                                // drained, destroy the queue entry
                                inner.remove(&name);
                                debug!(name, "task queue drained");
                                break;
                            }
                        }
                    };
                    job.await;
                }
            });
        }

        rx.await.map_err(|_| QueueDropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_name_runs_in_submission_order() {
        let queues = TaskQueues::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..8usize {
            let queues = Arc::clone(&queues);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                queues
                    .run("writer", async move {
                        // earlier submissions sleep longer; order must still hold
                        tokio::time::sleep(Duration::from_millis(20 - i as u64)).await;
                        order.lock().unwrap().push(i);
                    })
                    .await
                    .unwrap();
            }));
            // force deterministic submission order
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn distinct_names_run_concurrently() {
        let queues = TaskQueues::new();
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..4usize {
            let queues = Arc::clone(&queues);
            let live = Arc::clone(&live);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                queues
                    .run(&format!("queue-{i}"), async move {
                        let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        live.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn queue_entry_destroyed_after_drain() {
        let queues = TaskQueues::new();
        queues.run("once", async {}).await.unwrap();
        // the drain task removes the entry asynchronously
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(queues.inner.lock().unwrap().is_empty());
    }
}
