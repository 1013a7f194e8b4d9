// Bounded concurrency. Excess callers wait on the semaphore's FIFO; nothing
// in-flight is ever cancelled from here.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    pub async fn run<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        // the semaphore is never closed, acquisition only fails after close
        let _permit = self
            .permits
            .acquire()
            .await
            .expect("worker pool semaphore closed");
        fut.await
    }
}
