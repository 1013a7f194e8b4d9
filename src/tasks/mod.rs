pub mod pool;
pub mod queue;
pub mod singleflight;

pub use pool::WorkerPool;
pub use queue::TaskQueues;
pub use singleflight::{CachingSingleFlight, SharedError, SingleFlight};
