//! Host-side utilities: the process-wide worker pool and pooled staging
//! caches.

pub mod cache;
pub mod pool;

pub use cache::CachePool;
pub use pool::{global_worker_pool, WorkerPool};
