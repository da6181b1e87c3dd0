//! Process-wide worker pool.
//!
//! Used only for coarse-grained host parallelism: shader pre-compilation,
//! dynamic-transform updates when the instance count exceeds 128, and
//! alias-table construction. Device kernels never touch this pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use flume::{Receiver, Sender};
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// A fixed-size thread pool fed through an unbounded channel.
pub struct WorkerPool {
    sender: Sender<Task>,
    pending: Arc<(Mutex<usize>, Condvar)>,
    threads: usize,
}

impl WorkerPool {
    /// Creates a pool with `threads` workers.
    pub fn new(threads: usize) -> Self {
        let (sender, receiver): (Sender<Task>, Receiver<Task>) = flume::unbounded();
        let pending = Arc::new((Mutex::new(0usize), Condvar::new()));
        for i in 0..threads.max(1) {
            let receiver = receiver.clone();
            let pending = Arc::clone(&pending);
            thread::Builder::new()
                .name(format!("candela-worker-{i}"))
                .spawn(move || {
                    while let Ok(task) = receiver.recv() {
                        task();
                        let (lock, cvar) = &*pending;
                        let mut n = lock.lock();
                        *n -= 1;
                        if *n == 0 {
                            cvar.notify_all();
                        }
                    }
                })
                .expect("failed to spawn worker thread");
        }
        Self {
            sender,
            pending,
            threads: threads.max(1),
        }
    }

    /// Submits one asynchronous task.
    pub fn spawn(&self, task: impl FnOnce() + Send + 'static) {
        {
            let (lock, _) = &*self.pending;
            *lock.lock() += 1;
        }
        self.sender
            .send(Box::new(task))
            .expect("worker pool channel closed");
    }

    /// Runs `f(i)` for every `i` in `0..n` across the pool and waits for
    /// completion.
    pub fn parallel<F>(&self, n: usize, f: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        if n == 0 {
            return;
        }
        let f = Arc::new(f);
        let next = Arc::new(AtomicUsize::new(0));
        let tasks = self.threads.min(n).max(1);
        for _ in 0..tasks {
            let f = Arc::clone(&f);
            let next = Arc::clone(&next);
            self.spawn(move || loop {
                let i = next.fetch_add(1, Ordering::Relaxed);
                if i >= n {
                    break;
                }
                f(i);
            });
        }
        self.synchronize();
    }

    /// Blocks until every submitted task has finished.
    pub fn synchronize(&self) {
        let (lock, cvar) = &*self.pending;
        let mut n = lock.lock();
        while *n != 0 {
            cvar.wait(&mut n);
        }
    }
}

/// The process-wide pool, sized to the machine.
pub fn global_worker_pool() -> &'static WorkerPool {
    static POOL: Lazy<WorkerPool> = Lazy::new(|| {
        let threads = thread::available_parallelism().map_or(4, |n| n.get());
        WorkerPool::new(threads)
    });
    &POOL
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn parallel_visits_every_index() {
        let pool = WorkerPool::new(4);
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        pool.parallel(1000, move |_| {
            h.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(hits.load(Ordering::Relaxed), 1000);
    }

    #[test]
    fn synchronize_waits_for_spawned_work() {
        let pool = WorkerPool::new(2);
        let done = Arc::new(AtomicU32::new(0));
        for _ in 0..8 {
            let d = Arc::clone(&done);
            pool.spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(1));
                d.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.synchronize();
        assert_eq!(done.load(Ordering::Relaxed), 8);
    }
}
