//! Bounded task executor with graceful drain.
//!
//! Workers block on a shared FIFO queue; shutdown signals stop, wakes
//! everyone, finishes the queued tasks, and joins. A panicking task is
//! caught and logged so it can never take a worker down with it.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::error;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolShared {
    queue: Mutex<VecDeque<Task>>,
    ready: Condvar,
    should_stop: AtomicBool,
    running: AtomicBool,
    active: AtomicUsize,
}

/// Fixed-size pool of worker threads over a FIFO task queue.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl WorkerPool {
    /// Spawn `worker_count` workers (0 means half the available cores).
    pub fn new(worker_count: usize) -> Self {
        let worker_count = if worker_count == 0 {
            std::thread::available_parallelism()
                .map(|n| (n.get() / 2).max(1))
                .unwrap_or(1)
        } else {
            worker_count
        };

        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            should_stop: AtomicBool::new(false),
            running: AtomicBool::new(true),
            active: AtomicUsize::new(0),
        });

        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let shared = Arc::clone(&shared);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("worker-{}", i))
                    .spawn(move || worker_loop(shared))
                    .expect("spawn pool worker"),
            );
        }

        WorkerPool {
            shared,
            workers: Mutex::new(workers),
            worker_count,
        }
    }

    /// Queue a task. Silently rejected once shutdown has begun.
    pub fn enqueue<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut queue = self.shared.queue.lock();
            if !self.shared.running.load(Ordering::SeqCst) {
                return;
            }
            queue.push_back(Box::new(task));
        }
        self.shared.ready.notify_one();
    }

    /// Signal stop, finish queued tasks, and join every worker. Idempotent.
    pub fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let _queue = self.shared.queue.lock();
            self.shared.should_stop.store(true, Ordering::SeqCst);
        }
        self.shared.ready.notify_all();

        let mut workers = self.workers.lock();
        for worker in workers.drain(..) {
            if worker.join().is_err() {
                error!("worker thread panicked outside a task");
            }
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Tasks currently executing.
    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::Relaxed)
    }

    /// Tasks waiting in the queue.
    pub fn pending_count(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(task) = queue.pop_front() {
                    break task;
                }
                if shared.should_stop.load(Ordering::SeqCst) {
                    return;
                }
                shared.ready.wait(&mut queue);
            }
        };

        shared.active.fetch_add(1, Ordering::Relaxed);
        if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("task panicked: {}", message);
        }
        shared.active.fetch_sub(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn test_tasks_execute() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.enqueue(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_shutdown_drains_queued_tasks() {
        // One slow worker with a deep queue: every task must still run
        let pool = WorkerPool::new(1);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            pool.enqueue(move || {
                std::thread::sleep(Duration::from_millis(1));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn test_enqueue_after_shutdown_rejected() {
        let pool = WorkerPool::new(1);
        pool.shutdown();

        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);
        pool.enqueue(move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(pool.pending_count(), 0);
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let pool = WorkerPool::new(1);
        let counter = Arc::new(AtomicU32::new(0));

        pool.enqueue(|| panic!("deliberate test panic"));
        let counter_clone = Arc::clone(&counter);
        pool.enqueue(move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_workers_defaults_to_at_least_one() {
        let pool = WorkerPool::new(0);
        assert!(pool.worker_count() >= 1);
        pool.shutdown();
    }

    #[test]
    fn test_shutdown_idempotent() {
        let pool = WorkerPool::new(2);
        pool.shutdown();
        pool.shutdown();
    }
}
