//! Bounded Worker Pool (component C2).
//!
//! A fixed-size pool of background threads draining a bounded FIFO task
//! queue. `fire_async` never blocks: it returns `false` once the queue is
//! full rather than waiting for room. Worker threads are never joined —
//! they are dropped along with the pool, the Rust equivalent of daemon
//! threads, so a live pool never blocks process exit.
//!
//! Built on `std::sync::mpsc` rather than a crate like `threadpool` for the
//! same reason the original source hand-rolled its own: the standard
//! thread-pool offerings available to it could not bound the queue *and*
//! mark workers as background threads at once. `mpsc::sync_channel` gives a
//! bounded queue with a non-blocking `try_send`, and simply not joining the
//! `JoinHandle`s gives us daemon-thread semantics for free.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::PoolError;

/// A unit of work submitted to a [`WorkerPool`]. Rust has no `*args`/
/// `**kwargs`, so the closure itself is the task spec (spec section 3's
/// `TaskSpec` collapses into this single type by design, per the REDESIGN
/// notes in section 9).
type Task = Box<dyn FnOnce() + Send + 'static>;

enum QueueHandle {
    Bounded(SyncSender<Task>),
    Unbounded(Sender<Task>),
}

impl QueueHandle {
    fn try_send(&self, task: Task) -> bool {
        match self {
            QueueHandle::Bounded(tx) => match tx.try_send(task) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => false,
                Err(TrySendError::Disconnected(_)) => false,
            },
            QueueHandle::Unbounded(tx) => tx.send(task).is_ok(),
        }
    }
}

/// A fixed-size, bounded-queue, fire-and-forget thread pool.
///
/// Construct with [`WorkerPool::new`], submit work with
/// [`WorkerPool::fire_async`]. The pool never reports results or panics back
/// to the submitter; a misbehaving task cannot kill a worker thread's loop
/// (spec section 4.2 "Failure semantics").
pub struct WorkerPool {
    queue: QueueHandle,
    num_threads: usize,
    // Kept alive so the channel stays open for the pool's lifetime; workers
    // are intentionally never joined (see module docs).
    _workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Build a pool with `num_threads` worker threads (default: the number
    /// of available CPUs) and a task queue bounded to `queue_size` entries
    /// (`0` means unbounded).
    pub fn new(num_threads: Option<usize>, queue_size: usize) -> Result<Self, PoolError> {
        let num_threads = num_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        if num_threads == 0 {
            return Err(PoolError::ZeroThreads);
        }

        let (queue, receiver) = if queue_size == 0 {
            let (tx, rx) = mpsc::channel::<Task>();
            (QueueHandle::Unbounded(tx), rx)
        } else {
            let (tx, rx) = mpsc::sync_channel::<Task>(queue_size);
            (QueueHandle::Bounded(tx), rx)
        };

        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            let receiver = Arc::clone(&receiver);
            workers.push(std::thread::spawn(move || worker_loop(receiver)));
        }

        Ok(WorkerPool {
            queue,
            num_threads,
            _workers: workers,
        })
    }

    /// Number of worker threads running in this pool.
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Enqueue `task` if there is room. Returns `true` on success, `false`
    /// when the queue is full (or the pool's receiver has somehow gone
    /// away). Never blocks.
    pub fn fire_async<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.try_send(Box::new(task))
    }
}

fn worker_loop(receiver: Arc<Mutex<Receiver<Task>>>) {
    loop {
        // 1s timeout so that if the pool is dropped while a worker is
        // between jobs, the thread notices within 1s rather than hanging
        // forever on a dead channel's recv.
        let task = {
            let rx = match receiver.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            match rx.recv_timeout(Duration::from_secs(1)) {
                Ok(task) => task,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return,
            }
        };

        tracing::debug!("worker pool executing task");
        if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
            let message = panic_message(&payload);
            tracing::debug!(panic = %message, "worker pool task panicked");
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn fire_async_runs_task() {
        let pool = WorkerPool::new(Some(2), 4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        assert!(pool.fire_async(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        let deadline = Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bounded_queue_rejects_when_full() {
        // One worker, blocked on a long task, with a queue of exactly 2.
        let pool = WorkerPool::new(Some(1), 2).unwrap();
        let release = Arc::new(std::sync::Barrier::new(2));
        let r = Arc::clone(&release);
        // First task occupies the single worker thread.
        assert!(pool.fire_async(move || {
            r.wait();
        }));
        // Give the worker a moment to pick up the first task so the queue
        // below reflects only the backlog, not the in-flight task.
        std::thread::sleep(Duration::from_millis(100));

        assert!(pool.fire_async(|| {}));
        assert!(pool.fire_async(|| {}));
        // Queue capacity (2) is now full; a third submission must fail.
        assert!(!pool.fire_async(|| {}));

        release.wait();
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let pool = WorkerPool::new(Some(1), 4).unwrap();
        assert!(pool.fire_async(|| panic!("boom")));

        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        assert!(pool.fire_async(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        let deadline = Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_threads_rejected() {
        assert!(matches!(
            WorkerPool::new(Some(0), 0),
            Err(PoolError::ZeroThreads)
        ));
    }
}
