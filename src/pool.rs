//! Worker pool and the promise/future pair carrying results through queues.
//!
//! Tasks are closures returning `Result<T>`; an error set by the worker
//! travels through the future and re-raises on whichever thread calls
//! [`Future::get`]. The pool itself does not preserve submission order,
//! ordering is imposed by the queues that carry the futures.

use std::sync::{Arc, OnceLock};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// Worker count of the process-wide pool.
fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(4)
}

struct Shared<T> {
    slot: Mutex<Option<Result<T>>>,
    ready: Condvar,
}

/// Write side of a future. Setting the value wakes the waiting consumer.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Promise<T> {
    pub fn set(self, value: Result<T>) {
        let mut slot = self.shared.slot.lock();
        debug_assert!(slot.is_none(), "promise set twice");
        *slot = Some(value);
        self.shared.ready.notify_all();
    }
}

/// A promise abandoned without a value resolves its future with an error,
/// so `get()` can never block forever.
impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        let mut slot = self.shared.slot.lock();
        if slot.is_none() {
            *slot = Some(Err(Error::Logic("task abandoned before completion")));
            self.shared.ready.notify_all();
        }
    }
}

/// Read side: blocks in [`Future::get`] until the producing task completes.
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Future<T> {
    /// Wraps an already computed result.
    pub fn ready(value: Result<T>) -> Future<T> {
        let (promise, future) = channel();
        promise.set(value);
        future
    }

    /// Blocks until the result is available and returns it.
    pub fn get(self) -> Result<T> {
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(value) = slot.take() {
                return value;
            }
            self.shared.ready.wait(&mut slot);
        }
    }
}

/// Creates a connected promise/future pair.
pub fn channel<T>() -> (Promise<T>, Future<T>) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(None),
        ready: Condvar::new(),
    });
    (
        Promise {
            shared: Arc::clone(&shared),
        },
        Future { shared },
    )
}

/// A fixed set of worker threads executing submitted tasks.
pub struct Pool {
    pool: rayon::ThreadPool,
}

impl Pool {
    pub fn new(threads: usize) -> Result<Pool> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("osmbuf-worker-{i}"))
            .build()
            .map_err(|_| Error::Logic("failed to start worker pool"))?;
        Ok(Pool { pool })
    }

    /// The process-wide pool, started lazily with
    /// `min(4, available_parallelism)` workers.
    pub fn global() -> &'static Pool {
        static POOL: OnceLock<Pool> = OnceLock::new();
        POOL.get_or_init(|| {
            Pool::new(default_threads()).expect("failed to start global worker pool")
        })
    }

    /// Submits a task and returns the future of its result. Completion
    /// order across tasks is unspecified.
    pub fn submit<T, F>(&self, task: F) -> Future<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (promise, future) = channel();
        self.pool.spawn(move || promise.set(task()));
        future
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn submit_returns_value() {
        let pool = Pool::new(2).unwrap();
        let future = pool.submit(|| Ok(41 + 1));
        assert_eq!(future.get().unwrap(), 42);
    }

    #[test]
    fn error_reraises_at_get() {
        let pool = Pool::new(2).unwrap();
        let future: Future<()> = pool.submit(|| Err(Error::format("boom")));
        assert!(matches!(future.get(), Err(Error::Format(msg)) if msg == "boom"));
    }

    #[test]
    fn ready_future_resolves_immediately() {
        let future = Future::ready(Ok("header"));
        assert_eq!(future.get().unwrap(), "header");
    }

    #[test]
    fn get_blocks_until_task_finishes() {
        let pool = Pool::new(1).unwrap();
        let future = pool.submit(|| {
            std::thread::sleep(Duration::from_millis(30));
            Ok(7)
        });
        assert_eq!(future.get().unwrap(), 7);
    }

    #[test]
    fn completion_order_is_not_submission_order() {
        // two workers, first task sleeps: the second finishes first, yet
        // both futures resolve to their own results
        let pool = Pool::new(2).unwrap();
        let slow = pool.submit(|| {
            std::thread::sleep(Duration::from_millis(50));
            Ok("slow")
        });
        let fast = pool.submit(|| Ok("fast"));
        assert_eq!(fast.get().unwrap(), "fast");
        assert_eq!(slow.get().unwrap(), "slow");
    }
}
