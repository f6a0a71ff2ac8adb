//! Bounded FIFO queues connecting the pipeline stages.
//!
//! Producers block when the queue is full, consumers block when it is empty;
//! this is the only backpressure mechanism in the pipeline. Closing a reader
//! or writer shuts the queue down, which wakes blocked pushers so the
//! producing thread can observe cancellation at the queue boundary.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Default maximum number of queued entries.
pub const MAX_QUEUE_SIZE: usize = 20;

struct State<T> {
    items: VecDeque<T>,
    shutdown: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    max_size: usize,
}

/// A bounded multi-producer multi-consumer FIFO queue.
pub struct SharedQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SharedQueue<T> {
    fn clone(&self) -> Self {
        SharedQueue {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> SharedQueue<T> {
    pub fn new(max_size: usize) -> SharedQueue<T> {
        SharedQueue {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    items: VecDeque::new(),
                    shutdown: false,
                }),
                not_full: Condvar::new(),
                not_empty: Condvar::new(),
                max_size: max_size.max(1),
            }),
        }
    }

    /// Appends a value, blocking while the queue is full. Returns false if
    /// the queue was shut down; the value is dropped in that case.
    pub fn push(&self, value: T) -> bool {
        let mut state = self.inner.state.lock();
        while state.items.len() >= self.inner.max_size {
            if state.shutdown {
                return false;
            }
            self.inner.not_full.wait(&mut state);
        }
        if state.shutdown {
            return false;
        }
        state.items.push_back(value);
        self.inner.not_empty.notify_one();
        true
    }

    /// Removes the front value, blocking while the queue is empty. Returns
    /// `None` only after shutdown once the queue has drained.
    pub fn wait_and_pop(&self) -> Option<T> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(value) = state.items.pop_front() {
                self.inner.not_full.notify_one();
                return Some(value);
            }
            if state.shutdown {
                return None;
            }
            self.inner.not_empty.wait(&mut state);
        }
    }

    /// Non-blocking pop, used to drain leftovers during teardown.
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.inner.state.lock();
        let value = state.items.pop_front();
        if value.is_some() {
            self.inner.not_full.notify_one();
        }
        value
    }

    /// Wakes all blocked producers and consumers; subsequent pushes fail.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        self.inner.not_full.notify_all();
        self.inner.not_empty.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_order() {
        let queue = SharedQueue::new(10);
        for i in 0..5 {
            assert!(queue.push(i));
        }
        for i in 0..5 {
            assert_eq!(queue.wait_and_pop(), Some(i));
        }
    }

    #[test]
    fn push_blocks_until_pop() {
        let queue = SharedQueue::new(2);
        assert!(queue.push(1));
        assert!(queue.push(2));

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.push(3))
        };
        // give the producer a moment to block on the full queue
        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.wait_and_pop(), Some(1));
        assert!(producer.join().unwrap());
        assert_eq!(queue.wait_and_pop(), Some(2));
        assert_eq!(queue.wait_and_pop(), Some(3));
    }

    #[test]
    fn pop_blocks_until_push() {
        let queue: SharedQueue<u32> = SharedQueue::new(4);
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.wait_and_pop())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(queue.push(7));
        assert_eq!(consumer.join().unwrap(), Some(7));
    }

    #[test]
    fn shutdown_wakes_blocked_producer() {
        let queue = SharedQueue::new(1);
        assert!(queue.push(1));
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.push(2))
        };
        thread::sleep(Duration::from_millis(20));
        queue.shutdown();
        assert!(!producer.join().unwrap());
        // leftovers remain drainable
        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.try_pop(), None);
        assert_eq!(queue.wait_and_pop(), None);
    }
}
