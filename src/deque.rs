use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// A mutex-guarded double-ended queue with a blocking "wait until non-empty"
///  primitive.
///
/// This is the only shared-memory handoff in the library: engine tasks push
///  received messages in, the application thread drains them (and the
///  per-connection outbound queues use the same type in the opposite
///  direction). All operations are linearizable under the internal mutex.
pub struct BlockingDeque<T> {
    inner: Mutex<VecDeque<T>>,
    non_empty: Condvar,
}

impl<T> Default for BlockingDeque<T> {
    fn default() -> Self {
        BlockingDeque::new()
    }
}

impl<T> BlockingDeque<T> {
    pub fn new() -> BlockingDeque<T> {
        BlockingDeque {
            inner: Mutex::new(VecDeque::new()),
            non_empty: Condvar::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Takes ownership of the value and appends it at the back, waking one
    ///  waiting consumer.
    pub fn push_back(&self, value: T) {
        self.lock().push_back(value);
        self.non_empty.notify_one();
    }

    pub fn push_front(&self, value: T) {
        self.lock().push_front(value);
        self.non_empty.notify_one();
    }

    /// Removes and returns the front element, `None` when empty.
    pub fn pop_front(&self) -> Option<T> {
        self.lock().pop_front()
    }

    pub fn pop_back(&self) -> Option<T> {
        self.lock().pop_back()
    }

    /// Blocks the calling thread until the deque is non-empty.
    ///
    /// Another consumer may race the caller to the element; drain with the
    ///  `Option`-returning pops afterwards.
    pub fn wait(&self) {
        let mut guard = self.lock();
        // loop to absorb spurious wake-ups
        while guard.is_empty() {
            guard = self.non_empty.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: Clone> BlockingDeque<T> {
    /// A copy of the front element, `None` when empty.
    pub fn front(&self) -> Option<T> {
        self.lock().front().cloned()
    }

    pub fn back(&self) -> Option<T> {
        self.lock().back().cloned()
    }
}
