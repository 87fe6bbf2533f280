//! FIFO of fragments waiting for a worker.
//!
//! A fragment popped from the queue is checked out to one worker while it
//! stays registered in the index, so the queue has its own lock.

use parking_lot::Mutex;
use rfix_types::Fragment;
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct RepairQueue {
    inner: Mutex<VecDeque<Fragment>>,
}

impl RepairQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, fragment: Fragment) {
        self.inner.lock().push_back(fragment);
    }

    pub fn push_all(&self, fragments: impl IntoIterator<Item = Fragment>) {
        self.inner.lock().extend(fragments);
    }

    pub fn pop(&self) -> Option<Fragment> {
        self.inner.lock().pop_front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Copy of the queued fragments, front first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Fragment> {
        self.inner.lock().iter().copied().collect()
    }
}
