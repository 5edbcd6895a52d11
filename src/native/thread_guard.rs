use std::mem::ManuallyDrop;
use std::thread::{self, ThreadId};

/// Lets a `!Send` value live inside a thread-safe context while only ever
/// being touched by the thread that created it.
pub(crate) struct ThreadGuard<T> {
    thread: ThreadId,
    value: ManuallyDrop<T>,
}

// SAFETY: the value is only reachable through `get_mut` and `Drop`, both of
// which check that the caller is the creating thread.
unsafe impl<T> Send for ThreadGuard<T> {}

impl<T> ThreadGuard<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            thread: thread::current().id(),
            value: ManuallyDrop::new(value),
        }
    }

    pub(crate) fn get_mut(&mut self) -> &mut T {
        assert!(
            self.thread == thread::current().id(),
            "thread-local source dispatched from a thread that does not own it"
        );
        &mut self.value
    }
}

impl<T> Drop for ThreadGuard<T> {
    fn drop(&mut self) {
        if self.thread == thread::current().id() {
            // SAFETY: dropped exactly once, on the owning thread.
            unsafe { ManuallyDrop::drop(&mut self.value) }
        } else {
            tracing::error!("leaking a thread-local source destroyed from a foreign thread");
        }
    }
}
