//! Task abstraction
//!
//! A task wraps a future so the loop can drive it. Each task owns one
//! ready source at the soon priority; its waker arms that source, so every
//! suspension point is resumed through the main context like any other
//! scheduled callback.

use std::cell::RefCell;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, Waker};
use std::thread;

use crate::config::SOON_PRIORITY;
use crate::error::{Error, Result};
use crate::event_loop::EventLoop;
use crate::future::{CallbackId, DoneCallbacks};
use crate::handle::{Handle, RegistryKey};
use crate::native::Source;
pub use crate::waker::TaskId;
use crate::waker::source_waker;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

enum TaskState<T> {
    Pending,
    Finished(thread::Result<T>),
    Taken,
    Cancelled,
}

struct TaskCore<T> {
    id: TaskId,
    state: RefCell<TaskState<T>>,
    future: RefCell<Option<Pin<Box<dyn Future<Output = T>>>>>,
    handle: RefCell<Option<Handle>>,
    waker: RefCell<Option<Waker>>,
    join_waker: RefCell<Option<Waker>>,
    callbacks: RefCell<DoneCallbacks>,
}

impl<T> TaskCore<T> {
    fn step(&self) {
        let future = self.future.borrow_mut().take();
        let mut future = match future {
            Some(future) => future,
            None => return,
        };
        let waker = match self.waker.borrow().clone() {
            Some(waker) => waker,
            None => return,
        };
        let mut cx = Context::from_waker(&waker);
        match panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
            Ok(Poll::Pending) => {
                // The task may have been cancelled from inside its own poll.
                if matches!(*self.state.borrow(), TaskState::Pending) {
                    *self.future.borrow_mut() = Some(future);
                }
            }
            Ok(Poll::Ready(value)) => {
                self.finish(TaskState::Finished(Ok(value)));
            }
            Err(payload) => {
                tracing::debug!(task = self.id.0, "task panicked");
                self.finish(TaskState::Finished(Err(payload)));
            }
        }
    }

    fn finish(&self, outcome: TaskState<T>) -> bool {
        {
            let mut state = self.state.borrow_mut();
            if !matches!(*state, TaskState::Pending) {
                return false;
            }
            *state = outcome;
        }
        let future = self.future.borrow_mut().take();
        drop(future);
        let handle = self.handle.borrow_mut().take();
        if let Some(handle) = handle {
            handle.cancel();
        }
        let waiter = self.join_waker.borrow_mut().take();
        if let Some(waiter) = waiter {
            waiter.wake();
        }
        let callbacks = self.callbacks.borrow_mut().take();
        self.callbacks.borrow().schedule(callbacks);
        tracing::trace!(task = self.id.0, "task done");
        true
    }

    fn is_done(&self) -> bool {
        !matches!(*self.state.borrow(), TaskState::Pending)
    }
}

impl EventLoop {
    /// Spawn `future` as a task on this loop.
    ///
    /// The task starts at the next opportunity. Dropping the returned handle
    /// detaches the task; it keeps running.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let id = TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed));
        let core = Rc::new(TaskCore {
            id,
            state: RefCell::new(TaskState::Pending),
            future: RefCell::new(Some(Box::pin(future))),
            handle: RefCell::new(None),
            waker: RefCell::new(None),
            join_waker: RefCell::new(None),
            callbacks: RefCell::new(DoneCallbacks::new(self)),
        });
        if self.is_closed() {
            core.finish(TaskState::Cancelled);
            return JoinHandle { core };
        }

        let driver = core.clone();
        let source = Source::ready().with_priority(SOON_PRIORITY);
        let handle = Handle::schedule(self, source, true, RegistryKey::None, move |_, _| {
            driver.step()
        });
        if let Some(source) = handle.source_id() {
            *core.waker.borrow_mut() = Some(source_waker(self.context(), source));
            self.context().set_ready(source);
        }
        *core.handle.borrow_mut() = Some(handle);
        tracing::trace!(task = id.0, "task spawned");
        JoinHandle { core }
    }
}

/// Handle to a spawned task; awaiting it yields the task's output.
///
/// A panic inside the task resumes in whoever takes the output.
pub struct JoinHandle<T> {
    core: Rc<TaskCore<T>>,
}

impl<T> JoinHandle<T> {
    pub fn id(&self) -> TaskId {
        self.core.id
    }

    /// Whether the task completed, panicked or was cancelled.
    pub fn is_finished(&self) -> bool {
        self.core.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.core.state.borrow(), TaskState::Cancelled)
    }

    /// Cancel the task, dropping its future. Returns `false` if it already
    /// finished.
    pub fn cancel(&self) -> bool {
        self.core.finish(TaskState::Cancelled)
    }

    /// Run `callback` (via `call_soon`) once the task is done.
    pub fn add_done_callback<F>(&self, callback: F) -> CallbackId
    where
        F: FnOnce() + 'static,
    {
        let mut callbacks = self.core.callbacks.borrow_mut();
        let id = callbacks.add(Box::new(callback));
        if self.core.is_done() {
            let ready = callbacks.take();
            callbacks.schedule(ready);
        }
        id
    }

    pub fn remove_done_callback(&self, id: CallbackId) -> bool {
        self.core.callbacks.borrow_mut().remove(id)
    }

    /// Take the task's output.
    ///
    /// A still pending task yields [`Error::StoppedBeforeCompletion`].
    pub(crate) fn take_outcome(&self) -> Result<T> {
        let mut state = self.core.state.borrow_mut();
        match std::mem::replace(&mut *state, TaskState::Taken) {
            TaskState::Finished(Ok(value)) => Ok(value),
            TaskState::Finished(Err(payload)) => {
                drop(state);
                panic::resume_unwind(payload)
            }
            TaskState::Cancelled => {
                *state = TaskState::Cancelled;
                Err(Error::Cancelled)
            }
            TaskState::Pending => {
                *state = TaskState::Pending;
                Err(Error::StoppedBeforeCompletion)
            }
            TaskState::Taken => Err(Error::InvalidState),
        }
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.core.is_done() {
            *self.core.join_waker.borrow_mut() = Some(cx.waker().clone());
            return Poll::Pending;
        }
        Poll::Ready(self.take_outcome())
    }
}

impl<T> std::fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.core.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::time::Duration;

    struct SetOnDrop(Rc<Cell<bool>>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    #[test]
    fn test_join_handle_output() {
        let event_loop = EventLoop::new().unwrap();
        let child = event_loop.spawn(async { "child" });
        let value = event_loop
            .run_until_complete(async move { child.await.unwrap() })
            .unwrap();
        assert_eq!(value, "child");
    }

    #[test]
    fn test_cancel_drops_future() {
        let event_loop = EventLoop::new().unwrap();
        let dropped = Rc::new(Cell::new(false));
        let guard = SetOnDrop(dropped.clone());
        let task = event_loop.spawn(async move {
            let _guard = guard;
            futures::future::pending::<()>().await;
        });
        event_loop.run_once();
        assert!(!task.is_finished());

        assert!(task.cancel());
        assert!(dropped.get());
        assert!(task.is_cancelled());
        assert!(!task.cancel());
        assert_eq!(event_loop.live_handles(), 0);

        let result = event_loop.run_until_complete(task);
        assert!(matches!(result, Ok(Err(Error::Cancelled))));
    }

    #[test]
    fn test_panic_resumes_in_awaiting_task() {
        let event_loop = EventLoop::new().unwrap();
        let failing = event_loop.spawn(async {
            panic!("inner failure");
        });
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            event_loop.run_until_complete(async move {
                let _ = failing.await;
            })
        }));
        let payload = outcome.unwrap_err();
        assert_eq!(
            payload.downcast_ref::<&str>().copied(),
            Some("inner failure")
        );
    }

    #[test]
    fn test_woken_from_other_thread() {
        let event_loop = EventLoop::new().unwrap();
        let (tx, rx) = futures::channel::oneshot::channel();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            tx.send(7u32).unwrap();
        });
        let value = event_loop.run_until_complete(rx).unwrap().unwrap();
        assert_eq!(value, 7);
        worker.join().unwrap();
    }

    #[test]
    fn test_spawn_on_closed_loop_is_cancelled() {
        let event_loop = EventLoop::new().unwrap();
        event_loop.close().unwrap();
        let dropped = Rc::new(Cell::new(false));
        let guard = SetOnDrop(dropped.clone());
        let task = event_loop.spawn(async move {
            let _guard = guard;
        });
        assert!(dropped.get());
        assert!(task.is_cancelled());
        assert_eq!(event_loop.context().source_count(), 0);
        assert!(matches!(task.take_outcome(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_done_callback_after_completion() {
        let event_loop = EventLoop::new().unwrap();
        let task = event_loop.spawn(async {});
        let seen = Rc::new(Cell::new(0));
        let counter = seen.clone();
        task.add_done_callback(move || counter.set(counter.get() + 1));
        while !task.is_finished() {
            event_loop.run_once();
        }
        event_loop.run_once();
        assert_eq!(seen.get(), 1);
    }
}
