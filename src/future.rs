//! Loop-bound Future/Promise pair
//!
//! A [`Future`] is completed exactly once through its [`Promise`], either
//! with a value or by cancellation. Done callbacks never run inline: they
//! are handed to the owning loop with `call_soon`.

use std::cell::RefCell;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, WeakEventLoop};

/// Identifies a registered done callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(pub(crate) u64);

/// A future completed by its corresponding Promise
pub struct Future<T> {
    shared: Rc<RefCell<SharedState<T>>>,
}

/// Completes a Future
pub struct Promise<T> {
    shared: Rc<RefCell<SharedState<T>>>,
}

enum State<T> {
    Pending,
    Done(T),
    Taken,
    Cancelled,
}

/// Shared state between Future and Promise
struct SharedState<T> {
    state: State<T>,
    waker: Option<Waker>,
    callbacks: DoneCallbacks,
}

/// Done callbacks, shared with tasks.
pub(crate) struct DoneCallbacks {
    owner: WeakEventLoop,
    next: u64,
    pending: Vec<(CallbackId, Box<dyn FnOnce()>)>,
}

impl DoneCallbacks {
    pub(crate) fn new(owner: &EventLoop) -> Self {
        Self {
            owner: owner.downgrade(),
            next: 0,
            pending: Vec::new(),
        }
    }

    pub(crate) fn add(&mut self, callback: Box<dyn FnOnce()>) -> CallbackId {
        let id = CallbackId(self.next);
        self.next += 1;
        self.pending.push((id, callback));
        id
    }

    pub(crate) fn remove(&mut self, id: CallbackId) -> bool {
        let before = self.pending.len();
        self.pending.retain(|(current, _)| *current != id);
        self.pending.len() != before
    }

    pub(crate) fn take(&mut self) -> Vec<Box<dyn FnOnce()>> {
        self.pending.drain(..).map(|(_, callback)| callback).collect()
    }

    /// Hand `callbacks` to the loop. They are dropped if the loop is gone.
    pub(crate) fn schedule(&self, callbacks: Vec<Box<dyn FnOnce()>>) {
        if callbacks.is_empty() {
            return;
        }
        if let Some(event_loop) = self.owner.upgrade() {
            for callback in callbacks {
                event_loop.call_soon(callback);
            }
        }
    }
}

impl EventLoop {
    /// Create a Future/Promise pair bound to this loop.
    pub fn create_future<T: 'static>(&self) -> (Future<T>, Promise<T>) {
        let shared = Rc::new(RefCell::new(SharedState {
            state: State::Pending,
            waker: None,
            callbacks: DoneCallbacks::new(self),
        }));
        (
            Future {
                shared: shared.clone(),
            },
            Promise { shared },
        )
    }
}

impl<T> SharedState<T> {
    fn is_done(&self) -> bool {
        !matches!(self.state, State::Pending)
    }
}

fn complete<T>(shared: &RefCell<SharedState<T>>, state: State<T>) -> Result<()> {
    let (waker, callbacks) = {
        let mut shared = shared.borrow_mut();
        if shared.is_done() {
            return Err(Error::InvalidState);
        }
        shared.state = state;
        (shared.waker.take(), shared.callbacks.take())
    };
    if let Some(waker) = waker {
        waker.wake();
    }
    shared.borrow().callbacks.schedule(callbacks);
    Ok(())
}

impl<T> Future<T> {
    /// Whether a result was set or the future was cancelled.
    pub fn is_done(&self) -> bool {
        self.shared.borrow().is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.shared.borrow().state, State::Cancelled)
    }

    /// Cancel the future. Returns `false` if it was already done.
    pub fn cancel(&self) -> bool {
        complete(&self.shared, State::Cancelled).is_ok()
    }

    /// Run `callback` (via `call_soon`) once the future is done.
    pub fn add_done_callback<F>(&self, callback: F) -> CallbackId
    where
        F: FnOnce() + 'static,
    {
        let mut shared = self.shared.borrow_mut();
        let id = shared.callbacks.add(Box::new(callback));
        if shared.is_done() {
            let callbacks = shared.callbacks.take();
            shared.callbacks.schedule(callbacks);
        }
        id
    }

    pub fn remove_done_callback(&self, id: CallbackId) -> bool {
        self.shared.borrow_mut().callbacks.remove(id)
    }
}

impl<T> std::future::Future for Future<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut shared = self.shared.borrow_mut();
        match std::mem::replace(&mut shared.state, State::Taken) {
            State::Pending => {
                shared.state = State::Pending;
                shared.waker = Some(cx.waker().clone());
                Poll::Pending
            }
            State::Done(value) => Poll::Ready(Ok(value)),
            State::Cancelled => {
                shared.state = State::Cancelled;
                Poll::Ready(Err(Error::Cancelled))
            }
            State::Taken => Poll::Ready(Err(Error::InvalidState)),
        }
    }
}

impl<T> Promise<T> {
    /// Complete the future with a value.
    ///
    /// Fails with [`Error::InvalidState`] if the future is already done,
    /// including when it was cancelled.
    pub fn set_result(&self, value: T) -> Result<()> {
        complete(&self.shared, State::Done(value))
    }

    pub fn cancel(&self) -> bool {
        complete(&self.shared, State::Cancelled).is_ok()
    }

    pub fn is_done(&self) -> bool {
        self.shared.borrow().is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.shared.borrow().state, State::Cancelled)
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}
