//! Named notifications and futures waiting for them.
//!
//! [`Emitter`] is a minimal signal/slot object. [`wait_signal`] turns the
//! next emission of a name into a future. The wait holds only a weak
//! reference to the emitter plus a destroy notification, so destroying the
//! emitter cancels every pending wait instead of keeping it alive.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use crate::error::Result;
use crate::event_loop::EventLoop;
use crate::future::{Future as LoopFuture, Promise};

/// Identifies a connected handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Callback<A> = Box<dyn FnMut(&A)>;

struct Slot<A> {
    id: HandlerId,
    name: String,
    /// `None` while the callback runs
    callback: Option<Callback<A>>,
}

struct EmitterInner<A> {
    handlers: RefCell<Vec<Slot<A>>>,
    destroy_notify: RefCell<Vec<(HandlerId, Box<dyn FnOnce()>)>>,
    next_id: Cell<u64>,
}

impl<A> EmitterInner<A> {
    fn next_id(&self) -> HandlerId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        HandlerId(id)
    }

    fn disconnect(&self, id: HandlerId) -> bool {
        let removed = {
            let mut handlers = self.handlers.borrow_mut();
            let before = handlers.len();
            let kept: Vec<Slot<A>> = handlers.drain(..).filter(|slot| slot.id != id).collect();
            let removed = kept.len() != before;
            *handlers = kept;
            removed
        };
        let notify = {
            let mut notify = self.destroy_notify.borrow_mut();
            let before = notify.len();
            notify.retain(|(current, _)| *current != id);
            notify.len() != before
        };
        removed || notify
    }
}

impl<A> Drop for EmitterInner<A> {
    fn drop(&mut self) {
        let notify = std::mem::take(&mut *self.destroy_notify.borrow_mut());
        for (_, callback) in notify {
            callback();
        }
    }
}

/// Emits named notifications carrying an `A`.
pub struct Emitter<A> {
    inner: Rc<EmitterInner<A>>,
}

impl<A: 'static> Emitter<A> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(EmitterInner {
                handlers: RefCell::new(Vec::new()),
                destroy_notify: RefCell::new(Vec::new()),
                next_id: Cell::new(1),
            }),
        }
    }

    /// Call `callback` on every emission of `name`.
    pub fn connect<F>(&self, name: &str, callback: F) -> HandlerId
    where
        F: FnMut(&A) + 'static,
    {
        let id = self.inner.next_id();
        self.inner.handlers.borrow_mut().push(Slot {
            id,
            name: name.to_string(),
            callback: Some(Box::new(callback)),
        });
        id
    }

    pub fn disconnect(&self, id: HandlerId) -> bool {
        self.inner.disconnect(id)
    }

    /// Run every handler connected to `name`, in connection order.
    ///
    /// Handlers may connect or disconnect (themselves included) while
    /// running; a handler connected during an emission is not called by it.
    pub fn emit(&self, name: &str, args: A) {
        let ids: Vec<HandlerId> = self
            .inner
            .handlers
            .borrow()
            .iter()
            .filter(|slot| slot.name == name)
            .map(|slot| slot.id)
            .collect();
        for id in ids {
            let callback = {
                let mut handlers = self.inner.handlers.borrow_mut();
                handlers
                    .iter_mut()
                    .find(|slot| slot.id == id)
                    .and_then(|slot| slot.callback.take())
            };
            let mut callback = match callback {
                Some(callback) => callback,
                None => continue,
            };
            callback(&args);
            let mut handlers = self.inner.handlers.borrow_mut();
            if let Some(slot) = handlers.iter_mut().find(|slot| slot.id == id) {
                slot.callback = Some(callback);
            }
        }
    }

    /// Number of connected handlers.
    pub fn handler_count(&self) -> usize {
        self.inner.handlers.borrow().len()
    }

    fn on_destroy(&self, id: HandlerId, callback: Box<dyn FnOnce()>) {
        self.inner.destroy_notify.borrow_mut().push((id, callback));
    }

    fn downgrade(&self) -> Weak<EmitterInner<A>> {
        Rc::downgrade(&self.inner)
    }
}

impl<A: 'static> Default for Emitter<A> {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves with the arguments of the next emission of a name.
///
/// Yields [`Error::Cancelled`](crate::Error::Cancelled) if the emitter is
/// destroyed first or the wait is cancelled. Dropping the wait disconnects
/// it.
pub struct WaitSignal<A> {
    emitter: Weak<EmitterInner<A>>,
    handler: HandlerId,
    result: LoopFuture<A>,
}

/// Wait for the next emission of `name` on `emitter`.
pub fn wait_signal<A>(event_loop: &EventLoop, emitter: &Emitter<A>, name: &str) -> WaitSignal<A>
where
    A: Clone + 'static,
{
    let (result, promise): (LoopFuture<A>, Promise<A>) = event_loop.create_future();
    let handler = emitter.inner.next_id();
    let weak = emitter.downgrade();

    let resolve = promise.clone();
    let disconnect = weak.clone();
    emitter.inner.handlers.borrow_mut().push(Slot {
        id: handler,
        name: name.to_string(),
        callback: Some(Box::new(move |args: &A| {
            let _ = resolve.set_result(args.clone());
            if let Some(emitter) = disconnect.upgrade() {
                emitter.disconnect(handler);
            }
        })),
    });
    emitter.on_destroy(
        handler,
        Box::new(move || {
            promise.cancel();
        }),
    );

    WaitSignal {
        emitter: weak,
        handler,
        result,
    }
}

impl<A> WaitSignal<A> {
    pub fn cancel(&self) -> bool {
        if let Some(emitter) = self.emitter.upgrade() {
            emitter.disconnect(self.handler);
        }
        self.result.cancel()
    }

    pub fn is_done(&self) -> bool {
        self.result.is_done()
    }
}

impl<A> Future for WaitSignal<A> {
    type Output = Result<A>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.result).poll(cx)
    }
}

impl<A> Drop for WaitSignal<A> {
    fn drop(&mut self) {
        if let Some(emitter) = self.emitter.upgrade() {
            emitter.disconnect(self.handler);
        }
    }
}
