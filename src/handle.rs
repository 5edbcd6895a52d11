//! Cancellable handles binding loop work to a native source.

use std::cell::Cell;
use std::fmt;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use crate::event_loop::{EventLoop, LoopInner};
use crate::native::{ControlFlow, MainContext, Source, SourceEvent, SourceId};

/// Unique identifier of a handle within its loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub(crate) u64);

/// Which loop registry, if any, refers to a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegistryKey {
    None,
    Reader(RawFd),
    Writer(RawFd),
    Signal(i32),
    Child(i32),
}

/// A scheduled callback.
///
/// Every handle owns at most one attached source. Cancelling destroys that
/// source exactly once; a handle that is not repeating retires itself after
/// its first dispatch.
#[derive(Clone)]
pub struct Handle {
    inner: Rc<HandleInner>,
}

struct HandleInner {
    id: HandleId,
    owner: Weak<LoopInner>,
    context: MainContext,
    source: Cell<Option<SourceId>>,
    repeat: bool,
    key: RegistryKey,
    cancelled: Cell<bool>,
}

impl Handle {
    /// Register a handle with the loop and attach `source` for it.
    ///
    /// The handle is in the loop's live set before the source exists, so a
    /// dispatch can never see an unregistered handle. On a closed loop
    /// nothing is attached and the handle comes back already cancelled.
    pub(crate) fn schedule<F>(
        event_loop: &EventLoop,
        mut source: Source,
        repeat: bool,
        key: RegistryKey,
        mut callback: F,
    ) -> Handle
    where
        F: FnMut(&Handle, SourceEvent) + 'static,
    {
        let handle = Handle {
            inner: Rc::new(HandleInner {
                id: event_loop.inner.next_handle_id(),
                owner: Rc::downgrade(&event_loop.inner),
                context: event_loop.context().clone(),
                source: Cell::new(None),
                repeat,
                key,
                cancelled: Cell::new(event_loop.is_closed()),
            }),
        };
        if handle.is_cancelled() {
            tracing::debug!(handle = handle.inner.id.0, "scheduled on a closed loop");
            return handle;
        }
        event_loop.inner.register_handle(&handle);

        let firing = handle.clone();
        source.set_local_callback(move |event| firing.fire(event, &mut callback));
        let id = source.attach(&handle.inner.context);
        handle.inner.source.set(Some(id));
        handle
    }

    fn fire<F>(&self, event: SourceEvent, callback: &mut F) -> ControlFlow
    where
        F: FnMut(&Handle, SourceEvent),
    {
        if self.inner.cancelled.get() {
            return ControlFlow::Break;
        }
        // A descriptor that is not open will keep reporting NVAL forever.
        let last = !self.inner.repeat || event.is_invalid_fd();
        let result = panic::catch_unwind(AssertUnwindSafe(|| callback(self, event)));
        if let Err(payload) = result {
            match self.owner() {
                Some(owner) => owner.report_panic(self, payload),
                None => tracing::error!(handle = self.inner.id.0, "callback panicked"),
            }
        }
        if last || self.inner.cancelled.get() {
            self.retire();
            return ControlFlow::Break;
        }
        ControlFlow::Continue
    }

    /// Forget the source without destroying it; the native side drops it
    /// once the current dispatch returns.
    fn retire(&self) {
        self.inner.source.set(None);
        if let Some(owner) = self.inner.owner.upgrade() {
            owner.unregister_handle(self);
        }
    }

    /// Cancel the callback. Idempotent.
    pub fn cancel(&self) {
        if self.inner.cancelled.replace(true) {
            return;
        }
        if let Some(id) = self.inner.source.take() {
            self.inner.context.destroy(id);
        }
        if let Some(owner) = self.inner.owner.upgrade() {
            owner.unregister_handle(self);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.get()
    }

    /// Whether the handle still owns an attached source.
    pub fn is_active(&self) -> bool {
        self.inner.source.get().is_some()
    }

    pub fn id(&self) -> HandleId {
        self.inner.id
    }

    pub fn source_id(&self) -> Option<SourceId> {
        self.inner.source.get()
    }

    pub(crate) fn key(&self) -> RegistryKey {
        self.inner.key
    }

    pub(crate) fn context(&self) -> &MainContext {
        &self.inner.context
    }

    fn owner(&self) -> Option<EventLoop> {
        self.inner.owner.upgrade().map(|inner| EventLoop { inner })
    }

    pub(crate) fn same(&self, other: &Handle) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.inner.id.0)
            .field("source", &self.inner.source.get())
            .field("repeat", &self.inner.repeat)
            .field("cancelled", &self.inner.cancelled.get())
            .finish()
    }
}
