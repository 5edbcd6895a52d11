//! Which loop belongs to which thread.
//!
//! The main thread gets the default loop, which runs on the process-wide
//! default context and is allowed to nest. It is created on first request
//! rather than at startup, since a library cannot run code before `main`. Any other thread
//! has no loop until one is set with [`EventLoopPolicy::set_event_loop`].
//! Loops are `!Send`, so the bookkeeping is thread-local; only the default
//! application and the shared child watcher are process-wide.

use std::cell::{Cell, RefCell};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use once_cell::sync::{Lazy, OnceCell};

use crate::child::ChildWatcher;
use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, LoopOptions};
use crate::native::MainContext;
use crate::run::Application;

thread_local! {
    static CURRENT: RefCell<Option<EventLoop>> = RefCell::new(None);
    static SET_CALLED: Cell<bool> = Cell::new(false);
    static DEFAULT_LOOP: RefCell<Option<EventLoop>> = RefCell::new(None);
}

static MAIN_THREAD: OnceCell<ThreadId> = OnceCell::new();

static POLICY: Lazy<EventLoopPolicy> = Lazy::new(|| EventLoopPolicy {
    application: Mutex::new(None),
    child_watcher: Mutex::new(None),
});

/// The process-wide policy.
pub fn policy() -> &'static EventLoopPolicy {
    &POLICY
}

/// The current thread's loop; see [`EventLoopPolicy::get_event_loop`].
pub fn get_event_loop() -> Result<EventLoop> {
    policy().get_event_loop()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn is_main_thread() -> bool {
    let current = thread::current().id();
    if let Some(main) = MAIN_THREAD.get() {
        return *main == current;
    }
    if on_process_main_thread() {
        let _ = MAIN_THREAD.set(current);
        return true;
    }
    false
}

/// The initial thread of a Linux process is the one whose tid is the pid.
#[cfg(target_os = "linux")]
fn on_process_main_thread() -> bool {
    nix::unistd::gettid() == nix::unistd::getpid()
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn on_process_main_thread() -> bool {
    // SAFETY: no preconditions; only reports whether this is the main thread.
    unsafe { libc::pthread_main_np() != 0 }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
)))]
fn on_process_main_thread() -> bool {
    thread::current().name() == Some("main")
}

fn no_loop() -> Error {
    let current = thread::current();
    Error::NoEventLoop(current.name().unwrap_or("<unnamed>").to_string())
}

pub struct EventLoopPolicy {
    application: Mutex<Option<Arc<dyn Application>>>,
    child_watcher: Mutex<Option<ChildWatcher>>,
}

impl EventLoopPolicy {
    /// Application object given to the default loop when it is created.
    pub fn set_default_application(&self, application: Arc<dyn Application>) -> Result<()> {
        let mut slot = lock(&self.application);
        if slot.is_some() {
            return Err(Error::ApplicationAlreadySet);
        }
        *slot = Some(application);
        Ok(())
    }

    /// The loop on the default context, created on first call. Main thread
    /// only.
    pub fn get_default_loop(&self) -> Result<EventLoop> {
        if !is_main_thread() {
            return Err(no_loop());
        }
        let existing = DEFAULT_LOOP.with(|slot| slot.borrow().clone());
        if let Some(event_loop) = existing {
            return Ok(event_loop);
        }
        let mut options = LoopOptions::new().recursive(true);
        if let Some(application) = lock(&self.application).clone() {
            options = options.application(application);
        }
        let event_loop = EventLoop::with_context(&MainContext::default(), options);
        DEFAULT_LOOP.with(|slot| *slot.borrow_mut() = Some(event_loop.clone()));
        tracing::debug!("default event loop created");
        Ok(event_loop)
    }

    /// A new loop: the default loop the first time on the main thread, a
    /// loop on a fresh context otherwise.
    pub fn new_event_loop(&self) -> Result<EventLoop> {
        let default_created = DEFAULT_LOOP.with(|slot| slot.borrow().is_some());
        if is_main_thread() && !default_created {
            return self.get_default_loop();
        }
        EventLoop::new()
    }

    /// The current thread's loop.
    ///
    /// On the main thread one is created on first use, unless
    /// [`set_event_loop`](EventLoopPolicy::set_event_loop) was called.
    /// Other threads get [`Error::NoEventLoop`] until a loop is set.
    pub fn get_event_loop(&self) -> Result<EventLoop> {
        if let Some(event_loop) = CURRENT.with(|current| current.borrow().clone()) {
            return Ok(event_loop);
        }
        if is_main_thread() && !SET_CALLED.with(Cell::get) {
            let event_loop = self.new_event_loop()?;
            self.set_event_loop(Some(event_loop.clone()));
            return Ok(event_loop);
        }
        Err(no_loop())
    }

    pub fn set_event_loop(&self, event_loop: Option<EventLoop>) {
        SET_CALLED.with(|called| called.set(true));
        CURRENT.with(|current| *current.borrow_mut() = event_loop);
    }

    /// The process-wide child watcher, on the default context unless
    /// attached elsewhere.
    pub fn get_child_watcher(&self) -> ChildWatcher {
        lock(&self.child_watcher)
            .get_or_insert_with(|| ChildWatcher::new(&MainContext::default()))
            .clone()
    }

    /// Replace the child watcher, closing the previous one.
    pub fn set_child_watcher(&self, watcher: Option<ChildWatcher>) {
        let previous = std::mem::replace(&mut *lock(&self.child_watcher), watcher);
        if let Some(previous) = previous {
            previous.close();
        }
    }
}

impl std::fmt::Debug for EventLoopPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopPolicy")
            .field("application", &lock(&self.application).is_some())
            .finish()
    }
}
