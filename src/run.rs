//! Run/stop bookkeeping shared between a loop and the threads that stop it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::native::{MainContext, MainLoop};

/// An external application object that can drive the main context.
///
/// When a loop is given an application, running the loop at top level runs
/// the application instead of a plain [`MainLoop`], and stopping it asks the
/// application to quit.
pub trait Application: Send + Sync {
    /// Run until [`quit`](Application::quit) is called.
    fn run(&self);

    fn quit(&self);
}

/// State behind [`EventLoop::run`](crate::EventLoop::run) and
/// [`EventLoop::stop`](crate::EventLoop::stop).
pub(crate) struct RunControl {
    top: MainLoop,
    application: Mutex<Option<Arc<dyn Application>>>,
    nested: Mutex<Vec<MainLoop>>,
    running: AtomicBool,
    interrupted: AtomicBool,
    user_interrupt_handler: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RunControl {
    pub(crate) fn new(context: &MainContext, application: Option<Arc<dyn Application>>) -> Self {
        Self {
            top: MainLoop::new(context),
            application: Mutex::new(application),
            nested: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            user_interrupt_handler: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Entering arms the top loop first, so a stop racing with
    /// [`run_top`](RunControl::run_top) is kept.
    pub(crate) fn set_running(&self, running: bool) {
        if running {
            self.top.arm();
        }
        self.running.store(running, Ordering::SeqCst);
    }

    pub(crate) fn has_application(&self) -> bool {
        lock(&self.application).is_some()
    }

    pub(crate) fn set_application(&self, application: Arc<dyn Application>) -> crate::Result<()> {
        let mut slot = lock(&self.application);
        if slot.is_some() {
            return Err(crate::Error::ApplicationAlreadySet);
        }
        if self.is_running() {
            return Err(crate::Error::ApplicationWhileRunning);
        }
        *slot = Some(application);
        Ok(())
    }

    /// Number of nested invocations currently running on top of the
    /// top-level one.
    pub(crate) fn depth(&self) -> usize {
        lock(&self.nested).len()
    }

    /// Drive the context at top level until stopped.
    pub(crate) fn run_top(&self) {
        let application = lock(&self.application).clone();
        match application {
            Some(application) => application.run(),
            None => self.top.run_armed(),
        }
    }

    /// Drive the context in a fresh nested loop until stopped.
    pub(crate) fn run_nested(&self, context: &MainContext) {
        let nested = MainLoop::new(context);
        nested.arm();
        lock(&self.nested).push(nested.clone());
        let _pop = PopNested(self);
        tracing::debug!(depth = self.depth(), "entering nested loop");
        nested.run_armed();
    }

    /// End the innermost running invocation. Safe to call from any thread.
    pub(crate) fn stop(&self) {
        let innermost = lock(&self.nested).last().cloned();
        if let Some(nested) = innermost {
            nested.quit();
            return;
        }
        let application = lock(&self.application).clone();
        match application {
            Some(application) => application.quit(),
            None => self.top.quit(),
        }
    }

    /// The default SIGINT action: stop and remember why, unless the user
    /// installed a handler of their own.
    pub(crate) fn interrupt(&self) {
        if self.user_interrupt_handler.load(Ordering::SeqCst) {
            return;
        }
        tracing::info!("interrupted, stopping event loop");
        self.interrupted.store(true, Ordering::SeqCst);
        self.stop();
    }

    pub(crate) fn take_interrupted(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn set_user_interrupt_handler(&self, installed: bool) {
        self.user_interrupt_handler.store(installed, Ordering::SeqCst);
    }
}

struct PopNested<'a>(&'a RunControl);

impl Drop for PopNested<'_> {
    fn drop(&mut self) {
        lock(&self.0.nested).pop();
    }
}

/// Stops a loop from any thread.
#[derive(Clone)]
pub struct StopHandle {
    pub(crate) control: Arc<RunControl>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.control.stop();
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }
}

impl std::fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopHandle")
            .field("running", &self.control.is_running())
            .finish()
    }
}
