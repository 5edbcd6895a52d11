use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::MainContext;

/// Runs a context until told to quit.
///
/// Several main loops may run nested on the same context and thread (a
/// callback starting a modal loop); `quit` only ends the loop it is called
/// on, and that loop returns once control comes back to it.
#[derive(Clone, Debug)]
pub struct MainLoop {
    inner: Arc<LoopState>,
}

#[derive(Debug)]
struct LoopState {
    context: MainContext,
    running: AtomicBool,
}

impl MainLoop {
    pub fn new(context: &MainContext) -> Self {
        Self {
            inner: Arc::new(LoopState {
                context: context.clone(),
                running: AtomicBool::new(false),
            }),
        }
    }

    pub fn context(&self) -> &MainContext {
        &self.inner.context
    }

    /// Iterate the context until [`quit`](MainLoop::quit) is called.
    ///
    /// Blocks while another thread owns the context; a `quit` during that
    /// wait makes `run` return without iterating.
    pub fn run(&self) {
        self.arm();
        self.run_armed();
    }

    /// Mark the loop running ahead of [`run_armed`](MainLoop::run_armed), so
    /// that a `quit` issued in between is not lost.
    pub(crate) fn arm(&self) {
        self.inner.running.store(true, Ordering::SeqCst);
    }

    pub(crate) fn run_armed(&self) {
        let context = &self.inner.context;
        let _acquired = match context.acquire_guard_while(|| self.is_running()) {
            Some(acquired) => acquired,
            None => {
                tracing::debug!(context = context.id(), "main loop quit before acquiring");
                return;
            }
        };
        while self.is_running() {
            context.iteration(true);
        }
    }

    /// Make [`run`](MainLoop::run) return. Safe to call from any thread.
    pub fn quit(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.context.wakeup();
        self.inner.context.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}
