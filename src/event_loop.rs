//! The event loop: scheduling, source registries and the run/stop protocol.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

use crate::config::{IO_PRIORITY, SOON_PRIORITY, TIMER_PRIORITY};
use crate::error::{Error, Result};
use crate::handle::{Handle, HandleId, RegistryKey};
use crate::native::{ControlFlow, IoCondition, MainContext, Source, SourceEvent, SourceId};
use crate::run::{Application, RunControl, StopHandle};

static CLOCK_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Capabilities selected when a loop is built.
#[derive(Clone, Default)]
pub struct LoopOptions {
    pub(crate) recursive: bool,
    pub(crate) application: Option<Arc<dyn Application>>,
    pub(crate) keep_raw_exit_status: bool,
}

impl LoopOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow [`EventLoop::run`] to re-enter a running loop.
    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Run and quit this application instead of a plain main loop.
    pub fn application(mut self, application: Arc<dyn Application>) -> Self {
        self.application = Some(application);
        self
    }

    /// Apply the >128 exit status correction to child exit codes (on by default).
    pub fn exit_status_correction(mut self, enabled: bool) -> Self {
        self.keep_raw_exit_status = !enabled;
        self
    }
}

impl fmt::Debug for LoopOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopOptions")
            .field("recursive", &self.recursive)
            .field("application", &self.application.is_some())
            .field("exit_status_correction", &!self.keep_raw_exit_status)
            .finish()
    }
}

/// Counters describing what the loop has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Handles scheduled, of any kind
    pub handles_created: u64,
    /// Readiness waits armed by I/O futures
    pub readiness_waits: u64,
    /// `sock_sendall` calls completed without waiting
    pub fast_path_sends: u64,
}

/// What is handed to the exception handler when a callback panics.
#[derive(Debug, Clone)]
pub struct ExceptionContext {
    pub message: String,
    pub handle: Option<HandleId>,
}

type ExceptionHandler = Rc<dyn Fn(&EventLoop, &ExceptionContext)>;

pub(crate) struct LoopInner {
    pub(crate) context: MainContext,
    pub(crate) control: Arc<RunControl>,
    pub(crate) recursive: bool,
    pub(crate) correct_exit_status: Cell<bool>,
    closed: Cell<bool>,
    next_handle: Cell<u64>,
    handles: RefCell<BTreeMap<HandleId, Handle>>,
    pub(crate) readers: RefCell<HashMap<RawFd, Handle>>,
    pub(crate) writers: RefCell<HashMap<RawFd, Handle>>,
    pub(crate) signals: RefCell<HashMap<i32, Handle>>,
    pub(crate) children: RefCell<HashMap<i32, Handle>>,
    remote: Arc<RemoteCalls>,
    exception_handler: RefCell<Option<ExceptionHandler>>,
    stats: Cell<LoopStats>,
}

/// A cooperative event loop whose waiting is done by a [`MainContext`].
///
/// Cloning gives another handle to the same loop. The loop is bound to the
/// thread that created it; use [`EventLoop::threadsafe`] to reach it from
/// other threads.
#[derive(Clone)]
pub struct EventLoop {
    pub(crate) inner: Rc<LoopInner>,
}

impl EventLoop {
    /// Create a loop on a fresh context.
    pub fn new() -> Result<Self> {
        let context = MainContext::new()?;
        Ok(Self::with_context(&context, LoopOptions::default()))
    }

    /// Create a loop on `context`.
    ///
    /// A loop on the process-wide default context also takes over the
    /// default SIGINT handling.
    pub fn with_context(context: &MainContext, options: LoopOptions) -> Self {
        let control = Arc::new(RunControl::new(context, options.application));
        let event_loop = EventLoop {
            inner: Rc::new(LoopInner {
                context: context.clone(),
                control,
                recursive: options.recursive,
                correct_exit_status: Cell::new(!options.keep_raw_exit_status),
                closed: Cell::new(false),
                next_handle: Cell::new(1),
                handles: RefCell::new(BTreeMap::new()),
                readers: RefCell::new(HashMap::new()),
                writers: RefCell::new(HashMap::new()),
                signals: RefCell::new(HashMap::new()),
                children: RefCell::new(HashMap::new()),
                remote: Arc::new(RemoteCalls::default()),
                exception_handler: RefCell::new(None),
                stats: Cell::new(LoopStats::default()),
            }),
        };
        if context.is_default() {
            crate::signal::attach_default_interrupt(&event_loop.inner.control);
        }
        tracing::debug!(
            context = context.id(),
            recursive = options.recursive,
            "event loop created"
        );
        event_loop
    }

    pub fn context(&self) -> &MainContext {
        &self.inner.context
    }

    /// Monotonic clock in fractional seconds.
    pub fn time(&self) -> f64 {
        CLOCK_EPOCH.elapsed().as_secs_f64()
    }

    /// Run `callback` at the next opportunity.
    ///
    /// Callbacks scheduled this way run in the order they were scheduled,
    /// above timers and fd readiness.
    ///
    /// Only plain callbacks are accepted; an async block is not a callback:
    ///
    /// ```compile_fail
    /// let event_loop = rust_mainloop::EventLoop::new().unwrap();
    /// event_loop.call_soon(|| async {});
    /// ```
    pub fn call_soon<F>(&self, callback: F) -> Handle
    where
        F: FnOnce() + 'static,
    {
        let source = Source::idle().with_priority(SOON_PRIORITY);
        Handle::schedule(self, source, false, RegistryKey::None, once(callback))
    }

    /// Run `callback` once `delay` has elapsed. A zero delay is `call_soon`.
    pub fn call_later<F>(&self, delay: Duration, callback: F) -> Handle
    where
        F: FnOnce() + 'static,
    {
        if delay.is_zero() {
            return self.call_soon(callback);
        }
        let source = Source::timeout(delay).with_priority(TIMER_PRIORITY);
        Handle::schedule(self, source, false, RegistryKey::None, once(callback))
    }

    /// Run `callback` at loop time `when` (see [`time`](EventLoop::time)).
    pub fn call_at<F>(&self, when: f64, callback: F) -> Handle
    where
        F: FnOnce() + 'static,
    {
        let delay = when - self.time();
        if delay.is_nan() || delay <= 0.0 {
            return self.call_soon(callback);
        }
        // Past what a Duration holds: a timer that never fires.
        let delay = Duration::try_from_secs_f64(delay).unwrap_or(Duration::MAX);
        self.call_later(delay, callback)
    }

    /// Call `callback` whenever `fd` is readable, replacing any previous
    /// reader of `fd`.
    pub fn add_reader<F>(&self, fd: RawFd, callback: F) -> Result<Handle>
    where
        F: FnMut() + 'static,
    {
        self.watch_fd(fd, IoCondition::IN, RegistryKey::Reader(fd), callback)
    }

    /// Call `callback` whenever `fd` is writable, replacing any previous
    /// writer of `fd`.
    pub fn add_writer<F>(&self, fd: RawFd, callback: F) -> Result<Handle>
    where
        F: FnMut() + 'static,
    {
        self.watch_fd(fd, IoCondition::OUT, RegistryKey::Writer(fd), callback)
    }

    fn watch_fd<F>(
        &self,
        fd: RawFd,
        condition: IoCondition,
        key: RegistryKey,
        mut callback: F,
    ) -> Result<Handle>
    where
        F: FnMut() + 'static,
    {
        self.check_closed()?;
        let registry = match key {
            RegistryKey::Writer(_) => &self.inner.writers,
            _ => &self.inner.readers,
        };
        let previous = registry.borrow_mut().remove(&fd);
        if let Some(previous) = previous {
            previous.cancel();
        }
        let source = Source::fd(fd, condition).with_priority(IO_PRIORITY);
        let handle = Handle::schedule(self, source, true, key, move |_, _| callback());
        registry.borrow_mut().insert(fd, handle.clone());
        Ok(handle)
    }

    /// Stop watching `fd` for reading. Returns whether a reader was removed.
    pub fn remove_reader(&self, fd: RawFd) -> bool {
        let removed = self.inner.readers.borrow_mut().remove(&fd);
        removed.map(|handle| handle.cancel()).is_some()
    }

    /// Stop watching `fd` for writing. Returns whether a writer was removed.
    pub fn remove_writer(&self, fd: RawFd) -> bool {
        let removed = self.inner.writers.borrow_mut().remove(&fd);
        removed.map(|handle| handle.cancel()).is_some()
    }

    /// Schedule from any thread.
    pub fn call_soon_threadsafe<F>(&self, callback: F) -> Result<SourceId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.threadsafe().call_soon(callback)
    }

    /// A `Send` handle for scheduling onto this loop from other threads.
    pub fn threadsafe(&self) -> ThreadsafeHandle {
        ThreadsafeHandle {
            context: self.inner.context.clone(),
            remote: self.inner.remote.clone(),
            control: self.inner.control.clone(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            control: self.inner.control.clone(),
        }
    }

    /// Run the loop until [`stop`](EventLoop::stop) is called.
    ///
    /// Returns [`Error::AlreadyRunning`] if the loop is running and is not
    /// recursive; a recursive loop enters a nested invocation instead.
    /// Returns [`Error::Interrupted`] when the default SIGINT handling
    /// stopped the loop.
    pub fn run_forever(&self) -> Result<()> {
        self.check_closed()?;
        let control = &self.inner.control;
        if control.is_running() {
            if !self.inner.recursive {
                return Err(Error::AlreadyRunning);
            }
            control.run_nested(&self.inner.context);
            return Ok(());
        }

        control.set_running(true);
        tracing::debug!(context = self.inner.context.id(), "event loop running");
        let stopped = StopOnExit(control);
        control.run_top();
        drop(stopped);
        tracing::debug!(context = self.inner.context.id(), "event loop stopped");

        if control.take_interrupted() {
            return Err(Error::Interrupted);
        }
        Ok(())
    }

    /// Enter the loop, nesting if it is already running.
    ///
    /// This is the entry point for code such as a modal dialog that spins
    /// the loop from inside one of its callbacks.
    pub fn run(&self) -> Result<()> {
        self.run_forever()
    }

    /// Stop the innermost running invocation of the loop.
    pub fn stop(&self) {
        self.inner.control.stop();
    }

    pub fn is_running(&self) -> bool {
        self.inner.control.is_running()
    }

    /// Number of nested invocations on top of the top-level one.
    pub fn recursion_depth(&self) -> usize {
        self.inner.control.depth()
    }

    /// Drive `future` to completion, running the loop meanwhile.
    ///
    /// A panic inside `future` resumes on the caller once the loop has
    /// stopped.
    pub fn run_until_complete<F>(&self, future: F) -> Result<F::Output>
    where
        F: std::future::Future + 'static,
        F::Output: 'static,
    {
        self.check_closed()?;
        if self.is_running() && !self.inner.recursive {
            return Err(Error::AlreadyRunning);
        }
        let task = self.spawn(future);
        let control = self.inner.control.clone();
        let token = task.add_done_callback(move || control.stop());
        let outcome = self.run_forever();
        task.remove_done_callback(token);
        outcome?;
        task.take_outcome()
    }

    /// Attach an application object. Fails if one is set or the loop runs.
    pub fn set_application(&self, application: Arc<dyn Application>) -> Result<()> {
        self.inner.control.set_application(application)
    }

    pub fn has_application(&self) -> bool {
        self.inner.control.has_application()
    }

    /// Run one iteration of the context, blocking until something is
    /// dispatched. Returns whether anything was.
    pub fn run_once(&self) -> bool {
        self.inner.context.iteration(true)
    }

    /// Tear down every handle, watch and pending threadsafe call.
    ///
    /// A closed loop cannot be run again.
    pub fn close(&self) -> Result<()> {
        if self.is_running() {
            return Err(Error::AlreadyRunning);
        }
        if self.inner.closed.replace(true) {
            return Ok(());
        }
        self.inner.readers.borrow_mut().clear();
        self.inner.writers.borrow_mut().clear();
        self.inner.signals.borrow_mut().clear();
        self.inner.children.borrow_mut().clear();
        self.inner.cancel_all();
        self.inner.remote.close(&self.inner.context);
        self.inner.control.set_user_interrupt_handler(false);
        if self.inner.context.is_default() {
            crate::signal::detach_default_interrupt(&self.inner.control);
        }
        tracing::debug!(context = self.inner.context.id(), "event loop closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    pub(crate) fn check_closed(&self) -> Result<()> {
        if self.inner.closed.get() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Replace the handler that receives callback panics.
    pub fn set_exception_handler<F>(&self, handler: F)
    where
        F: Fn(&EventLoop, &ExceptionContext) + 'static,
    {
        *self.inner.exception_handler.borrow_mut() = Some(Rc::new(handler));
    }

    /// Restore the default handler, which logs.
    pub fn clear_exception_handler(&self) {
        *self.inner.exception_handler.borrow_mut() = None;
    }

    pub fn call_exception_handler(&self, context: &ExceptionContext) {
        let handler = self.inner.exception_handler.borrow().clone();
        let handler = match handler {
            Some(handler) => handler,
            None => return default_exception_handler(context),
        };
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler(self, context)));
        if result.is_err() {
            tracing::error!("exception handler panicked");
            default_exception_handler(context);
        }
    }

    pub(crate) fn report_panic(&self, handle: &Handle, payload: Box<dyn Any + Send>) {
        let context = ExceptionContext {
            message: panic_message(&payload),
            handle: Some(handle.id()),
        };
        self.call_exception_handler(&context);
    }

    pub fn stats(&self) -> LoopStats {
        self.inner.stats.get()
    }

    pub(crate) fn bump_stats(&self, update: impl FnOnce(&mut LoopStats)) {
        let mut stats = self.inner.stats.get();
        update(&mut stats);
        self.inner.stats.set(stats);
    }

    /// Number of handles that still own a source.
    pub fn live_handles(&self) -> usize {
        self.inner.handles.borrow().len()
    }

    pub(crate) fn downgrade(&self) -> WeakEventLoop {
        WeakEventLoop(Rc::downgrade(&self.inner))
    }

    pub fn ptr_eq(&self, other: &EventLoop) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("context", &self.inner.context.id())
            .field("running", &self.is_running())
            .field("closed", &self.is_closed())
            .field("handles", &self.live_handles())
            .finish()
    }
}

/// Non-owning reference to a loop.
#[derive(Clone)]
pub(crate) struct WeakEventLoop(std::rc::Weak<LoopInner>);

impl WeakEventLoop {
    pub(crate) fn upgrade(&self) -> Option<EventLoop> {
        self.0.upgrade().map(|inner| EventLoop { inner })
    }
}

struct StopOnExit<'a>(&'a RunControl);

impl Drop for StopOnExit<'_> {
    fn drop(&mut self) {
        self.0.set_running(false);
        self.0.stop();
    }
}

impl LoopInner {
    pub(crate) fn next_handle_id(&self) -> HandleId {
        let id = self.next_handle.get();
        self.next_handle.set(id + 1);
        HandleId(id)
    }

    pub(crate) fn register_handle(&self, handle: &Handle) {
        self.handles.borrow_mut().insert(handle.id(), handle.clone());
        let mut stats = self.stats.get();
        stats.handles_created += 1;
        self.stats.set(stats);
    }

    pub(crate) fn unregister_handle(&self, handle: &Handle) {
        let removed = self.handles.borrow_mut().remove(&handle.id());
        let registry = match handle.key() {
            RegistryKey::None => None,
            RegistryKey::Reader(fd) => Some((&self.readers, fd)),
            RegistryKey::Writer(fd) => Some((&self.writers, fd)),
            RegistryKey::Signal(signal) => Some((&self.signals, signal)),
            RegistryKey::Child(pid) => Some((&self.children, pid)),
        };
        let entry = registry.and_then(|(map, key)| {
            let mut map = map.borrow_mut();
            match map.get(&key) {
                Some(current) if current.same(handle) => map.remove(&key),
                _ => None,
            }
        });
        drop(removed);
        drop(entry);
    }

    fn cancel_all(&self) {
        let handles = std::mem::take(&mut *self.handles.borrow_mut());
        for handle in handles.into_values() {
            handle.cancel();
        }
    }
}

impl Drop for LoopInner {
    fn drop(&mut self) {
        self.cancel_all();
        self.remote.close(&self.context);
    }
}

/// Cross-thread access to a loop.
///
/// Everything done through this handle goes through the context's
/// thread-safe source attachment; nothing touches the loop's registries.
#[derive(Clone)]
pub struct ThreadsafeHandle {
    context: MainContext,
    remote: Arc<RemoteCalls>,
    control: Arc<RunControl>,
}

impl ThreadsafeHandle {
    /// Run `callback` on the loop's thread at the next opportunity.
    pub fn call_soon<F>(&self, callback: F) -> Result<SourceId>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.remote.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let token = self.remote.next.fetch_add(1, Ordering::Relaxed);
        let remote = self.remote.clone();
        let mut callback = Some(callback);
        let mut source = Source::idle().with_priority(SOON_PRIORITY);
        source.set_callback(move |_| {
            remote.lock().remove(&token);
            if let Some(callback) = callback.take() {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
                    tracing::error!(panic = %panic_message(&payload), "threadsafe callback panicked");
                }
            }
            ControlFlow::Break
        });
        // Held across attach so the callback never runs before it is recorded.
        let mut pending = self.remote.lock();
        let id = source.attach(&self.context);
        pending.insert(token, id);
        Ok(id)
    }

    pub fn stop(&self) {
        self.control.stop();
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }
}

impl fmt::Debug for ThreadsafeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadsafeHandle")
            .field("context", &self.context.id())
            .finish()
    }
}

#[derive(Default)]
struct RemoteCalls {
    closed: AtomicBool,
    next: AtomicU64,
    pending: Mutex<HashMap<u64, SourceId>>,
}

impl RemoteCalls {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, SourceId>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self, context: &MainContext) {
        self.closed.store(true, Ordering::SeqCst);
        let pending: Vec<SourceId> = self.lock().drain().map(|(_, id)| id).collect();
        for id in pending {
            context.destroy(id);
        }
    }
}

fn once<F>(callback: F) -> impl FnMut(&Handle, SourceEvent) + 'static
where
    F: FnOnce() + 'static,
{
    let mut callback = Some(callback);
    move |_, _| {
        if let Some(callback) = callback.take() {
            callback();
        }
    }
}

fn default_exception_handler(context: &ExceptionContext) {
    tracing::error!(
        handle = ?context.handle.map(|id| id.0),
        "unhandled panic in callback: {}",
        context.message
    );
}

pub(crate) fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
