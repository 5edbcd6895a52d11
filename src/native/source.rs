//! Source constructors.
//!
//! A [`Source`] is built detached, given a priority and a callback, and then
//! attached to a [`MainContext`]. Once attached it is only referred to by its
//! [`SourceId`].

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use super::thread_guard::ThreadGuard;
use super::{
    ControlFlow, IoCondition, MainContext, Priority, SourceEvent, SourceId, PRIORITY_DEFAULT,
    PRIORITY_DEFAULT_IDLE,
};
use crate::config;

pub(crate) type SourceFn = Box<dyn FnMut(SourceEvent) -> ControlFlow + Send + 'static>;

#[derive(Debug)]
pub(crate) enum SourceKind {
    Idle,
    /// `deadline` is `None` when the interval overflows the clock.
    Timeout { interval: Duration, deadline: Option<Instant> },
    Ready { ready_time: Option<Instant> },
    Fd { fd: RawFd, condition: IoCondition },
    Signal { signal: i32 },
    Child { pid: i32, reaped: bool },
}

/// A detached source.
pub struct Source {
    pub(crate) kind: SourceKind,
    pub(crate) priority: Priority,
    pub(crate) callback: Option<SourceFn>,
}

impl Source {
    fn with_kind(kind: SourceKind, priority: Priority) -> Self {
        Self {
            kind,
            priority,
            callback: None,
        }
    }

    /// Fires on every iteration that has nothing better to do.
    pub fn idle() -> Self {
        Self::with_kind(SourceKind::Idle, PRIORITY_DEFAULT_IDLE)
    }

    /// Fires every `interval`, the first time `interval` after attaching.
    ///
    /// An interval too large to be represented never fires.
    pub fn timeout(interval: Duration) -> Self {
        let deadline = Instant::now().checked_add(interval);
        Self::with_kind(SourceKind::Timeout { interval, deadline }, PRIORITY_DEFAULT)
    }

    /// Fires once each time it is armed with [`MainContext::set_ready`].
    pub fn ready() -> Self {
        Self::with_kind(SourceKind::Ready { ready_time: None }, PRIORITY_DEFAULT)
    }

    /// Fires while `fd` satisfies `condition`. Errors, hang-ups and invalid
    /// descriptors are always reported.
    pub fn fd(fd: RawFd, condition: IoCondition) -> Self {
        Self::with_kind(SourceKind::Fd { fd, condition }, PRIORITY_DEFAULT)
    }

    /// Fires when `signal` is delivered to the process.
    ///
    /// Returns `None` for signals the main loop cannot watch.
    pub fn unix_signal(signal: i32) -> Option<Self> {
        if !config::SUPPORTED_SIGNALS.contains(&signal) {
            return None;
        }
        Some(Self::with_kind(SourceKind::Signal { signal }, PRIORITY_DEFAULT))
    }

    /// Fires once when the child process `pid` terminates, reaping it.
    pub fn child_watch(pid: i32) -> Self {
        Self::with_kind(SourceKind::Child { pid, reaped: false }, PRIORITY_DEFAULT)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Set a callback that may be dispatched by whichever thread owns the
    /// context.
    pub fn set_callback<F>(&mut self, callback: F)
    where
        F: FnMut(SourceEvent) -> ControlFlow + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
    }

    /// Set a callback that may only be dispatched by the current thread.
    pub fn set_local_callback<F>(&mut self, callback: F)
    where
        F: FnMut(SourceEvent) -> ControlFlow + 'static,
    {
        let mut guard = ThreadGuard::new(callback);
        self.callback = Some(Box::new(move |event| (guard.get_mut())(event)));
    }

    /// Attach to `context`, making the source eligible for dispatch.
    pub fn attach(self, context: &MainContext) -> SourceId {
        context.attach_source(self)
    }
}

impl SourceKind {
    /// Whether the source should be dispatched, given what the last poll
    /// reported in `pending`.
    pub(crate) fn is_ready(&self, now: Instant, pending: bool) -> bool {
        match self {
            SourceKind::Idle => true,
            SourceKind::Timeout { deadline, .. } => matches!(deadline, Some(t) if *t <= now),
            SourceKind::Ready { ready_time } => matches!(ready_time, Some(t) if *t <= now),
            SourceKind::Fd { .. } | SourceKind::Signal { .. } | SourceKind::Child { .. } => pending,
        }
    }

    /// Earliest instant at which a time-based source becomes ready.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        match self {
            SourceKind::Timeout { deadline, .. } => *deadline,
            SourceKind::Ready { ready_time } => *ready_time,
            _ => None,
        }
    }
}
