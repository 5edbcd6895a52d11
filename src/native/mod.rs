//! Native main-loop abstraction.
//!
//! The event loop never waits by itself: every timer, readiness wait, signal
//! and child watch is a *source* attached to a [`MainContext`], and whoever
//! iterates that context (the loop, a [`MainLoop`] started by third-party
//! code, a toolkit's modal dialog) dispatches it.
//!
//! The model follows the classic native main loop:
//!
//! - A context is shared and thread-safe, but only one thread may *own* it at
//!   a time. Ownership is reentrant for the owning thread, so a callback may
//!   iterate the context again (a nested loop).
//! - Every source has a priority; lower values win. One iteration dispatches
//!   all ready sources of the best ready priority, in the order they were
//!   attached.
//! - File descriptors are polled with `poll(2)`, so readiness is
//!   level-triggered.
//! - A source that is currently being dispatched is skipped by nested
//!   iterations.

use std::fmt;
use std::ops::BitOr;

pub mod context;
pub mod main_loop;
pub mod source;
mod thread_guard;

pub use context::MainContext;
pub use main_loop::MainLoop;
pub use source::Source;

/// Dispatch priority of a source. Lower values are dispatched first.
pub type Priority = i32;

/// Use for very urgent work, above every default source.
pub const PRIORITY_HIGH: Priority = -100;
/// Priority of timers and fd watches.
pub const PRIORITY_DEFAULT: Priority = 0;
/// Idle work that should still run before redraw-class work.
pub const PRIORITY_HIGH_IDLE: Priority = 100;
/// Priority of plain idle sources.
pub const PRIORITY_DEFAULT_IDLE: Priority = 200;

/// Identifies a source attached to a context.
///
/// Ids are allocated in attach order, which is also the dispatch order
/// within one priority tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub(crate) u64);

impl SourceId {
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

/// Returned by source callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlow {
    /// Keep the source attached.
    Continue,
    /// Destroy the source after this dispatch.
    Break,
}

/// Readiness condition of a file descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct IoCondition(u8);

impl IoCondition {
    pub const IN: IoCondition = IoCondition(0b0001);
    pub const OUT: IoCondition = IoCondition(0b0010);
    pub const ERR: IoCondition = IoCondition(0b0100);
    pub const HUP: IoCondition = IoCondition(0b1000);
    pub const NVAL: IoCondition = IoCondition(0b1_0000);

    pub const fn empty() -> Self {
        IoCondition(0)
    }

    pub const fn contains(&self, other: IoCondition) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(&self, other: IoCondition) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub(crate) fn to_poll_events(self) -> libc::c_short {
        let mut events = 0;
        if self.contains(IoCondition::IN) {
            events |= libc::POLLIN;
        }
        if self.contains(IoCondition::OUT) {
            events |= libc::POLLOUT;
        }
        events
    }

    pub(crate) fn from_poll_events(revents: libc::c_short) -> Self {
        let mut condition = IoCondition::empty();
        if revents & libc::POLLIN != 0 {
            condition = condition | IoCondition::IN;
        }
        if revents & libc::POLLOUT != 0 {
            condition = condition | IoCondition::OUT;
        }
        if revents & libc::POLLERR != 0 {
            condition = condition | IoCondition::ERR;
        }
        if revents & libc::POLLHUP != 0 {
            condition = condition | IoCondition::HUP;
        }
        if revents & libc::POLLNVAL != 0 {
            condition = condition | IoCondition::NVAL;
        }
        condition
    }
}

impl BitOr for IoCondition {
    type Output = IoCondition;

    fn bitor(self, rhs: IoCondition) -> IoCondition {
        IoCondition(self.0 | rhs.0)
    }
}

impl fmt::Debug for IoCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (IoCondition::IN, "IN"),
            (IoCondition::OUT, "OUT"),
            (IoCondition::ERR, "ERR"),
            (IoCondition::HUP, "HUP"),
            (IoCondition::NVAL, "NVAL"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "IoCondition({})", set.join(" | "))
    }
}

/// What made a source fire, handed to its callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEvent {
    Idle,
    Timeout,
    Ready,
    Fd(IoCondition),
    Signal(i32),
    /// `status` is the raw wait status reported by `waitpid`.
    ChildExited { pid: i32, status: i32 },
}

impl SourceEvent {
    /// True when an fd source reported that its descriptor is not open.
    pub fn is_invalid_fd(&self) -> bool {
        matches!(self, SourceEvent::Fd(condition) if condition.contains(IoCondition::NVAL))
    }
}
