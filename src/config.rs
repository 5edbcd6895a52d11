//! Configuration constants for the event loop
//!
//! This module contains the tunable parameters that decide how loop work is
//! interleaved with the native main context: the priority tiers given to each
//! kind of source, the signals the native loop is able to watch, and the
//! knobs of the child-exit decoding.

use crate::native::{Priority, PRIORITY_DEFAULT, PRIORITY_HIGH};

/// Priority of `call_soon` callbacks and task wake-ups
///
/// Immediate callbacks must never rank below an I/O readiness source: a
/// writer that completes a future schedules the result-setter with
/// `call_soon`, and if that callback ranks lower than the (still ready)
/// writer it is never reached.
pub const SOON_PRIORITY: Priority = PRIORITY_HIGH;

/// Priority of `call_later`/`call_at` timers
pub const TIMER_PRIORITY: Priority = PRIORITY_DEFAULT;

/// Priority of fd readiness sources (readers, writers, socket waits)
pub const IO_PRIORITY: Priority = PRIORITY_DEFAULT;

/// Priority of unix signal and child-exit sources
pub const SIGNAL_PRIORITY: Priority = PRIORITY_DEFAULT;

/// Exclusive upper bound of valid signal numbers
#[cfg(target_os = "linux")]
pub const NSIG: i32 = 65;
#[cfg(not(target_os = "linux"))]
pub const NSIG: i32 = 32;

/// Signals the native loop knows how to turn into sources
pub const SUPPORTED_SIGNALS: &[i32] = &[
    libc::SIGHUP,
    libc::SIGINT,
    libc::SIGTERM,
    libc::SIGUSR1,
    libc::SIGUSR2,
    libc::SIGWINCH,
];

/// Signals no process can catch
pub const UNCATCHABLE_SIGNALS: &[i32] = &[libc::SIGKILL, libc::SIGSTOP];

/// Exit codes above this value are treated as mis-decoded by the native wait
/// primitive and folded back with `THRESHOLD - code`.
///
/// Whether the correction is still needed depends on the platform's wait
/// status translation; see `ChildWatcher::set_exit_status_correction`.
pub const EXIT_STATUS_CORRECTION_THRESHOLD: i32 = 128;

/// Buffer used when draining wake-up and signal pipes
pub const PIPE_DRAIN_BUFFER: usize = 64;
