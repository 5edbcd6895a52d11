//! Timers built on the loop's `call_later`.
//!
//! There is no timer wheel here: every sleep is one timeout source on the
//! main context, so timers interleave with everything else the context
//! dispatches.

use std::time::Duration;

use crate::event_loop::EventLoop;

pub mod sleep;
pub mod timeout;

pub use sleep::Sleep;
pub use timeout::{Timeout, TimeoutError};

/// Sleep for the given duration on `event_loop`.
pub fn sleep(event_loop: &EventLoop, duration: Duration) -> Sleep {
    Sleep::new(event_loop, duration)
}

/// Apply a timeout to any future
///
/// Returns a `Result<T, TimeoutError>` where `T` is the output of the original future.
/// If the future completes before the timeout, the result is `Ok(output)`.
/// If the timeout expires first, the result is `Err(TimeoutError)` and the
/// future is dropped.
///
/// # Examples
///
/// ```rust,no_run
/// use rust_mainloop::{timer, EventLoop};
/// use std::time::Duration;
///
/// let event_loop = EventLoop::new().unwrap();
/// let waiter = event_loop.clone();
/// let result = event_loop.run_until_complete(async move {
///     timer::timeout(&waiter, Duration::from_secs(1), async {
///         "completed"
///     })
///     .await
/// });
/// assert_eq!(result.unwrap().unwrap(), "completed");
/// ```
pub fn timeout<F>(event_loop: &EventLoop, duration: Duration, future: F) -> Timeout<F>
where
    F: std::future::Future,
{
    Timeout::new(event_loop, future, duration)
}

/// Add timeout combinator to Future trait
pub trait FutureExt: std::future::Future + Sized {
    fn with_timeout(self, event_loop: &EventLoop, duration: Duration) -> Timeout<Self> {
        Timeout::new(event_loop, self, duration)
    }
}

impl<F: std::future::Future> FutureExt for F {}

impl EventLoop {
    /// Sleep for `duration` on this loop.
    pub fn sleep(&self, duration: Duration) -> Sleep {
        Sleep::new(self, duration)
    }
}
