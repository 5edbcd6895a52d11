//! Deadline wrapper for futures driven by the loop.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project::pin_project;

use super::Sleep;
use crate::event_loop::EventLoop;

/// Future returned by [`timeout`](super::timeout).
///
/// The inner future is polled first, so a future that becomes ready in the
/// same pass as the deadline still wins. Dropping the wrapper cancels the
/// loop timer.
#[pin_project]
pub struct Timeout<F> {
    #[pin]
    inner: F,
    #[pin]
    expiry: Sleep,
}

impl<F: Future> Timeout<F> {
    pub fn new(event_loop: &EventLoop, inner: F, duration: Duration) -> Self {
        Self {
            inner,
            expiry: Sleep::new(event_loop, duration),
        }
    }

    /// The wrapped future.
    pub fn get_ref(&self) -> &F {
        &self.inner
    }

    pub fn is_elapsed(&self) -> bool {
        self.expiry.is_elapsed()
    }
}

impl<F: Future> Future for Timeout<F> {
    type Output = Result<F::Output, TimeoutError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if let Poll::Ready(output) = this.inner.poll(cx) {
            return Poll::Ready(Ok(output));
        }
        this.expiry.poll(cx).map(|()| Err(TimeoutError))
    }
}

/// The deadline passed before the wrapped future completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deadline elapsed")]
pub struct TimeoutError;
