use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::event_loop::EventLoop;
use crate::future::Future as LoopFuture;
use crate::handle::Handle;

/// Resolves once its timer fires. Dropping it cancels the timer.
pub struct Sleep {
    fired: LoopFuture<()>,
    timer: Handle,
}

impl Sleep {
    pub fn new(event_loop: &EventLoop, duration: Duration) -> Self {
        let (fired, promise) = event_loop.create_future();
        let timer = event_loop.call_later(duration, move || {
            let _ = promise.set_result(());
        });
        Self { fired, timer }
    }

    pub fn is_elapsed(&self) -> bool {
        self.fired.is_done()
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.fired).poll(cx) {
            Poll::Ready(_) => Poll::Ready(()),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        self.timer.cancel();
    }
}
