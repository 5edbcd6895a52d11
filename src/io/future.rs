use std::future::Future;
use std::io;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::config::IO_PRIORITY;
use crate::error::{Error, Result};
use crate::event_loop::EventLoop;
use crate::future::Future as LoopFuture;
use crate::handle::{Handle, RegistryKey};
use crate::native::{IoCondition, Source};

/// Future representing one readiness-driven I/O operation
///
/// Owns the handle that drives it; dropping the future before it resolves
/// cancels the handle and releases whatever the step function captured.
pub struct IoFuture<T> {
    /// Resolved exactly once, by the step function or by cancellation
    result: LoopFuture<Result<T>>,
    handle: Option<Handle>,
}

impl<T: 'static> IoFuture<T> {
    /// An operation that finished without waiting.
    pub(crate) fn ready(event_loop: &EventLoop, outcome: Result<T>) -> Self {
        let (result, promise) = event_loop.create_future();
        // A fresh promise always accepts its first result.
        let _ = promise.set_result(outcome);
        Self {
            result,
            handle: None,
        }
    }
}

impl<T> IoFuture<T> {
    pub fn is_done(&self) -> bool {
        self.result.is_done()
    }

    /// Stop waiting. Awaiting a cancelled operation yields
    /// [`Error::Cancelled`].
    pub fn cancel(&self) {
        self.result.cancel();
        if let Some(handle) = &self.handle {
            handle.cancel();
        }
    }
}

impl<T> Future for IoFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.result).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
        }
    }
}

impl<T> Drop for IoFuture<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.cancel();
        }
    }
}

impl EventLoop {
    /// Wait until `fd` satisfies `condition`, then call `step`.
    ///
    /// `step` returns `Ok(Some(value))` when the operation is complete and
    /// `Ok(None)` when it made partial progress (or none) and should wait for
    /// the next readiness. `WouldBlock` and `Interrupted` errors count as
    /// not ready yet; any other error completes the operation with
    /// [`Error::Io`].
    pub fn wait_ready<T, S>(&self, fd: RawFd, condition: IoCondition, mut step: S) -> IoFuture<T>
    where
        T: 'static,
        S: FnMut() -> io::Result<Option<T>> + 'static,
    {
        if let Err(err) = self.check_closed() {
            return IoFuture::ready(self, Err(err));
        }
        let (result, promise) = self.create_future();
        self.bump_stats(|stats| stats.readiness_waits += 1);

        let source = Source::fd(fd, condition).with_priority(IO_PRIORITY);
        let handle = Handle::schedule(self, source, true, RegistryKey::None, move |handle, event| {
            if promise.is_done() {
                handle.cancel();
                return;
            }
            let outcome = match step() {
                Ok(Some(value)) => Ok(value),
                Ok(None) if event.is_invalid_fd() => Err(Error::Io(io::Error::from_raw_os_error(
                    libc::EBADF,
                ))),
                Ok(None) => return,
                Err(err) if is_retryable(&err) && !event.is_invalid_fd() => return,
                Err(err) => Err(Error::Io(err)),
            };
            let _ = promise.set_result(outcome);
            handle.cancel();
        });
        IoFuture {
            result,
            handle: Some(handle),
        }
    }
}

fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;

    #[test]
    fn test_step_retries_until_done() {
        let event_loop = EventLoop::new().unwrap();
        let (reader, mut writer) = UnixStream::pair().unwrap();
        writer.write_all(b"x").unwrap();
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let wait = event_loop.wait_ready(reader.as_raw_fd(), IoCondition::IN, move || {
            counter.set(counter.get() + 1);
            match counter.get() {
                1 => Err(io::Error::from(io::ErrorKind::WouldBlock)),
                2 => Ok(None),
                _ => Ok(Some("done")),
            }
        });
        let value = event_loop.run_until_complete(wait).unwrap().unwrap();
        assert_eq!(value, "done");
        assert_eq!(calls.get(), 3);
        assert_eq!(event_loop.live_handles(), 0);
        assert_eq!(event_loop.stats().readiness_waits, 1);
    }

    #[test]
    fn test_step_error_carries_os_code() {
        let event_loop = EventLoop::new().unwrap();
        let (reader, mut writer) = UnixStream::pair().unwrap();
        writer.write_all(b"x").unwrap();
        let wait = event_loop.wait_ready(reader.as_raw_fd(), IoCondition::IN, || {
            Err::<Option<()>, _>(io::Error::from_raw_os_error(libc::ECONNRESET))
        });
        let err = event_loop.run_until_complete(wait).unwrap().unwrap_err();
        assert_eq!(err.os_code(), Some(libc::ECONNRESET));
    }

    #[test]
    fn test_invalid_fd_fails_instead_of_hanging() {
        let event_loop = EventLoop::new().unwrap();
        let wait = event_loop.wait_ready(900_001, IoCondition::IN, || Ok::<_, io::Error>(None::<()>));
        let err = event_loop.run_until_complete(wait).unwrap().unwrap_err();
        assert_eq!(err.os_code(), Some(libc::EBADF));
    }

    #[test]
    fn test_drop_cancels_handle() {
        let event_loop = EventLoop::new().unwrap();
        let (reader, _writer) = UnixStream::pair().unwrap();
        let wait = event_loop.wait_ready(reader.as_raw_fd(), IoCondition::IN, || {
            Ok::<_, io::Error>(Some(()))
        });
        assert_eq!(event_loop.context().source_count(), 1);
        drop(wait);
        assert_eq!(event_loop.context().source_count(), 0);
        assert_eq!(event_loop.live_handles(), 0);
    }

    #[test]
    fn test_explicit_cancel() {
        let event_loop = EventLoop::new().unwrap();
        let (reader, _writer) = UnixStream::pair().unwrap();
        let wait = event_loop.wait_ready(reader.as_raw_fd(), IoCondition::IN, || {
            Ok::<_, io::Error>(Some(()))
        });
        wait.cancel();
        assert!(wait.is_done());
        let result = event_loop.run_until_complete(wait).unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
