//! rust-mainloop: a cooperative event loop that lets a native main loop do
//! all the waiting
//!
//! The loop exposes the usual scheduling surface (immediate callbacks,
//! timers, readiness-based I/O waits, unix signals, child-process exits and
//! tasks) but owns no poller of its own. Every piece of deferred work is a
//! [`Handle`] bound to exactly one source of a [`native::MainContext`], so
//! the context may be driven by this loop, by a third-party `MainLoop`, or
//! recursively by both.
//!
//! - [`native`] - the main context, its sources and the nestable `MainLoop`
//! - [`EventLoop`] - scheduling, the fd/signal/child registries and the
//!   run/stop protocol
//! - [`io`] - socket connect/accept/recv/sendall on top of readiness waits
//! - [`task`] and [`future`] - the futures the loop drives
//! - [`policy`] - which loop belongs to which thread
//!
//! ## Ordering
//!
//! `call_soon` callbacks and task wake-ups run at a high priority tier, above
//! timers and fd readiness. Within one tier callbacks run in the order they
//! were scheduled; callbacks scheduled while a tier is being dispatched run on
//! the next pass.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use rust_mainloop::EventLoop;
//! use std::time::Duration;
//!
//! let event_loop = EventLoop::new().unwrap();
//! let stopper = event_loop.clone();
//! event_loop.call_later(Duration::from_millis(100), move || stopper.stop());
//! event_loop.run_forever().unwrap();
//!
//! let answer = event_loop
//!     .run_until_complete({
//!         let event_loop = event_loop.clone();
//!         async move {
//!             event_loop.sleep(Duration::from_millis(10)).await;
//!             42
//!         }
//!     })
//!     .unwrap();
//! assert_eq!(answer, 42);
//! ```
//!
//! # Nested loops
//!
//! A loop built with [`LoopOptions::recursive`] may be re-entered with
//! [`EventLoop::run`] from inside one of its own callbacks (a modal dialog,
//! for instance). [`EventLoop::stop`] always ends the innermost invocation
//! only; the outer one keeps dispatching until it is stopped separately.

pub mod child;
pub mod config;
pub mod emitter;
pub mod event_loop;
pub mod future;
pub mod handle;
pub mod io;
pub mod native;
pub mod policy;
pub mod run;
pub mod signal;
pub mod task;
pub mod timer;
pub mod waker;

// Re-export core types
pub use child::{decode_wait_status, ChildWatcher};
pub use emitter::{wait_signal, Emitter, WaitSignal};
pub use error::{Error, Result};
pub use event_loop::{EventLoop, ExceptionContext, LoopOptions, LoopStats, ThreadsafeHandle};
pub use future::{Future, Promise};
pub use handle::Handle;
pub use io::IoFuture;
pub use policy::{get_event_loop, policy, EventLoopPolicy};
pub use run::{Application, StopHandle};
pub use task::JoinHandle;
pub use timer::{Sleep, Timeout, TimeoutError};

/// Error types for the event loop
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("event loop is closed")]
        Closed,

        #[error("event loop is already running")]
        AlreadyRunning,

        #[error("event loop stopped before the future completed")]
        StoppedBeforeCompletion,

        #[error("event loop interrupted")]
        Interrupted,

        #[error("operation was cancelled")]
        Cancelled,

        #[error("result already set")]
        InvalidState,

        #[error("no event loop in thread {0:?}")]
        NoEventLoop(String),

        #[error("signal number {0} out of range")]
        InvalidSignal(i32),

        #[error("signal {0} cannot be caught")]
        UncatchableSignal(i32),

        #[error("signal {0} not supported")]
        UnsupportedSignal(i32),

        #[error("application is already set")]
        ApplicationAlreadySet,

        #[error("cannot change the application of a running loop")]
        ApplicationWhileRunning,

        #[error("OS error: {0}")]
        Io(#[from] std::io::Error),
    }

    impl Error {
        /// The OS error code carried by an I/O failure, if any.
        pub fn os_code(&self) -> Option<i32> {
            match self {
                Error::Io(err) => err.raw_os_error(),
                _ => None,
            }
        }

        /// Usage errors are rejected synchronously at the call site.
        pub fn is_usage_error(&self) -> bool {
            matches!(
                self,
                Error::AlreadyRunning
                    | Error::InvalidSignal(_)
                    | Error::UncatchableSignal(_)
                    | Error::ApplicationAlreadySet
                    | Error::ApplicationWhileRunning
                    | Error::InvalidState
            )
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}
