//! Child process exit watching
//!
//! A watch is a one-shot child source: the context reaps the pid with
//! `waitpid` when SIGCHLD arrives and hands over the raw wait status, which
//! is decoded into a single return code:
//!
//! - terminated by a signal: the negated signal number
//! - exited: the exit code, except that codes above
//!   [`EXIT_STATUS_CORRECTION_THRESHOLD`] are folded back to
//!   `THRESHOLD - code`
//!
//! The folding compensates for native wait primitives that report an exit
//! status already shifted by the shell convention. Whether it is still
//! needed depends on the platform, so it can be switched off.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::{EXIT_STATUS_CORRECTION_THRESHOLD, SIGNAL_PRIORITY};
use crate::error::Result;
use crate::event_loop::EventLoop;
use crate::handle::{Handle, RegistryKey};
use crate::native::{ControlFlow, MainContext, Source, SourceEvent, SourceId};

/// Decode a raw `waitpid` status into a return code.
pub fn decode_wait_status(status: i32, correct_exit_status: bool) -> i32 {
    if libc::WIFSIGNALED(status) {
        return -libc::WTERMSIG(status);
    }
    if libc::WIFEXITED(status) {
        let code = libc::WEXITSTATUS(status);
        if correct_exit_status && code > EXIT_STATUS_CORRECTION_THRESHOLD {
            return EXIT_STATUS_CORRECTION_THRESHOLD - code;
        }
        return code;
    }
    status
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type ChildCallback = Box<dyn FnOnce(i32, i32) + Send + 'static>;

struct Watch {
    generation: u64,
    source: SourceId,
    context: MainContext,
    callback: ChildCallback,
}

struct WatcherInner {
    context: Mutex<MainContext>,
    watches: Mutex<HashMap<i32, Watch>>,
    next_generation: AtomicU64,
    correct_exit_status: AtomicBool,
}

/// Watches child processes on behalf of any loop.
///
/// Thread-safe: callbacks run on whichever thread iterates the context the
/// watch was added on.
#[derive(Clone)]
pub struct ChildWatcher {
    inner: Arc<WatcherInner>,
}

impl ChildWatcher {
    /// A watcher adding its watches to `context`.
    pub fn new(context: &MainContext) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                context: Mutex::new(context.clone()),
                watches: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                correct_exit_status: AtomicBool::new(true),
            }),
        }
    }

    /// Add future watches to the context of `event_loop`.
    pub fn attach_loop(&self, event_loop: &EventLoop) {
        *lock(&self.inner.context) = event_loop.context().clone();
    }

    pub fn context(&self) -> MainContext {
        lock(&self.inner.context).clone()
    }

    pub fn set_exit_status_correction(&self, enabled: bool) {
        self.inner
            .correct_exit_status
            .store(enabled, Ordering::SeqCst);
    }

    /// Call `callback(pid, returncode)` once `pid` exits, replacing any
    /// existing watch for `pid`.
    pub fn add_child_handler<F>(&self, pid: i32, callback: F)
    where
        F: FnOnce(i32, i32) + Send + 'static,
    {
        self.remove_child_handler(pid);
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let context = self.context();
        let weak = Arc::downgrade(&self.inner);
        let mut source = Source::child_watch(pid).with_priority(SIGNAL_PRIORITY);
        source.set_callback(move |event| {
            if let (Some(inner), SourceEvent::ChildExited { pid, status }) = (weak.upgrade(), event)
            {
                inner.deliver(pid, generation, status);
            }
            ControlFlow::Break
        });

        // Held across attach so an immediate exit finds its entry.
        let mut watches = lock(&self.inner.watches);
        let id = source.attach(&context);
        watches.insert(
            pid,
            Watch {
                generation,
                source: id,
                context,
                callback: Box::new(callback),
            },
        );
        tracing::debug!(pid, "child watch added");
    }

    /// Returns whether a watch for `pid` existed.
    pub fn remove_child_handler(&self, pid: i32) -> bool {
        let removed = lock(&self.inner.watches).remove(&pid);
        match removed {
            Some(watch) => {
                watch.context.destroy(watch.source);
                true
            }
            None => false,
        }
    }

    pub fn is_watching(&self, pid: i32) -> bool {
        lock(&self.inner.watches).contains_key(&pid)
    }

    /// Drop every watch.
    pub fn close(&self) {
        let watches: Vec<Watch> = lock(&self.inner.watches).drain().map(|(_, w)| w).collect();
        for watch in watches {
            watch.context.destroy(watch.source);
        }
    }
}

impl WatcherInner {
    fn deliver(&self, pid: i32, generation: u64, status: i32) {
        let watch = {
            let mut watches = lock(&self.watches);
            match watches.get(&pid) {
                Some(watch) if watch.generation == generation => watches.remove(&pid),
                _ => None,
            }
        };
        if let Some(watch) = watch {
            let code = decode_wait_status(status, self.correct_exit_status.load(Ordering::SeqCst));
            tracing::debug!(pid, code, "child exited");
            (watch.callback)(pid, code);
        }
    }
}

impl std::fmt::Debug for ChildWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildWatcher")
            .field("watches", &lock(&self.inner.watches).len())
            .finish()
    }
}

impl EventLoop {
    /// Call `callback(pid, returncode)` on this loop's thread once `pid`
    /// exits, replacing any existing watch for `pid`.
    pub fn add_child_handler<F>(&self, pid: i32, callback: F) -> Result<Handle>
    where
        F: FnOnce(i32, i32) + 'static,
    {
        self.check_closed()?;
        self.remove_child_handler(pid);
        let owner = self.downgrade();
        let mut callback = Some(callback);
        let source = Source::child_watch(pid).with_priority(SIGNAL_PRIORITY);
        let handle = Handle::schedule(
            self,
            source,
            false,
            RegistryKey::Child(pid),
            move |handle, event| {
                let status = match event {
                    SourceEvent::ChildExited { status, .. } => status,
                    _ => return,
                };
                let event_loop = match owner.upgrade() {
                    Some(event_loop) => event_loop,
                    None => return,
                };
                // Out of the registry before the callback can re-watch pid.
                event_loop.forget_child(pid, handle);
                let code = decode_wait_status(status, event_loop.inner.correct_exit_status.get());
                if let Some(callback) = callback.take() {
                    callback(pid, code);
                }
            },
        );
        self.inner.children.borrow_mut().insert(pid, handle.clone());
        Ok(handle)
    }

    /// Returns whether a watch for `pid` existed.
    pub fn remove_child_handler(&self, pid: i32) -> bool {
        let removed = self.inner.children.borrow_mut().remove(&pid);
        removed.map(|handle| handle.cancel()).is_some()
    }

    fn forget_child(&self, pid: i32, handle: &Handle) {
        let mut children = self.inner.children.borrow_mut();
        if matches!(children.get(&pid), Some(current) if current.same(handle)) {
            children.remove(&pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::process::Command;
    use std::sync::mpsc;
    use std::time::Duration;

    fn exited(code: i32) -> i32 {
        (code & 0xff) << 8
    }

    #[test]
    fn test_decode_exit_and_signal() {
        assert_eq!(decode_wait_status(exited(0), true), 0);
        assert_eq!(decode_wait_status(exited(3), true), 3);
        assert_eq!(decode_wait_status(exited(128), true), 128);
        assert_eq!(decode_wait_status(exited(130), true), -2);
        assert_eq!(decode_wait_status(exited(130), false), 130);
        assert_eq!(decode_wait_status(libc::SIGKILL, true), -libc::SIGKILL);
        assert_eq!(decode_wait_status(libc::SIGTERM, false), -libc::SIGTERM);
    }

    proptest! {
        #[test]
        fn prop_signaled_status_is_negative(signal in 1i32..32) {
            prop_assume!(signal != libc::SIGSTOP);
            prop_assert_eq!(decode_wait_status(signal, true), -signal);
        }

        #[test]
        fn prop_exit_codes_up_to_threshold_unchanged(code in 0i32..=128) {
            prop_assert_eq!(decode_wait_status(exited(code), true), code);
        }

        #[test]
        fn prop_correction_is_never_positive(code in 129i32..256) {
            prop_assert!(decode_wait_status(exited(code), true) < 0);
            prop_assert_eq!(decode_wait_status(exited(code), false), code);
        }
    }

    #[test]
    fn test_watcher_delivers_once() {
        let context = MainContext::new().unwrap();
        let watcher = ChildWatcher::new(&context);
        let child = Command::new("sh").args(["-c", "exit 5"]).spawn().unwrap();
        let pid = child.id() as i32;
        let (tx, rx) = mpsc::channel();
        watcher.add_child_handler(pid, move |pid, code| {
            tx.send((pid, code)).unwrap();
        });
        assert!(watcher.is_watching(pid));

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let delivered = loop {
            context.iteration(false);
            if let Ok(delivered) = rx.try_recv() {
                break delivered;
            }
            assert!(std::time::Instant::now() < deadline, "child never reported");
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(delivered, (pid, 5));
        assert!(!watcher.is_watching(pid));
        assert_eq!(context.source_count(), 0);
    }

    #[test]
    fn test_watcher_remove_and_close() {
        let context = MainContext::new().unwrap();
        let watcher = ChildWatcher::new(&context);
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        let pid = child.id() as i32;
        watcher.add_child_handler(pid, |_, _| panic!("removed watch fired"));
        assert!(watcher.remove_child_handler(pid));
        assert!(!watcher.remove_child_handler(pid));

        watcher.add_child_handler(pid, |_, _| {});
        watcher.close();
        assert!(!watcher.is_watching(pid));
        assert_eq!(context.source_count(), 0);
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_loop_child_handler() {
        let event_loop = EventLoop::new().unwrap();
        let child = Command::new("sh").args(["-c", "kill -TERM $$"]).spawn().unwrap();
        let pid = child.id() as i32;
        let result = std::rc::Rc::new(std::cell::Cell::new(None));
        let slot = result.clone();
        let stopper = event_loop.clone();
        event_loop
            .add_child_handler(pid, move |pid, code| {
                assert!(!stopper.remove_child_handler(pid));
                slot.set(Some(code));
                stopper.stop();
            })
            .unwrap();
        event_loop.run_forever().unwrap();
        assert_eq!(result.get(), Some(-libc::SIGTERM));
        assert_eq!(event_loop.live_handles(), 0);
    }
}
