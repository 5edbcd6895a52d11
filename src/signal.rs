//! Unix signal handlers
//!
//! Handlers are ordinary repeating handles on a unix signal source; at most
//! one handler exists per signal and loop. Delivery goes through
//! signal-hook pipes owned by the main context, so handlers run on the loop
//! thread like any other callback.
//!
//! Independently of user handlers, the loop bound to the default context
//! gets SIGINT handling: the signal stops the loop and
//! [`EventLoop::run_forever`] reports [`Error::Interrupted`]. Installing a
//! SIGINT handler of your own replaces that behavior.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use once_cell::sync::Lazy;

use crate::config::{NSIG, SIGNAL_PRIORITY, UNCATCHABLE_SIGNALS};
use crate::error::{Error, Result};
use crate::event_loop::EventLoop;
use crate::handle::{Handle, RegistryKey};
use crate::native::{ControlFlow, MainContext, Source, SourceId};
use crate::run::RunControl;

static DEFAULT_INTERRUPT: Lazy<DefaultInterrupt> = Lazy::new(|| DefaultInterrupt {
    attached: Mutex::new(None),
    source: Mutex::new(None),
});

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn check_signal(signal: i32) -> Result<()> {
    if !(1..NSIG).contains(&signal) {
        return Err(Error::InvalidSignal(signal));
    }
    Ok(())
}

impl EventLoop {
    /// Call `callback` each time `signal` is delivered, replacing any
    /// handler this loop already has for it.
    pub fn add_signal_handler<F>(&self, signal: i32, mut callback: F) -> Result<Handle>
    where
        F: FnMut() + 'static,
    {
        self.check_closed()?;
        check_signal(signal)?;
        self.remove_signal_handler(signal)?;
        let source = match Source::unix_signal(signal) {
            Some(source) => source.with_priority(SIGNAL_PRIORITY),
            None if UNCATCHABLE_SIGNALS.contains(&signal) => {
                return Err(Error::UncatchableSignal(signal))
            }
            None => return Err(Error::UnsupportedSignal(signal)),
        };

        let handle = Handle::schedule(
            self,
            source,
            true,
            RegistryKey::Signal(signal),
            move |_, _| callback(),
        );
        self.inner.signals.borrow_mut().insert(signal, handle.clone());
        if signal == libc::SIGINT {
            self.inner.control.set_user_interrupt_handler(true);
        }
        tracing::debug!(signal, "signal handler added");
        Ok(handle)
    }

    /// Remove the handler for `signal`. Returns whether one was installed.
    pub fn remove_signal_handler(&self, signal: i32) -> Result<bool> {
        check_signal(signal)?;
        let removed = self.inner.signals.borrow_mut().remove(&signal);
        match removed {
            Some(handle) => {
                handle.cancel();
                if signal == libc::SIGINT {
                    self.inner.control.set_user_interrupt_handler(false);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn has_signal_handler(&self, signal: i32) -> bool {
        self.inner.signals.borrow().contains_key(&signal)
    }
}

/// The process-wide SIGINT source on the default context.
struct DefaultInterrupt {
    attached: Mutex<Option<Weak<RunControl>>>,
    source: Mutex<Option<SourceId>>,
}

impl DefaultInterrupt {
    fn install(&self) {
        let mut installed = lock(&self.source);
        if installed.is_some() {
            return;
        }
        let mut source = match Source::unix_signal(libc::SIGINT) {
            Some(source) => source.with_priority(SIGNAL_PRIORITY),
            None => return,
        };
        source.set_callback(|_| {
            DEFAULT_INTERRUPT.fire();
            ControlFlow::Continue
        });
        *installed = Some(source.attach(&MainContext::default()));
    }

    fn fire(&self) {
        let control = lock(&self.attached).as_ref().and_then(Weak::upgrade);
        match control {
            Some(control) => control.interrupt(),
            None => {
                // Nobody to stop: behave as if no handler were installed.
                tracing::info!("SIGINT with no event loop attached");
                if let Err(err) = signal_hook::low_level::emulate_default_handler(libc::SIGINT) {
                    tracing::warn!(error = %err, "cannot restore default SIGINT action");
                }
            }
        }
    }
}

/// Make `control` the target of the default SIGINT handling.
pub(crate) fn attach_default_interrupt(control: &Arc<RunControl>) {
    let handler = &*DEFAULT_INTERRUPT;
    {
        let mut attached = lock(&handler.attached);
        let previous = attached.as_ref().and_then(Weak::upgrade);
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, control) {
                tracing::warn!(
                    "more than one event loop on the default context; SIGINT stops the newest"
                );
            }
        }
        *attached = Some(Arc::downgrade(control));
    }
    handler.install();
}

pub(crate) fn detach_default_interrupt(control: &Arc<RunControl>) {
    let mut attached = lock(&DEFAULT_INTERRUPT.attached);
    let current = attached.as_ref().and_then(Weak::upgrade);
    if matches!(current, Some(current) if Arc::ptr_eq(&current, control)) {
        *attached = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::Duration;

    #[test]
    fn test_signal_number_validation() {
        let event_loop = EventLoop::new().unwrap();
        assert!(matches!(
            event_loop.add_signal_handler(0, || {}),
            Err(Error::InvalidSignal(0))
        ));
        assert!(matches!(
            event_loop.add_signal_handler(NSIG, || {}),
            Err(Error::InvalidSignal(_))
        ));
        assert!(matches!(
            event_loop.remove_signal_handler(-1),
            Err(Error::InvalidSignal(-1))
        ));
        assert!(matches!(
            event_loop.add_signal_handler(libc::SIGKILL, || {}),
            Err(Error::UncatchableSignal(_))
        ));
        assert!(matches!(
            event_loop.add_signal_handler(libc::SIGILL, || {}),
            Err(Error::UnsupportedSignal(_))
        ));
        assert!(event_loop
            .add_signal_handler(libc::SIGKILL, || {})
            .unwrap_err()
            .is_usage_error());
        assert!(!event_loop.has_signal_handler(libc::SIGKILL));
    }

    #[test]
    fn test_handler_replaced() {
        let event_loop = EventLoop::new().unwrap();
        let first = event_loop.add_signal_handler(libc::SIGWINCH, || {}).unwrap();
        let second = event_loop.add_signal_handler(libc::SIGWINCH, || {}).unwrap();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(event_loop.live_handles(), 1);
        assert!(event_loop.remove_signal_handler(libc::SIGWINCH).unwrap());
        assert!(!event_loop.remove_signal_handler(libc::SIGWINCH).unwrap());
    }

    #[test]
    fn test_handler_runs_on_delivery() {
        let event_loop = EventLoop::new().unwrap();
        let count = Rc::new(Cell::new(0));
        let counter = count.clone();
        let stopper = event_loop.clone();
        event_loop
            .add_signal_handler(libc::SIGUSR2, move || {
                counter.set(counter.get() + 1);
                stopper.stop();
            })
            .unwrap();
        event_loop.call_later(Duration::from_millis(10), || {
            nix::sys::signal::raise(nix::sys::signal::Signal::SIGUSR2).unwrap();
        });
        event_loop.run_forever().unwrap();
        assert_eq!(count.get(), 1);
        assert!(event_loop.remove_signal_handler(libc::SIGUSR2).unwrap());
    }

    #[test]
    fn test_user_sigint_handler_flag() {
        let event_loop = EventLoop::new().unwrap();
        event_loop.add_signal_handler(libc::SIGINT, || {}).unwrap();
        event_loop.inner.control.interrupt();
        assert!(!event_loop.inner.control.take_interrupted());
        assert!(event_loop.remove_signal_handler(libc::SIGINT).unwrap());
        event_loop.inner.control.interrupt();
        assert!(event_loop.inner.control.take_interrupted());
    }
}
