//! The main context: source bookkeeping, ownership and iteration.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Instant;

use mio::unix::pipe;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use once_cell::sync::Lazy;

use super::source::{SourceFn, SourceKind};
use super::{ControlFlow, IoCondition, Priority, Source, SourceEvent, SourceId};
use crate::config;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

static DEFAULT_CONTEXT: Lazy<MainContext> =
    Lazy::new(|| MainContext::new().expect("failed to create the default main context"));

/// A set of sources to be dispatched by whichever thread owns the context.
///
/// Cloning is cheap; every clone refers to the same context.
#[derive(Clone)]
pub struct MainContext {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    state: Mutex<State>,
    released: Condvar,
    wake_tx: pipe::Sender,
    wake_rx: pipe::Receiver,
}

#[derive(Default)]
struct State {
    owner: Option<ThreadId>,
    depth: usize,
    next_source: u64,
    sources: BTreeMap<SourceId, Slot>,
    signals: HashMap<i32, SignalPipe>,
    reap_requested: bool,
}

struct Slot {
    kind: SourceKind,
    priority: Priority,
    callback: Option<SourceFn>,
    pending: Option<SourceEvent>,
    dispatching: bool,
}

/// One signal-hook registration shared by every source of a signal.
struct SignalPipe {
    id: signal_hook::SigId,
    receiver: pipe::Receiver,
    users: usize,
}

enum PollTag {
    Wake,
    Signal(i32),
    Source(SourceId),
}

#[derive(Default)]
struct PollSet {
    fds: Vec<(RawFd, PollFlags)>,
    revents: Vec<libc::c_short>,
    tags: Vec<PollTag>,
    timeout_ms: libc::c_int,
}

impl PollSet {
    fn push(&mut self, fd: RawFd, events: libc::c_short, tag: PollTag) {
        self.fds.push((fd, PollFlags::from_bits_truncate(events)));
        self.revents.push(0);
        self.tags.push(tag);
    }
}

/// Holds ownership of a context; released on drop.
pub(crate) struct Acquired<'a> {
    context: &'a MainContext,
}

impl Drop for Acquired<'_> {
    fn drop(&mut self) {
        self.context.release();
    }
}

/// Destroys a source whose callback unwinds.
struct DispatchGuard<'a> {
    context: &'a MainContext,
    id: SourceId,
    armed: bool,
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.context.destroy(self.id);
        }
    }
}

impl MainContext {
    /// Create a new, independent context.
    pub fn new() -> io::Result<Self> {
        let (wake_tx, wake_rx) = pipe::new()?;
        Ok(Self {
            inner: Arc::new(Inner {
                id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(State::default()),
                released: Condvar::new(),
                wake_tx,
                wake_rx,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether this is the process-wide default context.
    pub fn is_default(&self) -> bool {
        Arc::ptr_eq(&self.inner, &DEFAULT_CONTEXT.inner)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Try to become the owner of the context without blocking.
    ///
    /// Succeeds when the context is free or already owned by the calling
    /// thread; every successful call must be paired with [`release`].
    ///
    /// [`release`]: MainContext::release
    pub fn acquire(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.lock();
        match state.owner {
            None => {
                state.owner = Some(me);
                state.depth = 1;
                true
            }
            Some(owner) if owner == me => {
                state.depth += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Block until the calling thread owns the context.
    pub fn wait_acquire(&self) {
        self.wait_acquire_while(|| true);
    }

    /// Block until the calling thread owns the context, giving up as soon as
    /// `keep_waiting` turns false. Returns whether ownership was taken.
    ///
    /// `keep_waiting` is checked under the context lock on every wake-up;
    /// whoever makes it false must call [`notify_waiters`] afterwards.
    ///
    /// [`notify_waiters`]: MainContext::notify_waiters
    pub(crate) fn wait_acquire_while(&self, keep_waiting: impl Fn() -> bool) -> bool {
        let me = thread::current().id();
        let mut state = self.lock();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    return true;
                }
                Some(owner) if owner == me => {
                    state.depth += 1;
                    return true;
                }
                Some(_) if !keep_waiting() => return false,
                Some(_) => {
                    state = self
                        .inner
                        .released
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Give up one level of ownership.
    pub fn release(&self) {
        let me = thread::current().id();
        let mut state = self.lock();
        if state.owner != Some(me) {
            tracing::warn!(context = self.inner.id, "release of a context not owned by this thread");
            return;
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            self.inner.released.notify_all();
        }
    }

    /// Whether the calling thread currently owns the context.
    pub fn is_owner(&self) -> bool {
        self.lock().owner == Some(thread::current().id())
    }

    /// Wake every thread blocked in an acquire so that it re-checks its
    /// wait condition.
    pub(crate) fn notify_waiters(&self) {
        // Taking the lock orders this after any waiter's condition check.
        drop(self.lock());
        self.inner.released.notify_all();
    }

    /// Like [`acquire_guard`](MainContext::acquire_guard) with blocking, but
    /// gives up once `keep_waiting` turns false.
    pub(crate) fn acquire_guard_while(
        &self,
        keep_waiting: impl Fn() -> bool,
    ) -> Option<Acquired<'_>> {
        if self.wait_acquire_while(keep_waiting) {
            Some(Acquired { context: self })
        } else {
            None
        }
    }

    pub(crate) fn acquire_guard(&self, block: bool) -> Option<Acquired<'_>> {
        if self.acquire() {
            return Some(Acquired { context: self });
        }
        if !block {
            return None;
        }
        self.wait_acquire();
        Some(Acquired { context: self })
    }

    /// Interrupt a blocking poll so that the owner re-examines its sources.
    ///
    /// Safe to call from any thread.
    pub fn wakeup(&self) {
        // A full pipe already guarantees a wake-up.
        let _ = nix::unistd::write(self.inner.wake_tx.as_raw_fd(), &[1u8]);
    }

    pub(crate) fn attach_source(&self, source: Source) -> SourceId {
        let Source {
            kind,
            priority,
            callback,
        } = source;
        let mut state = self.lock();
        let id = SourceId(state.next_source);
        state.next_source += 1;
        match kind {
            SourceKind::Signal { signal } => state.subscribe_signal(signal),
            SourceKind::Child { .. } => {
                state.subscribe_signal(libc::SIGCHLD);
                // The child may be gone already.
                state.reap_requested = true;
            }
            _ => {}
        }
        state.sources.insert(
            id,
            Slot {
                kind,
                priority,
                callback,
                pending: None,
                dispatching: false,
            },
        );
        drop(state);
        tracing::trace!(context = self.inner.id, source = id.0, priority, "source attached");
        self.wakeup();
        id
    }

    /// Remove a source. Returns `false` if it was not attached.
    ///
    /// A callback that is running when its source is destroyed finishes, but
    /// is never dispatched again.
    pub fn destroy(&self, id: SourceId) -> bool {
        let removed = self.lock().remove(id);
        match removed {
            Some(slot) => {
                // Dropping the callback may re-enter the context.
                drop(slot);
                self.wakeup();
                true
            }
            None => false,
        }
    }

    /// Arm a [`Source::ready`] source so that it fires on the next
    /// iteration. Safe to call from any thread.
    pub fn set_ready(&self, id: SourceId) -> bool {
        let mut state = self.lock();
        let armed = match state.sources.get_mut(&id) {
            Some(Slot {
                kind: SourceKind::Ready { ready_time },
                ..
            }) => {
                *ready_time = Some(Instant::now());
                true
            }
            _ => false,
        };
        drop(state);
        if armed {
            self.wakeup();
        }
        armed
    }

    pub fn contains(&self, id: SourceId) -> bool {
        self.lock().sources.contains_key(&id)
    }

    pub fn source_count(&self) -> usize {
        self.lock().sources.len()
    }

    /// Run one iteration: poll for events and dispatch the best ready tier.
    ///
    /// With `may_block`, waits for ownership and for at least one source to
    /// become ready. Returns whether anything was dispatched.
    pub fn iteration(&self, may_block: bool) -> bool {
        let _acquired = match self.acquire_guard(may_block) {
            Some(acquired) => acquired,
            None => return false,
        };
        let mut set = self.prepare(may_block);
        Self::poll(&mut set);
        self.check(&set);
        self.dispatch()
    }

    fn prepare(&self, may_block: bool) -> PollSet {
        let now = Instant::now();
        let state = self.lock();
        let mut set = PollSet::default();
        set.push(self.inner.wake_rx.as_raw_fd(), libc::POLLIN, PollTag::Wake);
        for (signal, pipe) in &state.signals {
            set.push(pipe.receiver.as_raw_fd(), libc::POLLIN, PollTag::Signal(*signal));
        }

        let mut ready = state.reap_requested;
        let mut deadline: Option<Instant> = None;
        for (id, slot) in &state.sources {
            if slot.dispatching {
                continue;
            }
            ready |= slot.kind.is_ready(now, slot.pending.is_some());
            if let Some(at) = slot.kind.next_deadline() {
                deadline = Some(deadline.map_or(at, |current| current.min(at)));
            }
            if let SourceKind::Fd { fd, condition } = slot.kind {
                set.push(fd, condition.to_poll_events(), PollTag::Source(*id));
            }
        }

        set.timeout_ms = if ready || !may_block {
            0
        } else {
            match deadline {
                None => -1,
                Some(at) => {
                    // Round up so that a timer never fires early.
                    let nanos = at.saturating_duration_since(now).as_nanos();
                    let millis = (nanos + 999_999) / 1_000_000;
                    millis.min(libc::c_int::MAX as u128) as libc::c_int
                }
            }
        };
        set
    }

    fn poll(set: &mut PollSet) {
        let borrowed: Vec<BorrowedFd<'_>> = set
            .fds
            .iter()
            // SAFETY: poll(2) only inspects the descriptor numbers; one that
            // is not open comes back as POLLNVAL.
            .map(|&(fd, _)| unsafe { BorrowedFd::borrow_raw(fd) })
            .collect();
        let mut fds: Vec<PollFd<'_>> = borrowed
            .iter()
            .zip(&set.fds)
            .map(|(fd, &(_, events))| PollFd::new(fd, events))
            .collect();
        match nix::poll::poll(&mut fds, set.timeout_ms) {
            Ok(_) => {
                for (revents, fd) in set.revents.iter_mut().zip(&fds) {
                    *revents = fd.revents().map_or(0, |flags| flags.bits());
                }
            }
            Err(Errno::EINTR) => {}
            Err(err) => tracing::warn!(error = %err, "poll failed"),
        }
    }

    fn check(&self, set: &PollSet) {
        let mut state = self.lock();
        for (&revents, tag) in set.revents.iter().zip(&set.tags) {
            match *tag {
                PollTag::Wake => {
                    if revents != 0 {
                        drain(self.inner.wake_rx.as_raw_fd());
                    }
                }
                PollTag::Signal(signal) => {
                    if revents == 0 {
                        continue;
                    }
                    // The registration may have gone away while polling.
                    let fd = match state.signals.get(&signal) {
                        Some(pipe) => pipe.receiver.as_raw_fd(),
                        None => continue,
                    };
                    drain(fd);
                    if signal == libc::SIGCHLD {
                        state.reap_requested = true;
                    } else {
                        state.raise_signal(signal);
                    }
                }
                PollTag::Source(id) => {
                    if let Some(slot) = state.sources.get_mut(&id) {
                        if slot.dispatching {
                            continue;
                        }
                        slot.pending = if revents == 0 {
                            None
                        } else {
                            Some(SourceEvent::Fd(IoCondition::from_poll_events(revents)))
                        };
                    }
                }
            }
        }
        if state.reap_requested {
            state.reap_requested = false;
            state.reap_children();
        }
    }

    fn dispatch(&self) -> bool {
        let now = Instant::now();
        let batch: Vec<SourceId> = {
            let state = self.lock();
            let eligible = |slot: &Slot| {
                !slot.dispatching && slot.kind.is_ready(now, slot.pending.is_some())
            };
            let best = state
                .sources
                .values()
                .filter(|slot| eligible(slot))
                .map(|slot| slot.priority)
                .min();
            match best {
                None => return false,
                Some(best) => state
                    .sources
                    .iter()
                    .filter(|(_, slot)| slot.priority == best && eligible(slot))
                    .map(|(id, _)| *id)
                    .collect(),
            }
        };
        for id in batch {
            self.dispatch_one(id, now);
        }
        true
    }

    fn dispatch_one(&self, id: SourceId, now: Instant) {
        let mut state = self.lock();
        let (callback, event) = match state.sources.get_mut(&id) {
            Some(slot) if !slot.dispatching => match slot.take_event(now) {
                Some(event) => (slot.callback.take(), event),
                None => return,
            },
            _ => return,
        };
        let mut callback = match callback {
            Some(callback) => callback,
            None => {
                // Nothing to call: a source without callback just goes away.
                let removed = state.remove(id);
                drop(state);
                drop(removed);
                return;
            }
        };
        if let Some(slot) = state.sources.get_mut(&id) {
            slot.dispatching = true;
        }
        drop(state);

        tracing::trace!(context = self.inner.id, source = id.0, ?event, "dispatch");
        let mut guard = DispatchGuard {
            context: self,
            id,
            armed: true,
        };
        let flow = callback(event);
        guard.armed = false;

        let mut state = self.lock();
        let keep = match state.sources.get_mut(&id) {
            Some(slot) => {
                slot.dispatching = false;
                flow == ControlFlow::Continue && !slot.kind.is_one_shot()
            }
            None => false,
        };
        if keep {
            if let Some(slot) = state.sources.get_mut(&id) {
                slot.callback = Some(callback);
            }
            return;
        }
        let removed = state.remove(id);
        drop(state);
        drop(removed);
        drop(callback);
    }
}

impl State {
    fn subscribe_signal(&mut self, signal: i32) {
        if let Some(pipe) = self.signals.get_mut(&signal) {
            pipe.users += 1;
            return;
        }
        match register_signal_pipe(signal) {
            Ok(pipe) => {
                self.signals.insert(signal, pipe);
            }
            Err(err) => {
                tracing::error!(signal, error = %err, "cannot watch signal");
            }
        }
    }

    fn unsubscribe_signal(&mut self, signal: i32) {
        let last = match self.signals.get_mut(&signal) {
            Some(pipe) => {
                pipe.users -= 1;
                pipe.users == 0
            }
            None => false,
        };
        if last {
            if let Some(pipe) = self.signals.remove(&signal) {
                signal_hook::low_level::unregister(pipe.id);
            }
        }
    }

    fn remove(&mut self, id: SourceId) -> Option<Slot> {
        let slot = self.sources.remove(&id)?;
        match slot.kind {
            SourceKind::Signal { signal } => self.unsubscribe_signal(signal),
            SourceKind::Child { .. } => self.unsubscribe_signal(libc::SIGCHLD),
            _ => {}
        }
        Some(slot)
    }

    fn raise_signal(&mut self, signal: i32) {
        for slot in self.sources.values_mut() {
            if matches!(slot.kind, SourceKind::Signal { signal: s } if s == signal) {
                slot.pending = Some(SourceEvent::Signal(signal));
            }
        }
    }

    fn reap_children(&mut self) {
        for slot in self.sources.values_mut() {
            let (pid, reaped) = match &mut slot.kind {
                SourceKind::Child { pid, reaped } if !*reaped => (*pid, reaped),
                _ => continue,
            };
            match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
                Ok(status) => {
                    if let Some(status) = raw_wait_status(status) {
                        *reaped = true;
                        slot.pending = Some(SourceEvent::ChildExited { pid, status });
                    }
                }
                Err(Errno::EINTR) => {}
                Err(err) => {
                    tracing::warn!(pid, error = %err, "child watch lost its process");
                    *reaped = true;
                }
            }
        }
    }
}

impl Slot {
    fn take_event(&mut self, now: Instant) -> Option<SourceEvent> {
        match &mut self.kind {
            SourceKind::Idle => Some(SourceEvent::Idle),
            SourceKind::Timeout { interval, deadline } => {
                if !matches!(deadline, Some(at) if *at <= now) {
                    return None;
                }
                *deadline = now.checked_add(*interval);
                Some(SourceEvent::Timeout)
            }
            SourceKind::Ready { ready_time } => match *ready_time {
                Some(at) if at <= now => {
                    *ready_time = None;
                    Some(SourceEvent::Ready)
                }
                _ => None,
            },
            SourceKind::Fd { .. } | SourceKind::Signal { .. } | SourceKind::Child { .. } => {
                self.pending.take()
            }
        }
    }
}

impl SourceKind {
    fn is_one_shot(&self) -> bool {
        matches!(self, SourceKind::Child { reaped: true, .. })
    }
}

fn register_signal_pipe(signal: i32) -> io::Result<SignalPipe> {
    let (sender, receiver) = pipe::new()?;
    let id = signal_hook::low_level::pipe::register(signal, sender)?;
    Ok(SignalPipe {
        id,
        receiver,
        users: 1,
    })
}

fn drain(fd: RawFd) {
    let mut buf = [0u8; config::PIPE_DRAIN_BUFFER];
    while matches!(nix::unistd::read(fd, &mut buf), Ok(n) if n > 0) {}
}

/// Re-encode a terminal wait status the way `waitpid(2)` reports it.
fn raw_wait_status(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some((code & 0xff) << 8),
        WaitStatus::Signaled(_, signal, core_dumped) => {
            Some(signal as i32 | if core_dumped { 0x80 } else { 0 })
        }
        _ => None,
    }
}

impl Default for MainContext {
    /// The process-wide default context.
    fn default() -> Self {
        DEFAULT_CONTEXT.clone()
    }
}

impl fmt::Debug for MainContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainContext")
            .field("id", &self.inner.id)
            .field("sources", &self.source_count())
            .finish()
    }
}
