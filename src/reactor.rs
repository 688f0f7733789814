//! The reactor: a single-thread-owned event loop over one poll backend plus
//! a timer list.
//!
//! All reactor state lives behind one mutex. The loop releases that mutex
//! only around the blocking wait syscall; everything the wait needs is
//! captured in an immutable per-pass `WaitSet` snapshot beforehand. Ready
//! events are resolved back through the registry one at a time, so a handler
//! that detaches a descriptor appearing later in the same batch causes the
//! later event to be skipped rather than delivered stale.
//!
//! Handlers run on the loop thread with the reactor mutex released, which is
//! what lets them attach, detach and arm timers re-entrantly. Foreign
//! threads get the same serialization by holding a [`ReactorGuard`].

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::backend::{Backend, Method, WaitSet};
use crate::error::{Error, Result};
use crate::ready::Ready;
use crate::registry::{Handler, Record, Registry};
use crate::timer::{tick_ms, TimerHandle, TimerList};

/// Advisory ceiling for one handler invocation; exceeding it logs a warning
/// in debug builds.
const MAX_BLOCKING: Duration = Duration::from_millis(500);

static CAUGHT_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn catch_signal(sig: libc::c_int) {
    CAUGHT_SIGNAL.store(sig, Ordering::SeqCst);
    // re-arm; delivery happens from the loop
    unsafe {
        libc::signal(
            sig,
            catch_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    }
}

fn install_signal_handlers() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| unsafe {
        libc::signal(
            libc::SIGINT,
            catch_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGTERM,
            catch_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    });
}

fn process_fd_limit() -> usize {
    let mut rl = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) } == 0 {
        rl.rlim_cur as usize
    } else {
        1024
    }
}

fn lock(m: &Mutex<Core>) -> MutexGuard<'_, Core> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn warn_blocking(started: Instant, what: &str) {
    if cfg!(debug_assertions) {
        let elapsed = started.elapsed();
        if elapsed > MAX_BLOCKING {
            log::warn!("{} handler blocked the loop for {:?}", what, elapsed);
        }
    }
}

fn benign_wait_error(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::Interrupted {
        return true;
    }
    // spurious EBADF out of kqueue right after a descriptor close
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    if e.raw_os_error() == Some(libc::EBADF) {
        return true;
    }
    false
}

struct Core {
    registry: Registry,
    timers: TimerList,
    backend: Option<Backend>,
    /// Desired method; the backend is created from it lazily and survives a
    /// `set_max_fds(0)` teardown.
    method: Method,
    max_fds: usize,
    /// Topology changed mid-dispatch; the pass returns after the current
    /// event and the loop restarts with a fresh snapshot.
    update: bool,
    dispatching: bool,
    pending_delete: Vec<Record>,
    entered: Option<ThreadId>,
    reuse_saved: bool,
    owner: ThreadId,
}

impl Core {
    fn ensure_backend(&mut self) -> Result<&mut Backend> {
        if self.backend.is_none() {
            self.backend = Some(Backend::new(self.method)?);
        }
        match self.backend.as_mut() {
            Some(b) => Ok(b),
            None => Err(Error::NotSupported),
        }
    }

    fn make_waitset(&mut self) -> Result<WaitSet> {
        self.ensure_backend()?;
        match self.backend.as_ref() {
            Some(b) => Ok(b.snapshot(&self.registry)),
            None => Err(Error::NotSupported),
        }
    }

    fn attach(&mut self, fd: RawFd, flags: Ready, handler: Option<Handler>) -> Result<()> {
        if fd < 0 {
            return Err(Error::BadDescriptor);
        }
        if flags.is_empty() {
            return self.detach(fd);
        }
        let handler = match handler {
            Some(h) => h,
            None => return Err(Error::BadArgument),
        };

        let attached = self
            .registry
            .get(fd)
            .map(|r| !r.flags.is_empty())
            .unwrap_or(false);
        let prev_slot = self.registry.get(fd).and_then(|r| r.slot);

        self.ensure_backend()?;
        if !attached {
            let cap = self
                .backend
                .as_ref()
                .and_then(|b| b.capacity())
                .map_or(self.max_fds, |c| c.min(self.max_fds));
            if self.registry.active_count() >= cap {
                return Err(Error::TooManyDescriptors);
            }
        }

        let res = match self.backend.as_mut() {
            Some(b) => b.attach(fd, flags, prev_slot, attached),
            None => return Err(Error::NotSupported),
        };

        match res {
            Ok(slot) => {
                self.registry.upsert(fd, flags, handler, slot);
                self.update = true;
                Ok(())
            }
            Err(e) => {
                // leave no trace of the failed attach
                let _ = self.detach(fd);
                Err(Error::from_attach(e))
            }
        }
    }

    fn detach(&mut self, fd: RawFd) -> Result<()> {
        if fd < 0 {
            return Err(Error::BadDescriptor);
        }
        let slot = match self.registry.get(fd) {
            Some(r) if !r.flags.is_empty() => r.slot,
            _ => return Ok(()),
        };
        if let Some(backend) = self.backend.as_mut() {
            backend.detach(fd, slot);
        }
        if let Some(record) = self.registry.clear(fd) {
            if self.dispatching {
                self.pending_delete.push(record);
            }
        }
        self.update = true;
        Ok(())
    }

    fn switch_method(&mut self, method: Method) -> Result<()> {
        if self.backend.as_ref().map(|b| b.method()) == Some(method) {
            self.method = method;
            return Ok(());
        }

        let mut next = Backend::new(method)?;
        if let Some(cap) = next.capacity() {
            if self.registry.active_count() > cap.min(self.max_fds) {
                return Err(Error::TooManyDescriptors);
            }
        }

        // stage every live record in the new backend before committing, so
        // a failure leaves the old backend fully in place
        let mut moves = Vec::with_capacity(self.registry.active_count());
        for (fd, record) in self.registry.iter_active() {
            let slot = next
                .attach(fd, record.flags, None, false)
                .map_err(Error::from_attach)?;
            moves.push((fd, slot));
        }
        for (fd, slot) in moves {
            if let Some(record) = self.registry.get_mut(fd) {
                record.slot = slot;
            }
        }

        self.backend = Some(next);
        self.method = method;
        self.update = true;
        log::debug!("switched backend to {}", method.name());
        Ok(())
    }

    fn resize(&mut self, n: Option<usize>) -> Result<()> {
        match n {
            Some(0) => {
                // teardown: every descriptor goes, then the backend itself
                let fds: Vec<RawFd> = self.registry.iter_active().map(|(fd, _)| fd).collect();
                for fd in fds {
                    let _ = self.detach(fd);
                }
                self.registry.compact();
                self.backend = None;
            }
            Some(limit) => self.max_fds = limit,
            None => self.max_fds = process_fd_limit(),
        }
        Ok(())
    }

    fn set_timer(&mut self, delay: Duration, f: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let deadline = tick_ms() + delay.as_millis() as u64;
        self.timers.insert(deadline, f)
    }
}

struct Shared {
    core: Mutex<Core>,
    polling: AtomicBool,
    external: OnceLock<Arc<Mutex<()>>>,
}

/// Handle to one event loop.
///
/// The handle is cheap to clone and may be moved across threads; the loop
/// itself runs on whichever thread called [`Reactor::run`], and every
/// handler executes there. A thread other than the runner must bracket
/// mutations in [`Reactor::enter`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use muxio::Reactor;
///
/// let reactor = Reactor::new().unwrap();
/// let r = reactor.clone();
/// reactor.set_timer(Duration::from_millis(1), move || r.cancel());
/// reactor.run().unwrap();
/// ```
pub struct Reactor {
    shared: Arc<Shared>,
}

impl Clone for Reactor {
    fn clone(&self) -> Reactor {
        Reactor {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Reactor {
    /// Creates a reactor using the best backend available on this platform.
    pub fn new() -> Result<Reactor> {
        Reactor::with_method(Method::best())
    }

    pub fn with_method(method: Method) -> Result<Reactor> {
        let core = Core {
            registry: Registry::new(),
            timers: TimerList::new(),
            backend: None,
            method,
            max_fds: process_fd_limit(),
            update: false,
            dispatching: false,
            pending_delete: Vec::new(),
            entered: None,
            reuse_saved: true,
            owner: thread::current().id(),
        };
        Ok(Reactor {
            shared: Arc::new(Shared {
                core: Mutex::new(core),
                polling: AtomicBool::new(false),
                external: OnceLock::new(),
            }),
        })
    }

    /// Registers `fd` for the events in `flags`.
    ///
    /// Attaching is idempotent in `fd`: a second call updates the interest
    /// and handler of the existing record. An empty `flags` set detaches.
    pub fn attach_fd<F>(&self, fd: RawFd, flags: Ready, handler: F) -> Result<()>
    where
        F: FnMut(Ready) + Send + 'static,
    {
        debug_assert!(
            self.check().is_ok(),
            "descriptor mutation from a thread that neither owns nor entered the reactor"
        );
        let _ext = self.external_guard();
        let mut core = lock(&self.shared.core);
        core.attach(fd, flags, Some(Arc::new(Mutex::new(handler))))
    }

    /// Stops watching `fd` and forgets its handler.
    pub fn detach_fd(&self, fd: RawFd) -> Result<()> {
        debug_assert!(
            self.check().is_ok(),
            "descriptor mutation from a thread that neither owns nor entered the reactor"
        );
        let _ext = self.external_guard();
        let mut core = lock(&self.shared.core);
        core.detach(fd)
    }

    /// Current interest of a live record, if any.
    pub fn lookup(&self, fd: RawFd) -> Option<Ready> {
        let core = lock(&self.shared.core);
        core.registry
            .get(fd)
            .map(|r| r.flags)
            .filter(|f| !f.is_empty())
    }

    /// Number of attached descriptors.
    pub fn active_count(&self) -> usize {
        lock(&self.shared.core).registry.active_count()
    }

    pub fn method(&self) -> Method {
        lock(&self.shared.core).method
    }

    /// Switches to another backend, migrating every live record.
    ///
    /// Valid at any time; an in-flight dispatch pass returns after its
    /// current event and the loop restarts on the new backend.
    pub fn set_method(&self, method: Method) -> Result<()> {
        let _ext = self.external_guard();
        let mut core = lock(&self.shared.core);
        core.switch_method(method)
    }

    /// Adjusts the descriptor limit.
    ///
    /// `None` re-reads the process fd limit; `Some(0)` detaches everything
    /// and tears the backend down.
    pub fn set_max_fds(&self, n: Option<usize>) -> Result<()> {
        let _ext = self.external_guard();
        let mut core = lock(&self.shared.core);
        core.resize(n)
    }

    /// Controls whether detached records keep their storage for the next
    /// attach of the same fd number.
    pub fn set_reuse(&self, reuse: bool) {
        let mut core = lock(&self.shared.core);
        core.registry.set_reuse(reuse);
        core.reuse_saved = reuse;
    }

    /// Arms a one-shot timer.
    pub fn set_timer<F>(&self, delay: Duration, f: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let _ext = self.external_guard();
        let mut core = lock(&self.shared.core);
        core.set_timer(delay, Box::new(f))
    }

    /// Cancels a pending timer. Returns false if it already fired or was
    /// canceled before.
    pub fn cancel_timer(&self, handle: TimerHandle) -> bool {
        let _ext = self.external_guard();
        lock(&self.shared.core).timers.cancel(handle)
    }

    /// Runs the event loop until [`Reactor::cancel`] is called.
    pub fn run(&self) -> Result<()> {
        self.run_inner(None)
    }

    /// Runs the event loop, delivering caught SIGINT/SIGTERM to `handler`.
    ///
    /// Signals are recorded by an async handler and delivered from the loop
    /// between dispatch passes, never from inside an event handler.
    pub fn run_with_signals<F>(&self, handler: F) -> Result<()>
    where
        F: FnMut(i32) + 'static,
    {
        self.run_inner(Some(Box::new(handler)))
    }

    fn run_inner(&self, mut signal_cb: Option<Box<dyn FnMut(i32)>>) -> Result<()> {
        if self.shared.polling.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyPolling);
        }
        if signal_cb.is_some() {
            install_signal_handlers();
        }
        lock(&self.shared.core).owner = thread::current().id();

        let res = self.poll_loop(&mut signal_cb);
        self.shared.polling.store(false, Ordering::SeqCst);
        res
    }

    /// Requests a graceful exit; the loop stops at the top of its next
    /// iteration. Cooperative: a loop parked in an indefinite wait leaves
    /// only once an event or timer wakes it.
    pub fn cancel(&self) {
        self.shared.polling.store(false, Ordering::SeqCst);
    }

    pub fn is_polling(&self) -> bool {
        self.shared.polling.load(Ordering::SeqCst)
    }

    /// Installs an external serialization lock shared with other libraries.
    ///
    /// One-shot: a second call fails with `AlreadyBound`. Once installed,
    /// the loop acquires it for every section that holds reactor state and
    /// releases it around the wait syscall, and [`Reactor::enter`] holds it
    /// for the guard's lifetime.
    pub fn set_lock(&self, external: Arc<Mutex<()>>) -> Result<()> {
        self.shared
            .external
            .set(external)
            .map_err(|_| Error::AlreadyBound)
    }

    /// Returns OK iff the calling thread owns the reactor or currently
    /// holds a [`ReactorGuard`].
    pub fn check(&self) -> Result<()> {
        let id = thread::current().id();
        let core = lock(&self.shared.core);
        if core.owner == id || core.entered == Some(id) {
            Ok(())
        } else {
            Err(Error::Permission)
        }
    }

    /// Serializes a foreign thread against the loop.
    ///
    /// The guard holds the reactor's lock (and the external lock, when one
    /// is installed) and exposes the mutating operations directly. Record
    /// reuse is disabled while the guard is held, since fd-number reuse is
    /// only deterministic within one thread.
    pub fn enter(&self) -> ReactorGuard<'_> {
        let ext = self.external_guard();
        let mut core = lock(&self.shared.core);
        core.entered = Some(thread::current().id());
        core.reuse_saved = core.registry.reuse();
        core.registry.set_reuse(false);
        ReactorGuard { core, _ext: ext }
    }

    pub(crate) fn same(&self, other: &Reactor) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn external_guard(&self) -> Option<MutexGuard<'_, ()>> {
        self.shared
            .external
            .get()
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn poll_loop(&self, signal_cb: &mut Option<Box<dyn FnMut(i32)>>) -> Result<()> {
        while self.shared.polling.load(Ordering::SeqCst) {
            // the captured signal stays sticky until a loop with a callback
            // picks it up; delivery is serialized with dispatch
            if let Some(cb) = signal_cb.as_mut() {
                let sig = CAUGHT_SIGNAL.swap(0, Ordering::SeqCst);
                if sig != 0 {
                    cb(sig);
                    continue;
                }
            }

            let (waitset, timeout) = {
                let _ext = self.external_guard();
                let mut core = lock(&self.shared.core);
                core.update = false;
                let timeout = core.timers.next_timeout(tick_ms());
                (core.make_waitset()?, timeout)
            };

            let events = match waitset.wait(timeout) {
                Ok(events) => events,
                Err(ref e) if benign_wait_error(e) => {
                    log::debug!("wait interrupted: {}", e);
                    self.fire_timers();
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            self.dispatch(events);
            self.fire_timers();
        }
        Ok(())
    }

    fn dispatch(&self, events: Vec<(RawFd, Ready)>) {
        lock(&self.shared.core).dispatching = true;

        'events: for (fd, ready) in events {
            let handler = {
                let _ext = self.external_guard();
                let core = lock(&self.shared.core);
                if core.update {
                    break 'events;
                }
                // the record may have been detached by an earlier handler
                // in this very batch
                core.registry
                    .get(fd)
                    .filter(|r| !r.flags.is_empty())
                    .and_then(|r| r.handler.clone())
            };

            if let Some(handler) = handler {
                let started = Instant::now();
                let mut f = handler.lock().unwrap_or_else(PoisonError::into_inner);
                (&mut *f)(ready);
                drop(f);
                warn_blocking(started, "event");
            }
        }

        let dead = {
            let mut core = lock(&self.shared.core);
            core.dispatching = false;
            std::mem::take(&mut core.pending_delete)
        };
        // records retired mid-pass are dropped here, outside the lock
        drop(dead);
    }

    fn fire_timers(&self) {
        loop {
            let due = {
                let _ext = self.external_guard();
                let mut core = lock(&self.shared.core);
                core.timers.pop_due(tick_ms())
            };
            match due {
                Some(f) => {
                    let started = Instant::now();
                    f();
                    warn_blocking(started, "timer");
                }
                None => break,
            }
        }
    }
}

/// RAII bracket serializing a foreign thread against the reactor.
///
/// Created by [`Reactor::enter`]; dropped to leave. While the guard lives,
/// the owning loop cannot start a new pass and no other thread can enter.
pub struct ReactorGuard<'a> {
    core: MutexGuard<'a, Core>,
    _ext: Option<MutexGuard<'a, ()>>,
}

impl ReactorGuard<'_> {
    pub fn attach_fd<F>(&mut self, fd: RawFd, flags: Ready, handler: F) -> Result<()>
    where
        F: FnMut(Ready) + Send + 'static,
    {
        self.core
            .attach(fd, flags, Some(Arc::new(Mutex::new(handler))))
    }

    pub fn detach_fd(&mut self, fd: RawFd) -> Result<()> {
        self.core.detach(fd)
    }

    pub fn set_method(&mut self, method: Method) -> Result<()> {
        self.core.switch_method(method)
    }

    pub fn set_timer<F>(&mut self, delay: Duration, f: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.set_timer(delay, Box::new(f))
    }

    pub fn cancel_timer(&mut self, handle: TimerHandle) -> bool {
        self.core.timers.cancel(handle)
    }

    pub fn active_count(&self) -> usize {
        self.core.registry.active_count()
    }
}

impl Drop for ReactorGuard<'_> {
    fn drop(&mut self) {
        self.core.entered = None;
        let reuse = self.core.reuse_saved;
        self.core.registry.set_reuse(reuse);
    }
}
