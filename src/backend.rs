//! Backend selection and dispatch.
//!
//! A reactor holds one `Backend` at a time and can swap it at runtime. The
//! tagged variant keeps dispatch a plain `match`, and the per-pass `WaitSet`
//! snapshot is the only thing that crosses the reactor's unlock-for-wait
//! boundary.

use std::io;
use std::os::unix::io::RawFd;

use crate::error::Result;
use crate::ready::Ready;
use crate::registry::Registry;
use crate::sys;

/// Readiness notification mechanisms, in rough order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Select,
    Poll,
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Epoll,
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    Kqueue,
}

impl Method {
    /// The preferred available method for this platform.
    pub fn best() -> Method {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            Method::Epoll
        }
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        ))]
        {
            Method::Kqueue
        }
        #[cfg(not(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        )))]
        {
            Method::Poll
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Method::Select => "select",
            Method::Poll => "poll",
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Method::Epoll => "epoll",
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            Method::Kqueue => "kqueue",
        }
    }
}

pub(crate) enum Backend {
    Select(sys::select::Select),
    Poll(sys::poll::Poll),
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Epoll(sys::epoll::Epoll),
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    Kqueue(sys::kqueue::Kqueue),
}

pub(crate) enum WaitSet {
    Select(sys::select::WaitSet),
    Poll(Vec<libc::pollfd>),
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Epoll(sys::epoll::WaitSet),
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    Kqueue(sys::kqueue::WaitSet),
}

impl Backend {
    pub fn new(method: Method) -> Result<Backend> {
        match method {
            Method::Select => Ok(Backend::Select(sys::select::Select::new()?)),
            Method::Poll => Ok(Backend::Poll(sys::poll::Poll::new()?)),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Method::Epoll => Ok(Backend::Epoll(sys::epoll::Epoll::new()?)),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            Method::Kqueue => Ok(Backend::Kqueue(sys::kqueue::Kqueue::new()?)),
        }
    }

    pub fn method(&self) -> Method {
        match self {
            Backend::Select(_) => Method::Select,
            Backend::Poll(_) => Method::Poll,
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Epoll(_) => Method::Epoll,
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            Backend::Kqueue(_) => Method::Kqueue,
        }
    }

    /// Hard per-backend descriptor ceiling, where one exists.
    pub fn capacity(&self) -> Option<usize> {
        match self {
            Backend::Select(s) => Some(s.capacity()),
            _ => None,
        }
    }

    /// Attaches or updates one descriptor, returning the backend slot to
    /// store in the registry.
    pub fn attach(
        &mut self,
        fd: RawFd,
        flags: Ready,
        prev_slot: Option<usize>,
        attached: bool,
    ) -> io::Result<Option<usize>> {
        match self {
            Backend::Select(s) => {
                s.attach(fd)?;
                Ok(None)
            }
            Backend::Poll(p) => p.attach(fd, flags, prev_slot).map(Some),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Epoll(e) => {
                e.attach(fd, flags, attached)?;
                Ok(None)
            }
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            Backend::Kqueue(k) => {
                k.attach(fd, flags)?;
                Ok(None)
            }
        }
    }

    /// Removes one descriptor. Failures are reported but a missing entry is
    /// not an error: the descriptor may already be closed, which removes it
    /// from kernel-owned sets on its own.
    pub fn detach(&mut self, fd: RawFd, slot: Option<usize>) {
        let res: io::Result<()> = match self {
            Backend::Select(s) => {
                s.detach(fd);
                Ok(())
            }
            Backend::Poll(p) => {
                if let Some(idx) = slot {
                    p.detach(idx);
                }
                Ok(())
            }
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Epoll(e) => e.detach(fd),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            Backend::Kqueue(k) => k.detach(fd),
        };

        if let Err(e) = res {
            log::debug!("backend detach fd {}: {}", fd, e);
        }
    }

    pub fn snapshot(&self, registry: &Registry) -> WaitSet {
        match self {
            Backend::Select(s) => WaitSet::Select(
                s.snapshot(registry.iter_active().map(|(fd, r)| (fd, r.flags))),
            ),
            Backend::Poll(p) => WaitSet::Poll(p.snapshot()),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Epoll(e) => WaitSet::Epoll(e.snapshot(registry.active_count())),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            Backend::Kqueue(k) => WaitSet::Kqueue(k.snapshot(registry.active_count())),
        }
    }
}

impl WaitSet {
    pub fn wait(self, timeout: Option<u64>) -> io::Result<Vec<(RawFd, Ready)>> {
        match self {
            WaitSet::Select(ws) => ws.wait(timeout),
            WaitSet::Poll(pfds) => sys::poll::wait(pfds, timeout),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            WaitSet::Epoll(ws) => ws.wait(timeout),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            WaitSet::Kqueue(ws) => ws.wait(timeout),
        }
    }
}
