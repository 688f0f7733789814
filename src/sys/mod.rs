//! OS-specific readiness backends.
//!
//! Each submodule wraps one notification mechanism behind the same small
//! surface: create, attach/modify/detach one descriptor, and a `wait` that
//! operates on a per-pass snapshot so the caller can drop its lock around
//! the blocking syscall.

/// Invokes a libc function, converting `-1` into `io::Error::last_os_error`.
macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub mod kqueue;
pub mod poll;
pub mod select;

/// Clamps a millisecond timeout to the `c_int` range used by poll and epoll.
pub(crate) fn timeout_ms(timeout: Option<u64>) -> libc::c_int {
    timeout
        .map(|ms| ms.min(libc::c_int::MAX as u64) as libc::c_int)
        .unwrap_or(-1)
}
