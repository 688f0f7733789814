//! `kqueue(2)` backend.
//!
//! Read and write interest map to separate kevent filters. Interest changes
//! are applied as a delete-then-add pair per filter so a modify never leaves
//! a stale filter behind. EV_EOF on either filter surfaces as EXCEPT.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;

use crate::ready::Ready;

pub struct Kqueue {
    kq: RawFd,
}

impl Kqueue {
    pub fn new() -> io::Result<Kqueue> {
        let kq = syscall!(kqueue())?;
        syscall!(fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC))?;
        Ok(Kqueue { kq })
    }

    pub fn attach(&mut self, fd: RawFd, flags: Ready) -> io::Result<()> {
        self.update_filter(fd, libc::EVFILT_READ, flags.is_read())?;
        self.update_filter(fd, libc::EVFILT_WRITE, flags.is_write())?;
        Ok(())
    }

    pub fn detach(&mut self, fd: RawFd) -> io::Result<()> {
        self.update_filter(fd, libc::EVFILT_READ, false)?;
        self.update_filter(fd, libc::EVFILT_WRITE, false)?;
        Ok(())
    }

    fn update_filter(&mut self, fd: RawFd, filter: i16, wanted: bool) -> io::Result<()> {
        let mut change: libc::kevent = unsafe { mem::zeroed() };
        change.ident = fd as libc::uintptr_t;
        change.filter = filter;
        change.flags = if wanted {
            libc::EV_ADD
        } else {
            libc::EV_DELETE
        };

        let res = unsafe {
            libc::kevent(
                self.kq,
                &change,
                1,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };

        if res == -1 {
            let err = io::Error::last_os_error();
            // deleting a filter that was never added is expected during
            // interest narrowing
            if !wanted && err.raw_os_error() == Some(libc::ENOENT) {
                return Ok(());
            }
            return Err(err);
        }

        Ok(())
    }

    pub fn snapshot(&self, capacity: usize) -> WaitSet {
        WaitSet {
            kq: self.kq,
            capacity: capacity.clamp(1, 1024),
        }
    }
}

impl Drop for Kqueue {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.kq);
        }
    }
}

pub struct WaitSet {
    kq: RawFd,
    capacity: usize,
}

impl WaitSet {
    pub fn wait(self, timeout: Option<u64>) -> io::Result<Vec<(RawFd, Ready)>> {
        let mut ts;
        let ts_ptr = match timeout {
            Some(ms) => {
                ts = libc::timespec {
                    tv_sec: (ms / 1000) as libc::time_t,
                    tv_nsec: ((ms % 1000) * 1_000_000) as libc::c_long,
                };
                &ts as *const libc::timespec
            }
            None => ptr::null(),
        };

        let mut evts: Vec<libc::kevent> = Vec::with_capacity(self.capacity);

        let n = unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                evts.as_mut_ptr(),
                self.capacity as libc::c_int,
                ts_ptr,
            )
        };

        if n == -1 {
            return Err(io::Error::last_os_error());
        }

        unsafe { evts.set_len(n as usize) };

        Ok(evts
            .iter()
            .map(|e| {
                let mut ready = Ready::empty();
                if e.filter == libc::EVFILT_READ {
                    ready.insert(Ready::read());
                }
                if e.filter == libc::EVFILT_WRITE {
                    ready.insert(Ready::write());
                }
                if e.flags & libc::EV_EOF != 0 {
                    ready.insert(Ready::except());
                }
                (e.ident as RawFd, ready)
            })
            .collect())
    }
}
