//! `select(2)` backend.
//!
//! The three fd-sets are rebuilt from the registry before every wait, so the
//! backend itself keeps no per-descriptor state. The highest descriptor is
//! derived from the live records at snapshot time rather than tracked
//! incrementally, which keeps the scan exact after detaches.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;

use crate::ready::Ready;

pub struct Select {
    _priv: (),
}

impl Select {
    pub fn new() -> io::Result<Select> {
        Ok(Select { _priv: () })
    }

    /// `select` addresses descriptors by value, so anything at or beyond
    /// `FD_SETSIZE` can never be watched.
    pub fn attach(&mut self, fd: RawFd) -> io::Result<()> {
        if fd as usize >= libc::FD_SETSIZE as usize {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(())
    }

    pub fn detach(&mut self, _fd: RawFd) {}

    pub fn capacity(&self) -> usize {
        libc::FD_SETSIZE as usize
    }

    pub fn snapshot<I>(&self, active: I) -> WaitSet
    where
        I: Iterator<Item = (RawFd, Ready)>,
    {
        let mut ws = WaitSet {
            read: unsafe { mem::zeroed() },
            write: unsafe { mem::zeroed() },
            except: unsafe { mem::zeroed() },
            fds: Vec::new(),
            nfds: 0,
        };

        unsafe {
            libc::FD_ZERO(&mut ws.read);
            libc::FD_ZERO(&mut ws.write);
            libc::FD_ZERO(&mut ws.except);
        }

        for (fd, flags) in active {
            if flags.is_read() {
                unsafe { libc::FD_SET(fd, &mut ws.read) };
            }
            if flags.is_write() {
                unsafe { libc::FD_SET(fd, &mut ws.write) };
            }
            unsafe { libc::FD_SET(fd, &mut ws.except) };

            ws.nfds = ws.nfds.max(fd + 1);
            ws.fds.push((fd, flags));
        }

        ws
    }
}

pub struct WaitSet {
    read: libc::fd_set,
    write: libc::fd_set,
    except: libc::fd_set,
    fds: Vec<(RawFd, Ready)>,
    nfds: libc::c_int,
}

impl WaitSet {
    pub fn wait(mut self, timeout: Option<u64>) -> io::Result<Vec<(RawFd, Ready)>> {
        let mut tv;
        let tv_ptr = match timeout {
            Some(ms) => {
                tv = libc::timeval {
                    tv_sec: (ms / 1000) as libc::time_t,
                    tv_usec: ((ms % 1000) * 1000) as libc::suseconds_t,
                };
                &mut tv as *mut libc::timeval
            }
            None => std::ptr::null_mut(),
        };

        let n = syscall!(select(
            self.nfds,
            &mut self.read,
            &mut self.write,
            &mut self.except,
            tv_ptr
        ))?;

        let mut events = Vec::with_capacity(n as usize);
        if n == 0 {
            return Ok(events);
        }

        let fds = std::mem::take(&mut self.fds);
        for (fd, _) in fds {
            let mut ready = Ready::empty();
            if unsafe { libc::FD_ISSET(fd, &mut self.read) } {
                ready.insert(Ready::read());
            }
            if unsafe { libc::FD_ISSET(fd, &mut self.write) } {
                ready.insert(Ready::write());
            }
            if unsafe { libc::FD_ISSET(fd, &mut self.except) } {
                ready.insert(Ready::except());
            }
            if !ready.is_empty() {
                events.push((fd, ready));
            }
        }

        Ok(events)
    }
}
