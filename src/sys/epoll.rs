//! `epoll(7)` backend.
//!
//! The interest set lives in the kernel, so attach/modify/detach are one
//! `epoll_ctl` each and the wait snapshot is just the epoll descriptor plus
//! a capacity hint. The kernel object can be manipulated while another
//! thread is blocked in `epoll_wait`; a descriptor attached mid-wait is
//! picked up without waking the waiter.

use std::io;
use std::os::unix::io::RawFd;

use super::timeout_ms;
use crate::ready::Ready;

pub struct Epoll {
    epfd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Epoll { epfd })
    }

    pub fn attach(&mut self, fd: RawFd, flags: Ready, attached: bool) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: interest_to_epoll(flags),
            u64: fd as u64,
        };

        let op = if attached {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };

        match syscall!(epoll_ctl(self.epfd, op, fd, &mut info)) {
            Ok(_) => Ok(()),
            // the kernel set can be ahead of our bookkeeping when a closed
            // fd number was reused; retry with the other op
            Err(ref e) if e.raw_os_error() == Some(libc::EEXIST) => {
                syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut info)).map(|_| ())
            }
            Err(ref e) if e.raw_os_error() == Some(libc::ENOENT) && attached => {
                syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut info)).map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    pub fn detach(&mut self, fd: RawFd) -> io::Result<()> {
        let mut info = libc::epoll_event { events: 0, u64: 0 };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut info)).map(|_| ())
    }

    pub fn snapshot(&self, capacity: usize) -> WaitSet {
        WaitSet {
            epfd: self.epfd,
            capacity: capacity.clamp(1, 1024),
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}

pub struct WaitSet {
    epfd: RawFd,
    capacity: usize,
}

impl WaitSet {
    pub fn wait(self, timeout: Option<u64>) -> io::Result<Vec<(RawFd, Ready)>> {
        let mut evts: Vec<libc::epoll_event> = Vec::with_capacity(self.capacity);

        let n = syscall!(epoll_wait(
            self.epfd,
            evts.as_mut_ptr(),
            self.capacity as libc::c_int,
            timeout_ms(timeout)
        ))?;

        unsafe { evts.set_len(n as usize) };

        Ok(evts
            .iter()
            .map(|e| (e.u64 as RawFd, epoll_to_ready(e.events)))
            .collect())
    }
}

fn interest_to_epoll(flags: Ready) -> u32 {
    let mut events = 0;
    if flags.is_read() {
        events |= libc::EPOLLIN;
    }
    if flags.is_write() {
        events |= libc::EPOLLOUT;
    }
    events as u32
}

fn epoll_to_ready(events: u32) -> Ready {
    let events = events as libc::c_int;
    let mut ready = Ready::empty();
    if events & libc::EPOLLIN != 0 {
        ready.insert(Ready::read());
    }
    if events & libc::EPOLLOUT != 0 {
        ready.insert(Ready::write());
    }
    if events & (libc::EPOLLERR | libc::EPOLLHUP) != 0 {
        ready.insert(Ready::except());
    }
    ready
}
