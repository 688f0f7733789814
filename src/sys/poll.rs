//! `poll(2)` backend.
//!
//! A compact `pollfd` array is kept in step with the registry. Each record
//! owns one slot for its lifetime (the slot index is what the registry
//! stores), so attach-modify is a single array write. Detached slots are
//! parked with `fd = -1`, which poll skips, and handed back by the slab on
//! the next attach.

use std::io;
use std::os::unix::io::RawFd;

use slab::Slab;

use super::timeout_ms;
use crate::ready::Ready;

pub struct Poll {
    slots: Slab<RawFd>,
    pfds: Vec<libc::pollfd>,
}

impl Poll {
    pub fn new() -> io::Result<Poll> {
        Ok(Poll {
            slots: Slab::new(),
            pfds: Vec::new(),
        })
    }

    /// Attaches or updates one descriptor, returning its slot index.
    pub fn attach(&mut self, fd: RawFd, flags: Ready, slot: Option<usize>) -> io::Result<usize> {
        let events = interest_to_poll(flags);

        if let Some(idx) = slot {
            let pfd = &mut self.pfds[idx];
            pfd.fd = fd;
            pfd.events = events;
            return Ok(idx);
        }

        let idx = self.slots.insert(fd);
        let pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        if idx == self.pfds.len() {
            self.pfds.push(pfd);
        } else {
            self.pfds[idx] = pfd;
        }
        Ok(idx)
    }

    pub fn detach(&mut self, slot: usize) {
        if self.slots.contains(slot) {
            self.slots.remove(slot);
            self.pfds[slot] = libc::pollfd {
                fd: -1,
                events: 0,
                revents: 0,
            };
        }
    }

    pub fn snapshot(&self) -> Vec<libc::pollfd> {
        self.pfds.clone()
    }
}

pub fn wait(mut pfds: Vec<libc::pollfd>, timeout: Option<u64>) -> io::Result<Vec<(RawFd, Ready)>> {
    let n = syscall!(poll(
        pfds.as_mut_ptr(),
        pfds.len() as libc::nfds_t,
        timeout_ms(timeout)
    ))?;

    let mut events = Vec::with_capacity(n as usize);
    if n == 0 {
        return Ok(events);
    }

    for pfd in &pfds {
        if pfd.fd < 0 || pfd.revents == 0 {
            continue;
        }
        events.push((pfd.fd, revents_to_ready(pfd.revents)));
        if events.len() == n as usize {
            break;
        }
    }

    Ok(events)
}

fn interest_to_poll(flags: Ready) -> libc::c_short {
    let mut events = 0;
    if flags.is_read() {
        events |= libc::POLLIN;
    }
    if flags.is_write() {
        events |= libc::POLLOUT;
    }
    events
}

fn revents_to_ready(revents: libc::c_short) -> Ready {
    let mut ready = Ready::empty();
    if revents & libc::POLLIN != 0 {
        ready.insert(Ready::read());
    }
    if revents & libc::POLLOUT != 0 {
        ready.insert(Ready::write());
    }
    if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        ready.insert(Ready::except());
    }
    ready
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_reuse_after_detach() {
        let mut poll = Poll::new().unwrap();
        let a = poll.attach(7, Ready::read(), None).unwrap();
        let b = poll.attach(8, Ready::read(), None).unwrap();
        assert_ne!(a, b);

        poll.detach(a);
        assert_eq!(poll.snapshot()[a].fd, -1);

        let c = poll.attach(9, Ready::write(), None).unwrap();
        assert_eq!(a, c);
        assert_eq!(poll.snapshot()[c].fd, 9);
    }

    #[test]
    fn modify_keeps_slot() {
        let mut poll = Poll::new().unwrap();
        let slot = poll.attach(3, Ready::read(), None).unwrap();
        let again = poll.attach(3, Ready::read() | Ready::write(), Some(slot)).unwrap();
        assert_eq!(slot, again);
        assert_eq!(poll.snapshot().len(), 1);
    }
}
