//! Per-thread reactor bookkeeping.
//!
//! Each thread can bind one reactor in a thread-local slot; the slot's
//! destructor releases the reactor handle when the thread exits without an
//! explicit close. The first reactor initialized this way is also published
//! as a process-wide fallback so that library calls made from incidental
//! threads still find a loop to talk to.

use std::cell::RefCell;
use std::sync::{Mutex, PoisonError};

use crate::error::{Error, Result};
use crate::reactor::Reactor;

thread_local! {
    static CURRENT: RefCell<Option<Reactor>> = const { RefCell::new(None) };
}

static GLOBAL: Mutex<Option<Reactor>> = Mutex::new(None);

fn global() -> std::sync::MutexGuard<'static, Option<Reactor>> {
    GLOBAL.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Allocates a reactor and binds it to the calling thread.
///
/// The first successful call also publishes the reactor as the process
/// fallback. Fails with `AlreadyBound` when the thread already has one.
pub fn thread_init() -> Result<Reactor> {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_some() {
            return Err(Error::AlreadyBound);
        }
        let reactor = Reactor::new()?;
        *slot = Some(reactor.clone());

        let mut fallback = global();
        if fallback.is_none() {
            *fallback = Some(reactor.clone());
        }
        Ok(reactor)
    })
}

/// Releases the calling thread's reactor and clears the slot.
///
/// Also unpublishes the process fallback if it was this reactor.
pub fn thread_close() {
    let closed = CURRENT.with(|slot| slot.borrow_mut().take());
    if let Some(reactor) = closed {
        let mut fallback = global();
        if fallback.as_ref().map(|g| g.same(&reactor)).unwrap_or(false) {
            fallback.take();
        }
    }
}

/// Points the calling thread's slot at an existing reactor.
///
/// Attaching the reactor that is already bound is a no-op; a different one
/// fails with `AlreadyBound`.
pub fn thread_attach(reactor: &Reactor) -> Result<()> {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        match slot.as_ref() {
            Some(existing) if existing.same(reactor) => Ok(()),
            Some(_) => Err(Error::AlreadyBound),
            None => {
                *slot = Some(reactor.clone());
                Ok(())
            }
        }
    })
}

/// Clears the calling thread's slot without releasing the reactor.
pub fn thread_detach() {
    CURRENT.with(|slot| {
        slot.borrow_mut().take();
    });
}

/// The calling thread's reactor, or the process fallback.
pub fn current() -> Option<Reactor> {
    let local = CURRENT.with(|slot| slot.borrow().clone());
    if local.is_some() {
        return local;
    }
    global().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    // the global fallback is process state; keep every scenario in one test
    // so runs cannot interleave
    #[test]
    fn slot_lifecycle() {
        let reactor = thread_init().unwrap();

        // second init on the same thread is rejected
        assert!(matches!(thread_init(), Err(Error::AlreadyBound)));

        // re-attach of the same reactor is fine
        thread_attach(&reactor).unwrap();

        let other = Reactor::new().unwrap();
        assert!(matches!(thread_attach(&other), Err(Error::AlreadyBound)));

        // the fallback serves threads with no slot of their own
        let seen = std::thread::spawn(|| current().is_some())
            .join()
            .unwrap();
        assert!(seen);

        thread_detach();
        // detaching keeps the fallback published
        assert!(current().is_some());

        thread_attach(&reactor).unwrap();
        thread_close();
        assert!(current().is_none());

        // a fresh init can take over again
        let again = thread_init().unwrap();
        assert!(current().map(|c| c.same(&again)).unwrap_or(false));
        thread_close();
    }
}
