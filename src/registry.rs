//! Descriptor handler bookkeeping.
//!
//! One record per attached descriptor, keyed by the raw fd. A detach either
//! clears the record in place (`reuse` on, the POSIX default: closed fd
//! numbers come right back, so the storage is immediately useful again) or
//! removes it so the storage can be dropped once the dispatch pass that may
//! still reference it has finished.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

use crate::ready::Ready;

/// Shared, callable event handler.
///
/// The handler is invoked outside the reactor lock, so it carries its own
/// one-slot lock; the reactor is single-threaded per pass and never contends
/// on it.
pub(crate) type Handler = Arc<Mutex<dyn FnMut(Ready) + Send>>;

pub(crate) struct Record {
    pub flags: Ready,
    pub handler: Option<Handler>,
    /// Backend slot; meaningful for array backends, `None` when detached.
    pub slot: Option<usize>,
}

pub(crate) struct Registry {
    records: IndexMap<RawFd, Record>,
    active: usize,
    reuse: bool,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            records: IndexMap::new(),
            active: 0,
            reuse: cfg!(unix),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active
    }

    pub fn reuse(&self) -> bool {
        self.reuse
    }

    pub fn set_reuse(&mut self, reuse: bool) {
        self.reuse = reuse;
    }

    /// Upserts the record for `fd`. The backend slot is preserved across
    /// updates of an already-attached descriptor.
    pub fn upsert(
        &mut self,
        fd: RawFd,
        flags: Ready,
        handler: Handler,
        slot: Option<usize>,
    ) {
        debug_assert!(!flags.is_empty());

        let record = self.records.entry(fd).or_insert(Record {
            flags: Ready::empty(),
            handler: None,
            slot: None,
        });

        if record.flags.is_empty() {
            self.active += 1;
        }
        record.flags = flags;
        record.handler = Some(handler);
        record.slot = slot;
    }

    /// Clears the record for `fd`.
    ///
    /// Under the reuse policy the cleared record stays in the map so a
    /// re-attach of the same fd number lands on the same storage; otherwise
    /// the record is removed and returned so the caller can defer dropping
    /// it past the current dispatch pass.
    pub fn clear(&mut self, fd: RawFd) -> Option<Record> {
        if self.reuse {
            let record = self.records.get_mut(&fd)?;
            if record.flags.is_empty() {
                return None;
            }
            self.active -= 1;
            record.flags = Ready::empty();
            record.slot = None;
            record.handler.take();
            None
        } else {
            let record = self.records.shift_remove(&fd)?;
            if record.flags.is_empty() {
                return None;
            }
            self.active -= 1;
            Some(record)
        }
    }

    pub fn get(&self, fd: RawFd) -> Option<&Record> {
        self.records.get(&fd)
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut Record> {
        self.records.get_mut(&fd)
    }

    /// Live records, in attach order.
    pub fn iter_active(&self) -> impl Iterator<Item = (RawFd, &Record)> {
        self.records
            .iter()
            .filter(|(_, r)| !r.flags.is_empty())
            .map(|(&fd, r)| (fd, r))
    }

    /// Drops cleared records kept around by the reuse policy.
    pub fn compact(&mut self) {
        self.records.retain(|_, r| !r.flags.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Handler {
        Arc::new(Mutex::new(|_: Ready| {}))
    }

    #[test]
    fn attach_update_detach_counts() {
        let mut reg = Registry::new();

        reg.upsert(5, Ready::read() | Ready::write(), noop(), Some(0));
        assert_eq!(reg.active_count(), 1);

        // update is not a second attach
        reg.upsert(5, Ready::read(), noop(), Some(0));
        assert_eq!(reg.active_count(), 1);

        reg.clear(5);
        assert_eq!(reg.active_count(), 0);
    }

    #[test]
    fn reuse_keeps_record_storage() {
        let mut reg = Registry::new();
        reg.set_reuse(true);

        reg.upsert(9, Ready::read(), noop(), Some(3));
        assert!(reg.clear(9).is_none());

        // the record is still present, cleared
        let rec = reg.get(9).unwrap();
        assert!(rec.flags.is_empty());
        assert!(rec.slot.is_none());
        assert_eq!(reg.active_count(), 0);

        reg.upsert(9, Ready::write(), noop(), Some(4));
        assert_eq!(reg.active_count(), 1);
    }

    #[test]
    fn no_reuse_returns_record() {
        let mut reg = Registry::new();
        reg.set_reuse(false);

        reg.upsert(9, Ready::read(), noop(), None);
        let rec = reg.clear(9);
        assert!(rec.is_some());
        assert!(reg.get(9).is_none());
    }

    #[test]
    fn double_clear_is_noop() {
        let mut reg = Registry::new();
        reg.upsert(2, Ready::read(), noop(), None);
        reg.clear(2);
        assert!(reg.clear(2).is_none());
        assert_eq!(reg.active_count(), 0);
    }
}
