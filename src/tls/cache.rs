//! Session-reuse cache.
//!
//! One entry per peer address, owning the library's opaque session object.
//! The cache is fed from the library's new-session notification and drained
//! by its remove notification; entries can also be installed and captured
//! explicitly around a handshake.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use openssl::ssl::{SslSession, SslSessionRef};

pub(crate) struct SessionCache {
    sessions: Mutex<HashMap<SocketAddr, SslSession>>,
}

impl SessionCache {
    pub fn new() -> SessionCache {
        SessionCache {
            sessions: Mutex::new(HashMap::with_capacity(256)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SocketAddr, SslSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `session` for `peer`, displacing any prior entry.
    pub fn insert(&self, peer: SocketAddr, session: SslSession) {
        log::trace!("session cache: insert {}", peer);
        self.lock().insert(peer, session);
    }

    /// Runs `f` on the cached session for `peer`, if there is one.
    ///
    /// The entry stays in the cache; peers commonly reconnect more than
    /// once.
    pub fn with_session<F, R>(&self, peer: &SocketAddr, f: F) -> Option<R>
    where
        F: FnOnce(&SslSessionRef) -> R,
    {
        let sessions = self.lock();
        sessions.get(peer).map(|s| f(s))
    }

    /// Drops the entry holding exactly this session object. Invoked from
    /// the library's remove notification.
    pub fn remove_session(&self, session: &SslSessionRef) {
        self.lock()
            .retain(|peer, s| {
                let keep = !std::ptr::eq::<SslSessionRef>(&**s, session);
                if !keep {
                    log::trace!("session cache: remove {}", peer);
                }
                keep
            });
    }

    pub fn remove_peer(&self, peer: &SocketAddr) -> bool {
        self.lock().remove(peer).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
