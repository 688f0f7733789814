//! A reactor-style networking runtime: readiness multiplexing over
//! swappable OS backends, per-thread event loops with timers, and TLS/DTLS
//! session management with per-peer session reuse.
//!
//! # Example
//!
//! ```
//! use std::os::unix::io::AsRawFd;
//! use muxio::{net::TcpListener, Reactor, Ready};
//!
//! let reactor = Reactor::new().unwrap();
//! let listener = TcpListener::bind("127.0.0.1:0").unwrap();
//! let addr = listener.local_addr().unwrap();
//!
//! let r = reactor.clone();
//! reactor.attach_fd(listener.as_raw_fd(), Ready::read(), move |_| {
//!     // accept, attach the client, echo...
//!     let _ = listener.accept();
//!     r.cancel();
//! }).unwrap();
//!
//! let client = std::thread::spawn(move || {
//!     let _ = std::net::TcpStream::connect(addr);
//! });
//!
//! reactor.run().unwrap();
//! client.join().unwrap();
//! ```
//!
//! Each OS thread runs at most one reactor; [`thread::thread_init`] binds
//! one to the current thread and publishes the first as a process-wide
//! fallback. The TLS layer lives in [`tls`] and rides on any registered
//! stream socket.

mod backend;
mod error;
mod reactor;
mod ready;
mod registry;
mod sys;
mod timer;

pub mod net;
pub mod thread;
pub mod tls;

pub use backend::Method;
pub use error::{Error, Result};
pub use reactor::{Reactor, ReactorGuard};
pub use ready::Ready;
pub use timer::TimerHandle;
