use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream as StdTcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use muxio::net::TcpListener;
use muxio::{Error, Method, Reactor, Ready};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Wires an echo server into `reactor`: accepted connections echo their
/// bytes back and the reactor is canceled when a client disconnects.
fn wire_echo(
    reactor: &Reactor,
    listener: TcpListener,
    peak_active: Arc<AtomicUsize>,
) -> RawFd {
    let lfd = listener.as_raw_fd();
    let conns: Arc<Mutex<HashMap<RawFd, muxio::net::TcpStream>>> =
        Arc::new(Mutex::new(HashMap::new()));

    let r = reactor.clone();
    reactor
        .attach_fd(lfd, Ready::read(), move |_| {
            let (stream, _peer) = match listener.accept() {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let fd = stream.as_raw_fd();
            conns.lock().unwrap().insert(fd, stream);

            let r2 = r.clone();
            let conns2 = conns.clone();
            let peak = peak_active.clone();
            r.attach_fd(fd, Ready::read(), move |ready| {
                peak.fetch_max(r2.active_count(), Ordering::SeqCst);

                if !ready.is_read() && !ready.is_except() {
                    return;
                }
                let mut gone = false;
                {
                    let mut conns = conns2.lock().unwrap();
                    if let Some(stream) = conns.get_mut(&fd) {
                        let mut buf = [0u8; 1024];
                        match stream.read(&mut buf) {
                            Ok(0) => gone = true,
                            Ok(n) => stream.write_all(&buf[..n]).unwrap(),
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                            Err(_) => gone = true,
                        }
                    }
                    if gone {
                        conns.remove(&fd);
                    }
                }
                if gone {
                    let _ = r2.detach_fd(fd);
                    r2.cancel();
                }
            })
            .unwrap();
        })
        .unwrap();

    lfd
}

#[test]
fn echo_over_poll() {
    init_logger();

    let reactor = Reactor::with_method(Method::Poll).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let peak = Arc::new(AtomicUsize::new(0));
    let lfd = wire_echo(&reactor, listener, peak.clone());

    let client = thread::spawn(move || {
        let mut stream = StdTcpStream::connect(addr).unwrap();
        stream.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        stream.shutdown(Shutdown::Write).unwrap();
    });

    reactor.run().unwrap();
    client.join().unwrap();

    // listener + one connection during the echo
    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(reactor.active_count(), 1);
    reactor.detach_fd(lfd).unwrap();
    assert_eq!(reactor.active_count(), 0);
}

#[cfg(target_os = "linux")]
#[test]
fn backend_switch_mid_stream() {
    init_logger();

    let reactor = Reactor::with_method(Method::Poll).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let peak = Arc::new(AtomicUsize::new(0));
    wire_echo(&reactor, listener, peak);

    let switcher = reactor.clone();
    let client = thread::spawn(move || {
        let mut stream = StdTcpStream::connect(addr).unwrap();
        let mut buf = [0u8; 3];

        stream.write_all(b"one").unwrap();
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"one");

        // swap the backend under the running loop
        switcher.enter().set_method(Method::Epoll).unwrap();

        stream.write_all(b"two").unwrap();
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"two");

        stream.shutdown(Shutdown::Write).unwrap();
    });

    reactor.run().unwrap();
    client.join().unwrap();

    assert_eq!(reactor.method(), Method::Epoll);
}

#[test]
fn timer_ordering() {
    init_logger();

    let reactor = Reactor::new().unwrap();
    let order: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));

    for delay in [10u64, 30, 20] {
        let order = order.clone();
        reactor.set_timer(Duration::from_millis(delay), move || {
            order.lock().unwrap().push(delay);
        });
    }

    let r = reactor.clone();
    reactor.set_timer(Duration::from_millis(80), move || r.cancel());

    reactor.run().unwrap();
    assert_eq!(*order.lock().unwrap(), vec![10, 20, 30]);
}

#[test]
fn zero_delay_timer_fires_without_blocking() {
    init_logger();

    let reactor = Reactor::new().unwrap();
    let r = reactor.clone();
    let started = Instant::now();
    reactor.set_timer(Duration::from_millis(0), move || r.cancel());
    reactor.run().unwrap();
    assert!(started.elapsed() < Duration::from_millis(200));
}

#[test]
fn canceled_timer_does_not_fire() {
    init_logger();

    let reactor = Reactor::new().unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let f = fired.clone();
    let handle = reactor.set_timer(Duration::from_millis(10), move || {
        f.fetch_add(1, Ordering::SeqCst);
    });
    assert!(reactor.cancel_timer(handle));
    assert!(!reactor.cancel_timer(handle));

    let r = reactor.clone();
    reactor.set_timer(Duration::from_millis(40), move || r.cancel());
    reactor.run().unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn run_twice_is_already_polling() {
    init_logger();

    let reactor = Reactor::new().unwrap();
    // give the loop a wakeup so cancel is observed
    reactor.set_timer(Duration::from_millis(150), || {});

    let r = reactor.clone();
    let runner = thread::spawn(move || r.run());

    while !reactor.is_polling() {
        thread::sleep(Duration::from_millis(1));
    }
    assert!(matches!(reactor.run(), Err(Error::AlreadyPolling)));

    reactor.cancel();
    runner.join().unwrap().unwrap();
}

#[test]
fn attach_update_detach_counts() {
    init_logger();

    let reactor = Reactor::new().unwrap();
    let (a, b) = UnixStream::pair().unwrap();
    let fd = a.as_raw_fd();

    reactor
        .attach_fd(fd, Ready::read() | Ready::write(), |_| {})
        .unwrap();
    assert_eq!(reactor.active_count(), 1);
    assert_eq!(reactor.lookup(fd), Some(Ready::read() | Ready::write()));

    // update in place
    reactor.attach_fd(fd, Ready::read(), |_| {}).unwrap();
    assert_eq!(reactor.active_count(), 1);
    assert_eq!(reactor.lookup(fd), Some(Ready::read()));

    // attaching with empty flags detaches
    reactor.attach_fd(fd, Ready::empty(), |_| {}).unwrap();
    assert_eq!(reactor.active_count(), 0);
    assert!(reactor.lookup(fd).is_none());

    assert!(matches!(
        reactor.attach_fd(-1, Ready::read(), |_| {}),
        Err(Error::BadDescriptor)
    ));

    drop((a, b));
}

#[test]
fn max_fds_limit_and_teardown() {
    init_logger();

    let reactor = Reactor::new().unwrap();
    let (a, b) = UnixStream::pair().unwrap();

    reactor.attach_fd(a.as_raw_fd(), Ready::read(), |_| {}).unwrap();
    reactor.set_max_fds(Some(0)).unwrap();
    assert_eq!(reactor.active_count(), 0);

    reactor.set_max_fds(Some(1)).unwrap();
    reactor.attach_fd(a.as_raw_fd(), Ready::read(), |_| {}).unwrap();
    assert!(matches!(
        reactor.attach_fd(b.as_raw_fd(), Ready::read(), |_| {}),
        Err(Error::TooManyDescriptors)
    ));

    reactor.set_max_fds(None).unwrap();
    reactor.attach_fd(b.as_raw_fd(), Ready::read(), |_| {}).unwrap();
    assert_eq!(reactor.active_count(), 2);
}

#[test]
fn switch_method_preserves_records() {
    init_logger();

    let reactor = Reactor::with_method(Method::Select).unwrap();
    let (a, b) = UnixStream::pair().unwrap();

    reactor.attach_fd(a.as_raw_fd(), Ready::read(), |_| {}).unwrap();
    reactor
        .attach_fd(b.as_raw_fd(), Ready::read() | Ready::write(), |_| {})
        .unwrap();
    assert_eq!(reactor.active_count(), 2);

    reactor.set_method(Method::Poll).unwrap();
    assert_eq!(reactor.method(), Method::Poll);
    assert_eq!(reactor.active_count(), 2);
    assert_eq!(
        reactor.lookup(b.as_raw_fd()),
        Some(Ready::read() | Ready::write())
    );
}

#[test]
fn foreign_thread_attach_dispatches_on_owner() {
    init_logger();

    let reactor = Reactor::new().unwrap();

    let owner_tid = Arc::new(Mutex::new(None));
    let handler_tid = Arc::new(Mutex::new(None));

    let (mut a, b) = UnixStream::pair().unwrap();
    b.set_nonblocking(true).unwrap();
    let bfd = b.as_raw_fd();

    let r = reactor.clone();
    let owner_tid2 = owner_tid.clone();
    let owner = thread::spawn(move || {
        *owner_tid2.lock().unwrap() = Some(thread::current().id());
        r.run().unwrap();
    });

    while !reactor.is_polling() {
        thread::sleep(Duration::from_millis(1));
    }

    // worker enters, attaches, leaves; the owner keeps dispatching
    let handler_tid2 = handler_tid.clone();
    let r2 = reactor.clone();
    {
        let mut guard = reactor.enter();
        guard
            .attach_fd(bfd, Ready::read(), move |_| {
                *handler_tid2.lock().unwrap() = Some(thread::current().id());
                let _ = r2.detach_fd(bfd);
                r2.cancel();
            })
            .unwrap();
    }

    a.write_all(b"x").unwrap();
    owner.join().unwrap();

    let owner_tid = owner_tid.lock().unwrap();
    let handler_tid = handler_tid.lock().unwrap();
    assert!(handler_tid.is_some());
    assert_eq!(*handler_tid, *owner_tid);

    drop(b);
}

#[test]
fn signal_delivered_between_passes() {
    init_logger();

    let reactor = Reactor::new().unwrap();
    let got: Arc<Mutex<Option<i32>>> = Arc::new(Mutex::new(None));

    reactor.set_timer(Duration::from_millis(20), || unsafe {
        libc::raise(libc::SIGTERM);
    });
    // failsafe so a missed signal fails the assert instead of hanging
    let r = reactor.clone();
    reactor.set_timer(Duration::from_millis(2000), move || r.cancel());

    let got2 = got.clone();
    let r = reactor.clone();
    reactor
        .run_with_signals(move |sig| {
            *got2.lock().unwrap() = Some(sig);
            r.cancel();
        })
        .unwrap();

    assert_eq!(*got.lock().unwrap(), Some(libc::SIGTERM));
}

#[test]
fn handler_reattach_during_dispatch() {
    init_logger();

    let reactor = Reactor::new().unwrap();
    let (mut a, b) = UnixStream::pair().unwrap();
    b.set_nonblocking(true).unwrap();
    let bfd = b.as_raw_fd();

    let hits = Arc::new(AtomicUsize::new(0));

    let r = reactor.clone();
    let hits2 = hits.clone();
    reactor
        .attach_fd(bfd, Ready::read(), move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
            // swap in a fresh handler from inside dispatch
            let r2 = r.clone();
            r.attach_fd(bfd, Ready::read(), move |_| {
                let _ = r2.detach_fd(bfd);
                r2.cancel();
            })
            .unwrap();
        })
        .unwrap();

    a.write_all(b"xy").unwrap();
    reactor.run().unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(reactor.active_count(), 0);
    drop(b);
}
