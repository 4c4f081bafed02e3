//! Integration tests: plain-TCP connections over a real poll loop.
//!
//! Each test binds a listener on 127.0.0.1:0, drives client and server
//! connections from one `PollRegistrar` on one thread, and asserts the
//! lifecycle the API promises.

use std::cell::{Cell, RefCell};
use std::io::{self, Read, Write};
use std::net::TcpListener;
use std::os::fd::IntoRawFd;
use std::rc::Rc;
use std::time::Duration;

use wireline::{ConnState, Connection, Error, PollRegistrar, TcpConnection};

const TICK: Duration = Duration::from_millis(20);
const MAX_ROUNDS: usize = 500;

fn bind_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Accept one inbound socket, non-blocking.
fn try_accept(listener: &TcpListener, registrar: &Rc<PollRegistrar>) -> Option<Rc<TcpConnection>> {
    match listener.accept() {
        Ok((stream, _addr)) => {
            stream.set_nonblocking(true).unwrap();
            Some(TcpConnection::new_accepted(
                registrar.clone(),
                stream.into_raw_fd(),
            ))
        }
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => None,
        Err(e) => panic!("accept failed: {e}"),
    }
}

/// Poll until `done` returns true, panicking after MAX_ROUNDS.
fn drive(registrar: &Rc<PollRegistrar>, mut step: impl FnMut() -> bool) {
    for _ in 0..MAX_ROUNDS {
        if step() {
            return;
        }
        registrar.poll(Some(TICK)).unwrap();
    }
    panic!("test did not converge");
}

#[test]
fn echo_ping_pong() {
    let registrar = Rc::new(PollRegistrar::new());
    let (listener, port) = bind_listener();

    let connects = Rc::new(Cell::new(0u32));
    let response = Rc::new(RefCell::new(Vec::new()));

    let client = TcpConnection::new(registrar.clone());
    {
        let connects = connects.clone();
        let response = response.clone();
        client
            .connect(
                "127.0.0.1",
                port,
                None,
                Rc::new(move |conn| {
                    connects.set(connects.get() + 1);
                    assert_eq!(conn.state(), ConnState::Connected);
                    assert_eq!(conn.write(b"PING\r\n").unwrap(), 6);

                    let response = response.clone();
                    conn.set_read_handler(Some(Rc::new(move |conn| {
                        let mut buf = [0u8; 64];
                        match conn.read(&mut buf) {
                            Ok(0) => {}
                            Ok(n) => response.borrow_mut().extend_from_slice(&buf[..n]),
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                            Err(e) => panic!("client read: {e}"),
                        }
                    })));
                }),
            )
            .unwrap();
    }

    let server: Rc<RefCell<Option<Rc<TcpConnection>>>> = Rc::new(RefCell::new(None));
    drive(&registrar, || {
        if server.borrow().is_none() {
            if let Some(conn) = try_accept(&listener, &registrar) {
                conn.accept(Rc::new(|conn| {
                    assert_eq!(conn.state(), ConnState::Connected);
                    conn.set_read_handler(Some(Rc::new(|conn| {
                        let mut buf = [0u8; 64];
                        match conn.read(&mut buf) {
                            Ok(0) => conn.close(false),
                            Ok(n) => {
                                assert_eq!(&buf[..n], b"PING\r\n");
                                assert_eq!(conn.write(b"PONG\r\n").unwrap(), 6);
                            }
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                            Err(e) => panic!("server read: {e}"),
                        }
                    })));
                }))
                .unwrap();
                *server.borrow_mut() = Some(conn);
            }
        }
        response.borrow().len() >= 6
    });

    assert_eq!(connects.get(), 1, "connect handler must fire exactly once");
    assert_eq!(response.borrow().as_slice(), b"PONG\r\n");

    // Orderly teardown: both ends observe the close.
    client.close(false);
    assert_eq!(client.fd(), -1);
    let server = server.borrow().clone().unwrap();
    drive(&registrar, || server.fd() == -1);
}

#[test]
fn peer_close_yields_zero_then_write_fails() {
    let registrar = Rc::new(PollRegistrar::new());
    let (listener, port) = bind_listener();

    let client = TcpConnection::new(registrar.clone());
    let connected = Rc::new(Cell::new(false));
    {
        let connected = connected.clone();
        client
            .connect(
                "127.0.0.1",
                port,
                None,
                Rc::new(move |_conn| connected.set(true)),
            )
            .unwrap();
    }

    let server: Rc<RefCell<Option<Rc<TcpConnection>>>> = Rc::new(RefCell::new(None));
    drive(&registrar, || {
        if server.borrow().is_none() {
            *server.borrow_mut() = try_accept(&listener, &registrar);
        }
        connected.get() && server.borrow().is_some()
    });

    // Server vanishes; client should see a clean end-of-stream.
    server.borrow().as_ref().unwrap().close(true);

    let saw_eof = Rc::new(Cell::new(false));
    {
        let saw_eof = saw_eof.clone();
        client.set_read_handler(Some(Rc::new(move |conn| {
            let mut buf = [0u8; 16];
            match conn.read(&mut buf) {
                Ok(0) => saw_eof.set(true),
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => panic!("read: {e}"),
            }
        })));
    }
    drive(&registrar, || saw_eof.get());

    assert_eq!(client.state(), ConnState::Closed);
    assert!(client.write(b"late").is_err());
    client.close(false);
}

#[test]
fn connect_in_wrong_state_is_rejected() {
    let registrar = Rc::new(PollRegistrar::new());
    let (_listener, port) = bind_listener();

    let client = TcpConnection::new(registrar.clone());
    client
        .connect("127.0.0.1", port, None, Rc::new(|_conn| {}))
        .unwrap();
    assert_eq!(client.state(), ConnState::Connecting);

    // A second connect must fail without touching the state.
    let result = client.connect("127.0.0.1", port, None, Rc::new(|_conn| {}));
    assert!(matches!(result, Err(Error::InvalidState(ConnState::Connecting))));
    assert_eq!(client.state(), ConnState::Connecting);
    client.close(false);
}

#[test]
fn blocking_connect_and_sync_io() {
    let registrar = Rc::new(PollRegistrar::new());
    let (listener, port) = bind_listener();

    let client = TcpConnection::new(registrar.clone());
    client
        .blocking_connect("127.0.0.1", port, Duration::from_secs(2))
        .unwrap();
    assert_eq!(client.state(), ConnState::Connected);

    let (mut stream, _) = listener.accept().unwrap();

    let timeout = Duration::from_secs(2);
    assert_eq!(client.sync_write(b"HELLO\r\n", timeout).unwrap(), 7);

    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"HELLO\r\n");

    stream.write_all(b"OK\r\n").unwrap();
    let mut line = [0u8; 32];
    let n = client.sync_readline(&mut line, timeout).unwrap();
    assert_eq!(&line[..n], b"OK");

    client.close(false);
}

#[test]
fn blocking_connect_refused() {
    let registrar = Rc::new(PollRegistrar::new());

    // Nothing listens on loopback port 1.
    let client = TcpConnection::new(registrar);
    let result = client.blocking_connect("127.0.0.1", 1, Duration::from_secs(2));
    assert!(result.is_err());
    assert_eq!(client.state(), ConnState::Error);
    assert!(client.last_error().is_some());
}

#[test]
fn close_inside_callback_is_safe() {
    let registrar = Rc::new(PollRegistrar::new());
    let (listener, port) = bind_listener();

    let client = TcpConnection::new(registrar.clone());
    let closed_inside = Rc::new(Cell::new(false));
    {
        let closed_inside = closed_inside.clone();
        client
            .connect(
                "127.0.0.1",
                port,
                None,
                Rc::new(move |conn| {
                    // Closing from inside the completion callback must not
                    // trip any further dispatch this event.
                    conn.close(false);
                    closed_inside.set(true);
                }),
            )
            .unwrap();
    }

    let server: Rc<RefCell<Option<Rc<TcpConnection>>>> = Rc::new(RefCell::new(None));
    drive(&registrar, || {
        if server.borrow().is_none() {
            *server.borrow_mut() = try_accept(&listener, &registrar);
        }
        closed_inside.get()
    });

    assert_eq!(client.fd(), -1);
}

#[test]
fn peer_addr_reports_listener() {
    let registrar = Rc::new(PollRegistrar::new());
    let (listener, port) = bind_listener();

    let client = TcpConnection::new(registrar.clone());
    client
        .blocking_connect("127.0.0.1", port, Duration::from_secs(2))
        .unwrap();
    let _ = listener.accept().unwrap();

    let peer = client.peer_addr().unwrap();
    assert_eq!(peer.port(), port);
    assert!(peer.ip().is_loopback());

    client.set_tcp_nodelay(true).unwrap();
    client.set_keep_alive(30).unwrap();

    client.close(false);
    assert!(client.peer_addr().is_err());
}
