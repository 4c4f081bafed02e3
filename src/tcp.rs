//! Plain TCP transport.
//!
//! Logical readiness equals physical readiness here: handler registration
//! maps one-to-one onto registrar interest, and the event handler dispatches
//! straight to the user callbacks.

use std::io;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::connection::{call_handler, ConnCore, ConnHandler, ConnState, Connection};
use crate::error::Error;
use crate::event::{sink_of, EventSink, Interest, RegistrarHandle};
use crate::metrics;
use crate::socket;
use crate::sync_io;

/// A connection over a plain socket.
pub struct TcpConnection {
    core: ConnCore,
    weak: Weak<TcpConnection>,
}

impl TcpConnection {
    /// Create an unconnected record. Follow with [`Connection::connect`] or
    /// [`Connection::blocking_connect`].
    pub fn new(registrar: RegistrarHandle) -> Rc<TcpConnection> {
        Rc::new_cyclic(|weak| TcpConnection {
            core: ConnCore::new(registrar),
            weak: weak.clone(),
        })
    }

    /// Wrap an fd that was already accepted from a listener. The connection
    /// starts in [`ConnState::Accepting`]; follow with [`Connection::accept`].
    pub fn new_accepted(registrar: RegistrarHandle, fd: RawFd) -> Rc<TcpConnection> {
        metrics::CONNECTIONS_ACCEPTED.increment();
        Rc::new_cyclic(|weak| TcpConnection {
            core: ConnCore::new_accepted(registrar, fd),
            weak: weak.clone(),
        })
    }

    fn register(&self, interest: Interest) {
        let fd = self.core.fd();
        if fd != -1 {
            self.core.registrar().register(fd, interest, sink_of(&self.weak));
        }
    }

    fn deregister(&self, interest: Interest) {
        let fd = self.core.fd();
        if fd != -1 {
            self.core.registrar().deregister(fd, interest);
        }
    }

    /// Outbound connect completion: resolve SO_ERROR, transition, and fire
    /// the single-shot handler parked in the write slot.
    fn finish_connect(&self) -> bool {
        let err = socket::socket_error(self.core.fd());
        if err != 0 {
            self.core.fail(err);
        } else {
            self.core.set_state(ConnState::Connected);
            metrics::CONNECTIONS_ESTABLISHED.increment();
        }

        // Pop before invoking: the callback may install a fresh write
        // handler, which must survive this event.
        if let Some(handler) = self.core.take_write_handler() {
            self.deregister(Interest::WRITE);
            return call_handler(self, &handler);
        }
        true
    }
}

impl EventSink for TcpConnection {
    fn on_ready(&self, ready: Interest) {
        if self.core.state() == ConnState::Connecting && ready.writable() {
            if self.core.has_write_handler() && !self.finish_connect() {
                return;
            }
        }

        if ready.readable() {
            if let Some(handler) = self.core.read_handler() {
                if !call_handler(self, &handler) {
                    return;
                }
            }
        }
        if ready.writable() {
            if let Some(handler) = self.core.write_handler() {
                call_handler(self, &handler);
            }
        }
    }
}

impl Connection for TcpConnection {
    fn core(&self) -> &ConnCore {
        &self.core
    }

    fn connect(
        &self,
        host: &str,
        port: u16,
        source: Option<&str>,
        on_done: ConnHandler,
    ) -> Result<(), Error> {
        if self.core.state() != ConnState::None {
            return Err(Error::InvalidState(self.core.state()));
        }

        let addr = socket::resolve(host, port).map_err(|_| Error::Resolve(host.to_string()))?;
        let src = source.and_then(|s| socket::resolve(s, 0).ok());

        let fd = match socket::start_connect(addr, src) {
            Ok(fd) => fd,
            Err(e) => {
                self.core.fail(e.raw_os_error().unwrap_or(0));
                return Err(Error::Io(e));
            }
        };

        self.core.set_fd(fd);
        self.core.set_state(ConnState::Connecting);
        metrics::CONNECTS_INITIATED.increment();

        // The completion rides the write slot as a single-shot handler.
        self.core.store_write_handler(Some(on_done));
        self.register(Interest::WRITE);
        Ok(())
    }

    fn blocking_connect(&self, host: &str, port: u16, timeout: Duration) -> Result<(), Error> {
        if self.core.state() != ConnState::None {
            return Err(Error::InvalidState(self.core.state()));
        }

        let addr = socket::resolve(host, port).map_err(|_| Error::Resolve(host.to_string()))?;
        let fd = match socket::start_connect(addr, None) {
            Ok(fd) => fd,
            Err(e) => {
                self.core.fail(e.raw_os_error().unwrap_or(0));
                return Err(Error::Io(e));
            }
        };
        self.core.set_fd(fd);

        match socket::wait_writable(fd, timeout) {
            Ok(true) => {}
            Ok(false) => {
                self.core.fail(libc::ETIMEDOUT);
                return Err(Error::ConnectTimedOut);
            }
            Err(e) => {
                self.core.fail(e.raw_os_error().unwrap_or(0));
                return Err(Error::Io(e));
            }
        }
        let err = socket::socket_error(fd);
        if err != 0 {
            self.core.fail(err);
            return Err(Error::Io(io::Error::from_raw_os_error(err)));
        }

        self.core.set_state(ConnState::Connected);
        metrics::CONNECTIONS_ESTABLISHED.increment();
        Ok(())
    }

    fn accept(&self, on_done: ConnHandler) -> Result<(), Error> {
        if self.core.state() != ConnState::Accepting {
            return Err(Error::InvalidState(self.core.state()));
        }
        // No transport handshake: connected as soon as the caller asks.
        self.core.set_state(ConnState::Connected);
        metrics::CONNECTIONS_ESTABLISHED.increment();
        call_handler(self, &on_done);
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.core.state() != ConnState::Connected {
            return Err(io::ErrorKind::NotConnected.into());
        }
        match socket::read(self.core.fd(), buf) {
            Ok(0) if !buf.is_empty() => {
                self.core.set_state(ConnState::Closed);
                Ok(0)
            }
            Ok(n) => {
                metrics::BYTES_RECEIVED.add(n as u64);
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(e),
            Err(e) => {
                self.core.fail(e.raw_os_error().unwrap_or(0));
                Err(e)
            }
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.core.state() != ConnState::Connected {
            return Err(io::ErrorKind::NotConnected.into());
        }
        match socket::write(self.core.fd(), buf) {
            Ok(n) => {
                metrics::BYTES_SENT.add(n as u64);
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(e),
            Err(e) => {
                self.core.fail(e.raw_os_error().unwrap_or(0));
                Err(e)
            }
        }
    }

    fn set_read_handler(&self, handler: Option<ConnHandler>) {
        if !self.core.store_read_handler(handler) {
            return;
        }
        if self.core.has_read_handler() {
            self.register(Interest::READ);
        } else {
            self.deregister(Interest::READ);
        }
    }

    fn set_write_handler(&self, handler: Option<ConnHandler>) {
        if !self.core.store_write_handler(handler) {
            return;
        }
        if self.core.has_write_handler() {
            self.register(Interest::WRITE);
        } else {
            self.deregister(Interest::WRITE);
        }
    }

    fn sync_read(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        sync_io::sync_read(self.core.require_fd()?, buf, timeout)
    }

    fn sync_write(&self, buf: &[u8], timeout: Duration) -> io::Result<usize> {
        sync_io::sync_write(self.core.require_fd()?, buf, timeout)
    }

    fn sync_readline(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        sync_io::sync_readline(self.core.require_fd()?, buf, timeout)
    }

    fn close(&self, do_shutdown: bool) {
        self.core.close_socket(do_shutdown);
    }

    fn shutdown(&self) {
        if let Ok(fd) = self.core.require_fd() {
            socket::shutdown(fd);
        }
    }

    fn last_error(&self) -> Option<String> {
        let errno = self.core.last_errno();
        if errno == 0 {
            return None;
        }
        Some(io::Error::from_raw_os_error(errno).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Registrar;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// Records registrar traffic so interest bookkeeping can be asserted.
    #[derive(Default)]
    struct RecordingRegistrar {
        masks: RefCell<HashMap<RawFd, Interest>>,
        calls: RefCell<Vec<(RawFd, &'static str, Interest)>>,
    }

    impl Registrar for RecordingRegistrar {
        fn register(&self, fd: RawFd, interest: Interest, _sink: std::rc::Weak<dyn EventSink>) {
            let mut masks = self.masks.borrow_mut();
            let mask = masks.entry(fd).or_default();
            *mask |= interest;
            self.calls.borrow_mut().push((fd, "register", interest));
        }

        fn deregister(&self, fd: RawFd, interest: Interest) {
            let mut masks = self.masks.borrow_mut();
            if let Some(mask) = masks.get_mut(&fd) {
                *mask = mask.without(interest);
            }
            self.calls.borrow_mut().push((fd, "deregister", interest));
        }

        fn registered(&self, fd: RawFd) -> Interest {
            self.masks.borrow().get(&fd).copied().unwrap_or_default()
        }
    }

    fn pipe_fd() -> RawFd {
        // A socketpair end stands in for an accepted connection.
        let mut fds = [0i32; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        socket::close(fds[1]);
        fds[0]
    }

    #[test]
    fn handler_idempotence() {
        let registrar = Rc::new(RecordingRegistrar::default());
        let conn = TcpConnection::new_accepted(registrar.clone(), pipe_fd());
        conn.accept(Rc::new(|_| {})).unwrap();

        let handler: ConnHandler = Rc::new(|_conn: &dyn Connection| {});
        conn.set_read_handler(Some(handler.clone()));
        conn.set_read_handler(Some(handler.clone()));

        let registers = registrar
            .calls
            .borrow()
            .iter()
            .filter(|(_, op, i)| *op == "register" && i.readable())
            .count();
        assert_eq!(registers, 1);
        conn.close(false);
    }

    #[test]
    fn clearing_handler_deregisters() {
        let registrar = Rc::new(RecordingRegistrar::default());
        let conn = TcpConnection::new_accepted(registrar.clone(), pipe_fd());
        conn.accept(Rc::new(|_| {})).unwrap();
        let fd = conn.fd();

        conn.set_write_handler(Some(Rc::new(|_conn: &dyn Connection| {})));
        assert!(registrar.registered(fd).writable());
        conn.set_write_handler(None);
        assert!(!registrar.registered(fd).writable());
        conn.close(false);
    }

    #[test]
    fn accept_requires_accepting_state() {
        let registrar = Rc::new(RecordingRegistrar::default());
        let conn = TcpConnection::new(registrar);
        assert!(matches!(
            conn.accept(Rc::new(|_| {})),
            Err(Error::InvalidState(ConnState::None))
        ));
    }

    #[test]
    fn accept_state_visible_to_handler() {
        let registrar = Rc::new(RecordingRegistrar::default());
        let conn = TcpConnection::new_accepted(registrar, pipe_fd());
        let seen = Rc::new(RefCell::new(None));
        let seen2 = seen.clone();
        conn.accept(Rc::new(move |c: &dyn Connection| {
            *seen2.borrow_mut() = Some(c.state());
        }))
        .unwrap();
        assert_eq!(*seen.borrow(), Some(ConnState::Connected));
        conn.close(false);
    }

    #[test]
    fn close_clears_fd_and_interest() {
        let registrar = Rc::new(RecordingRegistrar::default());
        let conn = TcpConnection::new_accepted(registrar.clone(), pipe_fd());
        conn.accept(Rc::new(|_| {})).unwrap();
        let fd = conn.fd();
        conn.set_read_handler(Some(Rc::new(|_conn: &dyn Connection| {})));

        conn.close(false);
        assert_eq!(conn.fd(), -1);
        assert!(registrar.registered(fd).is_empty());
        assert!(conn.read(&mut [0u8; 4]).is_err());
    }
}
