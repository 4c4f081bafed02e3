//! Connection record and transport capability set.
//!
//! A connection is created for exactly one transport and keeps that
//! transport for its lifetime. The caller owns the record (an `Rc`); the
//! readiness registrar holds only a weak reference while interest is
//! registered. All state lives in `Cell`/`RefCell` because the model is
//! single-threaded cooperative: user callbacks may re-enter the API,
//! including closing their own connection, so nothing may hold a borrow
//! across a callback.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use crate::error::Error;
use crate::event::{EventSink, Interest, RegistrarHandle};
use crate::socket;

/// Connection lifecycle state. Progresses forward only:
/// `None -> {Connecting|Accepting} -> Connected -> {Closed|Error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Allocated, no socket yet.
    None,
    /// Outbound connect in flight; transport handshake not started.
    Connecting,
    /// Accepted fd attached; server-side handshake pending.
    Accepting,
    /// Ready for user-level read/write.
    Connected,
    /// Peer closed cleanly.
    Closed,
    /// Terminal failure; the last error is retained.
    Error,
}

/// Logical read/write/connect callback.
///
/// Slots compare by `Rc` identity: re-assigning the same handler is a no-op.
pub type ConnHandler = Rc<dyn Fn(&dyn Connection)>;

/// State shared by every transport: lifecycle, fd, error, handler slots.
///
/// Embedded by value in each concrete connection so base accessors need no
/// downcast.
pub struct ConnCore {
    registrar: RegistrarHandle,
    state: Cell<ConnState>,
    fd: Cell<RawFd>,
    last_errno: Cell<i32>,
    read_handler: RefCell<Option<ConnHandler>>,
    write_handler: RefCell<Option<ConnHandler>>,
    conn_handler: RefCell<Option<ConnHandler>>,
    private_data: RefCell<Option<Rc<dyn Any>>>,
}

impl ConnCore {
    pub(crate) fn new(registrar: RegistrarHandle) -> Self {
        ConnCore {
            registrar,
            state: Cell::new(ConnState::None),
            fd: Cell::new(-1),
            last_errno: Cell::new(0),
            read_handler: RefCell::new(None),
            write_handler: RefCell::new(None),
            conn_handler: RefCell::new(None),
            private_data: RefCell::new(None),
        }
    }

    pub(crate) fn new_accepted(registrar: RegistrarHandle, fd: RawFd) -> Self {
        let core = ConnCore::new(registrar);
        core.fd.set(fd);
        core.state.set(ConnState::Accepting);
        core
    }

    pub(crate) fn registrar(&self) -> &RegistrarHandle {
        &self.registrar
    }

    pub(crate) fn state(&self) -> ConnState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: ConnState) {
        self.state.set(state);
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd.get()
    }

    pub(crate) fn set_fd(&self, fd: RawFd) {
        self.fd.set(fd);
    }

    pub(crate) fn last_errno(&self) -> i32 {
        self.last_errno.get()
    }

    pub(crate) fn set_errno(&self, errno: i32) {
        self.last_errno.set(errno);
    }

    /// Record a fatal I/O error: errno + state transition.
    pub(crate) fn fail(&self, errno: i32) {
        self.last_errno.set(errno);
        self.state.set(ConnState::Error);
    }

    pub(crate) fn read_handler(&self) -> Option<ConnHandler> {
        self.read_handler.borrow().clone()
    }

    pub(crate) fn write_handler(&self) -> Option<ConnHandler> {
        self.write_handler.borrow().clone()
    }

    pub(crate) fn has_read_handler(&self) -> bool {
        self.read_handler.borrow().is_some()
    }

    pub(crate) fn has_write_handler(&self) -> bool {
        self.write_handler.borrow().is_some()
    }

    /// Store a handler slot. Returns false when the assignment is the
    /// identical handler (no registrar traffic should follow).
    pub(crate) fn store_read_handler(&self, handler: Option<ConnHandler>) -> bool {
        store_slot(&self.read_handler, handler)
    }

    pub(crate) fn store_write_handler(&self, handler: Option<ConnHandler>) -> bool {
        store_slot(&self.write_handler, handler)
    }

    pub(crate) fn set_conn_handler(&self, handler: Option<ConnHandler>) {
        *self.conn_handler.borrow_mut() = handler;
    }

    /// Pop the single-shot connect/accept handler. Cleared before it runs.
    pub(crate) fn take_conn_handler(&self) -> Option<ConnHandler> {
        self.conn_handler.borrow_mut().take()
    }

    /// Pop the write-handler slot (plain-TCP connect completion rides there).
    pub(crate) fn take_write_handler(&self) -> Option<ConnHandler> {
        self.write_handler.borrow_mut().take()
    }

    pub(crate) fn set_private_data(&self, data: Option<Rc<dyn Any>>) {
        *self.private_data.borrow_mut() = data;
    }

    pub(crate) fn private_data(&self) -> Option<Rc<dyn Any>> {
        self.private_data.borrow().clone()
    }

    /// Common close path: optional shutdown, deregister, close fd, clear
    /// slots so closures captured by handlers are released.
    pub(crate) fn close_socket(&self, do_shutdown: bool) {
        let fd = self.fd.get();
        if fd == -1 {
            return;
        }
        if do_shutdown {
            socket::shutdown(fd);
        }
        self.registrar.deregister(fd, Interest::READ | Interest::WRITE);
        socket::close(fd);
        self.fd.set(-1);
        self.read_handler.borrow_mut().take();
        self.write_handler.borrow_mut().take();
        self.conn_handler.borrow_mut().take();
        self.private_data.borrow_mut().take();
        crate::metrics::CONNECTIONS_CLOSED.increment();
    }

    /// Guard for accessors that need a live fd.
    pub(crate) fn require_fd(&self) -> io::Result<RawFd> {
        let fd = self.fd.get();
        if fd == -1 {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection is closed"));
        }
        Ok(fd)
    }
}

fn store_slot(slot: &RefCell<Option<ConnHandler>>, handler: Option<ConnHandler>) -> bool {
    let mut slot = slot.borrow_mut();
    let same = match (slot.as_ref(), handler.as_ref()) {
        (Some(a), Some(b)) => Rc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    };
    if same {
        return false;
    }
    *slot = handler;
    true
}

/// Invoke a user callback, then report whether the connection survived it.
///
/// Callbacks may close their own connection; dispatch loops must stop when
/// this returns false and must not touch the registrar for the dead fd.
pub(crate) fn call_handler(conn: &dyn Connection, handler: &ConnHandler) -> bool {
    handler(conn);
    conn.core().fd() != -1
}

/// The transport capability set: everything a concrete transport must
/// provide, plus base accessors shared through [`ConnCore`].
///
/// Byte-count operations follow one convention: `Ok(n)` bytes transferred,
/// `Ok(0)` peer closed cleanly, `Err(WouldBlock)` retry after the next
/// readiness event, any other `Err` is fatal and the connection has
/// transitioned to [`ConnState::Error`].
pub trait Connection: EventSink {
    /// The embedded shared record.
    fn core(&self) -> &ConnCore;

    /// Initiate a non-blocking connect. `on_done` fires exactly once, when
    /// the connection reaches [`ConnState::Connected`] or
    /// [`ConnState::Error`]; it is cleared before it runs.
    fn connect(
        &self,
        host: &str,
        port: u16,
        source: Option<&str>,
        on_done: ConnHandler,
    ) -> Result<(), Error>;

    /// Synchronous connect used by bootstrap paths. The timeout applies to
    /// the socket-level connect and each handshake syscall, not the total.
    fn blocking_connect(&self, host: &str, port: u16, timeout: Duration) -> Result<(), Error>;

    /// Advance an [`ConnState::Accepting`] connection. `on_done` may fire
    /// synchronously when no further handshake is required, or later from
    /// the event handler. The state is [`ConnState::Connected`] when it runs.
    fn accept(&self, on_done: ConnHandler) -> Result<(), Error>;

    /// Non-blocking read into `buf`.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Non-blocking write of `buf`.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Register interest in readability. `None` clears the slot and drops
    /// physical interest once the transport has no internal need for it.
    fn set_read_handler(&self, handler: Option<ConnHandler>);

    /// Register interest in writability. Same clearing rule as reads.
    fn set_write_handler(&self, handler: Option<ConnHandler>);

    /// Blocking read with a per-syscall timeout (bootstrap paths only).
    fn sync_read(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Blocking write with a per-syscall timeout (bootstrap paths only).
    fn sync_write(&self, buf: &[u8], timeout: Duration) -> io::Result<usize>;

    /// Blocking line read: consumes through `\n`, strips a trailing `\r`,
    /// returns the line length written into `buf`.
    fn sync_readline(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Orderly close: releases transport resources, deregisters, closes the
    /// fd. The record is inert afterwards; every operation fails.
    fn close(&self, do_shutdown: bool);

    /// Transport-level shutdown signal without releasing the record
    /// (close_notify for TLS, `SHUT_RDWR` for TCP).
    fn shutdown(&self);

    /// Human-readable last error, engine-specific where one exists.
    fn last_error(&self) -> Option<String>;

    // ── Base accessors ─────────────────────────────────────────────────

    /// Current lifecycle state.
    fn state(&self) -> ConnState {
        self.core().state()
    }

    /// The owned fd, or -1 after close.
    fn fd(&self) -> RawFd {
        self.core().fd()
    }

    /// Whether a read handler is installed.
    fn has_read_handler(&self) -> bool {
        self.core().has_read_handler()
    }

    /// Whether a write handler is installed.
    fn has_write_handler(&self) -> bool {
        self.core().has_write_handler()
    }

    /// Peer address of the connected socket.
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        socket::peer_addr(self.core().require_fd()?)
    }

    /// Pending socket-level error (SO_ERROR), or 0.
    fn socket_error(&self) -> i32 {
        match self.core().require_fd() {
            Ok(fd) => socket::socket_error(fd),
            Err(_) => 0,
        }
    }

    /// Attach opaque caller data. Stored, never inspected.
    fn set_private_data(&self, data: Option<Rc<dyn Any>>) {
        self.core().set_private_data(data);
    }

    /// The opaque caller data, if any.
    fn private_data(&self) -> Option<Rc<dyn Any>> {
        self.core().private_data()
    }

    /// Switch the socket between blocking and non-blocking mode.
    fn set_blocking(&self, blocking: bool) -> io::Result<()> {
        socket::set_nonblocking(self.core().require_fd()?, !blocking)
    }

    /// Toggle TCP_NODELAY.
    fn set_tcp_nodelay(&self, enabled: bool) -> io::Result<()> {
        socket::set_tcp_nodelay(self.core().require_fd()?, enabled)
    }

    /// Enable keepalive probing every `interval` seconds.
    fn set_keep_alive(&self, interval: u32) -> io::Result<()> {
        socket::set_keep_alive(self.core().require_fd()?, interval)
    }

    /// Set the socket send timeout. `Duration::ZERO` clears it.
    fn set_send_timeout(&self, timeout: Duration) -> io::Result<()> {
        socket::set_send_timeout(self.core().require_fd()?, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Registrar;
    use std::rc::Weak;

    struct NullRegistrar;

    impl Registrar for NullRegistrar {
        fn register(&self, _fd: RawFd, _interest: Interest, _sink: Weak<dyn EventSink>) {}
        fn deregister(&self, _fd: RawFd, _interest: Interest) {}
        fn registered(&self, _fd: RawFd) -> Interest {
            Interest::NONE
        }
    }

    fn handler() -> ConnHandler {
        Rc::new(|_conn: &dyn Connection| {})
    }

    #[test]
    fn slot_identity() {
        let slot = RefCell::new(None);
        let h = handler();

        assert!(store_slot(&slot, Some(h.clone())));
        // Same Rc again: no-op.
        assert!(!store_slot(&slot, Some(h.clone())));
        // A different handler replaces it.
        assert!(store_slot(&slot, Some(handler())));
        // Clearing is a change, clearing twice is not.
        assert!(store_slot(&slot, None));
        assert!(!store_slot(&slot, None));
    }

    #[test]
    fn core_records_failures() {
        let core = ConnCore::new(Rc::new(NullRegistrar));
        assert_eq!(core.state(), ConnState::None);
        assert_eq!(core.fd(), -1);
        assert!(core.require_fd().is_err());

        core.fail(libc::ECONNRESET);
        assert_eq!(core.state(), ConnState::Error);
        assert_eq!(core.last_errno(), libc::ECONNRESET);
    }

    #[test]
    fn accepted_core_starts_accepting() {
        let core = ConnCore::new_accepted(Rc::new(NullRegistrar), 42);
        assert_eq!(core.state(), ConnState::Accepting);
        assert_eq!(core.fd(), 42);
        // Not a real socket: clear the fd instead of closing it.
        core.set_fd(-1);
    }
}
