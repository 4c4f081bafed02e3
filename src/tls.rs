//! TLS transport.
//!
//! A TLS connection wraps an in-memory rustls session over the same
//! non-blocking socket the plain transport uses. The complication is that a
//! logical operation can block on the opposite physical direction: a read
//! may need the socket writable (the engine has records to emit first) and a
//! write may need it readable. Two inversion bits on the connection record
//! which logical handler to re-dispatch when the opposite event fires:
//!
//! - `read_want_write`: a read returned would-block waiting for writability.
//! - `write_want_read`: a write returned would-block waiting for readability.
//!
//! Physical interest is recomputed after every engine call as the union of
//! the user-requested directions, the inversion bits, and any ciphertext the
//! engine still has to flush. During a handshake only the single direction
//! the engine asked for is registered, bypassing that reconciliation.

use std::cell::{Cell, RefCell};
use std::fs;
use std::io::{self, Read as _, Write as _};
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConnection, RootCertStore, ServerConnection};

use crate::connection::{call_handler, ConnCore, ConnHandler, ConnState, Connection};
use crate::error::Error;
use crate::event::{sink_of, EventSink, Interest, RegistrarHandle};
use crate::metrics;
use crate::socket;
use crate::sync_io::{read_line_with, BlockingGuard};

/// Cap on plaintext the engine will buffer for an in-flight write; beyond
/// this, writes report would-block instead of growing without bound.
const PLAINTEXT_BUFFER_LIMIT: usize = 64 * 1024;

// ── Context configuration ───────────────────────────────────────────────

/// File paths for [`configure`]. Certificate, key, and CA bundle are
/// required; the CA bundle verifies peers in both directions.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// PEM certificate chain, presented to peers and used as the client
    /// certificate on outbound connections.
    pub cert_file: PathBuf,
    /// PEM private key for `cert_file`.
    pub key_file: PathBuf,
    /// PEM CA bundle used to verify peer certificates.
    pub ca_cert_file: PathBuf,
    /// Optional PEM DH parameters. Validated for compatibility with older
    /// configurations; the engine negotiates its own key-exchange groups.
    pub dh_params_file: Option<PathBuf>,
}

/// An installed TLS context. Connections snapshot the current context at
/// creation time, so reconfiguration never disturbs live connections.
pub struct TlsContext {
    server_required_auth: Arc<rustls::ServerConfig>,
    server_optional_auth: Arc<rustls::ServerConfig>,
    client: Arc<rustls::ClientConfig>,
}

fn context_slot() -> &'static Mutex<Option<Arc<TlsContext>>> {
    static SLOT: OnceLock<Mutex<Option<Arc<TlsContext>>>> = OnceLock::new();
    SLOT.get_or_init(|| Mutex::new(None))
}

fn current_context() -> Option<Arc<TlsContext>> {
    context_slot().lock().expect("TLS context lock").clone()
}

/// Install a new process-wide TLS context from `options`.
///
/// Atomic: the context is fully built before it replaces the previous one,
/// and any failure leaves the previous context in place. Applies to TLS
/// connections created after this call.
pub fn configure(options: &TlsOptions) -> Result<(), Error> {
    let context = build_context(options)?;
    *context_slot().lock().expect("TLS context lock") = Some(Arc::new(context));
    Ok(())
}

/// Whether a TLS context has been installed.
pub fn is_configured() -> bool {
    current_context().is_some()
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = fs::File::open(path)
        .map_err(|e| Error::TlsSetup(format!("{}: {e}", path.display())))?;
    let mut reader = io::BufReader::new(file);
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|e| Error::TlsSetup(format!("{}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(Error::TlsSetup(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    let file = fs::File::open(path)
        .map_err(|e| Error::TlsSetup(format!("{}: {e}", path.display())))?;
    let mut reader = io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::TlsSetup(format!("{}: {e}", path.display())))?
        .ok_or_else(|| Error::TlsSetup(format!("{}: no private key found", path.display())))
}

fn build_context(options: &TlsOptions) -> Result<TlsContext, Error> {
    let certs = load_certs(&options.cert_file)?;
    let key = load_key(&options.key_file)?;

    let mut roots = RootCertStore::empty();
    for ca in load_certs(&options.ca_cert_file)? {
        roots.add(ca).map_err(|e| {
            Error::TlsSetup(format!("{}: {e}", options.ca_cert_file.display()))
        })?;
    }
    let roots = Arc::new(roots);

    if let Some(path) = &options.dh_params_file {
        let pem = fs::read_to_string(path)
            .map_err(|e| Error::TlsSetup(format!("{}: {e}", path.display())))?;
        if !pem.contains("-----BEGIN") {
            return Err(Error::TlsSetup(format!(
                "{}: not a PEM file",
                path.display()
            )));
        }
    }

    let required = WebPkiClientVerifier::builder(roots.clone())
        .build()
        .map_err(|e| Error::TlsSetup(e.to_string()))?;
    let optional = WebPkiClientVerifier::builder(roots.clone())
        .allow_unauthenticated()
        .build()
        .map_err(|e| Error::TlsSetup(e.to_string()))?;

    let server_required_auth = rustls::ServerConfig::builder()
        .with_client_cert_verifier(required)
        .with_single_cert(certs.clone(), key.clone_key())
        .map_err(|e| Error::TlsSetup(e.to_string()))?;
    let server_optional_auth = rustls::ServerConfig::builder()
        .with_client_cert_verifier(optional)
        .with_single_cert(certs.clone(), key.clone_key())
        .map_err(|e| Error::TlsSetup(e.to_string()))?;

    let client = rustls::ClientConfig::builder()
        .with_root_certificates(roots.clone())
        .with_client_auth_cert(certs, key)
        .map_err(|e| Error::TlsSetup(e.to_string()))?;

    Ok(TlsContext {
        server_required_auth: Arc::new(server_required_auth),
        server_optional_auth: Arc::new(server_optional_auth),
        client: Arc::new(client),
    })
}

// ── Engine ──────────────────────────────────────────────────────────────

/// TLS session kind — server (inbound) or client (outbound).
enum Engine {
    Client(ClientConnection),
    Server(ServerConnection),
}

impl Engine {
    fn read_tls(&mut self, rd: &mut dyn io::Read) -> io::Result<usize> {
        match self {
            Engine::Client(c) => c.read_tls(rd),
            Engine::Server(c) => c.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn io::Write) -> io::Result<usize> {
        match self {
            Engine::Client(c) => c.write_tls(wr),
            Engine::Server(c) => c.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            Engine::Client(c) => c.process_new_packets(),
            Engine::Server(c) => c.process_new_packets(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            Engine::Client(c) => c.reader(),
            Engine::Server(c) => c.reader(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            Engine::Client(c) => c.writer(),
            Engine::Server(c) => c.writer(),
        }
    }

    fn wants_read(&self) -> bool {
        match self {
            Engine::Client(c) => c.wants_read(),
            Engine::Server(c) => c.wants_read(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Engine::Client(c) => c.wants_write(),
            Engine::Server(c) => c.wants_write(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            Engine::Client(c) => c.is_handshaking(),
            Engine::Server(c) => c.is_handshaking(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            Engine::Client(c) => c.send_close_notify(),
            Engine::Server(c) => c.send_close_notify(),
        }
    }
}

/// Outcome of one engine call, after return-code translation.
enum EngineIo {
    /// Bytes transferred (possibly zero for handshake progress).
    Done(usize),
    /// Blocked until the socket is readable.
    WantRead,
    /// Blocked until the socket is writable.
    WantWrite,
    /// Peer ended the stream cleanly.
    Closed,
    /// Fatal; the error string has been stashed on the connection.
    Fatal,
}

/// io::Read/io::Write over the raw fd, for feeding the engine.
struct FdIo(RawFd);

impl io::Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        socket::read(self.0, buf)
    }
}

impl io::Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        socket::write(self.0, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ── Connection ──────────────────────────────────────────────────────────

/// A connection over a TLS session.
pub struct TlsConnection {
    core: ConnCore,
    weak: Weak<TlsConnection>,
    context: Arc<TlsContext>,
    engine: RefCell<Option<Engine>>,
    read_want_write: Cell<bool>,
    write_want_read: Cell<bool>,
    engine_error: RefCell<Option<String>>,
}

impl TlsConnection {
    /// Create an unconnected TLS record using the currently installed
    /// context. Follow with [`Connection::connect`] or
    /// [`Connection::blocking_connect`].
    pub fn new(registrar: RegistrarHandle) -> Result<Rc<TlsConnection>, Error> {
        let context = current_context().ok_or(Error::TlsNotConfigured)?;
        Ok(Rc::new_cyclic(|weak| TlsConnection {
            core: ConnCore::new(registrar),
            weak: weak.clone(),
            context,
            engine: RefCell::new(None),
            read_want_write: Cell::new(false),
            write_want_read: Cell::new(false),
            engine_error: RefCell::new(None),
        }))
    }

    /// Wrap an already-accepted fd. The server-side handshake starts when
    /// the caller invokes [`Connection::accept`]. With
    /// `require_client_auth`, peers without a certificate are rejected;
    /// otherwise a presented certificate is still verified.
    pub fn new_accepted(
        registrar: RegistrarHandle,
        fd: RawFd,
        require_client_auth: bool,
    ) -> Result<Rc<TlsConnection>, Error> {
        let context = current_context().ok_or(Error::TlsNotConfigured)?;
        let config = if require_client_auth {
            context.server_required_auth.clone()
        } else {
            context.server_optional_auth.clone()
        };
        let mut session =
            ServerConnection::new(config).map_err(|e| Error::Tls(e.to_string()))?;
        session.set_buffer_limit(Some(PLAINTEXT_BUFFER_LIMIT));

        metrics::CONNECTIONS_ACCEPTED.increment();
        Ok(Rc::new_cyclic(|weak| TlsConnection {
            core: ConnCore::new_accepted(registrar, fd),
            weak: weak.clone(),
            context,
            engine: RefCell::new(Some(Engine::Server(session))),
            read_want_write: Cell::new(false),
            write_want_read: Cell::new(false),
            engine_error: RefCell::new(None),
        }))
    }

    fn new_client_session(&self, host: &str) -> Result<Engine, Error> {
        let name = ServerName::try_from(host.to_string())
            .map_err(|_| Error::Tls(format!("invalid server name: {host}")))?;
        let mut session = ClientConnection::new(self.context.client.clone(), name)
            .map_err(|e| Error::Tls(e.to_string()))?;
        session.set_buffer_limit(Some(PLAINTEXT_BUFFER_LIMIT));
        Ok(Engine::Client(session))
    }

    // ── Error stash ────────────────────────────────────────────────────

    fn fatal_io(&self, err: io::Error) -> EngineIo {
        self.core.set_errno(err.raw_os_error().unwrap_or(0));
        *self.engine_error.borrow_mut() = Some(err.to_string());
        EngineIo::Fatal
    }

    fn fatal_engine(&self, err: rustls::Error) -> EngineIo {
        self.core.set_errno(0);
        *self.engine_error.borrow_mut() = Some(err.to_string());
        EngineIo::Fatal
    }

    fn fatal_msg(&self, msg: &str) -> EngineIo {
        self.core.set_errno(0);
        *self.engine_error.borrow_mut() = Some(msg.to_string());
        EngineIo::Fatal
    }

    fn stashed_error(&self) -> io::Error {
        match self.engine_error.borrow().as_deref() {
            Some(msg) => io::Error::other(msg.to_string()),
            None => io::Error::other("TLS failure"),
        }
    }

    // ── Engine driving ─────────────────────────────────────────────────

    /// Advance the handshake until it completes or blocks. Returns
    /// `Done(0)` on completion; `WantRead`/`WantWrite` name the single
    /// direction the engine is blocked on.
    fn drive_handshake(&self) -> EngineIo {
        let fd = self.core.fd();
        let mut slot = self.engine.borrow_mut();
        let engine = match slot.as_mut() {
            Some(engine) => engine,
            None => return self.fatal_msg("no TLS session"),
        };
        let mut sock = FdIo(fd);

        loop {
            while engine.wants_write() {
                match engine.write_tls(&mut sock) {
                    Ok(_) => {}
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return EngineIo::WantWrite;
                    }
                    Err(e) => return self.fatal_io(e),
                }
            }
            if !engine.is_handshaking() {
                return EngineIo::Done(0);
            }
            match engine.read_tls(&mut sock) {
                Ok(0) => return self.fatal_msg("connection closed during handshake"),
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return EngineIo::WantRead;
                }
                Err(e) => return self.fatal_io(e),
            }
            match engine.process_new_packets() {
                Ok(_) => {}
                Err(e) => {
                    // Push the alert out before surfacing the failure.
                    let _ = engine.write_tls(&mut sock);
                    return self.fatal_engine(e);
                }
            }
        }
    }

    /// One logical read against the engine.
    fn engine_read(&self, buf: &mut [u8]) -> EngineIo {
        if buf.is_empty() {
            return EngineIo::Done(0);
        }
        let fd = self.core.fd();
        let mut slot = self.engine.borrow_mut();
        let engine = match slot.as_mut() {
            Some(engine) => engine,
            None => return self.fatal_msg("no TLS session"),
        };
        let mut sock = FdIo(fd);

        loop {
            match engine.reader().read(buf) {
                Ok(0) => return EngineIo::Closed,
                Ok(n) => return EngineIo::Done(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return self.fatal_msg("peer closed without close_notify");
                }
                Err(e) => return self.fatal_io(e),
            }

            // No buffered plaintext; pull ciphertext from the socket.
            match engine.read_tls(&mut sock) {
                Ok(0) => return EngineIo::Closed,
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return EngineIo::WantRead;
                }
                Err(e) => return self.fatal_io(e),
            }
            match engine.process_new_packets() {
                Ok(_) => {}
                Err(e) => {
                    let _ = engine.write_tls(&mut sock);
                    return self.fatal_engine(e);
                }
            }
            // The records just consumed may oblige the engine to respond
            // before it releases plaintext.
            if engine.wants_write() {
                match engine.write_tls(&mut sock) {
                    Ok(_) => {}
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return EngineIo::WantWrite;
                    }
                    Err(e) => return self.fatal_io(e),
                }
            }
        }
    }

    /// One logical write against the engine. Reports the plaintext bytes
    /// accepted; unflushed ciphertext keeps WRITE interest armed through
    /// [`TlsConnection::update_event`].
    fn engine_write(&self, data: &[u8]) -> EngineIo {
        let fd = self.core.fd();
        let mut slot = self.engine.borrow_mut();
        let engine = match slot.as_mut() {
            Some(engine) => engine,
            None => return self.fatal_msg("no TLS session"),
        };
        let mut sock = FdIo(fd);

        // A handshake blocked on input inverts the write. An established
        // rustls session encrypts writes without needing input, so this
        // only triggers when the engine is still negotiating.
        if engine.is_handshaking() && engine.wants_read() && !engine.wants_write() {
            return EngineIo::WantRead;
        }

        let mut accepted = match engine.writer().write(data) {
            Ok(n) => n,
            Err(e) => return self.fatal_io(e),
        };

        loop {
            while engine.wants_write() {
                match engine.write_tls(&mut sock) {
                    Ok(_) => {}
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return if accepted == 0 {
                            EngineIo::WantWrite
                        } else {
                            EngineIo::Done(accepted)
                        };
                    }
                    Err(e) => return self.fatal_io(e),
                }
            }
            if accepted > 0 || data.is_empty() {
                return EngineIo::Done(accepted);
            }
            // Plaintext buffer was full; fully flushed now, so retry once.
            accepted = match engine.writer().write(data) {
                Ok(n) => n,
                Err(e) => return self.fatal_io(e),
            };
            if accepted == 0 {
                return EngineIo::WantWrite;
            }
        }
    }

    /// Best-effort flush of pending ciphertext (handshake tails, alerts).
    fn flush_output(&self) {
        let fd = self.core.fd();
        if fd == -1 {
            return;
        }
        if let Some(engine) = self.engine.borrow_mut().as_mut() {
            let mut sock = FdIo(fd);
            while engine.wants_write() {
                if engine.write_tls(&mut sock).is_err() {
                    break;
                }
            }
        }
    }

    // ── Readiness accounting ───────────────────────────────────────────

    /// Reconcile registrar interest with what the connection needs now:
    /// user handlers, inversion bits, and unflushed engine output.
    fn update_event(&self) {
        let fd = self.core.fd();
        if fd == -1 {
            return;
        }
        let engine_blocked_on_write = self
            .engine
            .borrow()
            .as_ref()
            .is_some_and(|engine| engine.wants_write());

        let need_read = self.core.has_read_handler() || self.write_want_read.get();
        let need_write = self.core.has_write_handler()
            || self.read_want_write.get()
            || engine_blocked_on_write;

        let mask = self.core.registrar().registered(fd);
        let registrar = self.core.registrar();

        if need_read && !mask.readable() {
            registrar.register(fd, Interest::READ, sink_of(&self.weak));
        }
        if !need_read && mask.readable() {
            registrar.deregister(fd, Interest::READ);
        }
        if need_write && !mask.writable() {
            registrar.register(fd, Interest::WRITE, sink_of(&self.weak));
        }
        if !need_write && mask.writable() {
            registrar.deregister(fd, Interest::WRITE);
        }
    }

    /// Register exactly the direction a handshake is blocked on. The
    /// opposite direction is dropped; logical-handler reconciliation does
    /// not apply while the engine owns the socket.
    fn register_want(&self, want: Interest) {
        let fd = self.core.fd();
        if fd == -1 {
            return;
        }
        let registrar = self.core.registrar();
        let mask = registrar.registered(fd);
        let other = if want.readable() {
            Interest::WRITE
        } else {
            Interest::READ
        };
        if mask.contains(other) {
            registrar.deregister(fd, other);
        }
        if !mask.contains(want) {
            registrar.register(fd, want, sink_of(&self.weak));
        }
    }

    /// Handshake step shared by the connecting and accepting states.
    /// Returns true when the handshake finished (either way) and the
    /// completion handler should fire.
    fn advance_handshake(&self) -> bool {
        match self.drive_handshake() {
            EngineIo::WantRead => {
                self.register_want(Interest::READ);
                false
            }
            EngineIo::WantWrite => {
                self.register_want(Interest::WRITE);
                false
            }
            EngineIo::Done(_) => {
                self.core.set_state(ConnState::Connected);
                metrics::CONNECTIONS_ESTABLISHED.increment();
                metrics::TLS_HANDSHAKES_COMPLETED.increment();
                true
            }
            EngineIo::Closed | EngineIo::Fatal => {
                self.core.set_state(ConnState::Error);
                metrics::TLS_HANDSHAKE_FAILURES.increment();
                true
            }
        }
    }

    fn blocking_engine_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.core.require_fd()?;
        let mut slot = self.engine.borrow_mut();
        let engine = slot
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let mut sock = FdIo(fd);

        loop {
            match engine.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            if engine.read_tls(&mut sock)? == 0 {
                return Ok(0);
            }
            engine
                .process_new_packets()
                .map_err(io::Error::other)?;
            // Blocking socket: flush any required response synchronously.
            while engine.wants_write() {
                engine.write_tls(&mut sock)?;
            }
        }
    }
}

impl EventSink for TlsConnection {
    fn on_ready(&self, ready: Interest) {
        match self.core.state() {
            ConnState::Connecting => {
                let err = socket::socket_error(self.core.fd());
                if err != 0 {
                    self.core.fail(err);
                } else if !self.advance_handshake() {
                    // Blocked again; the engine's chosen direction is
                    // registered and reconciliation must not override it.
                    return;
                }
                if let Some(handler) = self.core.take_conn_handler() {
                    if !call_handler(self, &handler) {
                        return;
                    }
                }
                self.update_event();
            }
            ConnState::Accepting => {
                if !self.advance_handshake() {
                    return;
                }
                if let Some(handler) = self.core.take_conn_handler() {
                    if !call_handler(self, &handler) {
                        return;
                    }
                }
                self.update_event();
            }
            ConnState::Connected => {
                if ready.writable() {
                    self.flush_output();
                }

                let mut read_fired = false;
                let mut write_fired = false;

                // Inverted-direction dispatches come first; each bit is
                // cleared before its handler runs so the handler can
                // re-issue the operation cleanly.
                if ready.readable() && self.write_want_read.get() {
                    self.write_want_read.set(false);
                    write_fired = true;
                    if let Some(handler) = self.core.write_handler() {
                        if !call_handler(self, &handler) {
                            return;
                        }
                    }
                }
                if ready.writable() && self.read_want_write.get() {
                    self.read_want_write.set(false);
                    read_fired = true;
                    if let Some(handler) = self.core.read_handler() {
                        if !call_handler(self, &handler) {
                            return;
                        }
                    }
                }

                if ready.readable() && !read_fired {
                    if let Some(handler) = self.core.read_handler() {
                        if !call_handler(self, &handler) {
                            return;
                        }
                    }
                }
                if ready.writable() && !write_fired {
                    if let Some(handler) = self.core.write_handler() {
                        if !call_handler(self, &handler) {
                            return;
                        }
                    }
                }

                self.update_event();
            }
            _ => {}
        }
    }

    fn has_pending(&self) -> bool {
        if self.core.state() != ConnState::Connected || !self.core.has_read_handler() {
            return false;
        }
        let mut slot = self.engine.borrow_mut();
        match slot.as_mut() {
            Some(engine) => engine
                .process_new_packets()
                .map(|state| state.plaintext_bytes_to_read() > 0)
                .unwrap_or(false),
            None => false,
        }
    }
}

impl Connection for TlsConnection {
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

        let session = self.new_client_session(host)?;
        let addr = socket::resolve(host, port).map_err(|_| Error::Resolve(host.to_string()))?;
        let src = source.and_then(|s| socket::resolve(s, 0).ok());

        let fd = match socket::start_connect(addr, src) {
            Ok(fd) => fd,
            Err(e) => {
                self.core.fail(e.raw_os_error().unwrap_or(0));
                return Err(Error::Io(e));
            }
        };

        *self.engine.borrow_mut() = Some(session);
        self.core.set_fd(fd);
        self.core.set_state(ConnState::Connecting);
        self.core.set_conn_handler(Some(on_done));
        metrics::CONNECTS_INITIATED.increment();

        // The TLS handshake starts from the event handler once the socket
        // connects; until then only writability matters.
        self.core
            .registrar()
            .register(fd, Interest::WRITE, sink_of(&self.weak));
        Ok(())
    }

    fn blocking_connect(&self, host: &str, port: u16, timeout: Duration) -> Result<(), Error> {
        if self.core.state() != ConnState::None {
            return Err(Error::InvalidState(self.core.state()));
        }

        let session = self.new_client_session(host)?;
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

        *self.engine.borrow_mut() = Some(session);

        // Drive the handshake over the blocking socket. The timeout caps
        // each syscall, not the whole exchange.
        {
            let _guard = BlockingGuard::new(fd, timeout).map_err(Error::Io)?;
            match self.drive_handshake() {
                EngineIo::Done(_) => {}
                EngineIo::WantRead | EngineIo::WantWrite => {
                    self.core.fail(libc::ETIMEDOUT);
                    return Err(Error::ConnectTimedOut);
                }
                EngineIo::Closed | EngineIo::Fatal => {
                    self.core.set_state(ConnState::Error);
                    return Err(Error::Tls(
                        self.last_error().unwrap_or_else(|| "handshake failed".into()),
                    ));
                }
            }
        }

        self.core.set_state(ConnState::Connected);
        metrics::CONNECTIONS_ESTABLISHED.increment();
        metrics::TLS_HANDSHAKES_COMPLETED.increment();
        Ok(())
    }

    fn accept(&self, on_done: ConnHandler) -> Result<(), Error> {
        if self.core.state() != ConnState::Accepting {
            return Err(Error::InvalidState(self.core.state()));
        }

        match self.drive_handshake() {
            EngineIo::WantRead => {
                self.core.set_conn_handler(Some(on_done));
                self.register_want(Interest::READ);
                Ok(())
            }
            EngineIo::WantWrite => {
                self.core.set_conn_handler(Some(on_done));
                self.register_want(Interest::WRITE);
                Ok(())
            }
            EngineIo::Done(_) => {
                self.core.set_state(ConnState::Connected);
                metrics::CONNECTIONS_ESTABLISHED.increment();
                metrics::TLS_HANDSHAKES_COMPLETED.increment();
                call_handler(self, &on_done);
                Ok(())
            }
            EngineIo::Closed | EngineIo::Fatal => {
                self.core.set_state(ConnState::Error);
                metrics::TLS_HANDSHAKE_FAILURES.increment();
                Err(Error::Tls(
                    self.last_error().unwrap_or_else(|| "handshake failed".into()),
                ))
            }
        }
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.core.state() != ConnState::Connected {
            return Err(io::ErrorKind::NotConnected.into());
        }
        match self.engine_read(buf) {
            EngineIo::Done(n) => {
                metrics::BYTES_RECEIVED.add(n as u64);
                self.update_event();
                Ok(n)
            }
            EngineIo::WantRead => {
                self.update_event();
                Err(io::ErrorKind::WouldBlock.into())
            }
            EngineIo::WantWrite => {
                self.read_want_write.set(true);
                self.update_event();
                Err(io::ErrorKind::WouldBlock.into())
            }
            EngineIo::Closed => {
                self.core.set_state(ConnState::Closed);
                Ok(0)
            }
            EngineIo::Fatal => {
                self.core.set_state(ConnState::Error);
                Err(self.stashed_error())
            }
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.core.state() != ConnState::Connected {
            return Err(io::ErrorKind::NotConnected.into());
        }
        match self.engine_write(buf) {
            EngineIo::Done(n) => {
                metrics::BYTES_SENT.add(n as u64);
                self.update_event();
                Ok(n)
            }
            EngineIo::WantRead => {
                self.write_want_read.set(true);
                self.update_event();
                Err(io::ErrorKind::WouldBlock.into())
            }
            EngineIo::WantWrite => {
                self.update_event();
                Err(io::ErrorKind::WouldBlock.into())
            }
            EngineIo::Closed => {
                self.core.set_state(ConnState::Closed);
                Ok(0)
            }
            EngineIo::Fatal => {
                self.core.set_state(ConnState::Error);
                Err(self.stashed_error())
            }
        }
    }

    fn set_read_handler(&self, handler: Option<ConnHandler>) {
        self.core.store_read_handler(handler);
        self.update_event();
    }

    fn set_write_handler(&self, handler: Option<ConnHandler>) {
        self.core.store_write_handler(handler);
        self.update_event();
    }

    fn sync_read(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let fd = self.core.require_fd()?;
        let _guard = BlockingGuard::new(fd, timeout)?;
        self.blocking_engine_read(buf)
    }

    fn sync_write(&self, buf: &[u8], timeout: Duration) -> io::Result<usize> {
        let fd = self.core.require_fd()?;
        let _guard = BlockingGuard::new(fd, timeout)?;

        let mut slot = self.engine.borrow_mut();
        let engine = slot
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let mut sock = FdIo(fd);

        // All-or-nothing: push every plaintext byte and flush completely.
        let mut written = 0;
        while written < buf.len() {
            let n = engine.writer().write(&buf[written..])?;
            written += n;
            let mut flushed = 0;
            while engine.wants_write() {
                flushed += engine.write_tls(&mut sock)?;
            }
            if n == 0 && flushed == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
        }
        while engine.wants_write() {
            engine.write_tls(&mut sock)?;
        }
        Ok(buf.len())
    }

    fn sync_readline(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let fd = self.core.require_fd()?;
        let _guard = BlockingGuard::new(fd, timeout)?;
        read_line_with(buf, |byte| self.blocking_engine_read(byte))
    }

    fn close(&self, do_shutdown: bool) {
        if do_shutdown && self.core.fd() != -1 {
            if let Some(engine) = self.engine.borrow_mut().as_mut() {
                engine.send_close_notify();
            }
            self.flush_output();
        }
        self.engine.borrow_mut().take();
        self.engine_error.borrow_mut().take();
        self.read_want_write.set(false);
        self.write_want_read.set(false);
        self.core.close_socket(do_shutdown);
    }

    fn shutdown(&self) {
        if self.core.fd() == -1 {
            return;
        }
        if let Some(engine) = self.engine.borrow_mut().as_mut() {
            engine.send_close_notify();
        }
        self.flush_output();
    }

    fn last_error(&self) -> Option<String> {
        if let Some(msg) = self.engine_error.borrow().as_ref() {
            return Some(msg.clone());
        }
        let errno = self.core.last_errno();
        if errno == 0 {
            return None;
        }
        Some(io::Error::from_raw_os_error(errno).to_string())
    }
}
