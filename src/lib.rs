//! wireline — pluggable connection abstraction for event-driven servers.
//!
//! wireline hides the differences between plain TCP sockets and TLS
//! sessions behind one uniform, non-blocking interface. The host
//! application owns a readiness loop (anything implementing [`Registrar`];
//! a `poll(2)`-backed [`PollRegistrar`] is included) and registers logical
//! read/write callbacks on connections; wireline maps those onto physical
//! socket readiness, driving transport handshakes and the TLS direction
//! inversions (a read that needs the socket writable, and vice versa)
//! behind the scenes.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::rc::Rc;
//! use std::time::Duration;
//! use wireline::{Connection, PollRegistrar, TcpConnection};
//!
//! fn main() -> Result<(), wireline::Error> {
//!     let registrar = Rc::new(PollRegistrar::new());
//!     let conn = TcpConnection::new(registrar.clone());
//!
//!     conn.connect("127.0.0.1", 6379, None, Rc::new(|conn| {
//!         if conn.state() == wireline::ConnState::Connected {
//!             conn.set_read_handler(Some(Rc::new(|conn| {
//!                 let mut buf = [0u8; 4096];
//!                 match conn.read(&mut buf) {
//!                     Ok(0) => conn.close(false),
//!                     Ok(n) => println!("{} bytes", n),
//!                     Err(_) => {}
//!                 }
//!             })));
//!         }
//!     }))?;
//!
//!     loop {
//!         registrar.poll(Some(Duration::from_millis(100)))?;
//!     }
//! }
//! ```
//!
//! # Model
//!
//! Single-threaded cooperative: one readiness loop owns all connections,
//! and nothing here is `Send`. Callbacks may re-enter the API freely,
//! including closing their own connection. The only blocking entry points
//! are `blocking_connect` and the `sync_*` bootstrap helpers.

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod metrics;
pub(crate) mod socket;
pub(crate) mod sync_io;

// ── Public modules ──────────────────────────────────────────────────────
pub mod connection;
pub mod error;
pub mod event;
pub mod poller;
pub mod tcp;
#[cfg(feature = "tls")]
pub mod tls;

// ── Re-exports: Connection types ───────────────────────────────────────

/// Logical read/write/connect callback.
pub use connection::ConnHandler;
/// Connection lifecycle state.
pub use connection::ConnState;
/// State shared by every transport.
pub use connection::ConnCore;
/// The transport capability set.
pub use connection::Connection;
/// Plain TCP transport.
pub use tcp::TcpConnection;

// ── Re-exports: Readiness ──────────────────────────────────────────────

/// Receiver of readiness events for one fd.
pub use event::EventSink;
/// Readiness interest/event mask.
pub use event::Interest;
/// Interest registration for an external readiness loop.
pub use event::Registrar;
/// Shared handle to a [`Registrar`].
pub use event::RegistrarHandle;
/// `poll(2)`-backed readiness loop.
pub use poller::PollRegistrar;

// ── Re-exports: Errors ─────────────────────────────────────────────────

/// Crate error type.
pub use error::Error;

// ── Re-exports: TLS (feature-gated) ────────────────────────────────────

/// Install a process-wide TLS context.
#[cfg(feature = "tls")]
pub use tls::configure;
/// Whether a TLS context has been installed.
#[cfg(feature = "tls")]
pub use tls::is_configured;
/// TLS transport.
#[cfg(feature = "tls")]
pub use tls::TlsConnection;
/// File paths for [`configure`].
#[cfg(feature = "tls")]
pub use tls::TlsOptions;
