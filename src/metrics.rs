//! Connection runtime metrics.
//!
//! Lifecycle and byte counters, exposed through the metriken registry for
//! whatever exposition the embedding application runs.

use metriken::{metric, Counter};

// ── Connection lifecycle ─────────────────────────────────────────

#[metric(
    name = "wireline/connections/accepted",
    description = "Inbound connections handed to the accept path"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "wireline/connections/initiated",
    description = "Outbound connects started"
)]
pub static CONNECTS_INITIATED: Counter = Counter::new();

#[metric(
    name = "wireline/connections/established",
    description = "Connections that reached the connected state"
)]
pub static CONNECTIONS_ESTABLISHED: Counter = Counter::new();

#[metric(
    name = "wireline/connections/closed",
    description = "Connections closed"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

// ── Bytes ────────────────────────────────────────────────────────

#[metric(name = "wireline/bytes/received", description = "Plaintext bytes read")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "wireline/bytes/sent", description = "Plaintext bytes written")]
pub static BYTES_SENT: Counter = Counter::new();

// ── TLS ──────────────────────────────────────────────────────────

#[metric(
    name = "wireline/tls/handshakes_completed",
    description = "TLS handshakes completed"
)]
pub static TLS_HANDSHAKES_COMPLETED: Counter = Counter::new();

#[metric(
    name = "wireline/tls/handshake_failures",
    description = "TLS handshakes that failed"
)]
pub static TLS_HANDSHAKE_FAILURES: Counter = Counter::new();
