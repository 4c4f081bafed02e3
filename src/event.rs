//! Readiness registrar contract.
//!
//! The registrar is the external component that watches file descriptors and
//! reports when they can make progress in a direction. Connections register
//! interest per `(fd, direction)` and receive events through [`EventSink`].
//! Any readiness loop can implement [`Registrar`]; a `poll(2)`-backed one
//! ships in [`crate::poller`].

use std::ops::{BitOr, BitOrAssign};
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

/// Readiness interest/event mask: READ, WRITE, or both.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    /// No direction.
    pub const NONE: Interest = Interest(0);
    /// Readable direction.
    pub const READ: Interest = Interest(1 << 0);
    /// Writable direction.
    pub const WRITE: Interest = Interest(1 << 1);

    /// Whether the READ bit is set.
    pub fn readable(self) -> bool {
        self.0 & Interest::READ.0 != 0
    }

    /// Whether the WRITE bit is set.
    pub fn writable(self) -> bool {
        self.0 & Interest::WRITE.0 != 0
    }

    /// Whether no bit is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every bit of `other` is set in `self`.
    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    /// The bits of `self` that are not in `other`.
    pub fn without(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    /// The bits present in both masks.
    pub fn intersect(self, other: Interest) -> Interest {
        Interest(self.0 & other.0)
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

impl std::fmt::Debug for Interest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.readable(), self.writable()) {
            (false, false) => write!(f, "NONE"),
            (true, false) => write!(f, "READ"),
            (false, true) => write!(f, "WRITE"),
            (true, true) => write!(f, "READ|WRITE"),
        }
    }
}

/// Receiver of readiness events for one file descriptor.
///
/// Connections implement this; the registrar calls [`EventSink::on_ready`]
/// with the subset of registered directions that fired.
pub trait EventSink {
    /// A registered direction became ready. `ready` is never empty.
    fn on_ready(&self, ready: Interest);

    /// Whether the transport holds buffered input that a socket-level event
    /// will not announce. Loops should check this before blocking and
    /// synthesize a READ event when it returns true (see
    /// [`crate::poller::PollRegistrar::poll`]).
    fn has_pending(&self) -> bool {
        false
    }
}

/// Interest registration for an external readiness loop.
///
/// Both `register` and `deregister` are idempotent per direction. The
/// registrar keeps only a [`Weak`] reference to the sink: registration does
/// not keep a connection alive.
pub trait Registrar {
    /// Add the directions in `interest` for `fd`, delivering events to `sink`.
    fn register(&self, fd: RawFd, interest: Interest, sink: Weak<dyn EventSink>);

    /// Remove the directions in `interest` for `fd`.
    fn deregister(&self, fd: RawFd, interest: Interest);

    /// The currently registered mask for `fd`.
    fn registered(&self, fd: RawFd) -> Interest;
}

/// Upcast helper: a concrete connection's `Weak` self-reference as a sink.
pub(crate) fn sink_of<T: EventSink + 'static>(weak: &Weak<T>) -> Weak<dyn EventSink> {
    weak.clone()
}

/// The registrar handle connections hold for their lifetime.
pub type RegistrarHandle = Rc<dyn Registrar>;
