//! A `poll(2)`-backed readiness loop.
//!
//! `PollRegistrar` is a minimal single-threaded driver for hosts and tests:
//! it implements [`Registrar`] and delivers events in [`poll`] rounds. It is
//! not a general-purpose event loop — no timers, no signal handling.
//!
//! One TLS-specific duty lives here: a transport can hold decrypted input
//! that no socket-level event will ever announce (the bytes already crossed
//! the socket). Before blocking, the poll round asks every sink via
//! [`EventSink::has_pending`] and synthesizes READ events instead of
//! sleeping, so a level-triggered caller never stalls on buffered plaintext.
//!
//! [`poll`]: PollRegistrar::poll

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::event::{EventSink, Interest, Registrar};

struct Entry {
    interest: Interest,
    sink: Weak<dyn EventSink>,
}

/// Readiness registrar driven by `poll(2)`.
#[derive(Default)]
pub struct PollRegistrar {
    entries: RefCell<HashMap<RawFd, Entry>>,
}

impl PollRegistrar {
    pub fn new() -> PollRegistrar {
        PollRegistrar::default()
    }

    /// Number of fds with registered interest.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Run one poll round: wait up to `timeout` (`None` blocks), then
    /// dispatch readiness to the registered sinks. Returns the number of
    /// sinks dispatched. Sinks with pending transport input short-circuit
    /// the wait and receive a synthesized READ event.
    ///
    /// Dispatch is re-entrancy safe: callbacks may register, deregister,
    /// and close connections; stale or dead registrations are skipped.
    pub fn poll(&self, timeout: Option<Duration>) -> io::Result<usize> {
        // Snapshot registrations, pruning dead sinks as we go.
        let mut snapshot: Vec<(RawFd, Interest, Rc<dyn EventSink>)> = Vec::new();
        let mut pending: Vec<(RawFd, Rc<dyn EventSink>)> = Vec::new();
        {
            let mut entries = self.entries.borrow_mut();
            entries.retain(|&fd, entry| match entry.sink.upgrade() {
                Some(sink) => {
                    snapshot.push((fd, entry.interest, sink));
                    true
                }
                None => false,
            });
        }
        for (fd, _, sink) in &snapshot {
            if sink.has_pending() {
                pending.push((*fd, sink.clone()));
            }
        }

        if snapshot.is_empty() && pending.is_empty() {
            return Ok(0);
        }

        let mut pollfds: Vec<libc::pollfd> = snapshot
            .iter()
            .map(|&(fd, interest, _)| {
                let mut events: libc::c_short = 0;
                if interest.readable() {
                    events |= libc::POLLIN;
                }
                if interest.writable() {
                    events |= libc::POLLOUT;
                }
                libc::pollfd {
                    fd,
                    events,
                    revents: 0,
                }
            })
            .collect();

        let timeout_ms: libc::c_int = if !pending.is_empty() {
            0
        } else {
            match timeout {
                Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
                None => -1,
            }
        };

        let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }

        let mut dispatched = 0;

        for (pollfd, (fd, _, sink)) in pollfds.iter().zip(&snapshot) {
            let revents = pollfd.revents;
            if revents == 0 {
                continue;
            }

            // Error and hangup conditions surface through whichever
            // directions are registered, so the owner observes them on its
            // normal read/write path.
            let fail = revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0;
            let mut ready = Interest::NONE;
            if revents & libc::POLLIN != 0 || fail {
                ready |= Interest::READ;
            }
            if revents & libc::POLLOUT != 0 || fail {
                ready |= Interest::WRITE;
            }

            // An earlier callback this round may have changed or dropped
            // this registration; deliver only what is still current.
            let ready = match self.current_interest(*fd, sink) {
                Some(current) => ready.intersect(current),
                None => continue,
            };
            if ready.is_empty() {
                continue;
            }

            sink.on_ready(ready);
            dispatched += 1;
        }

        // Synthesized reads for buffered transport input. Re-check: the
        // real dispatches above may have consumed it.
        for (fd, sink) in pending {
            if self.current_interest(fd, &sink).is_none() {
                continue;
            }
            if sink.has_pending() {
                sink.on_ready(Interest::READ);
                dispatched += 1;
            }
        }

        Ok(dispatched)
    }

    /// The still-registered interest for `fd`, provided the same sink owns
    /// the registration.
    fn current_interest(&self, fd: RawFd, sink: &Rc<dyn EventSink>) -> Option<Interest> {
        let entries = self.entries.borrow();
        let entry = entries.get(&fd)?;
        let current = entry.sink.upgrade()?;
        if !Rc::ptr_eq(&current, sink) {
            return None;
        }
        Some(entry.interest)
    }
}

impl Registrar for PollRegistrar {
    fn register(&self, fd: RawFd, interest: Interest, sink: Weak<dyn EventSink>) {
        if interest.is_empty() {
            return;
        }
        let mut entries = self.entries.borrow_mut();
        let entry = entries.entry(fd).or_insert(Entry {
            interest: Interest::NONE,
            sink: sink.clone(),
        });
        entry.interest |= interest;
        entry.sink = sink;
    }

    fn deregister(&self, fd: RawFd, interest: Interest) {
        let mut entries = self.entries.borrow_mut();
        let emptied = match entries.get_mut(&fd) {
            Some(entry) => {
                entry.interest = entry.interest.without(interest);
                entry.interest.is_empty()
            }
            None => false,
        };
        if emptied {
            entries.remove(&fd);
        }
    }

    fn registered(&self, fd: RawFd) -> Interest {
        self.entries
            .borrow()
            .get(&fd)
            .map(|entry| entry.interest)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket;
    use std::cell::Cell;

    struct CountingSink {
        fired: Cell<u32>,
        last: Cell<Interest>,
    }

    impl CountingSink {
        fn new() -> Rc<CountingSink> {
            Rc::new(CountingSink {
                fired: Cell::new(0),
                last: Cell::new(Interest::NONE),
            })
        }
    }

    impl EventSink for CountingSink {
        fn on_ready(&self, ready: Interest) {
            self.fired.set(self.fired.get() + 1);
            self.last.set(ready);
        }
    }

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn register_is_idempotent_per_direction() {
        let reg = PollRegistrar::new();
        let sink = CountingSink::new();
        let sink_dyn: Rc<dyn EventSink> = sink.clone();
        let weak: Weak<dyn EventSink> = Rc::downgrade(&sink_dyn);

        reg.register(5, Interest::READ, weak.clone());
        reg.register(5, Interest::READ, weak.clone());
        assert_eq!(reg.registered(5), Interest::READ);

        reg.register(5, Interest::WRITE, weak);
        assert!(reg.registered(5).contains(Interest::READ | Interest::WRITE));

        reg.deregister(5, Interest::READ);
        reg.deregister(5, Interest::READ);
        assert_eq!(reg.registered(5), Interest::WRITE);

        reg.deregister(5, Interest::WRITE);
        assert!(reg.registered(5).is_empty());
        assert!(reg.is_empty());
    }

    fn weak_sink(sink: &Rc<CountingSink>) -> Weak<dyn EventSink> {
        let sink_dyn: Rc<dyn EventSink> = sink.clone();
        Rc::downgrade(&sink_dyn)
    }

    #[test]
    fn poll_delivers_write_then_read() {
        let (a, b) = socketpair();
        let reg = PollRegistrar::new();
        let sink = CountingSink::new();

        reg.register(a, Interest::WRITE, weak_sink(&sink));
        reg.poll(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(sink.fired.get(), 1);
        assert!(sink.last.get().writable());

        reg.deregister(a, Interest::WRITE);
        reg.register(a, Interest::READ, weak_sink(&sink));

        // Nothing readable yet.
        assert_eq!(reg.poll(Some(Duration::from_millis(10))).unwrap(), 0);

        socket::write(b, b"x").unwrap();
        reg.poll(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(sink.fired.get(), 2);
        assert!(sink.last.get().readable());

        socket::close(a);
        socket::close(b);
    }

    #[test]
    fn dead_sinks_are_pruned() {
        let (a, b) = socketpair();
        let reg = PollRegistrar::new();
        {
            let sink = CountingSink::new();
            reg.register(a, Interest::WRITE, weak_sink(&sink));
        }
        assert_eq!(reg.len(), 1);
        reg.poll(Some(Duration::from_millis(10))).unwrap();
        assert!(reg.is_empty());

        socket::close(a);
        socket::close(b);
    }

    #[test]
    fn empty_poll_returns_immediately() {
        let reg = PollRegistrar::new();
        assert_eq!(reg.poll(None).unwrap(), 0);
    }
}
