//! Blocking I/O facade for bootstrap paths.
//!
//! These helpers exist for startup sequences (replication handshakes and the
//! like) that have not been asynchronised. The socket is flipped to blocking
//! mode with OS-level send/receive timeouts for the duration of the call;
//! the timeout is per syscall, so the total elapsed time may exceed it.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::socket;

/// Scope guard: blocking mode + send/recv timeouts on construction,
/// non-blocking and cleared timeouts on drop.
pub(crate) struct BlockingGuard {
    fd: RawFd,
}

impl BlockingGuard {
    pub(crate) fn new(fd: RawFd, timeout: Duration) -> io::Result<BlockingGuard> {
        socket::set_nonblocking(fd, false)?;
        socket::set_send_timeout(fd, timeout)?;
        socket::set_recv_timeout(fd, timeout)?;
        Ok(BlockingGuard { fd })
    }
}

impl Drop for BlockingGuard {
    fn drop(&mut self) {
        let _ = socket::set_nonblocking(self.fd, true);
        let _ = socket::set_send_timeout(self.fd, Duration::ZERO);
        let _ = socket::set_recv_timeout(self.fd, Duration::ZERO);
    }
}

/// Blocking write of the whole buffer.
pub(crate) fn sync_write(fd: RawFd, buf: &[u8], timeout: Duration) -> io::Result<usize> {
    let _guard = BlockingGuard::new(fd, timeout)?;
    let mut written = 0;
    while written < buf.len() {
        match socket::write(fd, &buf[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

/// Blocking read of at most `buf.len()` bytes. `Ok(0)` is peer close.
pub(crate) fn sync_read(fd: RawFd, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
    let _guard = BlockingGuard::new(fd, timeout)?;
    socket::read(fd, buf)
}

/// Blocking line read: one byte at a time through `\n`, trailing `\r`
/// stripped. Returns the line length written into `buf`.
pub(crate) fn sync_readline(fd: RawFd, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
    let _guard = BlockingGuard::new(fd, timeout)?;
    read_line_with(buf, |byte| socket::read(fd, byte))
}

/// Shared line-assembly loop; `read_one` fills exactly one byte.
pub(crate) fn read_line_with(
    buf: &mut [u8],
    mut read_one: impl FnMut(&mut [u8]) -> io::Result<usize>,
) -> io::Result<usize> {
    let mut len = 0;
    while len < buf.len() {
        let mut byte = [0u8; 1];
        if read_one(&mut byte)? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        if byte[0] == b'\n' {
            if len > 0 && buf[len - 1] == b'\r' {
                len -= 1;
            }
            return Ok(len);
        }
        buf[len] = byte[0];
        len += 1;
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(data: &'static [u8]) -> impl FnMut(&mut [u8]) -> io::Result<usize> {
        let mut pos = 0;
        move |byte: &mut [u8]| {
            if pos >= data.len() {
                return Ok(0);
            }
            byte[0] = data[pos];
            pos += 1;
            Ok(1)
        }
    }

    #[test]
    fn readline_strips_crlf() {
        let mut buf = [0u8; 32];
        let n = read_line_with(&mut buf, feed(b"PONG\r\nrest")).unwrap();
        assert_eq!(&buf[..n], b"PONG");
    }

    #[test]
    fn readline_bare_newline() {
        let mut buf = [0u8; 32];
        let n = read_line_with(&mut buf, feed(b"OK\n")).unwrap();
        assert_eq!(&buf[..n], b"OK");
    }

    #[test]
    fn readline_eof_is_error() {
        let mut buf = [0u8; 32];
        assert!(read_line_with(&mut buf, feed(b"no newline")).is_err());
    }

    #[test]
    fn readline_fills_buffer_without_newline() {
        let mut buf = [0u8; 4];
        let n = read_line_with(&mut buf, feed(b"abcdefg\n")).unwrap();
        assert_eq!(&buf[..n], b"abcd");
    }

    #[test]
    fn sync_roundtrip_over_socketpair() {
        let mut fds = [0i32; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        let (a, b) = (fds[0], fds[1]);

        let timeout = Duration::from_secs(2);
        assert_eq!(sync_write(a, b"+OK\r\n", timeout).unwrap(), 5);

        let mut line = [0u8; 16];
        let n = sync_readline(b, &mut line, timeout).unwrap();
        assert_eq!(&line[..n], b"+OK");

        socket::close(a);
        socket::close(b);
    }
}
