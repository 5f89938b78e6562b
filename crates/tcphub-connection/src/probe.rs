//! Non-blocking probe read
//!
//! A connection can sit alone in a relay slot for a while before its peer
//! shows up. Whatever its remote party sent in the meantime is already in
//! the kernel buffer, and the relay captures it with a single non-blocking
//! sweep right before streaming starts.

use std::io;

use tokio::net::TcpStream;

/// Read whatever is ready without waiting.
///
/// Implementations return `Err` with [`io::ErrorKind::WouldBlock`] when no
/// data is ready, `Ok(0)` on a clean end-of-stream, and `Ok(n)` otherwise.
pub trait TryReadNow {
    fn try_read_now(&self, buf: &mut [u8]) -> io::Result<usize>;
}

impl TryReadNow for TcpStream {
    fn try_read_now(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.try_read(buf)
    }
}

#[cfg(unix)]
impl TryReadNow for tokio::net::UnixStream {
    fn try_read_now(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.try_read(buf)
    }
}

/// Result of a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Number of bytes captured at the start of the buffer (may be zero).
    Data(usize),
    /// The peer closed before sending anything.
    Closed,
}

/// Drain everything immediately available into `buf`.
///
/// Stops at the first would-block, at end-of-stream, or when `buf` is full.
/// An end-of-stream or error after some bytes were captured still reports
/// those bytes; the copy loop will hit the same condition right after
/// flushing them.
pub fn probe_read<S: TryReadNow + ?Sized>(stream: &S, buf: &mut [u8]) -> io::Result<ProbeOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.try_read_now(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(ProbeOutcome::Closed),
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if filled == 0 => return Err(e),
            Err(_) => break,
        }
    }
    Ok(ProbeOutcome::Data(filled))
}
