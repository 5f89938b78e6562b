//! One active pairing: two copy tasks and their shared teardown

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tcphub_connection::ConnectionEnd;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info};

use crate::stats::RelayStats;

/// Which slot a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Hub,
    External,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Hub => Role::External,
            Role::External => Role::Hub,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Hub => "hub",
            Role::External => "external",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of one copy task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    HubToExternal,
    ExternalToHub,
}

impl Direction {
    pub fn source(self) -> Role {
        match self {
            Direction::HubToExternal => Role::Hub,
            Direction::ExternalToHub => Role::External,
        }
    }

    pub fn destination(self) -> Role {
        self.source().peer()
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.source(), self.destination())
    }
}

/// Fires at most once and ends both legs of a pairing.
#[derive(Debug)]
pub(crate) struct Teardown {
    fired: AtomicBool,
    hub: ConnectionEnd,
    external: ConnectionEnd,
}

impl Teardown {
    pub(crate) fn new(hub: ConnectionEnd, external: ConnectionEnd) -> Self {
        Self {
            fired: AtomicBool::new(false),
            hub,
            external,
        }
    }

    /// Close both legs. Only the first caller does anything.
    pub(crate) fn fire(&self, by: impl fmt::Display) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        debug!(by = %by, "Closing both connections of the pairing");
        self.hub.close();
        self.external.close();
        true
    }

    /// Resolves as soon as either leg has ended, whoever ended it.
    pub(crate) async fn ended(&self) {
        tokio::select! {
            _ = self.hub.wait() => {}
            _ = self.external.wait() => {}
        }
    }
}

/// How a copy task finished.
#[derive(Debug)]
pub(crate) enum CopyEnd {
    /// Clean end-of-stream on the source
    Eof,
    /// The pairing was torn down by the other direction or by shutdown
    Interrupted,
}

#[derive(Debug)]
pub(crate) enum CopyError {
    PendingFlush(io::Error),
    Read(io::Error),
    Write(io::Error),
}

impl fmt::Display for CopyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopyError::PendingFlush(e) => write!(f, "failed to transfer pending data: {}", e),
            CopyError::Read(e) => write!(f, "read error: {}", e),
            CopyError::Write(e) => write!(f, "write error: {}", e),
        }
    }
}

/// Everything one copy task needs; the buffer comes back when it is done.
pub(crate) struct CopyJob<R, W> {
    pub(crate) direction: Direction,
    pub(crate) source: R,
    pub(crate) destination: W,
    pub(crate) buffer: Vec<u8>,
    /// Bytes at the start of `buffer` captured before streaming began
    pub(crate) pending: usize,
    pub(crate) teardown: Arc<Teardown>,
    pub(crate) stats: RelayStats,
}

impl<R, W> CopyJob<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Flush pending bytes, then copy until end-of-stream, error, or
    /// teardown. Always fires the teardown before returning.
    pub(crate) async fn run(mut self) -> Vec<u8> {
        let direction = self.direction;
        let mut copied = 0u64;
        let outcome = self.copy(&mut copied).await;

        match &outcome {
            Ok(CopyEnd::Eof) => {
                info!(direction = %direction, bytes = copied, "Transferred data");
            }
            Ok(CopyEnd::Interrupted) => {
                info!(direction = %direction, bytes = copied, "Transferred data until pairing closed");
            }
            Err(e) => {
                error!(direction = %direction, bytes = copied, error = %e, "Failed to transfer data");
            }
        }

        self.teardown.fire(direction);
        self.buffer
    }

    async fn copy(&mut self, copied: &mut u64) -> Result<CopyEnd, CopyError> {
        let teardown = self.teardown.clone();

        if self.pending > 0 {
            let pending = self.pending;
            self.pending = 0;
            let flushed = tokio::select! {
                biased;
                _ = teardown.ended() => return Ok(CopyEnd::Interrupted),
                flushed = write_all_flush(&mut self.destination, &self.buffer[..pending]) => flushed,
            };
            flushed.map_err(CopyError::PendingFlush)?;
            self.stats.record_pending(pending as u64);
            info!(direction = %self.direction, bytes = pending, "Transferred pending data");
        }

        loop {
            let n = tokio::select! {
                biased;
                _ = teardown.ended() => return Ok(CopyEnd::Interrupted),
                read = self.source.read(&mut self.buffer) => read.map_err(CopyError::Read)?,
            };
            if n == 0 {
                return Ok(CopyEnd::Eof);
            }

            let written = tokio::select! {
                biased;
                _ = teardown.ended() => return Ok(CopyEnd::Interrupted),
                written = write_all_flush(&mut self.destination, &self.buffer[..n]) => written,
            };
            written.map_err(CopyError::Write)?;

            *copied += n as u64;
            self.stats.record_copied(self.direction, n as u64);
        }
    }
}

async fn write_all_flush<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}
