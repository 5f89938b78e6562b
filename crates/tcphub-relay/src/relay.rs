//! Relay event loop
//!
//! The loop is the only writer of the two slots. Copy tasks never touch a
//! slot; they share the streams, the relay-owned buffers (lent for the
//! duration of one pairing) and the pairing's teardown.

use std::sync::Arc;

use tcphub_connection::{probe_read, ManagedConnection, ProbeOutcome, TryReadNow};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::pairing::{CopyJob, Direction, Role, Teardown};
use crate::stats::RelayStats;

/// Default size of each direction's read buffer
pub const DEFAULT_BUFFER_SIZE: usize = 65535;

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Relay buffer size must be greater than zero")]
    InvalidBufferSize,
}

/// Relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Capacity of each direction's buffer; also bounds one probe read
    pub buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Streams the relay can splice together.
pub trait RelayStream: AsyncRead + AsyncWrite + TryReadNow + Send + Unpin + 'static {}

impl<T> RelayStream for T where T: AsyncRead + AsyncWrite + TryReadNow + Send + Unpin + 'static {}

struct Slot<S> {
    role: Role,
    conn: Option<ManagedConnection<S>>,
    /// `None` while lent to a copy task
    buffer: Option<Vec<u8>>,
    /// Bytes at the start of `buffer` captured by the probe
    pending: usize,
}

impl<S> Slot<S> {
    fn new(role: Role, buffer_size: usize) -> Self {
        Self {
            role,
            conn: None,
            buffer: Some(vec![0u8; buffer_size]),
            pending: 0,
        }
    }

    fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
        }
        self.pending = 0;
    }
}

/// Pairs one hub connection with one external connection at a time.
pub struct Relay<S = TcpStream> {
    config: RelayConfig,
    hub: Slot<S>,
    external: Slot<S>,
    stats: RelayStats,
}

impl<S: RelayStream> Relay<S> {
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        if config.buffer_size == 0 {
            return Err(RelayError::InvalidBufferSize);
        }
        Ok(Self {
            hub: Slot::new(Role::Hub, config.buffer_size),
            external: Slot::new(Role::External, config.buffer_size),
            config,
            stats: RelayStats::new(),
        })
    }

    pub fn stats(&self) -> RelayStats {
        self.stats.clone()
    }

    /// Consume both sources until `shutdown` is canceled or both sources
    /// are gone. Occupied slots are closed on the way out.
    pub async fn run(
        &mut self,
        shutdown: CancellationToken,
        mut hub_rx: mpsc::Receiver<ManagedConnection<S>>,
        mut external_rx: mpsc::Receiver<ManagedConnection<S>>,
    ) {
        info!("Relay started");
        let mut hub_open = true;
        let mut external_open = true;
        loop {
            if !hub_open && !external_open {
                info!("All connection sources closed, relay stopping");
                break;
            }

            let (role, conn) = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, closing relay connections");
                    break;
                }
                received = hub_rx.recv(), if hub_open => match received {
                    Some(conn) => (Role::Hub, conn),
                    None => {
                        debug!("Hub connection source closed");
                        hub_open = false;
                        continue;
                    }
                },
                received = external_rx.recv(), if external_open => match received {
                    Some(conn) => (Role::External, conn),
                    None => {
                        debug!("External connection source closed");
                        external_open = false;
                        continue;
                    }
                },
            };

            if self.place(role, conn) {
                self.pipe(&shutdown).await;
            }
        }

        self.hub.close();
        self.external.close();
    }

    fn slot_mut(&mut self, role: Role) -> &mut Slot<S> {
        match role {
            Role::Hub => &mut self.hub,
            Role::External => &mut self.external,
        }
    }

    /// Store `conn` in its slot. Returns `true` when a pairing can start.
    fn place(&mut self, role: Role, conn: ManagedConnection<S>) -> bool {
        let slot = self.slot_mut(role);
        if let Some(mut previous) = slot.conn.take() {
            info!(
                role = %role,
                previous_peer = %previous.peer_addr(),
                peer_addr = %conn.peer_addr(),
                "Replacing connection"
            );
            previous.close();
            self.stats.record_replacement();
        }

        let slot = self.slot_mut(role);
        slot.pending = 0;
        slot.conn = Some(conn);

        let peer = self.slot_mut(role.peer());
        let peer_role = peer.role;
        let Some(peer_conn) = peer.conn.as_ref() else {
            debug!(role = %role, "Missing {} connection", peer_role);
            return false;
        };
        let peer_addr = peer_conn.peer_addr();

        // The waiting peer may already hold bytes from its remote party,
        // or may have been closed while it waited.
        let probed = match (peer_conn.stream(), peer.buffer.as_mut()) {
            (Some(stream), Some(buffer)) => probe_read(stream, buffer),
            _ => Ok(ProbeOutcome::Closed),
        };

        match probed {
            Ok(ProbeOutcome::Data(n)) => {
                if n > 0 {
                    debug!(role = %peer_role, peer_addr = %peer_addr, bytes = n, "Captured pending data");
                }
                peer.pending = n;
                true
            }
            Ok(ProbeOutcome::Closed) => {
                warn!(role = %peer_role, peer_addr = %peer_addr, "Connection is already closed");
                peer.close();
                self.stats.record_probe_abort();
                false
            }
            Err(e) => {
                warn!(role = %peer_role, peer_addr = %peer_addr, error = %e, "Connection is already closed");
                peer.close();
                self.stats.record_probe_abort();
                false
            }
        }
    }

    /// Run one pairing to completion, or until `shutdown`, and clear both
    /// slots.
    async fn pipe(&mut self, shutdown: &CancellationToken) {
        let (Some(hub), Some(external)) = (self.hub.conn.as_mut(), self.external.conn.as_mut())
        else {
            return;
        };

        let pairing_id = self.stats.record_pairing();
        let span = info_span!(
            "pairing",
            id = pairing_id,
            hub = %hub.peer_addr(),
            external = %external.peer_addr()
        );

        let teardown = Arc::new(Teardown::new(hub.end_signal(), external.end_signal()));
        let hub_end = hub.end_signal();
        let external_end = external.end_signal();

        let (Some(hub_stream), Some(external_stream)) = (hub.take_stream(), external.take_stream())
        else {
            // Only reachable if a slot kept a closed connection
            warn!(parent: &span, "Pairing aborted, a stream was already closed");
            self.hub.close();
            self.external.close();
            return;
        };

        span.in_scope(|| info!("Start piping"));

        let (hub_read, hub_write) = tokio::io::split(hub_stream);
        let (external_read, external_write) = tokio::io::split(external_stream);

        let to_external = self.spawn_copy(
            Direction::HubToExternal,
            hub_read,
            external_write,
            &teardown,
            &span,
        );
        let to_hub = self.spawn_copy(
            Direction::ExternalToHub,
            external_read,
            hub_write,
            &teardown,
            &span,
        );

        let ended = async {
            hub_end.wait().await;
            external_end.wait().await;
        };
        tokio::select! {
            _ = ended => {}
            _ = shutdown.cancelled() => {
                span.in_scope(|| info!("Shutdown requested, tearing down pairing"));
                teardown.fire("shutdown");
            }
        }

        self.reclaim(Role::Hub, to_external).await;
        self.reclaim(Role::External, to_hub).await;

        self.hub.close();
        self.external.close();
        span.in_scope(|| info!("Pairing torn down"));
    }

    fn spawn_copy<R, W>(
        &mut self,
        direction: Direction,
        source: R,
        destination: W,
        teardown: &Arc<Teardown>,
        span: &tracing::Span,
    ) -> JoinHandle<Vec<u8>>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let buffer_size = self.config.buffer_size;
        let slot = self.slot_mut(direction.source());
        let buffer = slot
            .buffer
            .take()
            .unwrap_or_else(|| vec![0u8; buffer_size]);
        let job = CopyJob {
            direction,
            source,
            destination,
            buffer,
            pending: std::mem::take(&mut slot.pending),
            teardown: teardown.clone(),
            stats: self.stats.clone(),
        };
        tokio::spawn(job.run().instrument(span.clone()))
    }

    /// Take a finished copy task's buffer back into the slot it reads from.
    async fn reclaim(&mut self, source: Role, task: JoinHandle<Vec<u8>>) {
        let buffer_size = self.config.buffer_size;
        let buffer = match task.await {
            Ok(buffer) => buffer,
            Err(e) => {
                error!(role = %source, error = %e, "Copy task failed");
                vec![0u8; buffer_size]
            }
        };
        self.slot_mut(source).buffer = Some(buffer);
    }

    #[cfg(test)]
    fn buffer_len(&self, role: Role) -> Option<usize> {
        match role {
            Role::Hub => self.hub.buffer.as_ref().map(Vec::len),
            Role::External => self.external.buffer.as_ref().map(Vec::len),
        }
    }
}
