//! TCP listener feeding accepted connections to the relay

use std::net::SocketAddr;
use std::time::Duration;

use tcphub_connection::ManagedConnection;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Pause after a failed accept so a persistent error (e.g. EMFILE) does not spin
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Listener errors
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port\n  • Try using a different address or port")]
    BindError { address: String, reason: String },

    #[error("Connection receiver for {role} listener was dropped")]
    ReceiverClosed { role: String },
}

/// Listener configuration
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind (host:port)
    pub listen_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:9000".to_string(),
        }
    }
}

/// Accepts connections and publishes each one as a [`ManagedConnection`].
pub struct Listener {
    config: ListenerConfig,
    role: String,
    sender: mpsc::Sender<ManagedConnection>,
    ready: Option<oneshot::Sender<SocketAddr>>,
}

impl Listener {
    pub fn new(config: ListenerConfig) -> (Self, mpsc::Receiver<ManagedConnection>) {
        let (sender, receiver) = mpsc::channel(1);
        let listener = Self {
            config,
            role: "listener".to_string(),
            sender,
            ready: None,
        };
        (listener, receiver)
    }

    /// Label attached to every log event of this listener (e.g. "external").
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Receive the bound address once the socket is listening.
    pub fn with_ready(mut self, ready: oneshot::Sender<SocketAddr>) -> Self {
        self.ready = Some(ready);
        self
    }

    /// Bind and accept until `parent` is canceled.
    ///
    /// Only a bind failure is returned as an error; accept failures are
    /// logged and the loop keeps going.
    pub async fn run(self, parent: CancellationToken) -> Result<(), ListenerError> {
        let span = tracing::info_span!("listener", role = %self.role);
        self.accept_loop(parent).instrument(span).await
    }

    async fn accept_loop(mut self, parent: CancellationToken) -> Result<(), ListenerError> {
        let listener = TcpListener::bind(&self.config.listen_address)
            .await
            .map_err(|e| {
                error!(address = %self.config.listen_address, error = %e, "Failed to listen");
                ListenerError::BindError {
                    address: self.config.listen_address.clone(),
                    reason: e.to_string(),
                }
            })?;
        let local_addr = listener.local_addr()?;
        info!(listener = %local_addr, "Successfully started listener");

        if let Some(ready) = self.ready.take() {
            let _ = ready.send(local_addr);
        }

        loop {
            let accepted = tokio::select! {
                biased;
                _ = parent.cancelled() => {
                    info!(listener = %local_addr, "Shutdown requested, closing listener");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            let conn = match accepted
                .and_then(|(stream, _)| ManagedConnection::from_tcp(&parent, stream))
            {
                Ok(conn) => conn,
                Err(e) => {
                    error!(listener = %local_addr, error = %e, "Failed to accept a new connection");
                    if !pause_after_accept_error(&parent).await {
                        info!(listener = %local_addr, "Shutdown requested, closing listener");
                        return Ok(());
                    }
                    continue;
                }
            };

            info!(
                peer_addr = %conn.peer_addr(),
                local_addr = %conn.local_addr(),
                "New connection"
            );

            tokio::select! {
                biased;
                _ = parent.cancelled() => {
                    debug!("Dropping connection accepted during shutdown");
                    info!(listener = %local_addr, "Shutdown requested, closing listener");
                    return Ok(());
                }
                sent = self.sender.send(conn) => {
                    if sent.is_err() {
                        if parent.is_cancelled() {
                            return Ok(());
                        }
                        warn!("Relay stopped receiving connections");
                        return Err(ListenerError::ReceiverClosed { role: self.role.clone() });
                    }
                }
            }
        }
    }
}

/// Wait out [`ACCEPT_RETRY_DELAY`]. Returns `false` if `parent` was canceled
/// first.
async fn pause_after_accept_error(parent: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = parent.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => true,
    }
}
