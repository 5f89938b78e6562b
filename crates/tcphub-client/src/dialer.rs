//! Backoff-driven outbound dialer

use tcphub_connection::{Backoff, BackoffConfig, ManagedConnection};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Dialer errors
#[derive(Debug, Error)]
pub enum DialerError {
    /// Nobody is receiving connections anymore while the dialer is still
    /// supposed to run.
    #[error("Connection receiver for {role} dialer was dropped")]
    ReceiverClosed { role: String },
}

/// Dialer configuration
#[derive(Debug, Clone)]
pub struct DialerConfig {
    /// Address to dial (host:port)
    pub target_address: String,
    pub backoff: BackoffConfig,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            target_address: "127.0.0.1:9001".to_string(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Dials `target_address` and hands each connection to the receiver
/// returned by [`Dialer::new`].
///
/// Only one connection is ever outstanding: after a handoff the dialer
/// waits for that connection to end before dialing again, so a consumer
/// that stops receiving also stops the dialing.
pub struct Dialer {
    config: DialerConfig,
    role: String,
    backoff: Backoff,
    sender: mpsc::Sender<ManagedConnection>,
}

impl Dialer {
    pub fn new(config: DialerConfig) -> (Self, mpsc::Receiver<ManagedConnection>) {
        let (sender, receiver) = mpsc::channel(1);
        let dialer = Self {
            backoff: Backoff::new(config.backoff.clone()),
            config,
            role: "dialer".to_string(),
            sender,
        };
        (dialer, receiver)
    }

    /// Label attached to every log event of this dialer (e.g. "hub").
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Dial until `parent` is canceled.
    ///
    /// Dial failures are never returned; they only grow the backoff.
    pub async fn run(self, parent: CancellationToken) -> Result<(), DialerError> {
        let span = tracing::info_span!(
            "dialer",
            role = %self.role,
            target = %self.config.target_address
        );
        self.dial_loop(parent).instrument(span).await
    }

    async fn dial_loop(mut self, parent: CancellationToken) -> Result<(), DialerError> {
        info!("Dialer started");
        loop {
            if parent.is_cancelled() {
                info!("Shutdown requested, dialer stopping");
                return Ok(());
            }

            let dialed = tokio::select! {
                biased;
                _ = parent.cancelled() => continue,
                dialed = TcpStream::connect(&self.config.target_address) => dialed,
            };

            let conn = match dialed.and_then(|stream| ManagedConnection::from_tcp(&parent, stream)) {
                Ok(conn) => conn,
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!(
                        error = %e,
                        attempt = self.backoff.attempt(),
                        backoff_ms = delay.as_millis() as u64,
                        "Failed to dial"
                    );
                    tokio::select! {
                        biased;
                        _ = parent.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            };

            self.backoff.reset();
            info!(
                peer_addr = %conn.peer_addr(),
                local_addr = %conn.local_addr(),
                "New connection"
            );

            let end = conn.end_signal();
            tokio::select! {
                biased;
                _ = parent.cancelled() => continue,
                sent = self.sender.send(conn) => {
                    if sent.is_err() {
                        if parent.is_cancelled() {
                            continue;
                        }
                        return Err(DialerError::ReceiverClosed { role: self.role.clone() });
                    }
                }
            }

            end.wait().await;
            debug!("Connection ended, dialing again");
        }
    }
}
