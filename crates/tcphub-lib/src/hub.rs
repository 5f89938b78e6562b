//! Server and client modes
//!
//! Both modes run two producers and one relay under a single scope. The
//! first task to return cancels that scope so the others wind down, then
//! every task is awaited before the first fatal error (if any) is returned.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tcphub_client::{Dialer, DialerConfig, DialerError};
use tcphub_connection::BackoffConfig;
use tcphub_relay::{Relay, RelayConfig, RelayError, RelayStats};
use tcphub_server_tcp::{Listener, ListenerConfig, ListenerError};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

/// Errors that end a hub mode
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),

    #[error("Dialer error: {0}")]
    Dialer(#[from] DialerError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Task {task} panicked: {reason}")]
    TaskPanicked { task: &'static str, reason: String },
}

/// Server mode configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Where hub agents (clients) connect
    pub hub_listener: ListenerConfig,
    /// Where external parties connect
    pub external_listener: ListenerConfig,
    pub relay: RelayConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hub_listener: ListenerConfig {
                listen_address: "0.0.0.0:9001".to_string(),
            },
            external_listener: ListenerConfig {
                listen_address: "0.0.0.0:9000".to_string(),
            },
            relay: RelayConfig::default(),
        }
    }
}

/// Client mode configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// The internal application reached through the hub
    pub application: DialerConfig,
    /// The hub server's hub listener
    pub hub: DialerConfig,
    pub relay: RelayConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            application: DialerConfig {
                target_address: String::new(),
                backoff: BackoffConfig::with_max(Duration::from_secs(1)),
            },
            hub: DialerConfig {
                target_address: String::new(),
                backoff: BackoffConfig::with_max(Duration::from_secs(5 * 60)),
            },
            relay: RelayConfig::default(),
        }
    }
}

/// Publicly reachable side: accepts hub agents and external parties.
pub struct HubServer {
    config: ServerConfig,
    relay: Relay,
    hub_ready: Option<oneshot::Sender<SocketAddr>>,
    external_ready: Option<oneshot::Sender<SocketAddr>>,
}

impl HubServer {
    pub fn new(config: ServerConfig) -> Result<Self, HubError> {
        let relay = Relay::new(config.relay.clone())?;
        Ok(Self {
            config,
            relay,
            hub_ready: None,
            external_ready: None,
        })
    }

    /// Receive the hub listener's bound address.
    pub fn with_hub_ready(mut self, ready: oneshot::Sender<SocketAddr>) -> Self {
        self.hub_ready = Some(ready);
        self
    }

    /// Receive the external listener's bound address.
    pub fn with_external_ready(mut self, ready: oneshot::Sender<SocketAddr>) -> Self {
        self.external_ready = Some(ready);
        self
    }

    pub fn stats(&self) -> RelayStats {
        self.relay.stats()
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), HubError> {
        info!(
            hub_listener = %self.config.hub_listener.listen_address,
            external_listener = %self.config.external_listener.listen_address,
            "Starting hub server"
        );

        let (mut hub_listener, hub_rx) = Listener::new(self.config.hub_listener.clone());
        hub_listener = hub_listener.with_role("hub");
        if let Some(ready) = self.hub_ready {
            hub_listener = hub_listener.with_ready(ready);
        }

        let (mut external_listener, external_rx) =
            Listener::new(self.config.external_listener.clone());
        external_listener = external_listener.with_role("external");
        if let Some(ready) = self.external_ready {
            external_listener = external_listener.with_ready(ready);
        }

        let scope = shutdown.child_token();
        let mut tasks = Supervisor::new(scope.clone());
        tasks.spawn("hub listener", {
            let scope = scope.clone();
            async move { hub_listener.run(scope).await.map_err(HubError::from) }
        });
        tasks.spawn("external listener", {
            let scope = scope.clone();
            async move { external_listener.run(scope).await.map_err(HubError::from) }
        });
        let mut relay = self.relay;
        tasks.spawn(
            "relay",
            async move {
                relay.run(scope, hub_rx, external_rx).await;
                Ok(())
            }
            .instrument(tracing::info_span!("relay", mode = "server")),
        );

        tasks.wait().await
    }
}

/// Internal side: dials the hub server and the application.
pub struct HubClient {
    config: ClientConfig,
    relay: Relay,
}

impl HubClient {
    pub fn new(config: ClientConfig) -> Result<Self, HubError> {
        let relay = Relay::new(config.relay.clone())?;
        Ok(Self { config, relay })
    }

    pub fn stats(&self) -> RelayStats {
        self.relay.stats()
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), HubError> {
        info!(
            application = %self.config.application.target_address,
            hub = %self.config.hub.target_address,
            "Starting hub client"
        );

        let (application, application_rx) = Dialer::new(self.config.application.clone());
        let application = application.with_role("application");
        let (hub, hub_rx) = Dialer::new(self.config.hub.clone());
        let hub = hub.with_role("hub");

        let scope = shutdown.child_token();
        let mut tasks = Supervisor::new(scope.clone());
        tasks.spawn("application dialer", {
            let scope = scope.clone();
            async move { application.run(scope).await.map_err(HubError::from) }
        });
        tasks.spawn("hub dialer", {
            let scope = scope.clone();
            async move { hub.run(scope).await.map_err(HubError::from) }
        });
        let mut relay = self.relay;
        tasks.spawn(
            "relay",
            async move {
                relay.run(scope, hub_rx, application_rx).await;
                Ok(())
            }
            .instrument(tracing::info_span!("relay", mode = "client")),
        );

        tasks.wait().await
    }
}

struct Supervisor {
    scope: CancellationToken,
    set: JoinSet<(&'static str, Result<(), HubError>)>,
    names: Vec<(tokio::task::Id, &'static str)>,
}

impl Supervisor {
    fn new(scope: CancellationToken) -> Self {
        Self {
            scope,
            set: JoinSet::new(),
            names: Vec::new(),
        }
    }

    fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<(), HubError>> + Send + 'static,
    {
        let handle = self.set.spawn(async move { (name, task.await) });
        self.names.push((handle.id(), name));
    }

    /// Await every task; the first one to finish cancels the scope.
    async fn wait(mut self) -> Result<(), HubError> {
        let mut first_error = None;
        while let Some(joined) = self.set.join_next().await {
            if !self.scope.is_cancelled() {
                info!("Supervised task finished, shutting down the others");
                self.scope.cancel();
            }
            match joined {
                Ok((name, Ok(()))) => debug!(task = name, "Task finished"),
                Ok((name, Err(e))) => {
                    error!(task = name, error = %e, "Task failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    let task = self
                        .names
                        .iter()
                        .find(|(id, _)| *id == e.id())
                        .map(|(_, name)| *name)
                        .unwrap_or("unknown");
                    error!(task, error = %e, "Task panicked");
                    first_error.get_or_insert(HubError::TaskPanicked {
                        task,
                        reason: e.to_string(),
                    });
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
