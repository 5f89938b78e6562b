//! TCP hub library - public API for embedding the hub in Rust applications
//!
//! Re-exports the hub crates and adds the two ready-made modes:
//!
//! - [`HubServer`]: two listeners (hub agents and external parties) feeding
//!   one relay. Runs on the publicly reachable host.
//! - [`HubClient`]: two dialers (the hub server and the internal
//!   application) feeding one relay. Runs next to the application.
//!
//! # Quick Start - Server
//!
//! ```ignore
//! use tcphub_lib::{CancellationToken, HubServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let shutdown = CancellationToken::new();
//!     HubServer::new(ServerConfig::default())?.run(shutdown).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Quick Start - Client
//!
//! ```ignore
//! use tcphub_lib::{ClientConfig, HubClient};
//!
//! let mut config = ClientConfig::default();
//! config.application.target_address = "127.0.0.1:5432".to_string();
//! config.hub.target_address = "hub.example.com:9001".to_string();
//! HubClient::new(config)?.run(shutdown).await?;
//! ```

mod hub;

pub use hub::{ClientConfig, HubClient, HubError, HubServer, ServerConfig};

pub use tcphub_client::{Dialer, DialerConfig, DialerError};
pub use tcphub_connection::{
    probe_read, Backoff, BackoffConfig, ConnectionEnd, ManagedConnection, ProbeOutcome,
    TryReadNow,
};
pub use tcphub_relay::{
    Direction, Relay, RelayConfig, RelayError, RelayStats, RelayStatsSnapshot, RelayStream, Role,
};
pub use tcphub_server_tcp::{Listener, ListenerConfig, ListenerError};
pub use tokio_util::sync::CancellationToken;
