//! tcp-hub CLI - reverse TCP relay
//!
//! Run `server` on a publicly reachable host and `client` next to an
//! application that cannot accept inbound connections. External parties
//! connect to the server and are relayed to the application through the
//! connection the client keeps open.

use anyhow::{Context, Result};
use clap::builder::RangedU64ValueParser;
use clap::{Parser, Subcommand};
use std::time::Duration;
use tcphub_lib::{
    BackoffConfig, CancellationToken, ClientConfig, DialerConfig, HubClient, HubServer,
    ListenerConfig, RelayConfig, ServerConfig,
};
use tracing::{error, info, warn, Instrument};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// tcp-hub - Reach applications behind NAT through a public relay
#[derive(Parser, Debug)]
#[command(name = "tcp-hub")]
#[command(about = "tcp-hub - Reach applications behind NAT through a public relay")]
#[command(version = env!("GIT_TAG"))]
struct Cli {
    /// Log filter (e.g. info, debug, tcphub_relay=trace)
    #[arg(long, global = true, env = "TCPHUB_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable verbose logging (same as --log-level debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept hub agents and external parties and relay between them
    #[command(alias = "h")]
    #[command(long_about = r#"
Accept hub agent connections on one address and external parties on
another, and relay each external party to a waiting hub agent.

EXAMPLES:
  # Defaults: agents on :9001, external parties on :9000
  tcp-hub server

  tcp-hub server --hub-listener-address 0.0.0.0:7001 \
    --external-listener-address 0.0.0.0:7000

ENVIRONMENT VARIABLES:
  TCPHUB_HUB_LISTENER_ADDRESS       Address hub agents connect to
  TCPHUB_EXTERNAL_LISTENER_ADDRESS  Address external parties connect to
  TCPHUB_BUFFER_SIZE                Relay buffer size per direction
    "#)]
    Server {
        /// Address hub agents (clients) connect to
        #[arg(
            long,
            alias = "server-listener",
            env = "TCPHUB_HUB_LISTENER_ADDRESS",
            default_value = "0.0.0.0:9001"
        )]
        hub_listener_address: String,

        /// Address external parties connect to
        #[arg(
            long,
            alias = "external-listener",
            env = "TCPHUB_EXTERNAL_LISTENER_ADDRESS",
            default_value = "0.0.0.0:9000"
        )]
        external_listener_address: String,

        /// Relay buffer size in bytes, per direction
        #[arg(long, env = "TCPHUB_BUFFER_SIZE", default_value = "65535", value_parser = buffer_size_parser())]
        buffer_size: usize,
    },

    /// Keep connections open to the hub server and to the local application
    #[command(alias = "c")]
    #[command(long_about = r#"
Dial the hub server and the application, and relay between them. Both
sides are redialed with exponential backoff whenever a pairing ends.

EXAMPLES:
  tcp-hub client --application-address 127.0.0.1:5432 \
    --hub-address hub.example.com:9001

  # Slower application retries, faster hub retries
  tcp-hub client --application-address 127.0.0.1:8080 \
    --hub-address hub.example.com:9001 \
    --application-backoff 5s --hub-backoff 30s

ENVIRONMENT VARIABLES:
  TCPHUB_APPLICATION_ADDRESS  Application to relay to
  TCPHUB_HUB_ADDRESS          Hub server's hub listener
  TCPHUB_APPLICATION_BACKOFF  Maximum delay between application dials
  TCPHUB_HUB_BACKOFF          Maximum delay between hub dials
  TCPHUB_BUFFER_SIZE          Relay buffer size per direction
    "#)]
    Client {
        /// Application address (e.g. 127.0.0.1:5432)
        #[arg(long, env = "TCPHUB_APPLICATION_ADDRESS")]
        application_address: String,

        /// Hub server address (e.g. hub.example.com:9001)
        #[arg(long, env = "TCPHUB_HUB_ADDRESS")]
        hub_address: String,

        /// Maximum delay between application dial attempts (e.g. 500ms, 1s, 2m)
        #[arg(long, env = "TCPHUB_APPLICATION_BACKOFF", default_value = "1s", value_parser = parse_duration)]
        application_backoff: Duration,

        /// Maximum delay between hub dial attempts (e.g. 30s, 5m, 1h)
        #[arg(long, env = "TCPHUB_HUB_BACKOFF", default_value = "5m", value_parser = parse_duration)]
        hub_backoff: Duration,

        /// Relay buffer size in bytes, per direction
        #[arg(long, env = "TCPHUB_BUFFER_SIZE", default_value = "65535", value_parser = buffer_size_parser())]
        buffer_size: usize,
    },

    /// Print version information
    Version,
}

fn buffer_size_parser() -> RangedU64ValueParser<usize> {
    RangedU64ValueParser::<usize>::new().range(1..)
}

/// Parse `250ms`, `10s`, `5m`, `1h`, or a bare number of seconds.
fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration '{}'", value))?;

    let duration = match unit {
        "ms" => Duration::from_millis(number),
        "" | "s" => Duration::from_secs(number),
        "m" => Duration::from_secs(number.saturating_mul(60)),
        "h" => Duration::from_secs(number.saturating_mul(3600)),
        other => {
            return Err(format!(
                "unknown duration unit '{}' (expected ms, s, m or h)",
                other
            ))
        }
    };
    Ok(duration)
}

/// Setup logging with the specified filter
fn setup_logging(log_level: &str, verbose: bool) {
    let log_level = if verbose { "debug" } else { log_level };

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Cancel `shutdown` on the first Ctrl+C or SIGTERM.
async fn watch_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = shutdown.cancelled() => return,
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
    shutdown.cancel();
}

fn print_version() {
    println!("package: {}", env!("CARGO_PKG_NAME"));
    println!("version: {}", env!("GIT_TAG"));
    println!("commit: {}", env!("GIT_HASH"));
    println!("built: {}", env!("BUILD_TIME"));
}

async fn run(command: Commands, shutdown: CancellationToken) -> Result<()> {
    match command {
        Commands::Server {
            hub_listener_address,
            external_listener_address,
            buffer_size,
        } => {
            let config = ServerConfig {
                hub_listener: ListenerConfig {
                    listen_address: hub_listener_address,
                },
                external_listener: ListenerConfig {
                    listen_address: external_listener_address,
                },
                relay: RelayConfig { buffer_size },
            };
            HubServer::new(config)
                .context("Invalid server configuration")?
                .run(shutdown)
                .await
                .context("Hub server stopped")
        }
        Commands::Client {
            application_address,
            hub_address,
            application_backoff,
            hub_backoff,
            buffer_size,
        } => {
            let config = ClientConfig {
                application: DialerConfig {
                    target_address: application_address,
                    backoff: BackoffConfig::with_max(application_backoff),
                },
                hub: DialerConfig {
                    target_address: hub_address,
                    backoff: BackoffConfig::with_max(hub_backoff),
                },
                relay: RelayConfig { buffer_size },
            };
            HubClient::new(config)
                .context("Invalid client configuration")?
                .run(shutdown)
                .await
                .context("Hub client stopped")
        }
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        print_version();
        return Ok(());
    }

    setup_logging(&cli.log_level, cli.verbose);

    let shutdown = CancellationToken::new();
    let signals = tokio::spawn(watch_signals(shutdown.clone()));

    let root = tracing::info_span!("tcp_hub", pid = std::process::id());
    let result = async {
        info!(version = env!("GIT_TAG"), commit = env!("GIT_HASH"), "tcp-hub starting...");
        let result = run(cli.command, shutdown.clone()).await;
        match &result {
            Ok(()) => info!("tcp-hub stopped"),
            Err(e) => error!("{:#}", e),
        }
        result
    }
    .instrument(root)
    .await;

    shutdown.cancel();
    let _ = signals.await;
    result
}
