//! Relay scenarios over real loopback sockets
//!
//! Each "managed" connection is the relay-side end of a loopback pair; the
//! test keeps the other end ("remote") to play the hub agent or the
//! external party.

use std::time::Duration;

use rand::RngCore;
use tcphub_connection::ManagedConnection;
use tcphub_relay::{Relay, RelayConfig, RelayStats};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const STEP: Duration = Duration::from_millis(100);
const BOUND: Duration = Duration::from_secs(3);

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();
}

async fn managed(parent: &CancellationToken) -> (ManagedConnection, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (remote, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let conn = ManagedConnection::from_tcp(parent, accepted.unwrap().0).unwrap();
    (conn, remote.unwrap())
}

struct Harness {
    shutdown: CancellationToken,
    hub_tx: mpsc::Sender<ManagedConnection>,
    external_tx: mpsc::Sender<ManagedConnection>,
    stats: RelayStats,
    task: JoinHandle<()>,
}

impl Harness {
    fn start(config: RelayConfig) -> Self {
        init_tracing();
        let shutdown = CancellationToken::new();
        let (hub_tx, hub_rx) = mpsc::channel(1);
        let (external_tx, external_rx) = mpsc::channel(1);
        let mut relay = Relay::new(config).unwrap();
        let stats = relay.stats();
        let relay_shutdown = shutdown.clone();
        let task = tokio::spawn(async move {
            relay.run(relay_shutdown, hub_rx, external_rx).await;
        });
        Self {
            shutdown,
            hub_tx,
            external_tx,
            stats,
            task,
        }
    }

    async fn hub(&self) -> TcpStream {
        let (conn, remote) = managed(&self.shutdown).await;
        self.hub_tx.send(conn).await.unwrap();
        remote
    }

    async fn external(&self) -> TcpStream {
        let (conn, remote) = managed(&self.shutdown).await;
        self.external_tx.send(conn).await.unwrap();
        remote
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(BOUND, self.task)
            .await
            .expect("relay did not stop in time")
            .unwrap();
    }
}

async fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(BOUND, stream.read_exact(&mut buf))
        .await
        .expect("timed out waiting for relayed bytes")
        .unwrap();
    buf
}

async fn expect_eof(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    loop {
        let read = tokio::time::timeout(BOUND, stream.read(&mut buf))
            .await
            .expect("connection was not closed in time");
        match read {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_relay_is_byte_exact_in_both_directions() {
    let harness = Harness::start(RelayConfig { buffer_size: 4096 });
    let mut hub = harness.hub().await;
    let mut external = harness.external().await;

    let mut to_external = vec![0u8; 512 * 1024];
    let mut to_hub = vec![0u8; 256 * 1024];
    rand::thread_rng().fill_bytes(&mut to_external);
    rand::thread_rng().fill_bytes(&mut to_hub);

    let (mut hub_read, mut hub_write) = hub.split();
    let (mut external_read, mut external_write) = external.split();

    let send_down = async {
        hub_write.write_all(&to_external).await.unwrap();
    };
    let send_up = async {
        external_write.write_all(&to_hub).await.unwrap();
    };
    let recv_down = async {
        let mut buf = vec![0u8; to_external.len()];
        external_read.read_exact(&mut buf).await.unwrap();
        buf
    };
    let recv_up = async {
        let mut buf = vec![0u8; to_hub.len()];
        hub_read.read_exact(&mut buf).await.unwrap();
        buf
    };

    let (_, _, down, up) = tokio::time::timeout(
        Duration::from_secs(10),
        async { tokio::join!(send_down, send_up, recv_down, recv_up) },
    )
    .await
    .expect("relay stalled");

    assert!(down == to_external, "hub -> external bytes differ");
    assert!(up == to_hub, "external -> hub bytes differ");

    // Copy tasks are joined by the relay before it stops
    let stats = harness.stats.clone();
    harness.stop().await;
    let snapshot = stats.snapshot();
    // Bytes written before the relay saw both legs may have gone through the probe
    assert_eq!(
        snapshot.hub_to_external_bytes + snapshot.external_to_hub_bytes + snapshot.pending_bytes,
        (to_external.len() + to_hub.len()) as u64
    );
    assert!(snapshot.hub_to_external_bytes <= to_external.len() as u64);
    assert!(snapshot.external_to_hub_bytes <= to_hub.len() as u64);
    assert_eq!(snapshot.pairings, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bytes_sent_before_pairing_arrive_first() {
    let harness = Harness::start(RelayConfig::default());

    let mut external = harness.external().await;
    external.write_all(b"HELLO").await.unwrap();
    tokio::time::sleep(STEP).await;

    let mut hub = harness.hub().await;
    external.write_all(b"WORLD").await.unwrap();
    assert_eq!(read_exactly(&mut hub, 10).await, b"HELLOWORLD");

    hub.write_all(b"reply").await.unwrap();
    assert_eq!(read_exactly(&mut external, 5).await, b"reply");

    let stats = harness.stats.clone();
    harness.stop().await;
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.pending_bytes, 5);
    assert_eq!(snapshot.external_to_hub_bytes, 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_second_hub_connection_replaces_first() {
    let harness = Harness::start(RelayConfig::default());

    let mut first = harness.hub().await;
    tokio::time::sleep(STEP).await;
    let mut second = harness.hub().await;

    expect_eof(&mut first).await;

    let mut external = harness.external().await;
    external.write_all(b"to second").await.unwrap();
    assert_eq!(read_exactly(&mut second, 9).await, b"to second");

    let snapshot = harness.stats.snapshot();
    assert_eq!(snapshot.replacements, 1);
    assert_eq!(snapshot.pairings, 1);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_closing_one_leg_closes_the_other() {
    let harness = Harness::start(RelayConfig::default());

    let hub = harness.hub().await;
    let mut external = harness.external().await;
    tokio::time::sleep(STEP).await;

    drop(hub);
    expect_eof(&mut external).await;

    let mut hub = harness.hub().await;
    let mut external = harness.external().await;
    external.write_all(b"again").await.unwrap();
    hub.write_all(b"back").await.unwrap();
    assert_eq!(read_exactly(&mut hub, 5).await, b"again");
    assert_eq!(read_exactly(&mut external, 4).await, b"back");

    drop(external);
    expect_eof(&mut hub).await;

    assert_eq!(harness.stats.snapshot().pairings, 2);
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_waiting_peer_closed_before_pairing_is_discarded() {
    let harness = Harness::start(RelayConfig::default());

    let external = harness.external().await;
    drop(external);
    tokio::time::sleep(STEP).await;

    let mut hub = harness.hub().await;
    tokio::time::sleep(STEP).await;
    assert_eq!(harness.stats.snapshot().probe_aborts, 1);
    assert_eq!(harness.stats.snapshot().pairings, 0);

    // The hub connection stays and pairs with the next external party
    let mut external = harness.external().await;
    external.write_all(b"late").await.unwrap();
    assert_eq!(read_exactly(&mut hub, 4).await, b"late");

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_mid_stream_closes_both_legs() {
    let harness = Harness::start(RelayConfig::default());

    let mut hub = harness.hub().await;
    let mut external = harness.external().await;
    hub.write_all(b"in flight").await.unwrap();
    assert_eq!(read_exactly(&mut external, 9).await, b"in flight");

    harness.stop().await;

    expect_eof(&mut hub).await;
    expect_eof(&mut external).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_closes_waiting_connection() {
    let harness = Harness::start(RelayConfig::default());
    let mut hub = harness.hub().await;
    tokio::time::sleep(STEP).await;

    harness.stop().await;
    expect_eof(&mut hub).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_relay_returns_when_sources_close() {
    init_tracing();
    let (hub_tx, hub_rx) = mpsc::channel::<ManagedConnection>(1);
    let (external_tx, external_rx) = mpsc::channel::<ManagedConnection>(1);
    let mut relay = Relay::new(RelayConfig::default()).unwrap();

    drop(hub_tx);
    drop(external_tx);

    tokio::time::timeout(
        BOUND,
        relay.run(CancellationToken::new(), hub_rx, external_rx),
    )
    .await
    .expect("relay should stop once both sources are gone");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_relay_returns_when_one_source_closes_after_the_other() {
    init_tracing();
    let scope = CancellationToken::new();
    let (hub_tx, hub_rx) = mpsc::channel::<ManagedConnection>(1);
    let (external_tx, external_rx) = mpsc::channel::<ManagedConnection>(1);
    let mut relay = Relay::new(RelayConfig::default()).unwrap();

    let (conn, mut remote) = managed(&scope).await;
    hub_tx.send(conn).await.unwrap();
    drop(hub_tx);

    let task = tokio::spawn(async move {
        relay.run(CancellationToken::new(), hub_rx, external_rx).await;
    });
    tokio::time::sleep(STEP).await;
    assert!(!task.is_finished(), "external source is still open");

    drop(external_tx);
    tokio::time::timeout(BOUND, task)
        .await
        .expect("relay should stop once both sources are gone")
        .unwrap();
    // The waiting hub connection is closed on the way out
    expect_eof(&mut remote).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_ends_pairing_of_connections_from_another_scope() {
    init_tracing();
    // Connections owned by a scope the relay knows nothing about
    let connection_scope = CancellationToken::new();
    let shutdown = CancellationToken::new();
    let (hub_tx, hub_rx) = mpsc::channel(1);
    let (external_tx, external_rx) = mpsc::channel(1);
    let mut relay = Relay::new(RelayConfig::default()).unwrap();
    let stats = relay.stats();
    let relay_shutdown = shutdown.clone();
    let task = tokio::spawn(async move {
        relay.run(relay_shutdown, hub_rx, external_rx).await;
    });

    let (hub_conn, mut hub) = managed(&connection_scope).await;
    let (external_conn, mut external) = managed(&connection_scope).await;
    hub_tx.send(hub_conn).await.unwrap();
    external_tx.send(external_conn).await.unwrap();

    hub.write_all(b"ping").await.unwrap();
    assert_eq!(read_exactly(&mut external, 4).await, b"ping");
    assert_eq!(stats.snapshot().pairings, 1);

    shutdown.cancel();
    tokio::time::timeout(BOUND, task)
        .await
        .expect("relay should stop on shutdown during a pairing")
        .unwrap();

    expect_eof(&mut hub).await;
    expect_eof(&mut external).await;
    assert!(!connection_scope.is_cancelled());
}
