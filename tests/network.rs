//! End-to-end tests over the in-memory transport.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use goshawk::memory::{MemoryNet, MemoryTransport};
use goshawk::{
    Authority, Codec, Config, Endpoint, Error, HostStorage, Listener, Message, NetworkAddress,
    P2p, PlainCodec, Transport, NODE_NETWORK,
};

/// Honors `RUST_LOG` when a test needs tracing output.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn node(net: &Arc<MemoryNet>, ip: &str, config: Config) -> P2p<MemoryTransport> {
    P2p::new(
        config,
        Arc::new(PlainCodec::new()),
        net.endpoint(ip.parse().unwrap()),
    )
}

/// A quiet node: no pool, no sessions unless enabled per test.
fn quiet(seed: u64) -> Config {
    Config {
        host_pool_capacity: 0,
        outbound_connections: 0,
        inbound_connections: 0,
        rng_seed: Some(seed),
        ..Config::default()
    }
}

fn listening(ip: &str, seed: u64) -> Config {
    Config {
        bind: format!("{ip}:8333").parse().unwrap(),
        inbound_connections: 16,
        ..quiet(seed)
    }
}

async fn settle<T: Transport>(p2p: &P2p<T>, want: usize) {
    for _ in 0..600 {
        if p2p.connection_count() == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!(
        "connection count never settled at {want} (now {})",
        p2p.connection_count()
    );
}

#[tokio::test(start_paused = true)]
async fn handshake_success_at_31402() {
    init_logging();
    let net = MemoryNet::new();

    let b = node(
        &net,
        "10.0.0.2",
        Config {
            protocol_maximum: 31402,
            ..listening("10.0.0.2", 2)
        },
    );
    let a = node(
        &net,
        "10.0.0.1",
        Config {
            protocol_maximum: 31402,
            ..quiet(1)
        },
    );

    let mut a_conns = a.subscribe_connection();
    let mut b_conns = b.subscribe_connection();

    b.start().await.unwrap();
    b.run().await.unwrap();
    a.start().await.unwrap();
    a.run().await.unwrap();

    a.connect("10.0.0.2", 8333);

    let a_channel = timeout(Duration::from_secs(30), a_conns.recv())
        .await
        .expect("outbound adoption")
        .unwrap();
    assert_eq!(a_channel.authority(), "10.0.0.2:8333".parse().unwrap());
    assert_eq!(a_channel.negotiated_version(), 31402);
    assert_ne!(a_channel.nonce(), 0);

    let peer = a_channel.peer_version().expect("peer version recorded");
    assert_eq!(peer.value, 31402);
    assert_eq!(peer.services, NODE_NETWORK);

    let b_channel = timeout(Duration::from_secs(30), b_conns.recv())
        .await
        .expect("inbound adoption")
        .unwrap();
    assert_eq!(b_channel.authority().ip, "10.0.0.1".parse::<std::net::IpAddr>().unwrap());
    assert_eq!(b_channel.negotiated_version(), 31402);

    assert_eq!(a.connection_count(), 1);
    assert_eq!(b.connection_count(), 1);
    assert!(a.connected(&"10.0.0.2:8333".parse().unwrap()));

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn handshake_negotiates_relay_and_nonced_ping_at_70002() {
    init_logging();
    let net = MemoryNet::new();

    let b = node(&net, "10.0.0.2", listening("10.0.0.2", 2));
    let a = node(&net, "10.0.0.1", quiet(1));

    let mut b_conns = b.subscribe_connection();

    b.start().await.unwrap();
    b.run().await.unwrap();
    a.start().await.unwrap();
    a.run().await.unwrap();

    a.connect("10.0.0.2", 8333);

    let b_channel = timeout(Duration::from_secs(30), b_conns.recv())
        .await
        .expect("inbound adoption")
        .unwrap();
    assert_eq!(b_channel.negotiated_version(), 70002);
    let peer = b_channel.peer_version().expect("peer version recorded");
    assert!(peer.relay);

    // Survive several nonced heartbeat rounds; an unanswered ping
    // would stop the channel with a timeout.
    tokio::time::sleep(Duration::from_secs(400)).await;
    assert_eq!(a.connection_count(), 1);
    assert_eq!(b.connection_count(), 1);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn insufficient_version_is_rejected() {
    init_logging();
    let net = MemoryNet::new();

    // B only accepts 70002 peers; A tops out at 31402.
    let b = node(
        &net,
        "10.0.0.2",
        Config {
            protocol_minimum: 70002,
            protocol_maximum: 70002,
            ..listening("10.0.0.2", 2)
        },
    );
    let a = node(
        &net,
        "10.0.0.1",
        Config {
            protocol_maximum: 31402,
            ..quiet(1)
        },
    );

    let mut b_conns = b.subscribe_connection();

    b.start().await.unwrap();
    b.run().await.unwrap();
    a.start().await.unwrap();
    a.run().await.unwrap();

    a.connect("10.0.0.2", 8333);

    // Adoption never happens on either side.
    let adopted = timeout(Duration::from_secs(120), b_conns.recv()).await;
    assert!(adopted.is_err(), "obsolete peer must not be adopted");
    assert_eq!(a.connection_count(), 0);
    assert_eq!(b.connection_count(), 0);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn seeding_below_threshold_is_throttled() {
    init_logging();
    let net = MemoryNet::new();

    // The seed peer accepts us but has no addresses to give.
    let b = node(&net, "10.0.0.2", listening("10.0.0.2", 2));
    b.start().await.unwrap();
    b.run().await.unwrap();

    let a = node(
        &net,
        "10.0.0.1",
        Config {
            host_pool_capacity: 100,
            seeds: vec![Endpoint::new("10.0.0.2", 8333)],
            outbound_connections: 0,
            inbound_connections: 0,
            rng_seed: Some(1),
            ..Config::default()
        },
    );

    assert_eq!(a.start().await, Err(Error::PeerThrottling));
    assert_eq!(a.address_count(), 0);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

/// Serves a scripted seed peer on the raw transport: handshakes, echoes
/// pings and answers getaddr with the given list.
async fn fake_seed(
    transport: MemoryTransport,
    bind: Authority,
    addresses: Vec<NetworkAddress>,
) {
    let codec = PlainCodec::new();
    let mut listener = transport.bind(bind).await.unwrap();
    let (stream, _peer) = listener.accept().await.unwrap();
    let (mut reader, mut writer) = tokio::io::split(stream);

    let mut header = vec![0u8; codec.header_len()];
    loop {
        if reader.read_exact(&mut header).await.is_err() {
            return;
        }
        let frame = codec.decode_header(&header).unwrap();
        let mut payload = vec![0u8; frame.payload_len];
        if reader.read_exact(&mut payload).await.is_err() {
            return;
        }

        let replies = match codec.decode_payload(&frame.command, &payload).unwrap() {
            Message::Version(version) => vec![
                Message::Version(goshawk::VersionPayload {
                    value: 70002,
                    services: NODE_NETWORK,
                    timestamp: 1,
                    receiver: version.sender,
                    sender: bind.to_network_address(NODE_NETWORK),
                    nonce: 0x5eed,
                    user_agent: "/fake-seed/".into(),
                    start_height: 0,
                    relay: false,
                }),
                Message::Verack,
            ],
            Message::Ping { nonce: Some(nonce) } => vec![Message::Pong { nonce }],
            Message::GetAddress => vec![Message::Address(addresses.clone())],
            _ => Vec::new(),
        };

        for reply in replies {
            let frame = codec.encode(&reply).unwrap();
            if writer.write_all(&frame).await.is_err() {
                return;
            }
        }
    }
}

#[tokio::test(start_paused = true)]
async fn seeding_harvests_addresses() {
    init_logging();
    let net = MemoryNet::new();

    let addresses: Vec<NetworkAddress> = (0..150u32)
        .map(|i| NetworkAddress {
            services: NODE_NETWORK,
            ip: format!("10.1.{}.{}", i / 250, (i % 250) + 1).parse().unwrap(),
            port: 8333,
            timestamp: 1,
        })
        .collect();

    let seed_transport = net.endpoint("10.0.0.2".parse().unwrap());
    tokio::spawn(fake_seed(
        seed_transport,
        "10.0.0.2:8333".parse().unwrap(),
        addresses,
    ));

    let a = node(
        &net,
        "10.0.0.1",
        Config {
            host_pool_capacity: 1000,
            seeds: vec![Endpoint::new("10.0.0.2", 8333)],
            outbound_connections: 0,
            inbound_connections: 0,
            rng_seed: Some(1),
            ..Config::default()
        },
    );

    a.start().await.unwrap();
    assert_eq!(a.address_count(), 150);

    a.close().await.unwrap();
}

struct Preload(Vec<NetworkAddress>);

impl HostStorage for Preload {
    fn load(&self) -> std::io::Result<Vec<NetworkAddress>> {
        Ok(self.0.clone())
    }

    fn save(&self, _addresses: &[NetworkAddress]) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn outbound_replaces_a_stopped_channel() {
    init_logging();
    let net = MemoryNet::new();

    let b = node(&net, "10.0.0.2", listening("10.0.0.2", 2));
    let c = node(&net, "10.0.0.3", listening("10.0.0.3", 3));
    b.start().await.unwrap();
    b.run().await.unwrap();
    c.start().await.unwrap();
    c.run().await.unwrap();

    let pool = vec![
        NetworkAddress {
            services: NODE_NETWORK,
            ip: "10.0.0.2".parse().unwrap(),
            port: 8333,
            timestamp: 1,
        },
        NetworkAddress {
            services: NODE_NETWORK,
            ip: "10.0.0.3".parse().unwrap(),
            port: 8333,
            timestamp: 1,
        },
    ];

    let a = P2p::with_storage(
        Config {
            host_pool_capacity: 10,
            outbound_connections: 2,
            connect_batch_size: 2,
            inbound_connections: 0,
            connect_cycle_delay: Duration::from_millis(200),
            rng_seed: Some(1),
            ..Config::default()
        },
        Arc::new(PlainCodec::new()),
        net.endpoint("10.0.0.1".parse().unwrap()),
        Preload(pool),
    );

    let mut a_conns = a.subscribe_connection();

    a.start().await.unwrap();
    a.run().await.unwrap();

    settle(&a, 2).await;

    let first = timeout(Duration::from_secs(60), a_conns.recv())
        .await
        .expect("first adoption")
        .unwrap();
    let second = timeout(Duration::from_secs(60), a_conns.recv())
        .await
        .expect("second adoption")
        .unwrap();
    assert_ne!(first.authority(), second.authority());

    // Drop one channel; the outbound session must replace it.
    first.stop(Error::ChannelStopped);
    settle(&a, 2).await;

    let replacement = timeout(Duration::from_secs(120), a_conns.recv())
        .await
        .expect("replacement adoption")
        .unwrap();
    assert_ne!(replacement.authority(), second.authority());

    a.close().await.unwrap();
    b.close().await.unwrap();
    c.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn blacklisted_peer_is_never_dialed() {
    init_logging();
    let net = MemoryNet::new();

    let b = node(&net, "10.0.0.2", listening("10.0.0.2", 2));
    b.start().await.unwrap();
    b.run().await.unwrap();

    let pool = vec![NetworkAddress {
        services: NODE_NETWORK,
        ip: "10.0.0.2".parse().unwrap(),
        port: 8333,
        timestamp: 1,
    }];

    let a = P2p::with_storage(
        Config {
            host_pool_capacity: 10,
            outbound_connections: 1,
            connect_batch_size: 1,
            inbound_connections: 0,
            connect_cycle_delay: Duration::from_millis(200),
            blacklists: vec!["10.0.0.0/24".parse().unwrap()],
            rng_seed: Some(1),
            ..Config::default()
        },
        Arc::new(PlainCodec::new()),
        net.endpoint("10.0.0.1".parse().unwrap()),
        Preload(pool),
    );

    a.start().await.unwrap();
    a.run().await.unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(a.connection_count(), 0);
    assert_eq!(b.connection_count(), 0);

    a.close().await.unwrap();
    b.close().await.unwrap();
}
