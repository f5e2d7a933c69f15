use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use meshlink_crypto::{KeyPair, Nonce};
use meshlink_network::protocol::{decode, encode, SignalMessage};
use meshlink_network::{
    NegotiationMessage, PeerPath, PeerTransport, RelayClient, RelayServer, RelayServerConfig,
    SignalChannel, SignalClient, SignalConfig, SignalServer, TransportConfig, TransportEvent,
};

const WAIT: Duration = Duration::from_secs(3);

async fn signal_server() -> Arc<SignalServer> {
    let server = Arc::new(SignalServer::bind("127.0.0.1:0", SignalConfig::default()).await.unwrap());
    tokio::spawn(server.clone().run());
    server
}

#[tokio::test]
async fn offer_reaches_remote_through_signal_server() {
    let server = signal_server().await;
    let addr = server.local_addr().unwrap();

    let alice = KeyPair::generate().public;
    let bob = KeyPair::generate().public;

    let alice_client = SignalClient::connect(addr, alice, SignalConfig::default()).await.unwrap();
    let bob_client = SignalClient::connect(addr, bob, SignalConfig::default()).await.unwrap();

    let mut bob_inbox = bob_client.subscribe(bob);
    let _alice_inbox = alice_client.subscribe(alice);

    let observed = alice_client.wait_observed(WAIT).await.unwrap();
    assert_eq!(observed.ip().to_string(), "127.0.0.1");
    bob_client.wait_observed(WAIT).await.unwrap();

    let offer = NegotiationMessage::Offer {
        negotiation: Nonce::random(),
        candidates: Vec::new(),
    };
    let payload = meshlink_network::protocol::encode(&offer).unwrap();
    alice_client.send(alice, bob, payload.clone()).await.unwrap();

    let envelope = tokio::time::timeout(WAIT, bob_inbox.next()).await.unwrap().unwrap();
    assert_eq!(envelope.from, alice);
    assert_eq!(envelope.payload, payload);
    assert_eq!(server.stats().subscribers, 2);
}

/// Next `Deliver` on a raw subscriber socket, skipping acks of subscribes
async fn next_delivery(socket: &tokio::net::UdpSocket) -> (u64, Vec<u8>) {
    let mut buf = [0u8; 2048];
    loop {
        let (len, _) = tokio::time::timeout(WAIT, socket.recv_from(&mut buf)).await.unwrap().unwrap();
        if let SignalMessage::Deliver { id, envelope } = decode(&buf[..len]).unwrap() {
            return (id, envelope.payload);
        }
    }
}

#[tokio::test]
async fn unacked_delivery_is_retransmitted() {
    let config = SignalConfig {
        send_attempts: 4,
        ack_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let server = Arc::new(SignalServer::bind("127.0.0.1:0", config).await.unwrap());
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.clone().run());

    let alice = KeyPair::generate().public;
    let bob = KeyPair::generate().public;

    // Bob is a bare socket so the test decides which deliveries get acked
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let subscribe = encode(&SignalMessage::Subscribe { peer: bob }).unwrap();
    socket.send_to(&subscribe, addr).await.unwrap();
    while server.stats().subscribers == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    server.hub().send(alice, bob, vec![7, 7, 7]).await.unwrap();

    // First copy is "lost": never acked
    let (first_id, payload) = next_delivery(&socket).await;
    assert_eq!(payload, vec![7, 7, 7]);

    let (second_id, payload) = next_delivery(&socket).await;
    assert_eq!(second_id, first_id);
    assert_eq!(payload, vec![7, 7, 7]);

    let ack = encode(&SignalMessage::DeliverAck { peer: bob, id: second_id }).unwrap();
    socket.send_to(&ack, addr).await.unwrap();

    // Acked: no further copies
    let mut buf = [0u8; 2048];
    let quiet = tokio::time::timeout(Duration::from_millis(600), socket.recv_from(&mut buf)).await;
    assert!(quiet.is_err());
}

#[tokio::test]
async fn send_without_server_expires() {
    // Nothing listens on this socket's address once it is dropped
    let unused = std::net::UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
    let config = SignalConfig {
        send_attempts: 2,
        ack_timeout: Duration::from_millis(100),
        ..Default::default()
    };

    let me = KeyPair::generate().public;
    let them = KeyPair::generate().public;
    let client = SignalClient::connect(unused, me, config).await.unwrap();

    let err = client.send(me, them, vec![1]).await.unwrap_err();
    assert!(matches!(err, meshlink_network::NetworkError::SignalExpired(k) if k == them));
}

#[tokio::test]
async fn keepalive_flows_through_relay() {
    let relay = Arc::new(RelayServer::bind("127.0.0.1:0", RelayServerConfig::default()).await.unwrap());
    let relay_addr = relay.local_addr().unwrap();
    tokio::spawn(relay.clone().run());

    let a_keys = KeyPair::generate();
    let b_keys = KeyPair::generate();
    let (a_pub, b_pub) = (a_keys.public, b_keys.public);

    let a = PeerTransport::bind("127.0.0.1:0".parse().unwrap(), a_keys, TransportConfig::default())
        .await
        .unwrap();
    let b = PeerTransport::bind("127.0.0.1:0".parse().unwrap(), b_keys, TransportConfig::default())
        .await
        .unwrap();
    a.authorize(b_pub);
    b.authorize(a_pub);

    let a_relay = RelayClient::connect(a_pub, relay_addr).await.unwrap();
    let b_relay = RelayClient::connect(b_pub, relay_addr).await.unwrap();
    a.attach_relay(a_relay.clone());
    b.attach_relay(b_relay.clone());

    let endpoint = a_relay.allocate(b_pub).await.unwrap();
    assert_eq!(endpoint.relay_addr, relay_addr);
    assert_eq!(endpoint.peer, a_pub);
    b_relay.allocate(a_pub).await.unwrap();

    let mut b_events = b.events();
    a.send_keepalive(b_pub, PeerPath::Relayed(relay_addr)).await.unwrap();

    let event = tokio::time::timeout(WAIT, b_events.recv()).await.unwrap().unwrap();
    assert_eq!(
        event,
        TransportEvent::Liveness {
            peer: a_pub,
            path: PeerPath::Relayed(relay_addr),
        }
    );
    assert_eq!(relay.stats().await.active_allocations, 2);

    a_relay.release(b_pub).await.unwrap();
    assert!(!a_relay.is_allocated(&b_pub));
}
