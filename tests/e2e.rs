//! End-to-end tests over loopback UDP.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use bifrost::config::{Config, ProtocolConfig};
use bifrost::connection::Role;
use bifrost::crypto::{random_bytes, KeyPair, RootKeyPair};
use bifrost::endpoint::{EventHandler, RemoteClient, UdpClient, UdpServer};
use bifrost::protocol::{
    ClientHello, Direction, MessageSlot, Packet, PacketHeader, PacketType, SeqNum, ServerHello,
    HEADER_SIZE,
};
use bifrost::types::{ConnectionStatus, ConnectionToken, DisconnectReason, RetryMode};

/// Records inbound messages; replies to "ping" with a configured payload.
struct EchoHandler {
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    disconnects: Arc<AtomicBool>,
    reply: Vec<u8>,
}

impl EventHandler for EchoHandler {
    fn handle_message(&mut self, client: &mut RemoteClient<'_>, _msg_seq: SeqNum, payload: &[u8]) {
        self.received.lock().unwrap().push(payload.to_vec());
        if payload == b"ping" {
            client
                .send(self.reply.clone(), RetryMode::BestEffort)
                .unwrap();
        }
    }

    fn disconnect(&mut self, _client: &mut RemoteClient<'_>) {
        self.disconnects.store(true, Ordering::SeqCst);
    }
}

struct TestServer {
    addr: std::net::SocketAddr,
    root: bifrost::crypto::RootPublicKey,
    shutdown: bifrost::endpoint::ShutdownHandle,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    disconnects: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<bifrost::Result<()>>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn spawn_server(mut config: Config, reply: Vec<u8>) -> TestServer {
    init_tracing();
    config.server.listen_addr = "127.0.0.1:0".parse().unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let disconnects = Arc::new(AtomicBool::new(false));
    let handler = EchoHandler {
        received: received.clone(),
        disconnects: disconnects.clone(),
        reply,
    };

    let server = UdpServer::bind(config, handler).await.unwrap();
    let addr = server.local_addr().unwrap();
    let root = server.root_public_key();
    let shutdown = server.shutdown_handle();
    let task = tokio::spawn(server.run());

    TestServer {
        addr,
        root,
        shutdown,
        received,
        disconnects,
        task,
    }
}

async fn pump_until<F: FnMut(&mut UdpClient) -> bool>(
    client: &mut UdpClient,
    mut done: F,
    max_ms: u64,
) -> bool {
    for _ in 0..(max_ms / 5) {
        client.update().await.unwrap();
        if done(client) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[tokio::test]
async fn test_connect_send_and_fragmented_reply() {
    let reply: Vec<u8> = b"pong".repeat(500); // 2000 bytes, forces fragmentation
    let server = spawn_server(Config::default(), reply.clone()).await;

    let mut client = UdpClient::new(server.root.clone(), ProtocolConfig::default());
    client.connect(server.addr, None).await.unwrap();

    assert!(pump_until(&mut client, |c| c.connected(), 3000).await);
    assert!(client.token().is_some());

    client.send(Bytes::from_static(b"ping"), RetryMode::None).unwrap();

    let mut got = None;
    assert!(
        pump_until(
            &mut client,
            |c| {
                if let Some((_, payload)) = c.next_message() {
                    got = Some(payload);
                    true
                } else {
                    false
                }
            },
            3000
        )
        .await
    );
    assert_eq!(&got.unwrap()[..], &reply[..]);

    assert_eq!(server.received.lock().unwrap()[0], b"ping");
    let stats = client.stats().unwrap();
    assert!(stats.received >= 1);
    assert!(stats.assembled >= 1);

    client.disconnect();
    client.wait_for_disconnect().await.unwrap();
    assert!(server.disconnects.load(Ordering::SeqCst));

    server.shutdown.shutdown();
    let _ = server.task.await;
}

#[tokio::test]
async fn test_tracked_send_resolves_true() {
    let server = spawn_server(Config::default(), Vec::new()).await;

    let mut client = UdpClient::new(server.root.clone(), ProtocolConfig::default());
    client.connect(server.addr, None).await.unwrap();
    assert!(pump_until(&mut client, |c| c.connected(), 3000).await);

    let mut handle = client
        .send_tracked(Bytes::from_static(b"tracked"), RetryMode::BestEffort)
        .unwrap();

    let mut acked = false;
    assert!(
        pump_until(
            &mut client,
            |_| {
                if let Ok(result) = handle.try_recv() {
                    acked = result;
                    true
                } else {
                    false
                }
            },
            3000
        )
        .await
    );
    assert!(acked);

    server.shutdown.shutdown();
    let _ = server.task.await;
}

#[tokio::test]
async fn test_client_drops_after_server_goes_silent() {
    let mut config = Config::default();
    config.protocol.connection_timeout = Duration::from_secs(1);

    let server = spawn_server(config.clone(), Vec::new()).await;

    let mut client = UdpClient::new(server.root.clone(), config.protocol.clone());
    client.connect(server.addr, None).await.unwrap();
    assert!(pump_until(&mut client, |c| c.connected(), 3000).await);

    // kill the server mid-session
    server.shutdown.shutdown();
    let _ = server.task.await;

    assert!(
        pump_until(
            &mut client,
            |c| c.status() == ConnectionStatus::Dropped,
            4000
        )
        .await
    );
    assert_eq!(client.disconnect_reason(), Some(DisconnectReason::Timeout));
}

#[tokio::test]
async fn test_blocked_client_cannot_connect() {
    let mut config = Config::default();
    config.protocol.connection_timeout = Duration::from_secs(1);
    config.server.block_list.insert("127.0.0.1".parse().unwrap());

    let server = spawn_server(config.clone(), Vec::new()).await;

    let failed = Arc::new(AtomicBool::new(false));
    let flag = failed.clone();
    let mut client = UdpClient::new(server.root.clone(), config.protocol.clone());
    client
        .connect(
            server.addr,
            Some(Box::new(move |ok| flag.store(!ok, Ordering::SeqCst))),
        )
        .await
        .unwrap();

    assert!(pump_until(&mut client, |_| failed.load(Ordering::SeqCst), 4000).await);
    assert_eq!(client.status(), ConnectionStatus::Dropped);

    server.shutdown.shutdown();
    let _ = server.task.await;
}

/// A middleman answering with a SERVER_HELLO signed by the wrong root key
/// must be rejected, and the client must never send a CHALLENGE_RESP.
#[tokio::test]
async fn test_forged_server_hello_rejected() {
    init_tracing();
    let fake_server = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = fake_server.local_addr().unwrap();

    let pinned = RootKeyPair::generate().public();
    let wrong_root = RootKeyPair::generate();

    let failed = Arc::new(AtomicBool::new(false));
    let flag = failed.clone();
    let mut client = UdpClient::new(pinned, ProtocolConfig::default());
    client
        .connect(
            addr,
            Some(Box::new(move |ok| flag.store(!ok, Ordering::SeqCst))),
        )
        .await
        .unwrap();

    // harvest the CLIENT_HELLO
    let mut buf = vec![0u8; 2048];
    let (len, peer) = fake_server.recv_from(&mut buf).await.unwrap();
    let header = PacketHeader::decode(&buf[..HEADER_SIZE], Direction::ToServer).unwrap();
    assert_eq!(header.pkt_type, PacketType::ClientHello);
    let packet = Packet::decode(header, &buf[..len], None).unwrap();
    let hello = ClientHello::decode(&packet.messages[0].payload).unwrap();

    // forge a reply signed by a key the client does not trust
    let eph = KeyPair::generate();
    let forged = ServerHello {
        server_pubkey: eph.public,
        salt: random_bytes(),
        token: ConnectionToken::generate(),
    };
    let body = forged.encode_signed(&hello.client_pubkey, &wrong_root);
    let reply_header = PacketHeader::new(
        Direction::ToClient,
        1,
        PacketType::ServerHello,
        SeqNum(1),
        header.seq,
        0,
    );
    let reply = Packet::assemble(
        reply_header,
        vec![MessageSlot {
            msg_seq: SeqNum(1),
            pkt_type: PacketType::ServerHello,
            payload: Bytes::from(body),
        }],
    )
    .unwrap();
    fake_server
        .send_to(&reply.encode(None).unwrap(), peer)
        .await
        .unwrap();

    assert!(pump_until(&mut client, |_| failed.load(Ordering::SeqCst), 3000).await);
    assert_eq!(client.status(), ConnectionStatus::Dropped);

    // anything else the fake server sees can only be a hello retry, never
    // a challenge response
    loop {
        let recv = tokio::time::timeout(
            Duration::from_millis(300),
            fake_server.recv_from(&mut buf),
        )
        .await;
        match recv {
            Err(_) => break, // silence
            Ok(Ok((len, _))) => {
                let header =
                    PacketHeader::decode(&buf[..HEADER_SIZE], Direction::ToServer).unwrap();
                assert_eq!(header.pkt_type, PacketType::ClientHello, "len {len}");
            }
            Ok(Err(e)) => panic!("fake server socket error: {e}"),
        }
    }
}

/// Direction constants line up with roles: a server speaks "to client".
#[test]
fn test_role_directions() {
    assert_eq!(Role::Server.outbound_direction(), Direction::ToClient);
    assert_eq!(Role::Client.outbound_direction(), Direction::ToServer);
    assert_eq!(Role::Server.inbound_direction(), Direction::ToServer);
}
