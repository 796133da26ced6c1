//! End-to-end tests over loopback UDP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use ton_adnl::{
    Adnl, AdnlAddress, AdnlAddressList, AdnlChannel, AdnlConfig, AdnlError, AdnlNode,
    PeerPairState, RateLimitConfig,
};
use ton_crypto::PrivateKey;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn now() -> i32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i32
}

async fn transport() -> Adnl {
    let config = AdnlConfig::default().with_rate_limit(RateLimitConfig::disabled());
    Adnl::bind_with_config("127.0.0.1:0".parse().unwrap(), config)
        .await
        .unwrap()
}

async fn wait_for_state(channel: &AdnlChannel, state: PeerPairState) {
    timeout(Duration::from_secs(5), async {
        while channel.state().await != state {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("channel never reached {state:?}"));
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("handler dropped")
}

/// Forwards everything from the client to `target` twice and everything
/// from `target` back to the client once.
async fn spawn_duplicating_relay(target: SocketAddr) -> SocketAddr {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buffer = vec![0u8; 65535];
        let mut client = None;
        while let Ok((len, from)) = socket.recv_from(&mut buffer).await {
            if from == target {
                if let Some(client) = client {
                    let _ = socket.send_to(&buffer[..len], client).await;
                }
            } else {
                client = Some(from);
                for _ in 0..2 {
                    let _ = socket.send_to(&buffer[..len], target).await;
                }
            }
        }
    });
    addr
}

#[tokio::test]
async fn test_ping_and_query() {
    init_tracing();
    let (messages_tx, mut messages) = mpsc::unbounded_channel();

    let adnl_a = transport().await;
    let adnl_b = transport().await;
    let node_b = adnl_b
        .local_node(PrivateKey::generate())
        .on_message(move |_, data| {
            let _ = messages_tx.send(data.to_vec());
        })
        .on_query(|_, query| {
            assert_eq!(query.data(), b"ping");
            query.respond(b"pong".to_vec());
        })
        .build()
        .unwrap();
    let node_a = adnl_a.local_node(PrivateKey::generate()).build().unwrap();

    let channel = node_a.create_channel(node_b.node()).await.unwrap();
    channel.send_message(b"ping".to_vec()).await.unwrap();
    assert_eq!(recv(&mut messages).await, b"ping");

    wait_for_state(&channel, PeerPairState::ChannelReady).await;
    let answer = channel
        .send_query(b"ping".to_vec(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(answer, b"pong");

    // the query travelled through the channel, so B has seen it in use
    let channel_b = node_b.channel(&node_a.short_id()).unwrap();
    assert_eq!(channel_b.state().await, PeerPairState::ChannelReady);
    assert_eq!(channel.state().await, PeerPairState::ChannelReady);

    sleep(Duration::from_millis(100)).await;
    assert!(messages.try_recv().is_err(), "ping delivered twice");
}

#[tokio::test]
async fn test_unanswered_query_times_out() {
    init_tracing();
    let adnl_a = transport().await;
    let adnl_b = transport().await;
    let node_b = adnl_b.local_node(PrivateKey::generate()).build().unwrap();
    let node_a = adnl_a.local_node(PrivateKey::generate()).build().unwrap();

    let channel = node_a.create_channel(node_b.node()).await.unwrap();
    let started = Instant::now();
    let result = channel
        .send_query(b"anyone?".to_vec(), Duration::from_secs(1))
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(AdnlError::QueryTimeout)));
    assert!(elapsed >= Duration::from_secs(1), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "{elapsed:?}");
}

#[tokio::test]
async fn test_oversized_message_rejected() {
    init_tracing();
    let adnl = transport().await;
    let node = adnl.local_node(PrivateKey::generate()).build().unwrap();
    let remote = AdnlNode::with_socket_addr(
        PrivateKey::generate().public_key().into(),
        "127.0.0.1:9".parse().unwrap(),
    );
    let channel = node.create_channel(remote).await.unwrap();

    let max = adnl.config().max_message_size();
    let result = channel.send_message(vec![0u8; max]).await;
    assert!(matches!(result, Err(AdnlError::MessageTooLarge { .. })));

    // 4-byte constructor + 4-byte length prefix leaves this much payload
    assert!(channel.send_message(vec![0u8; max - 8]).await.is_ok());
}

#[tokio::test]
async fn test_duplicated_datagrams_delivered_once() {
    init_tracing();
    let (messages_tx, mut messages) = mpsc::unbounded_channel();

    let adnl_a = transport().await;
    let adnl_b = transport().await;
    let relay = spawn_duplicating_relay(adnl_b.local_addr().unwrap()).await;

    let reinit_date = now();
    let mut relay_list = AdnlAddressList::new(reinit_date, reinit_date);
    relay_list.addresses.push(AdnlAddress::from_socket_addr(relay));

    let node_b = adnl_b
        .local_node(PrivateKey::generate())
        .reinit_date(reinit_date)
        .address_list(relay_list)
        .on_message(move |_, data| {
            let _ = messages_tx.send(data.to_vec());
        })
        .on_query(|_, query| {
            let mut answer = query.data().to_vec();
            answer.reverse();
            query.respond(answer);
        })
        .build()
        .unwrap();
    // A advertises nothing, so B can only answer through the relay
    let node_a = adnl_a
        .local_node(PrivateKey::generate())
        .reinit_date(reinit_date)
        .address_list(AdnlAddressList::new(reinit_date, reinit_date))
        .build()
        .unwrap();

    let channel = node_a.create_channel(node_b.node()).await.unwrap();
    for i in 0..5u8 {
        channel.send_message(vec![i; 16]).await.unwrap();
    }

    let mut received = Vec::new();
    for _ in 0..5 {
        received.push(recv(&mut messages).await);
    }
    received.sort();
    assert_eq!(received, (0..5u8).map(|i| vec![i; 16]).collect::<Vec<_>>());

    let answer = channel
        .send_query(b"abc".to_vec(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(answer, b"cba");

    sleep(Duration::from_millis(200)).await;
    assert!(messages.try_recv().is_err(), "duplicate delivered");
}

#[tokio::test]
async fn test_peer_restart_is_detected() {
    init_tracing();
    let (messages_tx, mut messages) = mpsc::unbounded_channel();

    let adnl_a = transport().await;
    let node_a = adnl_a
        .local_node(PrivateKey::generate())
        .on_message(move |_, data| {
            let _ = messages_tx.send(data.to_vec());
        })
        .build()
        .unwrap();

    let key_b = PrivateKey::generate();
    let b_id = ton_adnl::AdnlIdFull::new(key_b.public_key()).short_id();

    // first incarnation of B
    let first_reinit = now() - 10;
    let adnl_b = transport().await;
    let node_b = adnl_b
        .local_node(key_b.clone())
        .reinit_date(first_reinit)
        .build()
        .unwrap();
    let channel_b = node_b.create_channel(node_a.node()).await.unwrap();
    channel_b.send_message(b"first life".to_vec()).await.unwrap();
    assert_eq!(recv(&mut messages).await, b"first life");
    wait_for_state(&channel_b, PeerPairState::ChannelReady).await;

    let channel_a = node_a.channel(&b_id).unwrap();
    assert_eq!(channel_a.peer_reinit_date().await, first_reinit);
    let first_channel = channel_a.channel_out_id().await;
    assert!(first_channel.is_some());
    drop(channel_b);
    drop(node_b);
    adnl_b.shutdown();

    // B comes back on another socket with a later reinit date
    let second_reinit = now();
    let adnl_b2 = transport().await;
    let node_b2 = adnl_b2
        .local_node(key_b)
        .reinit_date(second_reinit)
        .on_query(|_, query| {
            query.respond(b"second life".to_vec());
        })
        .build()
        .unwrap();
    let channel_b2 = node_b2.create_channel(node_a.node()).await.unwrap();
    channel_b2.send_message(b"back again".to_vec()).await.unwrap();
    assert_eq!(recv(&mut messages).await, b"back again");

    // A kept the same pair but rebuilt it around the new incarnation
    let same = node_a.channel(&b_id).unwrap();
    assert_eq!(same.remote_id(), channel_a.remote_id());
    let answer = channel_a
        .send_query(b"who?".to_vec(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(answer, b"second life");
    wait_for_state(&channel_a, PeerPairState::ChannelReady).await;

    // A saw the new epoch and ran a fresh handshake
    assert_eq!(channel_a.peer_reinit_date().await, second_reinit);
    let second_channel = channel_a.channel_out_id().await;
    assert!(second_channel.is_some());
    assert_ne!(second_channel, first_channel);
}
