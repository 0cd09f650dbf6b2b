//! Broadcast reaches exactly the connections registered when it starts.

use skein_client::ClientConfig;
use skein_harness::{Down, Lobby, loopback};

#[tokio::test]
async fn late_joiner_misses_earlier_broadcast() {
    let mut lobby = Lobby::open(loopback()).await.unwrap();
    let mut members = lobby.join_many(3).await.unwrap();

    let first = Down::Said { from: 0, text: "before".into() };
    assert_eq!(lobby.server.broadcast(&first).await, 3);

    let mut late = lobby.join(ClientConfig::default()).await.unwrap();
    let second = Down::Said { from: 0, text: "after".into() };
    assert_eq!(lobby.server.broadcast(&second).await, 4);

    for member in &mut members {
        assert_eq!(member.next_message().await, Some(first.clone()));
        assert_eq!(member.next_message().await, Some(second.clone()));
    }
    assert_eq!(late.next_message().await, Some(second));

    lobby.server.close().await;
}

#[tokio::test]
async fn broadcast_to_nobody_sends_nothing() {
    let lobby = Lobby::open(loopback()).await.unwrap();
    assert_eq!(lobby.server.broadcast(&Down::Pong(0)).await, 0);
    lobby.server.close().await;
}

#[tokio::test]
async fn per_connection_order_is_preserved() {
    let mut lobby = Lobby::open(loopback()).await.unwrap();
    let mut member = lobby.join(ClientConfig::default()).await.unwrap();

    for n in 0..50 {
        assert_eq!(lobby.server.send_message(&Down::Pong(n), &[member.id]).await, 1);
    }
    for n in 0..50 {
        assert_eq!(member.next_message().await, Some(Down::Pong(n)));
    }

    lobby.server.close().await;
}
