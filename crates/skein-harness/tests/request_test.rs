//! Request/answer correlation across a live server.

use std::time::Duration;

use skein_client::ClientConfig;
use skein_harness::{Down, Lobby, Ping, Up, loopback};
use skein_server::ServerEvent;

#[tokio::test]
async fn answer_is_matched_even_when_other_traffic_arrives_first() {
    let mut lobby = Lobby::open(loopback()).await.unwrap();
    let mut member = lobby.join(ClientConfig::default()).await.unwrap();

    let client = member.client.clone();
    let request = tokio::spawn(async move { client.send_request(Ping(42)).await });

    let Some(ServerEvent::RequestReceived { connection_id, request_id, message }) = lobby.next_event().await
    else {
        panic!("expected a request");
    };
    assert_eq!(connection_id, member.id);
    assert_eq!(message, Up::Ping(42));

    let unsolicited = Down::Said { from: 9, text: "meanwhile".into() };
    assert_eq!(lobby.server.broadcast(&unsolicited).await, 1);
    assert!(lobby.server.answer(connection_id, request_id, &Down::Pong(42)).await);

    assert_eq!(request.await.unwrap(), Some(Down::Pong(42)));
    assert_eq!(member.next_message().await, Some(unsolicited));

    lobby.server.close().await;
}

#[tokio::test]
async fn concurrent_requests_each_get_their_own_answer() {
    let mut lobby = Lobby::open(loopback()).await.unwrap();
    let member = lobby.join(ClientConfig::default()).await.unwrap();

    let mut requests = Vec::new();
    for nonce in 0..4 {
        let client = member.client.clone();
        requests.push((nonce, tokio::spawn(async move { client.send_request(Ping(nonce)).await })));
    }

    // Answer in reverse arrival order.
    let mut received = Vec::new();
    for _ in 0..4 {
        match lobby.next_event().await {
            Some(ServerEvent::RequestReceived { connection_id, request_id, message: Up::Ping(nonce) }) => {
                received.push((connection_id, request_id, nonce));
            },
            other => panic!("expected a ping request, got {other:?}"),
        }
    }
    for (connection_id, request_id, nonce) in received.into_iter().rev() {
        assert!(lobby.server.answer(connection_id, request_id, &Down::Pong(nonce)).await);
    }

    for (nonce, request) in requests {
        assert_eq!(request.await.unwrap(), Some(Down::Pong(nonce)));
    }
    lobby.server.close().await;
}

#[tokio::test]
async fn late_answer_after_timeout_arrives_as_a_plain_message() {
    let mut lobby = Lobby::open(loopback()).await.unwrap();
    let config = ClientConfig { request_timeout: Some(Duration::from_millis(100)), ..ClientConfig::default() };
    let mut member = lobby.join(config).await.unwrap();

    assert_eq!(member.client.send_request(Ping(5)).await, None);

    let Some(ServerEvent::RequestReceived { request_id, .. }) = lobby.next_event().await else {
        panic!("expected a request");
    };
    assert!(lobby.server.answer(member.id, request_id, &Down::Pong(5)).await);
    assert_eq!(member.next_message().await, Some(Down::Pong(5)));
    assert!(member.client.is_connected());

    lobby.server.close().await;
}

#[tokio::test]
async fn losing_the_server_releases_waiting_requests() {
    let mut lobby = Lobby::open(loopback()).await.unwrap();
    let member = lobby.join(ClientConfig::default()).await.unwrap();

    let client = member.client.clone();
    let request = tokio::spawn(async move { client.send_request(Ping(1)).await });
    assert!(matches!(lobby.next_event().await, Some(ServerEvent::RequestReceived { .. })));

    lobby.server.close().await;
    assert_eq!(request.await.unwrap(), None);
}

#[tokio::test]
async fn plain_ping_is_not_a_request() {
    let mut lobby = Lobby::open(loopback()).await.unwrap();
    let member = lobby.join(ClientConfig::default()).await.unwrap();

    assert!(member.client.send_message(&Up::Ping(3)).await);
    assert_eq!(lobby.next_event().await, Some(ServerEvent::MessageReceived { connection_id: member.id, message: Up::Ping(3) }));

    lobby.server.close().await;
}
