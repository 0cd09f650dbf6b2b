//! Registry consistency under concurrent connects and disconnects.

use std::collections::HashSet;

use skein_client::ClientConfig;
use skein_harness::{Lobby, STEP, connect_client, eventually, loopback};
use tokio::task::JoinSet;

const CLIENTS: usize = 16;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_connects_get_distinct_ids() {
    let mut lobby = Lobby::open(loopback()).await.unwrap();

    let mut connecting = JoinSet::new();
    for _ in 0..CLIENTS {
        connecting.spawn(connect_client(lobby.addr, ClientConfig::default()));
    }
    let mut clients = Vec::new();
    while let Some(joined) = connecting.join_next().await {
        clients.push(joined.unwrap().unwrap());
    }

    let mut announced = HashSet::new();
    for _ in 0..CLIENTS {
        let id = lobby.next_connected().await.expect("ClientConnected for every client");
        assert!(announced.insert(id), "{id} announced twice");
    }

    assert_eq!(lobby.server.connection_count(), CLIENTS);
    let registered: HashSet<_> = lobby.server.connection_ids().into_iter().collect();
    assert_eq!(registered, announced);

    for (client, _events) in &clients {
        client.disconnect().await;
    }

    let mut lost = HashSet::new();
    for _ in 0..CLIENTS {
        let id = lobby.next_lost().await.expect("ConnectionLost for every client");
        assert!(lost.insert(id), "{id} lost twice");
    }
    assert_eq!(lost, announced);
    assert!(eventually(STEP, || lobby.server.connection_count() == 0).await);

    lobby.server.close().await;
}

#[tokio::test]
async fn ids_are_not_reused_after_disconnect() {
    let mut lobby = Lobby::open(loopback()).await.unwrap();

    let first = lobby.join(ClientConfig::default()).await.unwrap();
    let first_id = first.id;
    first.client.disconnect().await;
    assert_eq!(lobby.next_lost().await, Some(first_id));

    let second = lobby.join(ClientConfig::default()).await.unwrap();
    assert_ne!(second.id, first_id);
    assert!(second.id.get() > first_id.get());

    lobby.server.close().await;
}

#[tokio::test]
async fn remote_addresses_are_tracked_per_connection() {
    let mut lobby = Lobby::open(loopback()).await.unwrap();
    let members = lobby.join_many(2).await.unwrap();

    let a = lobby.server.remote_addr(members[0].id).unwrap();
    let b = lobby.server.remote_addr(members[1].id).unwrap();
    assert!(a.ip().is_loopback());
    assert_ne!(a.port(), b.port());

    lobby.server.close().await;
}
