//! Integration tests for meshes of sync managers over the in-memory transport.

use entanglement_engine::{MemoryNetwork, ResponseFuture, ResponseOutcome};
use entanglement_testkit::prelude::*;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

async fn outcome(future: ResponseFuture) -> ResponseOutcome {
    tokio::time::timeout(DEFAULT_WAIT, future)
        .await
        .expect("response did not arrive")
}

/// A server and a connected client.
async fn pair() -> (Mesh, SyncManager, SyncManager) {
    init_tracing();
    let mut mesh = Mesh::new();
    let server = mesh.add_node("server");
    let client = mesh.add_node("client");
    mesh.link_and_wait("client", "server").await;
    let owner = server.local_owner();
    assert!(wait_until(DEFAULT_WAIT, || client.owner(&owner).is_some()).await);
    (mesh, server, client)
}

#[tokio::test]
async fn committed_objects_reach_connected_peer() {
    let (_mesh, server, client) = pair().await;

    server.commit(&Widget::new(1, "gear").sized(3)).unwrap();

    assert!(wait_until(DEFAULT_WAIT, || client.count::<Widget>() == 1).await);
    assert_eq!(client.get::<Widget>(&[json!(1)]), Some(Widget::new(1, "gear").sized(3)));
    let obj = client.object::<Widget>(&[json!(1)]).unwrap();
    assert_eq!(obj.owner().id(), Some(server.local_owner()));
    assert_eq!(obj.sync_serial(), 1);
}

#[tokio::test]
async fn objects_committed_before_connecting_are_caught_up() {
    init_tracing();
    let mut mesh = Mesh::new();
    let server = mesh.add_node("server");
    let client = mesh.add_node("client");
    for id in 0..5 {
        server.commit(&Widget::new(id, "early")).unwrap();
    }

    mesh.link("client", "server");

    assert!(wait_until(DEFAULT_WAIT, || client.count::<Widget>() == 5).await);
    let owner = server.local_owner();
    assert!(wait_until(DEFAULT_WAIT, || client.owner(&owner).map(|o| o.incoming_serial) == Some(5)).await);
}

#[tokio::test]
async fn floods_relay_along_a_line() {
    init_tracing();
    let mut mesh = Mesh::new();
    let a = mesh.add_node("a");
    let b = mesh.add_node("b");
    let c = mesh.add_node("c");
    mesh.link_and_wait("b", "a").await;
    mesh.link_and_wait("c", "b").await;

    a.commit(&Widget::new(7, "relayed")).unwrap();

    assert!(wait_until(DEFAULT_WAIT, || c.count::<Widget>() == 1).await);
    assert_eq!(b.count::<Widget>(), 1);
    let owner = a.local_owner();
    let seen_by_c = c.owner(&owner).unwrap();
    assert_eq!(seen_by_c.dest, Some(node_hash("b")));
}

#[tokio::test]
async fn forward_round_trip_returns_owner_version() {
    let (_mesh, server, client) = pair().await;
    server.commit(&Widget::new(1, "gear")).unwrap();
    assert!(wait_until(DEFAULT_WAIT, || client.count::<Widget>() == 1).await);

    let future = client.forward(&Widget::new(1, "gear").sized(42)).unwrap();
    let obj = outcome(future).await.unwrap().expect("owner responded");

    assert_eq!(obj.decode::<Widget>().unwrap().size, 42);
    assert_eq!(server.get::<Widget>(&[json!(1)]).unwrap().size, 42);
    assert_eq!(client.get::<Widget>(&[json!(1)]).unwrap().size, 42);
    assert_eq!(server.object::<Widget>(&[json!(1)]).unwrap().sync_serial(), 2);
}

#[tokio::test]
async fn commit_of_a_remote_object_is_refused() {
    let (_mesh, server, client) = pair().await;
    server.commit(&Widget::new(1, "gear")).unwrap();
    assert!(wait_until(DEFAULT_WAIT, || client.count::<Widget>() == 1).await);

    let result = client.commit(&Widget::new(1, "mine now"));

    assert!(matches!(result, Err(SyncError::BadOwner(_))));
}

#[tokio::test]
async fn remote_create_lets_owner_assign_keys() {
    let (_mesh, server, client) = pair().await;
    let owner = server.local_owner();

    let future = client.create(owner, &Ticket::titled("printer jam"), false).unwrap();
    let obj = outcome(future).await.unwrap().expect("owner responded");

    let ticket: Ticket = obj.decode().unwrap();
    assert!(!ticket.id.is_empty());
    assert_eq!(ticket.title, "printer jam");
    assert_eq!(server.get::<Ticket>(&[json!(ticket.id)]), Some(ticket.clone()));
    assert!(wait_until(DEFAULT_WAIT, || client.get::<Ticket>(&[json!(ticket.id)]).is_some()).await);
}

#[tokio::test]
async fn create_with_sender_keys_needs_approval() {
    let (_mesh, server, client) = pair().await;
    let owner = server.local_owner();

    let refused = Ticket {
        id: "server-1".into(),
        title: "bad".into(),
    };
    let future = client.create(owner, &refused, true).unwrap();
    assert!(matches!(outcome(future).await, Err(SyncError::Unauthorized(_))));
    assert_eq!(server.count::<Ticket>(), 0);

    let approved = Ticket {
        id: "client-1".into(),
        title: "good".into(),
    };
    let future = client.create(owner, &approved, true).unwrap();
    let obj = outcome(future).await.unwrap().expect("owner responded");
    assert_eq!(obj.decode::<Ticket>().unwrap(), approved);
    assert_eq!(server.get::<Ticket>(&[json!("client-1")]), Some(approved));
}

#[tokio::test]
async fn create_of_an_existing_key_is_refused_as_not_found() {
    let (_mesh, server, client) = pair().await;
    let owner = server.local_owner();
    let ticket = Ticket {
        id: "client-7".into(),
        title: "first".into(),
    };
    outcome(client.create(owner, &ticket, true).unwrap()).await.unwrap();

    let again = Ticket {
        title: "second".into(),
        ..ticket.clone()
    };
    let result = outcome(client.create(owner, &again, true).unwrap()).await;

    assert!(matches!(result, Err(SyncError::NotFound(_))));
    assert_eq!(server.get::<Ticket>(&[json!("client-7")]), Some(ticket));
}

#[tokio::test]
async fn create_under_local_owner_commits_immediately() {
    let (_mesh, server, client) = pair().await;

    let future = server.create(server.local_owner(), &Ticket::titled("local"), false).unwrap();
    let obj = outcome(future).await.unwrap().expect("committed");

    let id = obj.decode::<Ticket>().unwrap().id;
    assert!(wait_until(DEFAULT_WAIT, || client.get::<Ticket>(&[json!(id)]).is_some()).await);
}

#[tokio::test]
async fn delete_from_a_peer_reaches_everyone() {
    init_tracing();
    let mut mesh = Mesh::new();
    let server = mesh.add_node("server");
    let left = mesh.add_node("left");
    let right = mesh.add_node("right");
    mesh.link_and_wait("left", "server").await;
    mesh.link_and_wait("right", "server").await;
    server.commit(&Widget::new(1, "doomed")).unwrap();
    assert!(wait_until(DEFAULT_WAIT, || left.count::<Widget>() == 1 && right.count::<Widget>() == 1).await);

    let future = left.delete(&Widget::new(1, "doomed")).unwrap();
    outcome(future).await.unwrap();

    assert!(wait_until(DEFAULT_WAIT, || {
        server.count::<Widget>() == 0 && left.count::<Widget>() == 0 && right.count::<Widget>() == 0
    })
    .await);
}

#[tokio::test]
async fn delete_of_a_missing_object_fails_locally() {
    let (_mesh, _server, client) = pair().await;

    let result = client.delete(&Widget::new(99, "ghost"));

    assert!(matches!(result, Err(SyncError::NotFound(_))));
}

#[tokio::test]
async fn forward_without_a_connection_to_the_owner_fails() {
    let (mesh, server, client) = pair().await;
    server.commit(&Widget::new(1, "gear")).unwrap();
    assert!(wait_until(DEFAULT_WAIT, || client.count::<Widget>() == 1).await);

    mesh.unlink("client", "server");

    let result = client.forward(&Widget::new(1, "gear").sized(1));
    assert!(matches!(result, Err(SyncError::NotConnected { .. })));
}

#[tokio::test]
async fn explicit_destination_must_be_connected() {
    let (_mesh, server, client) = pair().await;
    let obj = server.commit(&Widget::new(1, "gear")).unwrap();

    let options = SyncOptions::new(Operation::Sync).to(vec![node_hash("nobody")]);
    assert!(matches!(
        server.synchronize(&obj, options),
        Err(SyncError::NotConnected { .. })
    ));

    let options = SyncOptions::new(Operation::Sync).to(vec![client.dest_hash()]);
    assert!(server.synchronize(&obj, options).unwrap().is_none());
}

#[tokio::test]
async fn paused_writes_stay_queued_until_resumed() {
    let (_mesh, server, client) = pair().await;
    let peer = node_hash("client");
    assert!(server.pause_writing(&peer));

    server.commit(&Widget::new(1, "held")).unwrap();

    let stats = server.connection_stats(&peer).unwrap();
    assert!(stats.paused);
    assert!(stats.queued >= 1);
    settle().await;
    assert_eq!(client.count::<Widget>(), 0);

    assert!(server.resume_writing(&peer));
    assert!(wait_until(DEFAULT_WAIT, || client.count::<Widget>() == 1).await);
    assert!(wait_until(DEFAULT_WAIT, || server.connection_stats(&peer).map(|s| s.queued) == Some(0)).await);
    assert!(!server.connection_stats(&peer).unwrap().paused);
    assert!(!server.pause_writing(&node_hash("nobody")));
}

#[tokio::test]
async fn dials_until_the_listener_appears() {
    init_tracing();
    let mut mesh = Mesh::new();
    mesh.add_node("server");
    let client = mesh.add_node("client");
    mesh.stop_listening("server");

    mesh.link("client", "server");
    settle().await;
    assert_eq!(
        client.connection_state(&node_hash("server")),
        Some(ConnectionState::Connecting)
    );

    mesh.resume_listening("server");
    assert!(mesh.wait_linked("client", "server").await);
}

#[tokio::test]
async fn removed_destination_is_forgotten() {
    let (mesh, server, client) = pair().await;

    mesh.unlink("client", "server");

    assert!(client.connection_state(&server.dest_hash()).is_none());
    assert!(server.destinations().is_empty());
    assert!(matches!(
        client.drain(&server.dest_hash()).await,
        Err(SyncError::NotConnected { .. })
    ));
}

#[tokio::test]
async fn unknown_peers_go_through_the_hook() {
    init_tracing();
    let network = MemoryNetwork::new();
    let consulted = Arc::new(AtomicBool::new(false));
    let seen = consulted.clone();
    let server = SyncManager::builder(node_hash("server"))
        .registry(sample_registry())
        .config(fast_config())
        .unknown_destination(move |hash| {
            seen.store(true, Ordering::SeqCst);
            Some(Destination::new(hash, "guest"))
        })
        .build();
    let _listener = server.serve(network.listen("server", node_hash("server")));
    let client = SyncManager::builder(node_hash("client"))
        .registry(sample_registry())
        .config(fast_config())
        .connector(network.connector(node_hash("client")))
        .build();
    client
        .add_destination(Destination::new(node_hash("server"), "server").with_endpoint(Endpoint::Memory("server".into())))
        .unwrap();

    server.commit(&Widget::new(1, "welcome")).unwrap();

    assert!(wait_until(DEFAULT_WAIT, || client.count::<Widget>() == 1).await);
    assert!(consulted.load(Ordering::SeqCst));
    assert_eq!(server.destinations()[0].name, "guest");
    server.close();
    client.close();
}

#[tokio::test]
async fn commit_transition_completes_remote_transition() {
    let (_mesh, server, client) = pair().await;
    server.commit(&Dial::at(1, 0)).unwrap();
    assert!(wait_until(DEFAULT_WAIT, || client.count::<Dial>() == 1).await);

    let future = client.perform_transition(&Dial::at(1, 10)).unwrap().expect("first step");
    assert!(client.perform_transition(&Dial::at(1, 20)).unwrap().is_none());
    assert_eq!(client.transition_state::<Dial>(&[json!(1)]).unwrap().position, 20);
    assert!(
        wait_until(DEFAULT_WAIT, || {
            server.transition_state::<Dial>(&[json!(1)]).map(|d| d.position) == Some(20)
        })
        .await
    );

    server.commit_transition(&Dial::at(1, 25)).unwrap();

    let obj = outcome(future).await.unwrap().expect("owner committed");
    assert_eq!(obj.decode::<Dial>().unwrap().position, 25);
    assert!(wait_until(DEFAULT_WAIT, || client.get::<Dial>(&[json!(1)]).map(|d| d.position) == Some(25)).await);
    assert!(wait_until(DEFAULT_WAIT, || client.transition_state::<Dial>(&[json!(1)]).is_none()).await);
    assert!(server.transition_state::<Dial>(&[json!(1)]).is_none());
}

#[tokio::test]
async fn plain_commit_breaks_remote_transition() {
    let (_mesh, server, client) = pair().await;
    server.commit(&Dial::at(1, 0)).unwrap();
    assert!(wait_until(DEFAULT_WAIT, || client.count::<Dial>() == 1).await);

    let future = client.perform_transition(&Dial::at(1, 10)).unwrap().expect("first step");
    assert!(wait_until(DEFAULT_WAIT, || server.transition_state::<Dial>(&[json!(1)]).is_some()).await);

    server.commit(&Dial::at(1, -5)).unwrap();

    assert!(matches!(
        outcome(future).await,
        Err(SyncError::BrokenTransition { .. })
    ));
    assert!(wait_until(DEFAULT_WAIT, || client.get::<Dial>(&[json!(1)]).map(|d| d.position) == Some(-5)).await);
}

#[tokio::test]
async fn transitions_need_a_transition_type() {
    let (_mesh, server, _client) = pair().await;
    server.commit(&Widget::new(1, "gear")).unwrap();

    let result = server.perform_transition(&Widget::new(1, "gear").sized(2));

    assert!(matches!(result, Err(SyncError::BadOperation(_))));
}
