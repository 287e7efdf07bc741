//! End-to-end walkthroughs of the core sync behaviors, one test each.
//!
//! Where exact traffic matters, the far end is a [`ScriptedPeer`] so the
//! test can count what went over the wire.

use entanglement_engine::{ResponseFuture, ResponseOutcome, WRONG_EPOCH, YOU_HAVE};
use entanglement_protocol::SyncMessage;
use entanglement_testkit::prelude::*;
use serde_json::{json, Value};
use uuid::Uuid;

async fn outcome(future: ResponseFuture) -> ResponseOutcome {
    tokio::time::timeout(DEFAULT_WAIT, future)
        .await
        .expect("response did not arrive")
}

/// Connects a scripted peer to `server` and waits for the owner announcement.
async fn scripted(server: &SyncManager, name: &str) -> (ScriptedPeer, Uuid, Epoch) {
    let peer = ScriptedPeer::connect(server, name).await;
    let owner = server.local_owner();
    assert!(wait_until(DEFAULT_WAIT, || peer.announced_epoch(owner).is_some()).await);
    let epoch = peer.announced_epoch(owner).expect("owner announced");
    (peer, owner, epoch)
}

fn about(msg: &SyncMessage, owner: Uuid) -> bool {
    msg.owner().ok().flatten() == Some(owner)
}

fn serial(msg: &SyncMessage) -> Option<u64> {
    msg.get("serial").and_then(Value::as_u64)
}

fn widgets_with_id(peer: &ScriptedPeer, id: u32) -> Vec<SyncMessage> {
    peer.received_of(Widget::SYNC_TYPE)
        .into_iter()
        .filter(|msg| msg.get("id") == Some(&json!(id)))
        .collect()
}

#[tokio::test]
async fn sending_a_simple_object() {
    init_tracing();
    let mut mesh = Mesh::new();
    let x = mesh.add_node("x");
    let y = mesh.add_node("y");
    mesh.link_and_wait("y", "x").await;
    let name = "o".repeat(32);

    x.commit(&Widget::new(1, &name)).unwrap();

    assert!(wait_until(DEFAULT_WAIT, || y.count::<Widget>() == 1).await);
    assert_eq!(y.get::<Widget>(&[json!(1)]).unwrap().name, name);
    let owner = y.object::<Widget>(&[json!(1)]).unwrap().owner().id().unwrap();
    assert_eq!(owner, x.local_owner());
    assert_eq!(y.owner(&owner).unwrap().dest, Some(node_hash("x")));
}

#[tokio::test]
async fn you_have_follows_a_send() {
    init_tracing();
    let mut mesh = Mesh::new();
    let x = mesh.add_node("x");
    let (mut y, owner, epoch) = scripted(&x, "y").await;
    y.i_have(owner, 0, epoch).await;

    x.commit(&Widget::new(1, "sent")).unwrap();

    let reported = || {
        y.received_of(YOU_HAVE)
            .iter()
            .any(|msg| about(msg, owner) && serial(msg) == Some(1))
    };
    assert!(wait_until(std::time::Duration::from_secs(1), reported).await);
    assert!(!widgets_with_id(&y, 1).is_empty());
}

#[tokio::test]
async fn catch_up_after_disconnect() {
    init_tracing();
    let mut mesh = Mesh::new();
    let x = mesh.add_node("x");
    for id in 1..=3 {
        x.commit(&Widget::new(id, "while away")).unwrap();
    }
    let (mut y, owner, epoch) = scripted(&x, "y").await;

    y.i_have(owner, 0, epoch).await;

    assert!(wait_until(DEFAULT_WAIT, || !y.received_of(YOU_HAVE).is_empty()).await);
    settle().await;
    let you_haves = y.received_of(YOU_HAVE);
    assert_eq!(you_haves.len(), 1);
    assert!(about(&you_haves[0], owner));
    assert_eq!(serial(&you_haves[0]), Some(3));
    for id in 1..=3 {
        assert_eq!(widgets_with_id(&y, id).len(), 1, "widget {id}");
    }
}

#[tokio::test]
async fn wrong_epoch_triggers_resync() {
    init_tracing();
    let mut mesh = Mesh::new();
    let x = mesh.add_node("x");
    x.commit(&Widget::new(1, "current")).unwrap();
    let (mut y, owner, epoch) = scripted(&x, "y").await;

    y.i_have(owner, 0, Epoch::after(epoch)).await;

    assert!(wait_until(DEFAULT_WAIT, || !y.received_of(WRONG_EPOCH).is_empty()).await);
    let wrong = y.received_of(WRONG_EPOCH);
    assert!(about(&wrong[0], owner));
    assert_eq!(wrong[0].get("new_epoch"), Some(&Value::String(epoch.to_wire())));
    assert!(widgets_with_id(&y, 1).is_empty());

    y.i_have(owner, 0, epoch).await;

    assert!(wait_until(DEFAULT_WAIT, || widgets_with_id(&y, 1).len() == 1).await);
}

#[tokio::test]
async fn delete_with_tombstone_replay() {
    init_tracing();
    let mut mesh = Mesh::new();
    let x = mesh.add_node("x");
    x.commit(&Widget::new(1, "seen")).unwrap();
    x.commit(&Widget::new(42, "short lived")).unwrap();
    outcome(x.delete(&Widget::new(42, "short lived")).unwrap()).await.unwrap();
    let (mut y, owner, epoch) = scripted(&x, "y").await;

    y.i_have(owner, 1, epoch).await;

    assert!(wait_until(DEFAULT_WAIT, || !y.received_of(YOU_HAVE).is_empty()).await);
    settle().await;
    let about_42 = widgets_with_id(&y, 42);
    assert_eq!(about_42.len(), 1);
    assert_eq!(about_42[0].operation().unwrap(), "delete");
    assert!(widgets_with_id(&y, 1).is_empty());
    assert_eq!(serial(&y.received_of(YOU_HAVE)[0]), Some(3));
}

#[tokio::test]
async fn delete_with_tombstone_replay_leaves_no_object_behind() {
    init_tracing();
    let mut mesh = Mesh::new();
    let x = mesh.add_node("x");
    let y = mesh.add_node("y");
    mesh.link_and_wait("y", "x").await;
    let owner = x.local_owner();
    x.commit(&Widget::new(1, "seen")).unwrap();
    assert!(wait_until(DEFAULT_WAIT, || y.owner(&owner).map(|o| o.incoming_serial) == Some(1)).await);

    mesh.unlink("y", "x");
    x.commit(&Widget::new(42, "short lived")).unwrap();
    outcome(x.delete(&Widget::new(42, "short lived")).unwrap()).await.unwrap();
    mesh.link("y", "x");

    assert!(wait_until(DEFAULT_WAIT, || y.owner(&owner).map(|o| o.incoming_serial) == Some(3)).await);
    assert!(y.get::<Widget>(&[json!(42)]).is_none());
    assert_eq!(y.count::<Widget>(), 1);
}

#[tokio::test]
async fn broken_transition() {
    init_tracing();
    let mut mesh = Mesh::new();
    let z = mesh.add_node("z");
    let peer = mesh.add_node("peer");
    mesh.link_and_wait("peer", "z").await;
    z.commit(&Dial::at(1, 0)).unwrap();
    assert!(wait_until(DEFAULT_WAIT, || peer.count::<Dial>() == 1).await);

    let future = z.perform_transition(&Dial::at(1, 30)).unwrap().expect("first step");
    assert!(
        wait_until(DEFAULT_WAIT, || {
            peer.transition_state::<Dial>(&[json!(1)]).map(|d| d.position) == Some(30)
        })
        .await
    );

    z.commit(&Dial::at(1, 3)).unwrap();

    assert!(matches!(
        outcome(future).await,
        Err(SyncError::BrokenTransition { .. })
    ));
    assert!(wait_until(DEFAULT_WAIT, || peer.transition_state::<Dial>(&[json!(1)]).is_none()).await);
    assert_eq!(peer.get::<Dial>(&[json!(1)]).unwrap().position, 3);
}
