//! Integration tests for the simulated mesh.
//!
//! These tests exercise whole clusters through the public API: bootstrap via
//! ENTER, the PING round-trip law, iterative lookups, record replication,
//! and loss tolerance. Timing-sensitive scenarios run under a paused clock
//! so the 10 second RPC timeout is virtual.

use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use kadmesh::{sort_by_distance, Address, Contact, NodeId, Simnet, K};

/// Spawns one extra node on a running simnet and waits for its entry
/// sequence to finish.
async fn spawn_and_enter(simnet: &Simnet) -> kadmesh::Node {
    let (done_tx, mut done_rx) = mpsc::channel(8);
    let node = simnet.spawn_node(done_tx);
    done_rx.recv().await.expect("entry finished");
    node
}

#[tokio::test]
async fn ping_populates_both_routing_tables() {
    let simnet = Simnet::new(false, 0.0);
    simnet.start();

    let node = spawn_and_enter(&simnet).await;
    let master = simnet.master_contact();

    node.ping(master.address()).await;

    assert!(
        node.lookup_contact(master.id()).await.is_some(),
        "pinger should learn the responder"
    );
    assert!(
        simnet.master().lookup_contact(node.id()).await.is_some(),
        "responder should learn the pinger"
    );
}

#[tokio::test]
async fn find_node_on_own_id_finds_the_node() {
    let simnet = Simnet::new(false, 0.0);
    simnet.start();

    let nodes = simnet.spawn_cluster(10).await;
    let node = &nodes[0];

    let found = node.find_node(node.id()).await;

    assert!(!found.is_empty(), "lookup should return contacts");
    // The node may be absent when no queried peer reported it; when it is
    // present it must sort first with distance zero.
    if let Some(position) = found.iter().position(|c| c.id() == node.id()) {
        assert_eq!(position, 0, "own id must be the closest result");
    }
}

#[tokio::test]
async fn find_node_converges_on_the_true_closest_contacts() {
    let simnet = Simnet::new(false, 0.0);
    simnet.start();

    // Spawn members one by one so every contact in the mesh stays live (no
    // visibility-check shutdowns) and the true closest set is exact.
    let mut nodes = Vec::new();
    for _ in 0..10 {
        nodes.push(spawn_and_enter(&simnet).await);
    }

    let target = NodeId::random();
    let mut everyone: Vec<Contact> = nodes.iter().map(|n| n.contact()).collect();
    everyone.push(simnet.master_contact());
    sort_by_distance(&mut everyone, target);
    let true_closest: Vec<NodeId> = everyone.iter().take(K).map(|c| c.id()).collect();

    // Monotone lookup: the best shortlist distance only ever shrinks, so a
    // converged lookup must settle on the mesh's actual K closest contacts
    // in distance order. Lookups densify routing tables as a side effect,
    // so re-run until the result stabilizes on that set.
    let mut found_ids: Vec<NodeId> = Vec::new();
    for _ in 0..20 {
        let found = nodes[0].find_node(target).await;
        found_ids = found.iter().map(|c| c.id()).collect();
        if found_ids == true_closest {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }

    assert_eq!(
        found_ids, true_closest,
        "lookup must converge on the true K closest contacts by distance"
    );
}

#[tokio::test]
async fn stored_records_are_found_fully_replicated() {
    let simnet = Simnet::new(false, 0.0);
    simnet.start();

    let nodes = simnet.spawn_cluster(10).await;
    let writer = &nodes[0];
    let reader = &nodes[nodes.len() - 1];
    let key = NodeId::random();

    // Store is fire-and-forget and the two lookups may settle on slightly
    // different holder sets while tables are still converging; re-store and
    // re-check until the record reads back fully replicated.
    let mut holders = Vec::new();
    for _ in 0..10 {
        writer.store_record(key).await;
        sleep(Duration::from_millis(200)).await;
        match reader.find_record(key).await {
            Ok(found) => {
                holders = found;
                break;
            }
            Err(_) => continue,
        }
    }

    assert!(
        !holders.is_empty(),
        "record should become fully replicated on a stable cluster"
    );
    assert!(holders.len() <= K, "holder set is bounded by K");
}

#[tokio::test]
async fn find_record_reports_missing_replication() {
    let simnet = Simnet::new(false, 0.0);
    simnet.start();

    let nodes = simnet.spawn_cluster(5).await;
    let key = NodeId::random();

    // Nothing stored: every queried holder denies, so the lookup must
    // surface the partial result as an error.
    let result = nodes[0].find_record(key).await;
    let error = result.expect_err("an unstored record cannot be fully replicated");
    assert_eq!(error.confirmed, 0);
}

#[tokio::test(start_paused = true)]
async fn lossy_transport_still_converges() {
    let simnet = Simnet::new(false, 0.25);
    simnet.start();

    let nodes = simnet.spawn_cluster(20).await;
    assert_eq!(nodes.len(), 20);

    let target = NodeId::random();
    let mut found = Vec::new();
    for _ in 0..50 {
        found = nodes[0].find_node(target).await;
        if !found.is_empty() {
            break;
        }
    }

    assert!(
        !found.is_empty(),
        "lookup should eventually return contacts despite drops"
    );
    assert!(found.len() <= K);
}

#[tokio::test(start_paused = true)]
async fn unreachable_addresses_time_out_quietly() {
    let simnet = Simnet::new(false, 0.0);
    simnet.start();

    let node = spawn_and_enter(&simnet).await;

    // No mailbox behind this address: the frame vanishes in the transport
    // and the ping resolves via timeout without surfacing an error.
    node.ping(Address::from_octets([7, 7, 7, 7])).await;

    // The node is still fully functional afterwards.
    node.ping(simnet.master_contact().address()).await;
    assert!(node
        .lookup_contact(simnet.master_contact().id())
        .await
        .is_some());
}

#[tokio::test(start_paused = true)]
async fn shut_down_nodes_stop_answering() {
    let simnet = Simnet::new(false, 0.0);
    simnet.start();

    let stayer = spawn_and_enter(&simnet).await;
    let leaver = spawn_and_enter(&simnet).await;

    // Teach the stayer about the leaver, then take the leaver down.
    stayer.ping(leaver.address()).await;
    assert!(stayer.lookup_contact(leaver.id()).await.is_some());
    simnet.shutdown_node(&leaver).await;

    // Pings to the dead mailbox run into the timeout but nothing panics and
    // the stayer keeps serving.
    stayer.ping(leaver.address()).await;
    let found = stayer.find_node(NodeId::random()).await;
    assert!(found.iter().all(|c| c.address() != Address::ZERO));
}
