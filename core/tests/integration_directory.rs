use ghostrelay_core::directory::{Connection, Hub, HubConfig, HubHandle, Outbound};
use ghostrelay_core::gateway::{StoredPersistence, TokenAllowList};
use ghostrelay_core::protocol::{DirectoryEvent, NodeCommand, RelayJob, RoomRole};
use ghostrelay_core::store::MemoryStorage;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn spawn_hub() -> (HubHandle, Arc<StoredPersistence<MemoryStorage>>) {
    let persistence = Arc::new(StoredPersistence::new(MemoryStorage::new()));
    let (hub, handle) = Hub::new(
        HubConfig::default(),
        Arc::new(TokenAllowList::new(["valid"])),
        persistence.clone(),
    );
    hub.spawn();
    (handle, persistence)
}

/// Everything queued for `conn` until it goes quiet
async fn drain(conn: &mut Connection) -> Vec<Outbound> {
    let mut out = Vec::new();
    while let Ok(Some(message)) = timeout(Duration::from_millis(50), conn.outbound.recv()).await {
        out.push(message);
    }
    out
}

async fn events(conn: &mut Connection) -> Vec<DirectoryEvent> {
    drain(conn)
        .await
        .into_iter()
        .filter_map(|m| match m {
            Outbound::Event(e) => Some(e),
            Outbound::Close { .. } => None,
        })
        .collect()
}

async fn register(handle: &HubHandle, id: &str, wallet: &str, token: &str) -> Connection {
    let conn = handle.connect().unwrap();
    handle
        .submit_command(
            conn.id,
            NodeCommand::Register {
                node_id: id.to_string(),
                wallet_address: wallet.to_string(),
                region: Some("us-east".to_string()),
                token: Some(token.to_string()),
            },
        )
        .await
        .unwrap();
    conn
}

fn node_list_ids(events: &[DirectoryEvent]) -> Option<Vec<String>> {
    events.iter().rev().find_map(|e| match e {
        DirectoryEvent::NodeList { nodes, .. } => {
            Some(nodes.iter().map(|n| n.id.clone()).collect())
        }
        _ => None,
    })
}

#[tokio::test(start_paused = true)]
async fn test_registration_discovery_and_disconnect() {
    let (handle, _) = spawn_hub();

    let mut n1 = register(&handle, "n1", "W1", "valid").await;
    let first = events(&mut n1).await;
    assert_eq!(
        first[0],
        DirectoryEvent::Registered {
            node_id: "n1".to_string(),
            nodes: vec![]
        }
    );
    assert_eq!(handle.stats().await.unwrap().total_nodes, 1);

    let mut n2 = register(&handle, "n2", "W2", "valid").await;
    match &events(&mut n2).await[0] {
        DirectoryEvent::Registered { nodes, .. } => {
            assert_eq!(nodes.len(), 1);
            assert_eq!(nodes[0].id, "n1");
            assert_eq!(nodes[0].wallet_address, "W1");
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(handle.stats().await.unwrap().total_nodes, 2);
    events(&mut n1).await;

    handle
        .submit(n1.id, r#"{"type":"disconnect","nodeId":"n1"}"#)
        .await
        .unwrap();
    let after = events(&mut n2).await;
    assert_eq!(node_list_ids(&after), Some(vec!["n2".to_string()]));
    assert_eq!(handle.nodes().await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_token_never_registers() {
    let (handle, persistence) = spawn_hub();

    let mut conn = register(&handle, "n1", "W1", "forged").await;
    assert_eq!(
        drain(&mut conn).await,
        vec![Outbound::Close {
            code: 1008,
            reason: "Invalid access token".to_string()
        }]
    );
    assert_eq!(handle.stats().await.unwrap().total_nodes, 0);
    assert!(persistence.sessions_for("n1").unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_idle_node_is_evicted_once() {
    let (handle, persistence) = spawn_hub();

    let mut idle = register(&handle, "idle", "W1", "valid").await;
    let mut busy = register(&handle, "busy", "W2", "valid").await;
    events(&mut idle).await;
    events(&mut busy).await;

    let beat = handle.clone();
    let busy_id = busy.id;
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(20)).await;
            let frame = r#"{"type":"heartbeat","nodeId":"busy"}"#;
            if beat.submit(busy_id, frame).await.is_err() {
                break;
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(65)).await;

    let received = events(&mut busy).await;
    let lists: Vec<&DirectoryEvent> = received
        .iter()
        .filter(|e| matches!(e, DirectoryEvent::NodeList { .. }))
        .collect();
    assert_eq!(lists.len(), 1);
    assert_eq!(node_list_ids(&received), Some(vec!["busy".to_string()]));

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.total_nodes, 1);

    let sessions = persistence.sessions_for("idle").unwrap();
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].ended_at.is_some());
    let performance = persistence.performance("idle").unwrap().unwrap();
    assert_eq!(performance.flushes, 1);
    assert!(performance.total_uptime_ms >= 60_000);
}

#[tokio::test(start_paused = true)]
async fn test_call_room_lifecycle() {
    let (handle, _) = spawn_hub();
    let mut alice = handle.connect().unwrap();
    let mut bob = handle.connect().unwrap();
    let mut carol = handle.connect().unwrap();

    handle
        .submit(alice.id, r#"{"type":"join","callId":"c1"}"#)
        .await
        .unwrap();
    assert_eq!(
        events(&mut alice).await,
        vec![DirectoryEvent::Joined {
            role: RoomRole::Initiator
        }]
    );

    handle
        .submit(bob.id, r#"{"type":"join","callId":"c1"}"#)
        .await
        .unwrap();
    handle
        .submit(carol.id, r#"{"type":"join","callId":"c1"}"#)
        .await
        .unwrap();
    assert_eq!(
        events(&mut bob).await,
        vec![DirectoryEvent::Joined {
            role: RoomRole::Participant
        }]
    );
    events(&mut carol).await;
    assert_eq!(
        events(&mut alice).await,
        vec![DirectoryEvent::PeerJoined, DirectoryEvent::PeerJoined]
    );
    assert_eq!(handle.calls().await.unwrap()[0].participants, 3);

    handle
        .submit(bob.id, r#"{"type":"offer","callId":"c1","offer":{"sdp":"o"}}"#)
        .await
        .unwrap();
    assert_eq!(events(&mut alice).await.len(), 1);
    assert_eq!(events(&mut carol).await.len(), 1);
    assert!(events(&mut bob).await.is_empty());

    handle
        .submit(alice.id, r#"{"type":"leave","callId":"c1"}"#)
        .await
        .unwrap();
    let ended = DirectoryEvent::CallEnded {
        reason: "initiator-left".to_string(),
    };
    assert_eq!(events(&mut bob).await, vec![ended.clone()]);
    assert_eq!(events(&mut carol).await, vec![ended]);
    assert!(handle.calls().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_relay_broadcast_skips_offline_selected_nodes() {
    let (handle, _) = spawn_hub();
    let mut a = register(&handle, "node-a", "A", "valid").await;
    let mut other = register(&handle, "node-c", "C", "valid").await;
    events(&mut a).await;
    events(&mut other).await;

    let job = RelayJob {
        request_id: "r-1".to_string(),
        recipient: "R".to_string(),
        amount: 1_000,
        fee: 5,
        hops: 2,
        selected_nodes: vec!["A".to_string(), "B".to_string()],
        mode: None,
    };
    handle
        .submit_command(other.id, NodeCommand::BroadcastRelayRequest(job.clone()))
        .await
        .unwrap();

    assert_eq!(events(&mut a).await, vec![DirectoryEvent::RelayRequest(job)]);
    assert!(events(&mut other).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_handshake_to_absent_node_is_silent() {
    let (handle, _) = spawn_hub();
    let mut n1 = register(&handle, "n1", "W1", "valid").await;
    events(&mut n1).await;

    handle
        .submit(
            n1.id,
            r#"{"type":"ice-candidate","to":"nobody","candidate":{"c":1}}"#,
        )
        .await
        .unwrap();
    assert!(drain(&mut n1).await.is_empty());
    assert_eq!(handle.stats().await.unwrap().total_nodes, 1);
}
