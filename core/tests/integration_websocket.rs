use futures::{SinkExt, StreamExt};
use ghostrelay_core::directory::{Hub, HubConfig, HubHandle, Outbound};
use ghostrelay_core::gateway::{AllowAll, InMemoryLedger, NoopPersistence};
use ghostrelay_core::node::{NodeAgent, NodeClient, NodeClientConfig, NodeIdentity, RelayTiming};
use ghostrelay_core::protocol::{decode_event, DirectoryEvent};
use ghostrelay_core::store::MemoryStorage;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async};

/// Minimal WebSocket front for the hub
async fn serve(handle: HubHandle) -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handle = handle.clone();
            tokio::spawn(async move {
                let Ok(ws) = accept_async(stream).await else {
                    return;
                };
                let Ok(mut conn) = handle.connect() else {
                    return;
                };
                let id = conn.id;
                let (mut write, mut read) = ws.split();

                let writer = tokio::spawn(async move {
                    while let Some(message) = conn.outbound.recv().await {
                        let frame = match message {
                            Outbound::Event(event) => match serde_json::to_string(&event) {
                                Ok(text) => Message::Text(text),
                                Err(_) => continue,
                            },
                            Outbound::Close { code, reason } => Message::Close(Some(CloseFrame {
                                code: CloseCode::from(code),
                                reason: reason.into(),
                            })),
                        };
                        if write.send(frame).await.is_err() {
                            break;
                        }
                    }
                });

                while let Some(Ok(message)) = read.next().await {
                    match message {
                        Message::Text(text) => {
                            if handle.submit(id, &text).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
                let _ = handle.disconnect(id);
                writer.abort();
            });
        }
    });

    Ok(addr)
}

async fn node_ids(handle: &HubHandle) -> Vec<String> {
    handle
        .nodes()
        .await
        .map(|nodes| nodes.into_iter().map(|n| n.id).collect())
        .unwrap_or_default()
}

async fn wait_for_nodes(handle: &HubHandle, expected: &[&str]) -> bool {
    for _ in 0..250 {
        let mut ids = node_ids(handle).await;
        ids.sort();
        if ids == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

fn holder_client(addr: SocketAddr) -> NodeClient {
    let (agent, outbound) = NodeAgent::new(
        NodeIdentity::new("holder", "W-HOLDER", "eu-west"),
        Arc::new(InMemoryLedger::new("W-HOLDER")),
        Arc::new(MemoryStorage::new()),
        RelayTiming::default(),
    );
    let config = NodeClientConfig {
        signaling_url: format!("ws://{}", addr),
        heartbeat_interval: Duration::from_millis(200),
        ..NodeClientConfig::default()
    };
    NodeClient::new(config, agent, outbound)
}

fn spawn_hub() -> HubHandle {
    let (hub, handle) = Hub::new(
        HubConfig::default(),
        Arc::new(AllowAll),
        Arc::new(NoopPersistence),
    );
    hub.spawn();
    handle
}

#[tokio::test]
async fn test_client_registers_and_disconnects_gracefully() -> anyhow::Result<()> {
    let handle = spawn_hub();
    let addr = serve(handle.clone()).await?;

    let (stop, stop_rx) = watch::channel(false);
    let task = tokio::spawn(holder_client(addr).run(stop_rx));
    assert!(wait_for_nodes(&handle, &["holder"]).await);

    let info = &handle.nodes().await?[0];
    assert_eq!(info.wallet_address, "W-HOLDER");
    assert_eq!(info.region, "eu-west");

    stop.send(true)?;
    task.await??;
    assert!(wait_for_nodes(&handle, &[]).await);
    Ok(())
}

#[tokio::test]
async fn test_chunks_round_trip_through_directory() -> anyhow::Result<()> {
    let handle = spawn_hub();
    let addr = serve(handle.clone()).await?;

    let (stop, stop_rx) = watch::channel(false);
    let task = tokio::spawn(holder_client(addr).run(stop_rx));

    let (mut owner, _) = connect_async(format!("ws://{}", addr)).await?;
    owner
        .send(Message::Text(
            r#"{"type":"register","nodeId":"owner","walletAddress":"W-OWNER"}"#.to_string(),
        ))
        .await?;
    assert!(wait_for_nodes(&handle, &["holder", "owner"]).await);

    owner
        .send(Message::Text(
            r#"{"type":"STORE_CHUNK","targetNodeId":"holder","fileId":"f1","chunkId":"0","data":"Z2hvc3Q="}"#
                .to_string(),
        ))
        .await?;
    owner
        .send(Message::Text(
            r#"{"type":"REQUEST_CHUNK","targetNodeId":"holder","fileId":"f1","chunkId":"0","requestId":"q"}"#
                .to_string(),
        ))
        .await?;

    let mut stored = None;
    let mut data = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while stored.is_none() || data.is_none() {
        let frame = tokio::time::timeout_at(deadline, owner.next()).await?;
        let Some(Ok(Message::Text(text))) = frame else {
            anyhow::bail!("owner connection ended");
        };
        match decode_event(&text)? {
            DirectoryEvent::ChunkStored(reply) => stored = Some(reply),
            DirectoryEvent::ChunkData(reply) => data = Some(reply),
            _ => {}
        }
    }

    let stored = stored.unwrap();
    assert!(stored.success);
    assert_eq!(stored.node_id, "holder");
    let data = data.unwrap();
    assert!(data.success);
    assert_eq!(data.data.as_deref(), Some("Z2hvc3Q="));
    assert_eq!(data.request_id.as_deref(), Some("q"));

    stop.send(true)?;
    task.await??;
    Ok(())
}
