// Directory server: WebSocket endpoint plus read-only HTTP API
//
// Every socket is bridged to the hub through a `HubHandle`. Text frames go
// in, hub events and close requests come back out.

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use ghostrelay_core::{HubError, HubHandle, Outbound};
use serde::Serialize;
use std::future::Future;
use tracing::{debug, info, warn};
use warp::http::StatusCode;
use warp::ws::{Message, WebSocket};
use warp::{Filter, Reply};

/// Serve until `shutdown` resolves
pub async fn run<F>(port: u16, handle: HubHandle, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    let routes = routes(handle);

    info!("Directory listening on 0.0.0.0:{}", port);
    info!("WebSocket endpoint: ws://0.0.0.0:{}/ws", port);

    tokio::select! {
        _ = warp::serve(routes).run(([0, 0, 0, 0], port)) => {}
        _ = shutdown => {
            info!("Directory server stopping");
        }
    }
    Ok(())
}

pub fn routes(
    handle: HubHandle,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    let hub = warp::any().map(move || handle.clone());

    // Nodes connect on /ws; dashboards historically use the bare root
    let ws_route = warp::path("ws")
        .and(warp::path::end())
        .or(warp::path::end())
        .unify()
        .and(warp::ws())
        .and(hub.clone())
        .map(|ws: warp::ws::Ws, hub: HubHandle| {
            ws.on_upgrade(move |socket| handle_connection(socket, hub))
        })
        .boxed();

    let health_route = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(hub.clone())
        .and_then(health_handler)
        .boxed();

    let stats_route = warp::path!("api" / "stats")
        .and(warp::get())
        .and(hub.clone())
        .and_then(stats_handler)
        .boxed();

    let nodes_route = warp::path!("api" / "nodes")
        .and(warp::get())
        .and(hub.clone())
        .and_then(nodes_handler)
        .boxed();

    let calls_route = warp::path!("api" / "calls")
        .and(warp::get())
        .and(hub)
        .and_then(calls_handler)
        .boxed();

    ws_route
        .or(health_route)
        .or(stats_route)
        .or(nodes_route)
        .or(calls_route)
        .with(warp::cors().allow_any_origin())
}

fn reply_json<T: Serialize>(result: Result<T, HubError>) -> warp::reply::Response {
    match result {
        Ok(body) => warp::reply::json(&body).into_response(),
        Err(e) => warp::reply::with_status(
            warp::reply::json(&serde_json::json!({ "error": e.to_string() })),
            StatusCode::SERVICE_UNAVAILABLE,
        )
        .into_response(),
    }
}

async fn health_handler(hub: HubHandle) -> Result<impl Reply, warp::Rejection> {
    let result = hub.health().await.map(|health| {
        serde_json::json!({
            "status": "ok",
            "connections": health.connections,
            "nodes": health.nodes,
            "activeCalls": health.active_calls,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })
    });
    Ok(reply_json(result))
}

async fn stats_handler(hub: HubHandle) -> Result<impl Reply, warp::Rejection> {
    Ok(reply_json(hub.stats().await))
}

async fn nodes_handler(hub: HubHandle) -> Result<impl Reply, warp::Rejection> {
    let result = hub.nodes().await.map(|nodes| {
        serde_json::json!({
            "total": nodes.len(),
            "nodes": nodes,
        })
    });
    Ok(reply_json(result))
}

async fn calls_handler(hub: HubHandle) -> Result<impl Reply, warp::Rejection> {
    Ok(reply_json(hub.calls().await))
}

fn encode(outbound: Outbound) -> Option<Message> {
    match outbound {
        Outbound::Event(event) => match serde_json::to_string(&event) {
            Ok(json) => Some(Message::text(json)),
            Err(e) => {
                warn!("Failed to encode event: {}", e);
                None
            }
        },
        Outbound::Close { code, reason } => Some(Message::close_with(code, reason)),
    }
}

async fn handle_connection(ws: WebSocket, hub: HubHandle) {
    let mut connection = match hub.connect() {
        Ok(connection) => connection,
        Err(e) => {
            warn!("Refusing socket: {}", e);
            return;
        }
    };
    let conn = connection.id;
    info!("{} opened", conn);

    let (mut ws_tx, mut ws_rx) = ws.split();

    let forward_task = tokio::spawn(async move {
        while let Some(outbound) = connection.outbound.recv().await {
            let closing = matches!(outbound, Outbound::Close { .. });
            let Some(msg) = encode(outbound) else {
                continue;
            };
            if ws_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(result) = ws_rx.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(e) => {
                debug!("{} read error: {}", conn, e);
                break;
            }
        };

        if msg.is_close() {
            break;
        }
        if let Ok(text) = msg.to_str() {
            if hub.submit(conn, text).await.is_err() {
                break;
            }
        }
    }

    if let Err(e) = hub.disconnect(conn) {
        debug!("{} closed after hub shutdown: {}", conn, e);
    }
    forward_task.abort();
    info!("{} closed", conn);
}
