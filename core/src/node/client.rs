//! Node client: keeps a WebSocket session with the directory

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::agent::NodeAgent;
use crate::protocol::{decode_event, NodeCommand};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct NodeClientConfig {
    /// Directory WebSocket URL, e.g. `ws://localhost:8080/ws`
    pub signaling_url: String,
    pub access_token: Option<String>,
    pub heartbeat_interval: Duration,
    /// Step of the linear reconnect backoff
    pub reconnect_step: Duration,
    pub max_reconnect_delay: Duration,
}

impl Default for NodeClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:8080/ws".to_string(),
            access_token: None,
            heartbeat_interval: Duration::from_secs(30),
            reconnect_step: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(60),
        }
    }
}

impl NodeClientConfig {
    /// Heartbeat period; a zero interval falls back to one second
    pub fn heartbeat_period(&self) -> Duration {
        if self.heartbeat_interval.is_zero() {
            Duration::from_secs(1)
        } else {
            self.heartbeat_interval
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based)
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.reconnect_step
            .saturating_mul(attempt)
            .min(self.max_reconnect_delay)
    }
}

enum SessionEnd {
    Shutdown,
    Dropped,
}

pub struct NodeClient {
    config: NodeClientConfig,
    agent: NodeAgent,
    outbound: mpsc::UnboundedReceiver<NodeCommand>,
}

impl NodeClient {
    pub fn new(
        config: NodeClientConfig,
        agent: NodeAgent,
        outbound: mpsc::UnboundedReceiver<NodeCommand>,
    ) -> Self {
        Self {
            config,
            agent,
            outbound,
        }
    }

    pub fn agent(&self) -> &NodeAgent {
        &self.agent
    }

    /// Run until `shutdown` flips to true, reconnecting whenever the session
    /// drops. Job state survives reconnects but not the process.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ClientError> {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            info!("Connecting to {}", self.config.signaling_url);
            match connect_async(self.config.signaling_url.as_str()).await {
                Ok((ws, _)) => {
                    attempt = 0;
                    match self.session(ws, &mut shutdown).await {
                        Ok(SessionEnd::Shutdown) => return Ok(()),
                        Ok(SessionEnd::Dropped) => warn!("Directory closed the connection"),
                        Err(e) => warn!("Session ended: {}", e),
                    }
                }
                Err(e) => warn!("Connection failed: {}", e),
            }

            attempt += 1;
            let delay = self.config.reconnect_delay(attempt);
            info!(
                "Reconnecting in {}s (attempt {})",
                delay.as_secs(),
                attempt
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    async fn session<S>(
        &mut self,
        ws: tokio_tungstenite::WebSocketStream<S>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, ClientError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut write, mut read) = ws.split();
        let identity = self.agent.identity().clone();

        let register = identity.register_command(self.config.access_token.clone());
        write
            .send(Message::Text(serde_json::to_string(&register)?))
            .await?;

        let period = self.config.heartbeat_period();
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let beat = NodeCommand::Heartbeat { node_id: identity.node_id.clone() };
                    write.send(Message::Text(serde_json::to_string(&beat)?)).await?;
                }
                Some(command) = self.outbound.recv() => {
                    debug!("-> {}", command.kind());
                    write.send(Message::Text(serde_json::to_string(&command)?)).await?;
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => match decode_event(&text) {
                        Ok(event) => {
                            self.agent.handle_event(event);
                        }
                        Err(e) => warn!("Ignoring frame from directory: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Dropped),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
                _ = shutdown.changed() => {
                    info!("Disconnecting {}", identity.node_id);
                    let bye = NodeCommand::Disconnect { node_id: identity.node_id.clone() };
                    write.send(Message::Text(serde_json::to_string(&bye)?)).await?;
                    let _ = write.close().await;
                    return Ok(SessionEnd::Shutdown);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_backoff_is_linear_and_capped() {
        let config = NodeClientConfig::default();
        assert_eq!(config.reconnect_delay(1), Duration::from_secs(5));
        assert_eq!(config.reconnect_delay(4), Duration::from_secs(20));
        assert_eq!(config.reconnect_delay(12), Duration::from_secs(60));
        assert_eq!(config.reconnect_delay(40), Duration::from_secs(60));
    }

    #[test]
    fn test_zero_heartbeat_is_raised() {
        let config = NodeClientConfig {
            heartbeat_interval: Duration::ZERO,
            ..NodeClientConfig::default()
        };
        assert_eq!(config.heartbeat_period(), Duration::from_secs(1));
        assert_eq!(
            NodeClientConfig::default().heartbeat_period(),
            Duration::from_secs(30)
        );
    }
}
