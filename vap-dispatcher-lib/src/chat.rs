//! Realtime chat transport.
//!
//! One WebSocket connection per identity against the marketplace origin,
//! authenticated with a short-lived chat token plus the identity's session
//! cookie. Inbound buyer turns are funneled into a shared event channel;
//! outbound commands (room joins, replies) arrive over a per-connection
//! command channel. The loop reconnects with a 2-second backoff and
//! rejoins every tracked room after each reconnect.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use vap_runtime::{DispatcherError, MarketplaceClient};

const RECONNECT_BACKOFF: std::time::Duration = std::time::Duration::from_secs(2);

/// Wire frames exchanged with the chat endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChatFrame {
    #[serde(rename_all = "camelCase")]
    JoinJob { job_id: String },
    #[serde(rename_all = "camelCase")]
    Joined { job_id: String },
    #[serde(rename_all = "camelCase")]
    Message {
        job_id: String,
        sender_verus_id: String,
        content: String,
    },
    Error {
        #[serde(default)]
        message: String,
    },
}

/// Transport events delivered to the dispatcher.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Joined { job_id: String },
    Message { job_id: String, sender: String, content: String },
}

#[derive(Debug)]
enum ChatCommand {
    Join(String),
    Send { job_id: String, content: String },
}

/// Handle for issuing room joins and replies on one identity's connection.
#[derive(Clone)]
pub struct ChatHandle {
    tx: mpsc::UnboundedSender<ChatCommand>,
}

impl ChatHandle {
    pub fn join(&self, job_id: &str) {
        if self.tx.send(ChatCommand::Join(job_id.to_string())).is_err() {
            tracing::warn!(job_id, "chat transport gone, join dropped");
        }
    }

    pub fn send_message(&self, job_id: &str, content: &str) {
        let command =
            ChatCommand::Send { job_id: job_id.to_string(), content: content.to_string() };
        if self.tx.send(command).is_err() {
            tracing::warn!(job_id, "chat transport gone, reply dropped");
        }
    }
}

/// Spawn the transport loop for one identity. Events flow into the shared
/// `events` channel; the returned handle accepts commands immediately, even
/// while the connection is still being established.
pub fn spawn_transport(
    market: Arc<MarketplaceClient>,
    events: mpsc::Sender<ChatEvent>,
) -> ChatHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(transport_loop(market, events, rx));
    ChatHandle { tx }
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;
type WsSink =
    futures_util::stream::SplitSink<WsStream, tokio_tungstenite::tungstenite::Message>;

async fn transport_loop(
    market: Arc<MarketplaceClient>,
    events: mpsc::Sender<ChatEvent>,
    mut commands: mpsc::UnboundedReceiver<ChatCommand>,
) {
    let identity = market.identity().identity_name().to_string();
    let mut rooms: HashSet<String> = HashSet::new();

    loop {
        match connect(&market).await {
            Ok(ws) => {
                tracing::info!(identity = %identity, "chat transport connected");
                let (mut sink, mut stream) = ws.split();

                let mut healthy = true;
                for room in &rooms {
                    if send_frame(&mut sink, &ChatFrame::JoinJob { job_id: room.clone() })
                        .await
                        .is_err()
                    {
                        healthy = false;
                        break;
                    }
                }

                while healthy {
                    tokio::select! {
                        command = commands.recv() => match command {
                            None => {
                                tracing::debug!(identity = %identity, "command channel closed, stopping chat transport");
                                return;
                            }
                            Some(ChatCommand::Join(job_id)) => {
                                rooms.insert(job_id.clone());
                                if send_frame(&mut sink, &ChatFrame::JoinJob { job_id }).await.is_err() {
                                    healthy = false;
                                }
                            }
                            Some(ChatCommand::Send { job_id, content }) => {
                                let frame = ChatFrame::Message {
                                    job_id,
                                    sender_verus_id: identity.clone(),
                                    content,
                                };
                                if send_frame(&mut sink, &frame).await.is_err() {
                                    healthy = false;
                                }
                            }
                        },
                        frame = stream.next() => match frame {
                            Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                                if let Some(event) = parse_frame(text.as_ref()) {
                                    if events.send(event).await.is_err() {
                                        tracing::debug!(identity = %identity, "event channel closed, stopping chat transport");
                                        return;
                                    }
                                }
                            }
                            Some(Ok(tokio_tungstenite::tungstenite::Message::Ping(_))) => {}
                            Some(Ok(tokio_tungstenite::tungstenite::Message::Close(_))) | None => {
                                tracing::warn!(identity = %identity, "chat stream closed");
                                healthy = false;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                tracing::warn!(identity = %identity, error = %e, "chat stream error");
                                healthy = false;
                            }
                        },
                    }
                }
            }
            Err(e) => {
                tracing::warn!(identity = %identity, error = %e, "chat connect failed");
            }
        }

        tracing::info!(identity = %identity, "reconnecting chat transport in 2s");
        tokio::time::sleep(RECONNECT_BACKOFF).await;
    }
}

async fn connect(market: &MarketplaceClient) -> Result<WsStream, DispatcherError> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let token = market.chat_token().await?;
    let url = market.chat_ws_url(&token)?;
    let mut request = url
        .into_client_request()
        .map_err(|e| DispatcherError::Transport(e.to_string()))?;
    if let Some(cookie) = market.session_cookie() {
        let value = tokio_tungstenite::tungstenite::http::HeaderValue::from_str(&cookie)
            .map_err(|e| DispatcherError::Transport(e.to_string()))?;
        request.headers_mut().insert("Cookie", value);
    }

    let (ws, _resp) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| DispatcherError::Transport(e.to_string()))?;
    Ok(ws)
}

async fn send_frame(sink: &mut WsSink, frame: &ChatFrame) -> Result<(), DispatcherError> {
    let text = serde_json::to_string(frame)?;
    sink.send(tokio_tungstenite::tungstenite::Message::Text(text.into()))
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, "chat send failed");
            DispatcherError::Transport(e.to_string())
        })
}

/// Map an inbound text frame to a transport event. Unknown or malformed
/// frames (heartbeats, acks) are dropped.
fn parse_frame(text: &str) -> Option<ChatEvent> {
    match serde_json::from_str::<ChatFrame>(text) {
        Ok(ChatFrame::Message { job_id, sender_verus_id, content }) => {
            Some(ChatEvent::Message { job_id, sender: sender_verus_id, content })
        }
        Ok(ChatFrame::Joined { job_id }) => Some(ChatEvent::Joined { job_id }),
        Ok(ChatFrame::Error { message }) => {
            tracing::warn!(message = %message, "chat server reported error");
            None
        }
        Ok(ChatFrame::JoinJob { .. }) | Err(_) => None,
    }
}
