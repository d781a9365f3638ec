use crate::traits::DeliveryChannel;
use crate::types::{InboundEvent, InboundKind, ReplyPayload, Token};
use anyhow::Result;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// One connected browser socket. Payloads are serialized to JSON text
/// frames and handed to the connection's writer task.
struct WebChatChannel {
    connection_id: String,
    outbound: mpsc::UnboundedSender<Message>,
}

#[async_trait::async_trait]
impl DeliveryChannel for WebChatChannel {
    fn id(&self) -> &str {
        &self.connection_id
    }

    async fn send(&self, payload: &ReplyPayload) -> Result<()> {
        let text = serde_json::to_string(payload)?;
        self.outbound
            .send(Message::Text(text.into()))
            .map_err(|_| anyhow::anyhow!("webchat send failed: socket closed"))?;
        Ok(())
    }
}

#[derive(Clone)]
struct WebChatState {
    inbound_tx: Arc<tokio::sync::RwLock<Option<mpsc::Sender<InboundEvent>>>>,
    connections: Arc<DashMap<String, mpsc::UnboundedSender<Message>>>,
}

#[derive(Clone)]
pub struct WebChatAdapter {
    state: WebChatState,
}

impl Default for WebChatAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl WebChatAdapter {
    pub fn new() -> Self {
        Self {
            state: WebChatState {
                inbound_tx: Arc::new(tokio::sync::RwLock::new(None)),
                connections: Arc::new(DashMap::new()),
            },
        }
    }

    /// Wires the adapter into the gateway's inbound queue.
    pub async fn start(&self, tx: mpsc::Sender<InboundEvent>) {
        *self.state.inbound_tx.write().await = Some(tx);
    }

    /// Router that serves the chat WebSocket at `/ws`.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new().route("/ws", get(ws_upgrade)).with_state(self)
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.len()
    }
}

async fn ws_upgrade(
    State(adapter): State<Arc<WebChatAdapter>>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_socket(adapter, socket))
}

#[tracing::instrument(level = "info", skip_all)]
async fn handle_socket(adapter: Arc<WebChatAdapter>, socket: WebSocket) {
    let connection_id = Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    adapter
        .state
        .connections
        .insert(connection_id.clone(), outbound_tx.clone());

    let channel: Arc<dyn DeliveryChannel> = Arc::new(WebChatChannel {
        connection_id: connection_id.clone(),
        outbound: outbound_tx,
    });

    let adapter_out = adapter.clone();
    let connection_id_out = connection_id.clone();
    let outbound_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
        adapter_out.state.connections.remove(&connection_id_out);
    });

    let mut last_token: Option<Token> = None;
    while let Some(Ok(msg)) = ws_receiver.next().await {
        let Message::Text(text) = msg else {
            continue;
        };

        let parsed: serde_json::Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(%e, connection_id = %connection_id, "webchat received invalid json");
                break;
            }
        };
        let Some(msg_type) = parsed.get("type").and_then(|v| v.as_str()) else {
            tracing::error!(connection_id = %connection_id, "webchat payload missing type");
            break;
        };

        // Keepalives are answered here; they never reach the core.
        if msg_type == "ping" {
            if channel.send(&ReplyPayload::Ping).await.is_err() {
                break;
            }
            continue;
        }

        let Some(token) = parsed.get("token").and_then(|v| v.as_str()) else {
            tracing::error!(connection_id = %connection_id, message_type = msg_type, "webchat payload missing token");
            break;
        };
        let token = Token::new(token);
        last_token = Some(token.clone());

        let kind = match msg_type {
            "msg" => {
                let Some(text) = parsed.get("text").and_then(|v| v.as_str()) else {
                    tracing::error!(connection_id = %connection_id, "webchat message missing text");
                    break;
                };
                InboundKind::Message {
                    text: text.to_string(),
                }
            }
            "remote" => {
                let Some(phone) = parsed.get("phone").and_then(|v| v.as_str()) else {
                    tracing::error!(connection_id = %connection_id, "webchat remote request missing phone");
                    break;
                };
                InboundKind::Remote {
                    phone: phone.to_string(),
                }
            }
            other => {
                tracing::error!(connection_id = %connection_id, message_type = other, "webchat unsupported message type");
                break;
            }
        };

        let event = InboundEvent {
            token,
            kind,
            channel: channel.clone(),
        };
        if !forward(&adapter, event, &connection_id).await {
            break;
        }
    }

    // Tell the core the channel is gone so its binding can be dropped.
    if let Some(token) = last_token {
        let event = InboundEvent {
            token,
            kind: InboundKind::Disconnected,
            channel: channel.clone(),
        };
        forward(&adapter, event, &connection_id).await;
    }

    outbound_task.abort();
    adapter.state.connections.remove(&connection_id);
}

async fn forward(adapter: &WebChatAdapter, event: InboundEvent, connection_id: &str) -> bool {
    let tx = adapter.state.inbound_tx.read().await.clone();
    let Some(tx) = tx else {
        tracing::error!(connection_id = %connection_id, "webchat adapter started without inbound queue");
        return false;
    };
    if let Err(e) = tx.send(event).await {
        tracing::error!(%e, connection_id = %connection_id, "webchat inbound queue closed");
        return false;
    }
    true
}
