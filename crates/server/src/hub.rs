use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use db::events::RelayFrame;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{RwLock, mpsc};

/// Outbound frames buffered per connected node before the hub drops them.
const NODE_BUFFER: usize = 100;

struct NodeConnection {
    conn_id: u64,
    tx: mpsc::Sender<Message>,
}

/// Stateless relay: a map of node id to live connection and nothing else.
/// Frames to offline nodes are dropped; durability lives in each sender's
/// outbox, never here.
pub struct Hub {
    token: String,
    next_conn_id: AtomicU64,
    nodes: RwLock<HashMap<String, NodeConnection>>,
}

#[derive(Debug, Deserialize)]
pub struct HubParams {
    node_id: Option<String>,
    token: Option<String>,
}

impl Hub {
    pub fn new(token: &str) -> Arc<Self> {
        Arc::new(Self {
            token: token.to_string(),
            next_conn_id: AtomicU64::new(1),
            nodes: RwLock::new(HashMap::new()),
        })
    }

    pub fn router(hub: Arc<Self>) -> Router {
        Router::new()
            .route("/", get(relay_upgrade))
            .route("/relay", get(relay_upgrade))
            .with_state(hub)
    }

    async fn register(&self, node_id: &str, tx: mpsc::Sender<Message>) -> u64 {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .nodes
            .write()
            .await
            .insert(node_id.to_string(), NodeConnection { conn_id, tx });
        if previous.is_some() {
            tracing::info!(node_id, "node reconnected, replacing prior connection");
        } else {
            tracing::info!(node_id, "node connected");
        }
        conn_id
    }

    /// Removes the entry only when it still belongs to this connection; a
    /// reconnect may already have replaced it.
    async fn unregister(&self, node_id: &str, conn_id: u64) {
        let mut nodes = self.nodes.write().await;
        if nodes.get(node_id).is_some_and(|c| c.conn_id == conn_id) {
            nodes.remove(node_id);
            tracing::info!(node_id, "node disconnected");
        }
    }

    /// Routes one raw frame: fill `source` when the sender left it empty,
    /// forward verbatim when the target is connected, drop otherwise.
    pub async fn route_frame(&self, from: &str, raw: &str) {
        let mut frame: RelayFrame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(from, error = %err, "undecodable frame dropped");
                return;
            }
        };

        if frame.source.is_empty() {
            frame.source = from.to_string();
        }

        let nodes = self.nodes.read().await;
        let Some(target) = nodes.get(&frame.target) else {
            tracing::warn!(from, target = %frame.target, "target not connected, frame dropped");
            return;
        };

        match serde_json::to_string(&frame) {
            Ok(raw) => {
                if target.tx.send(Message::Text(raw.into())).await.is_err() {
                    tracing::warn!(target = %frame.target, "target writer gone, frame dropped");
                }
            }
            Err(err) => tracing::error!(error = %err, "frame re-serialization failed"),
        }
    }

    async fn handle_connection(self: Arc<Self>, node_id: String, socket: WebSocket) {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(NODE_BUFFER);
        let conn_id = self.register(&node_id, tx).await;

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        });

        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => self.route_frame(&node_id, text.as_str()).await,
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(node_id, error = %err, "read error");
                    break;
                }
            }
        }

        self.unregister(&node_id, conn_id).await;
        writer.abort();
    }
}

async fn relay_upgrade(
    State(hub): State<Arc<Hub>>,
    Query(params): Query<HubParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let header_token = headers
        .get("x-relay-token")
        .and_then(|value| value.to_str().ok());
    let token_ok = params.token.as_deref() == Some(hub.token.as_str())
        || header_token == Some(hub.token.as_str());
    if !token_ok {
        return (StatusCode::UNAUTHORIZED, "invalid relay token").into_response();
    }

    let Some(node_id) = params.node_id.filter(|id| !id.trim().is_empty()) else {
        return (StatusCode::BAD_REQUEST, "node_id is required").into_response();
    };

    ws.on_upgrade(move |socket| hub.handle_connection(node_id, socket))
}
