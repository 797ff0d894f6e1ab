use anyhow::Context;
use chrono::Utc;
use futures_util::{SinkExt, Stream, StreamExt};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use uuid::Uuid;

use crate::broadcast::SnapshotSink;
use crate::types::SnapshotView;
use crate::websocket_commands::{handle_message, CommandContext, Connection};

/// Envelope for every frame in both directions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub message_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub timestamp: u64,
}

impl WireMessage {
    pub fn new(message_type: &str, data: serde_json::Value) -> Self {
        Self {
            message_type: message_type.to_string(),
            data,
            timestamp: Utc::now().timestamp_millis().max(0) as u64,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new("error", serde_json::json!({ "message": message.into() }))
    }

    pub fn to_frame(&self) -> Result<Message, serde_json::Error> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }
}

/// Queue feeding one connection's writer task
pub type Outbox = mpsc::UnboundedSender<Message>;

/// Hub sink that frames snapshots onto a socket's outbox
pub struct WsSink {
    outbox: Outbox,
}

impl WsSink {
    pub fn new(outbox: Outbox) -> Self {
        Self { outbox }
    }
}

impl SnapshotSink for WsSink {
    fn deliver(&self, snapshot: &SnapshotView) -> Result<(), String> {
        let data = serde_json::to_value(snapshot).map_err(|e| e.to_string())?;
        let frame = WireMessage::new("SNAPSHOT", data)
            .to_frame()
            .map_err(|e| e.to_string())?;
        self.outbox
            .send(frame)
            .map_err(|_| "connection closed".to_string())
    }
}

pub struct SyncServer {
    port: u16,
    context: Arc<CommandContext>,
}

impl SyncServer {
    pub fn new(port: u16, context: Arc<CommandContext>) -> Self {
        Self { port, context }
    }

    /// Accepts connections until the listener fails
    pub async fn start(&self) -> anyhow::Result<()> {
        let addr = format!("127.0.0.1:{}", self.port);
        let listener = TcpListener::bind(&addr).await.with_context(|| {
            format!(
                "failed to bind {} (another instance running, or the port is taken)",
                addr
            )
        })?;
        info!("WebSocket server listening on: {}", addr);

        loop {
            let (stream, peer) = listener.accept().await.context("accept failed")?;
            let context = Arc::clone(&self.context);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, context).await {
                    error!("Error handling connection from {}: {}", peer, e);
                }
            });
        }
    }
}

async fn handle_connection(
    raw_stream: TcpStream,
    peer: SocketAddr,
    context: Arc<CommandContext>,
) -> anyhow::Result<()> {
    let ws_stream = accept_async(raw_stream).await?;
    let connection_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {} with ID: {}", peer, connection_id);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let welcome = WireMessage::new(
        "connected",
        serde_json::json!({ "connectionId": connection_id, "status": "ready" }),
    );
    ws_sender.send(welcome.to_frame()?).await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let writer_id = connection_id.clone();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = ws_sender.send(message).await {
                warn!("Failed to send message to connection {}: {}", writer_id, e);
                break;
            }
        }
        debug!("Writer task ended for connection {}", writer_id);
    });

    let mut connection = Connection::new(tx);
    let result = read_loop(&mut ws_receiver, &context, &mut connection, &connection_id).await;

    // Dropping the last outbox sender lets the writer drain and exit
    connection.close(&context).await;
    info!("Connection {} closed", connection_id);
    result
}

async fn read_loop<S>(
    ws_receiver: &mut S,
    context: &CommandContext,
    connection: &mut Connection,
    connection_id: &str,
) -> anyhow::Result<()>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = ws_receiver.next().await {
        match msg? {
            Message::Text(text) => {
                let reply = match serde_json::from_str::<WireMessage>(&text) {
                    Ok(request) => handle_message(context, connection, &request).await,
                    Err(e) => {
                        warn!("Unparseable frame from {}: {}", connection_id, e);
                        WireMessage::error(format!("malformed message: {}", e))
                    }
                };
                connection.send(&reply)?;
            }
            Message::Binary(_) => {
                debug!("Received binary message (not supported)");
            }
            Message::Close(_) => {
                info!("Connection {} disconnected", connection_id);
                break;
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PlaybackSnapshot;

    #[test]
    fn wire_message_tolerates_missing_fields() {
        let msg: WireMessage = serde_json::from_str(r#"{"message_type":"ping"}"#).unwrap();
        assert_eq!(msg.message_type, "ping");
        assert!(msg.data.is_null());
        assert_eq!(msg.timestamp, 0);
    }

    #[test]
    fn sink_frames_snapshots() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = WsSink::new(tx);
        let view = SnapshotView {
            version: 7,
            updated_at: Utc::now(),
            playback: PlaybackSnapshot::idle(),
            lyrics: None,
            evaluation: None,
        };
        sink.deliver(&view).unwrap();

        let Message::Text(text) = rx.try_recv().unwrap() else {
            panic!("expected a text frame");
        };
        let msg: WireMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(msg.message_type, "SNAPSHOT");
        assert_eq!(msg.data["version"], 7);
        assert!(msg.timestamp > 0);

        drop(rx);
        assert!(sink.deliver(&view).is_err());
    }
}
