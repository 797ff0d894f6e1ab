use log::{debug, info, warn};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::broadcast::BroadcastHub;
use crate::cache::PlaybackCache;
use crate::daemon::PollingDaemon;
use crate::history::HistoryReconciler;
use crate::providers::SharedTokenProvider;
use crate::websocket::{Outbox, WireMessage, WsSink};

/// Everything a connection may touch
pub struct CommandContext {
    pub cache: Arc<PlaybackCache>,
    pub hub: Arc<BroadcastHub>,
    pub daemon: Arc<PollingDaemon>,
    /// Token store the daemon polls with; `START_POLLING` may replace it
    pub credentials: Arc<SharedTokenProvider>,
    pub reconciler: Arc<HistoryReconciler>,
    /// Default and ceiling for `GET_HISTORY`
    pub history_limit: usize,
}

/// Per-socket state: the outbox and the hub registration, if any
pub struct Connection {
    outbox: Outbox,
    subscription: Option<(String, u64)>,
}

impl Connection {
    pub fn new(outbox: Outbox) -> Self {
        Self {
            outbox,
            subscription: None,
        }
    }

    pub fn subscribed_as(&self) -> Option<&str> {
        self.subscription.as_ref().map(|(id, _)| id.as_str())
    }

    pub fn send(&self, message: &WireMessage) -> anyhow::Result<()> {
        self.outbox
            .send(message.to_frame()?)
            .map_err(|_| anyhow::anyhow!("connection outbox closed"))
    }

    async fn leave(&mut self, hub: &BroadcastHub) {
        if let Some((id, registration)) = self.subscription.take() {
            hub.unsubscribe_registration(&id, registration).await;
        }
    }

    /// Drops the hub registration when the socket goes away
    pub async fn close(mut self, context: &CommandContext) {
        self.leave(&context.hub).await;
    }
}

/// Handles one client request and builds the reply
pub async fn handle_message(
    context: &CommandContext,
    connection: &mut Connection,
    request: &WireMessage,
) -> WireMessage {
    debug!("Handling {} request", request.message_type);
    match request.message_type.as_str() {
        "SUBSCRIBE" => subscribe(context, connection, request).await,
        "UNSUBSCRIBE" => {
            let id = connection.subscribed_as().map(str::to_string);
            connection.leave(&context.hub).await;
            WireMessage::new("UNSUBSCRIBED", json!({ "clientId": id }))
        }
        "GET_SNAPSHOT" => match serde_json::to_value(context.cache.snapshot()) {
            Ok(data) => WireMessage::new("SNAPSHOT", data),
            Err(e) => WireMessage::error(format!("failed to encode snapshot: {}", e)),
        },
        "GET_HISTORY" => {
            let limit = request
                .data
                .get("limit")
                .and_then(|v| v.as_u64())
                .map(|n| (n as usize).clamp(1, context.history_limit))
                .unwrap_or(context.history_limit);
            let entries = context.reconciler.reconcile(limit).await;
            WireMessage::new("HISTORY", json!({ "entries": entries }))
        }
        "GET_STATUS" => status(context).await,
        "START_POLLING" => start_polling(context, request).await,
        "ping" => WireMessage::new("pong", json!({})),
        other => {
            debug!("Unknown message type: {}", other);
            WireMessage::error(format!("unknown message type: {}", other))
        }
    }
}

async fn subscribe(
    context: &CommandContext,
    connection: &mut Connection,
    request: &WireMessage,
) -> WireMessage {
    let client_id = request
        .data
        .get("clientId")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if connection.subscribed_as().is_some_and(|current| current != client_id) {
        connection.leave(&context.hub).await;
    }

    let sink = WsSink::new(connection.outbox.clone());
    match context.hub.subscribe(&client_id, Box::new(sink)).await {
        Ok(registration) => {
            info!("Connection subscribed as {}", client_id);
            connection.subscription = Some((client_id.clone(), registration));
            WireMessage::new("SUBSCRIBED", json!({ "clientId": client_id }))
        }
        Err(e) => WireMessage::error(format!("subscribe failed: {}", e)),
    }
}

async fn start_polling(context: &CommandContext, request: &WireMessage) -> WireMessage {
    if let Some(token) = request.data.get("accessToken").and_then(|v| v.as_str()) {
        info!("Access token replaced by client");
        context.credentials.replace(Some(token.to_string()));
    }
    match context.daemon.start().await {
        Ok(_) => status(context).await,
        Err(e) => {
            warn!("START_POLLING failed: {}", e);
            WireMessage::new(
                "error",
                json!({
                    "message": e.to_string(),
                    "daemon": context.daemon.status().await,
                }),
            )
        }
    }
}

async fn status(context: &CommandContext) -> WireMessage {
    WireMessage::new(
        "STATUS",
        json!({
            "daemon": context.daemon.status().await,
            "subscribers": context.hub.subscriber_count().await,
            "version": context.cache.version(),
        }),
    )
}
