//! WebSocket Log Streaming
//!
//! `/ws/logs` attaches one subscription on the shared log hub to a socket:
//! backlog first, then live records, gap notices and drop notices. Clients
//! change their filter mid-stream with an `update_filter` text frame.
//! `/ws/nodes` pushes the node list on the poll interval and `/ws/alerts`
//! pushes alerts as they are raised.
//!
//! Every socket write is bounded by the configured send timeout. A client
//! that stops reading is disconnected instead of holding its subscription
//! queue open forever.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use nodewatch_core::constants::ROSOUT_SOURCE;
use nodewatch_core::{DeliveryError, FilterSpec, NamePattern};
use nodewatch_logs::{GapNotice, LogEvent, LogHub, SequencedRecord, Subscription};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alerts::{Alert, AlertService};
use crate::error::{ApiError, ApiResult};
use crate::inspect::{normalize_node_name, NodeInspector, NodeSummary};
use crate::telemetry::METRICS;
use crate::transport::is_topic_name;

// ============================================================================
// STATE
// ============================================================================

/// State shared by the WebSocket endpoints.
#[derive(Clone)]
pub struct WsState {
    pub hub: Arc<LogHub>,
    pub inspector: Arc<NodeInspector>,
    pub alerts: Arc<AlertService>,
    pub send_timeout: Duration,
    pub node_poll_interval: Duration,
}

// ============================================================================
// MESSAGES
// ============================================================================

/// Frames sent to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        subscription_id: Uuid,
        source_id: String,
        filter: FilterSpec,
        /// Number of backlog records that follow.
        backlog: usize,
    },
    Log(SequencedRecord),
    Gap(GapNotice),
    /// Records or alerts lost because this client fell behind.
    Dropped { count: u64, total: u64 },
    FilterUpdated { filter: FilterSpec },
    NodesUpdate {
        total: usize,
        nodes: Vec<NodeSummary>,
        stale: bool,
        timestamp: DateTime<Utc>,
    },
    Alert(Alert),
    Error { message: String },
}

impl From<LogEvent> for ServerMessage {
    fn from(event: LogEvent) -> Self {
        match event {
            LogEvent::Record(entry) => ServerMessage::Log(entry),
            LogEvent::Gap(notice) => ServerMessage::Gap(notice),
        }
    }
}

/// Frames accepted from the client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    UpdateFilter {
        #[serde(default)]
        patterns: Vec<String>,
        #[serde(default)]
        min_level: Option<String>,
    },
}

// ============================================================================
// QUERY
// ============================================================================

/// Parsed `/ws/logs` query string. `pattern` may repeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogStreamQuery {
    pub source: String,
    pub spec: FilterSpec,
}

impl LogStreamQuery {
    pub fn from_pairs(pairs: &[(String, String)]) -> ApiResult<Self> {
        let mut source = ROSOUT_SOURCE.to_string();
        let mut spec = FilterSpec::match_all();

        for (key, value) in pairs {
            match key.as_str() {
                "source" => source = value.trim().to_string(),
                "pattern" => spec.patterns.push(value.clone()),
                "min_level" => spec.min_level = Some(value.clone()),
                other => {
                    return Err(ApiError::invalid_input(format!(
                        "Unknown query parameter '{}'",
                        other
                    )))
                }
            }
        }

        if !is_topic_name(&source) {
            return Err(ApiError::invalid_format("source", "a topic name like /rosout"));
        }
        // Reject bad filters before the upgrade so the client gets a 400.
        spec.compile()?;
        Ok(Self { source, spec })
    }

    /// Query for one node's logs: the node itself and its sub-namespaces,
    /// never siblings sharing its prefix.
    pub fn for_node(node: &str, pairs: &[(String, String)]) -> ApiResult<Self> {
        let node = normalize_node_name(node)?;
        let mut query = Self::from_pairs(pairs)?;
        query.spec.patterns = NamePattern::node_scope(&node);
        query.spec.compile()?;
        Ok(query)
    }
}

// ============================================================================
// HANDLERS
// ============================================================================

/// GET /ws/logs?source=/rosout&pattern=/a&pattern=/b&min_level=WARN
pub async fn logs_handler(
    State(state): State<Arc<WsState>>,
    Query(pairs): Query<Vec<(String, String)>>,
    ws: Option<WebSocketUpgrade>,
) -> ApiResult<Response> {
    let query = LogStreamQuery::from_pairs(&pairs)?;
    open_log_stream(state, query, ws)
}

/// GET /ws/logs/{node}: logs from `/node` and `/node/...`.
pub async fn node_logs_handler(
    State(state): State<Arc<WsState>>,
    Path(node): Path<String>,
    Query(pairs): Query<Vec<(String, String)>>,
    ws: Option<WebSocketUpgrade>,
) -> ApiResult<Response> {
    let query = LogStreamQuery::for_node(&node, &pairs)?;
    open_log_stream(state, query, ws)
}

fn open_log_stream(
    state: Arc<WsState>,
    query: LogStreamQuery,
    ws: Option<WebSocketUpgrade>,
) -> ApiResult<Response> {
    // Unknown sources never reach the hub, so they cannot start a pump.
    state.hub.check_source(&query.source)?;
    let ws = ws.ok_or_else(|| ApiError::invalid_input("Expected a WebSocket upgrade request"))?;
    let subscription = state.hub.subscribe(&query.source, &query.spec)?;

    info!(
        subscription_id = %subscription.id(),
        source_id = %query.source,
        patterns = ?query.spec.patterns,
        "Log stream requested"
    );
    Ok(ws.on_upgrade(move |socket| stream_logs(socket, state, query.source, subscription)))
}

/// GET /ws/nodes
pub async fn nodes_handler(
    State(state): State<Arc<WsState>>,
    ws: Option<WebSocketUpgrade>,
) -> ApiResult<Response> {
    let ws = ws.ok_or_else(|| ApiError::invalid_input("Expected a WebSocket upgrade request"))?;
    Ok(ws.on_upgrade(move |socket| stream_node_status(socket, state)))
}

/// GET /ws/alerts
pub async fn alerts_handler(
    State(state): State<Arc<WsState>>,
    ws: Option<WebSocketUpgrade>,
) -> ApiResult<Response> {
    let ws = ws.ok_or_else(|| ApiError::invalid_input("Expected a WebSocket upgrade request"))?;
    let alerts = state.alerts.subscribe();
    Ok(ws.on_upgrade(move |socket| stream_alerts(socket, state, alerts)))
}

// ============================================================================
// CONNECTION LOOPS
// ============================================================================

#[derive(Debug)]
enum SendFailure {
    /// The write did not finish within the send timeout.
    TimedOut,
    Closed(String),
}

/// Sending half of a socket with a bounded write time.
struct Outbound<S> {
    sender: S,
    timeout: Duration,
}

impl<S> Outbound<S>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    fn new(sender: S, timeout: Duration) -> Self {
        Self { sender, timeout }
    }

    async fn send(&mut self, message: &ServerMessage) -> Result<(), SendFailure> {
        let json = serde_json::to_string(message).map_err(|e| SendFailure::Closed(e.to_string()))?;
        match tokio::time::timeout(self.timeout, self.sender.send(Message::Text(json))).await {
            Ok(result) => result.map_err(|e| SendFailure::Closed(e.to_string())),
            Err(_) => Err(SendFailure::TimedOut),
        }
    }
}

fn ws_connected() {
    if let Ok(metrics) = METRICS.as_ref() {
        metrics.ws_connected();
    }
}

fn ws_disconnected() {
    if let Ok(metrics) = METRICS.as_ref() {
        metrics.ws_disconnected();
    }
}

/// Apply a client frame to the subscription and build the reply.
fn handle_client_text(text: &str, subscription: &Subscription) -> ServerMessage {
    let update = match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::UpdateFilter { patterns, min_level }) => FilterSpec { patterns, min_level },
        Err(e) => {
            return ServerMessage::Error {
                message: format!("Invalid message: {}", e),
            }
        }
    };

    match subscription.update_filter(&update) {
        Ok(_) => ServerMessage::FilterUpdated {
            filter: subscription.filter(),
        },
        Err(e) => ServerMessage::Error {
            message: e.to_string(),
        },
    }
}

async fn stream_logs(
    socket: WebSocket,
    state: Arc<WsState>,
    source_id: String,
    mut subscription: Subscription,
) {
    let subscription_id = subscription.id();
    ws_connected();

    let (sender, receiver) = socket.split();
    let mut out = Outbound::new(sender, state.send_timeout);

    if let Err(err) = deliver_logs(&mut out, receiver, &mut subscription, &source_id).await {
        warn!(
            error = %err,
            send_timeout_ms = state.send_timeout.as_millis() as u64,
            "Closing log stream"
        );
    }

    subscription.close();
    ws_disconnected();
    info!(subscription_id = %subscription_id, source_id = %source_id, "Log stream closed");
}

/// Run one log stream to the end. A client that stops reading ends it with
/// `SinkUnresponsive`; one that goes away ends it cleanly.
async fn deliver_logs<S, R>(
    out: &mut Outbound<S>,
    receiver: R,
    subscription: &mut Subscription,
    source_id: &str,
) -> Result<(), DeliveryError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    match forward_logs(out, receiver, subscription, source_id).await {
        Ok(()) => Ok(()),
        Err(SendFailure::TimedOut) => Err(DeliveryError::SinkUnresponsive {
            subscription_id: subscription.id().to_string(),
            dropped: subscription.dropped(),
        }),
        Err(SendFailure::Closed(reason)) => {
            debug!(subscription_id = %subscription.id(), error = %reason, "Send failed, client gone");
            Ok(())
        }
    }
}

/// Backlog, then live events until either side goes away.
async fn forward_logs<S, R>(
    out: &mut Outbound<S>,
    mut receiver: R,
    subscription: &mut Subscription,
    source_id: &str,
) -> Result<(), SendFailure>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let subscription_id = subscription.id();
    let backlog = subscription.take_backlog();
    out.send(&ServerMessage::Connected {
        subscription_id,
        source_id: source_id.to_string(),
        filter: subscription.filter(),
        backlog: backlog.len(),
    })
    .await?;
    for entry in backlog {
        out.send(&ServerMessage::Log(entry)).await?;
    }

    let mut reported_dropped = 0u64;
    loop {
        tokio::select! {
            event = subscription.next() => {
                let Some(event) = event else {
                    debug!(subscription_id = %subscription_id, "Subscription closed");
                    return Ok(());
                };

                let dropped = subscription.dropped();
                if dropped > reported_dropped {
                    out.send(&ServerMessage::Dropped {
                        count: dropped - reported_dropped,
                        total: dropped,
                    })
                    .await?;
                    reported_dropped = dropped;
                }
                out.send(&event.into()).await?;
            }

            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let reply = handle_client_text(&text, subscription);
                    out.send(&reply).await?;
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(subscription_id = %subscription_id, "Client closed connection");
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(subscription_id = %subscription_id, error = %e, "WebSocket receive error");
                    return Ok(());
                }
            },
        }
    }
}

async fn stream_node_status(socket: WebSocket, state: Arc<WsState>) {
    ws_connected();
    let (sender, mut receiver) = socket.split();
    let mut out = Outbound::new(sender, state.send_timeout);

    let mut interval = tokio::time::interval(state.node_poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let message = match state.inspector.list_nodes(true).await {
                    Ok(listing) => ServerMessage::NodesUpdate {
                        total: listing.total,
                        nodes: listing.nodes,
                        stale: listing.stale,
                        timestamp: Utc::now(),
                    },
                    Err(e) => ServerMessage::Error { message: e.message },
                };
                if out.send(&message).await.is_err() {
                    break;
                }
            }

            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    ws_disconnected();
    debug!("Node status stream closed");
}

async fn stream_alerts(socket: WebSocket, state: Arc<WsState>, alerts: broadcast::Receiver<Alert>) {
    ws_connected();
    let (sender, receiver) = socket.split();
    let mut out = Outbound::new(sender, state.send_timeout);

    match forward_alerts(&mut out, receiver, alerts).await {
        Ok(()) | Err(SendFailure::Closed(_)) => {}
        Err(SendFailure::TimedOut) => warn!(
            send_timeout_ms = state.send_timeout.as_millis() as u64,
            "Closing alert stream, client stopped reading"
        ),
    }

    ws_disconnected();
    debug!("Alert stream closed");
}

/// Live alerts until either side goes away. Alerts missed by a slow client
/// are reported as one `dropped` frame.
async fn forward_alerts<S, R>(
    out: &mut Outbound<S>,
    mut receiver: R,
    mut alerts: broadcast::Receiver<Alert>,
) -> Result<(), SendFailure>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let mut total_dropped = 0u64;
    loop {
        tokio::select! {
            alert = alerts.recv() => match alert {
                Ok(alert) => out.send(&ServerMessage::Alert(alert)).await?,
                Err(RecvError::Lagged(count)) => {
                    total_dropped += count;
                    out.send(&ServerMessage::Dropped { count, total: total_dropped }).await?;
                }
                Err(RecvError::Closed) => return Ok(()),
            },

            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return Ok(()),
                Some(Ok(_)) => {}
            },
        }
    }
}
