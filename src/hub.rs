// =============================================================================
// SubscriptionHub — WebSocket connection registry + typed broadcast
// =============================================================================
//
// Each connection is represented by an `mpsc::UnboundedSender<Message>`
// handle that the connection's send loop drains (see api::ws). This mirrors
// the teacher's push-loop style while replacing the Python original's direct
// `websocket.send_json` against a shared object — here, every publisher just
// pushes onto a channel and never touches the socket directly.
//
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::Message;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::Prediction;

/// Past this many genuinely unconsumed frames, a connection is considered
/// slow and is dropped rather than allowed to back up the hub (spec §5). The
/// channel itself is bounded to this depth so backlog is measured by actual
/// queue occupancy, not lifetime messages sent.
const MAX_QUEUE_DEPTH: usize = 1_000;

pub type ConnId = Uuid;

/// Outbound message kinds, fixed field shapes per spec §6.
#[derive(Debug, Clone)]
pub enum OutboundKind {
    Progress {
        completed: i64,
        total: i64,
        failed: i64,
    },
    Result(Box<PredictionWire>),
    Verification {
        prediction_id: String,
        symbol: String,
        actual_return: f64,
        was_correct: bool,
        pnl: f64,
        verified_at: chrono::DateTime<Utc>,
    },
    PriceUpdate {
        price_update: PriceUpdateWire,
    },
    JobComplete {
        total_results: i64,
        total_failures: i64,
        duration_seconds: f64,
    },
    Error {
        error: String,
    },
    Pong,
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictionWire {
    pub id: String,
    pub symbol: String,
    pub scan_time: chrono::DateTime<Utc>,
    pub horizon: i64,
    pub prob_up: f64,
    pub prob_down: f64,
    pub mean_return: f64,
    pub edge: f64,
    pub direction: String,
    pub n_neighbors: i64,
    pub dist1: Option<f64>,
    pub p10: Option<f64>,
    pub p90: Option<f64>,
    pub price_at_scan: f64,
}

impl From<&Prediction> for PredictionWire {
    fn from(p: &Prediction) -> Self {
        Self {
            id: p.id.clone(),
            symbol: p.symbol.clone(),
            scan_time: p.scan_time,
            horizon: p.horizon,
            prob_up: crate::types::round4(p.prob_up),
            prob_down: crate::types::round4(p.prob_down),
            mean_return: crate::types::round4(p.mean_return),
            edge: crate::types::round4(p.edge),
            direction: p.direction.to_string(),
            n_neighbors: p.n_neighbors,
            dist1: p.dist1,
            p10: p.p10,
            p90: p.p90,
            price_at_scan: p.price_at_scan,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PriceUpdateWire {
    pub prediction_id: String,
    pub job_id: String,
    pub symbol: String,
    pub current_price: f64,
    pub price_at_scan: f64,
    pub unrealized_return: f64,
    pub unrealized_pnl: f64,
    pub direction: String,
    pub is_currently_correct: bool,
    pub minutes_remaining: f64,
    pub timestamp: chrono::DateTime<Utc>,
}

/// One outbound frame: `{type, job_id?, data, timestamp}` at the wire, built
/// by [`Envelope::to_message`].
#[derive(Debug, Clone)]
pub struct Envelope {
    pub job_id: Option<String>,
    pub kind: OutboundKind,
}

impl Envelope {
    pub fn to_message(&self) -> Message {
        // price_update carries its own nested shape per spec §6; every other
        // tag wraps its fields under a generic `data` object.
        let body = match &self.kind {
            OutboundKind::PriceUpdate { price_update } => json!({
                "type": "price_update",
                "price_update": price_update,
                "timestamp": Utc::now(),
            }),
            OutboundKind::Progress { completed, total, failed } => json!({
                "type": "progress",
                "job_id": self.job_id,
                "data": {"completed": completed, "total": total, "failed": failed},
                "timestamp": Utc::now(),
            }),
            OutboundKind::Result(prediction) => json!({
                "type": "result",
                "job_id": self.job_id,
                "data": prediction,
                "timestamp": Utc::now(),
            }),
            OutboundKind::Verification {
                prediction_id,
                symbol,
                actual_return,
                was_correct,
                pnl,
                verified_at,
            } => json!({
                "type": "verification",
                "job_id": self.job_id,
                "data": {
                    "prediction_id": prediction_id,
                    "symbol": symbol,
                    "actual_return": actual_return,
                    "was_correct": was_correct,
                    "pnl": pnl,
                    "verified_at": verified_at,
                },
                "timestamp": Utc::now(),
            }),
            OutboundKind::JobComplete { total_results, total_failures, duration_seconds } => json!({
                "type": "job_complete",
                "job_id": self.job_id,
                "data": {
                    "total_results": total_results,
                    "total_failures": total_failures,
                    "duration_seconds": (duration_seconds * 100.0).round() / 100.0,
                },
                "timestamp": Utc::now(),
            }),
            OutboundKind::Error { error } => json!({
                "type": "error",
                "job_id": self.job_id,
                "data": {"error": error},
                "timestamp": Utc::now(),
            }),
            OutboundKind::Pong => json!({
                "type": "pong",
                "job_id": self.job_id,
                "data": {},
                "timestamp": Utc::now(),
            }),
        };

        Message::Text(body.to_string())
    }
}

struct Connection {
    sender: Sender<Message>,
}

/// Registry of live connections and per-job subscriptions.
pub struct SubscriptionHub {
    connections: RwLock<HashMap<ConnId, Arc<Connection>>>,
    subscriptions: RwLock<HashMap<String, HashSet<ConnId>>>,
    conn_jobs: RwLock<HashMap<ConnId, HashSet<String>>>,
    total_connections: AtomicU64,
    total_messages_sent: AtomicU64,
}

impl Default for SubscriptionHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            conn_jobs: RwLock::new(HashMap::new()),
            total_connections: AtomicU64::new(0),
            total_messages_sent: AtomicU64::new(0),
        }
    }

    /// Register a new connection, returning its id and the receiver half the
    /// caller should drain into the socket. The channel is bounded at
    /// `MAX_QUEUE_DEPTH`: once a connection's backlog fills, it is genuinely
    /// slow and gets dropped rather than allowed to back up the hub.
    pub fn connect(&self) -> (ConnId, tokio::sync::mpsc::Receiver<Message>) {
        let id = Uuid::new_v4();
        let (tx, rx) = tokio::sync::mpsc::channel(MAX_QUEUE_DEPTH);
        self.connections
            .write()
            .insert(id, Arc::new(Connection { sender: tx }));
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        info!(conn = %id, active = self.connections.read().len(), "ws connected");
        (id, rx)
    }

    pub fn disconnect(&self, conn: ConnId) {
        self.connections.write().remove(&conn);
        if let Some(jobs) = self.conn_jobs.write().remove(&conn) {
            let mut subs = self.subscriptions.write();
            for job_id in jobs {
                if let Some(set) = subs.get_mut(&job_id) {
                    set.remove(&conn);
                    if set.is_empty() {
                        subs.remove(&job_id);
                    }
                }
            }
        }
        info!(conn = %conn, active = self.connections.read().len(), "ws disconnected");
    }

    pub fn subscribe(&self, conn: ConnId, job_id: &str) {
        self.subscriptions
            .write()
            .entry(job_id.to_string())
            .or_default()
            .insert(conn);
        self.conn_jobs
            .write()
            .entry(conn)
            .or_default()
            .insert(job_id.to_string());
        debug!(conn = %conn, job_id, "subscribed");
    }

    pub fn unsubscribe(&self, conn: ConnId, job_id: &str) {
        if let Some(set) = self.subscriptions.write().get_mut(job_id) {
            set.remove(&conn);
        }
        if let Some(jobs) = self.conn_jobs.write().get_mut(&conn) {
            jobs.remove(job_id);
        }
        debug!(conn = %conn, job_id, "unsubscribed");
    }

    fn subscribers(&self, job_id: &str) -> Vec<ConnId> {
        self.subscriptions
            .read()
            .get(job_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    fn all_connections(&self) -> Vec<ConnId> {
        self.connections.read().keys().copied().collect()
    }

    fn deliver(&self, conn: ConnId, message: &Message) -> bool {
        let handle = self.connections.read().get(&conn).cloned();
        let Some(handle) = handle else { return false };

        match handle.sender.try_send(message.clone()) {
            Ok(()) => {
                self.total_messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(conn = %conn, depth = MAX_QUEUE_DEPTH, "connection backlog full, dropping");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Send to every subscriber of `job_id`; failures disconnect the
    /// connection. Returns the number of successful sends.
    pub fn broadcast_to_job(&self, job_id: &str, envelope: Envelope) -> usize {
        let message = envelope.to_message();
        let subscribers = self.subscribers(job_id);
        if subscribers.is_empty() {
            return 0;
        }

        let mut sent = 0;
        let mut failed = Vec::new();
        for conn in subscribers {
            if self.deliver(conn, &message) {
                sent += 1;
            } else {
                failed.push(conn);
            }
        }
        for conn in failed {
            self.disconnect(conn);
        }
        sent
    }

    /// Send to every live connection regardless of subscription (used for
    /// verifications and price updates, per spec §4.2/§4.7).
    pub fn broadcast_all(&self, envelope: Envelope) -> usize {
        let message = envelope.to_message();
        let conns = self.all_connections();
        if conns.is_empty() {
            return 0;
        }

        let mut sent = 0;
        let mut failed = Vec::new();
        for conn in conns {
            if self.deliver(conn, &message) {
                sent += 1;
            } else {
                failed.push(conn);
            }
        }
        for conn in failed {
            self.disconnect(conn);
        }
        sent
    }

    fn send_personal(&self, conn: ConnId, envelope: Envelope) {
        self.deliver(conn, &envelope.to_message());
    }

    /// Dispatch an inbound client frame (`subscribe` / `unsubscribe` / `ping`).
    pub fn handle_inbound_message(&self, conn: ConnId, raw: &str) {
        let parsed: serde_json::Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(_) => {
                self.send_personal(
                    conn,
                    Envelope {
                        job_id: None,
                        kind: OutboundKind::Error {
                            error: "invalid JSON".to_string(),
                        },
                    },
                );
                return;
            }
        };

        match parsed.get("type").and_then(|v| v.as_str()) {
            Some("subscribe") => match parsed.get("job_id").and_then(|v| v.as_str()) {
                Some(job_id) => self.subscribe(conn, job_id),
                None => self.send_error(conn, "missing job_id"),
            },
            Some("unsubscribe") => match parsed.get("job_id").and_then(|v| v.as_str()) {
                Some(job_id) => self.unsubscribe(conn, job_id),
                None => self.send_error(conn, "missing job_id"),
            },
            Some("ping") => self.send_personal(
                conn,
                Envelope {
                    job_id: None,
                    kind: OutboundKind::Pong,
                },
            ),
            other => self.send_error(conn, &format!("unknown message type: {other:?}")),
        }
    }

    fn send_error(&self, conn: ConnId, reason: &str) {
        self.send_personal(
            conn,
            Envelope {
                job_id: None,
                kind: OutboundKind::Error {
                    error: reason.to_string(),
                },
            },
        );
    }

    pub fn active_connections(&self) -> usize {
        self.connections.read().len()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.read().len()
    }
}
