use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::{sync::Arc, time::Instant};
use tokio::time::Duration;
use tracing::debug;

use tether_core::relay::PublishResponse;
use tether_core::signal::{SignalId, SignalMessage};
use tether_core::types::UserId;

use crate::{
    config::RelayConfig,
    mailbox::{MailboxError, SignalBoard},
    metrics::RelayMetrics,
};

#[derive(Clone)]
pub struct AppState {
    pub board: Arc<SignalBoard>,
    pub metrics: Arc<RelayMetrics>,
    pub config: RelayConfig,
    pub shutdown: tokio::sync::watch::Receiver<bool>,
}

impl AppState {
    fn record_gauges(&self) {
        self.metrics
            .active_mailboxes
            .set(self.board.mailbox_count() as f64);
        self.metrics
            .pending_signals
            .set(self.board.pending_count() as f64);
    }

    fn reject(&self, status: StatusCode, reason: &'static str) -> Response {
        self.metrics.error_counts.inc();
        (status, reason).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PollParams {
    pub wait_ms: Option<u64>,
    pub after: Option<String>,
}

// POST /v1/signals/{recipient}/{sender}
pub async fn post_signal(
    State(state): State<AppState>,
    Path((recipient, sender)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let start = Instant::now();

    if body.len() > state.config.max_signal_size {
        return state.reject(StatusCode::PAYLOAD_TOO_LARGE, "signal too large");
    }

    let message: SignalMessage = match serde_json::from_slice(&body) {
        Ok(m) => m,
        Err(e) => {
            debug!(error = %e, "rejecting malformed signal");
            return state.reject(StatusCode::BAD_REQUEST, "malformed signal");
        }
    };

    if message.to.as_str() != recipient || message.from.as_str() != sender {
        return state.reject(StatusCode::BAD_REQUEST, "signal does not match mailbox");
    }

    match state.board.post(message, state.config.max_mailbox_len) {
        Ok(id) => {
            state.metrics.signals_posted.inc();
            state.record_gauges();
            state
                .metrics
                .request_latency
                .observe(start.elapsed().as_secs_f64());
            (StatusCode::CREATED, Json(PublishResponse { id })).into_response()
        }
        Err(MailboxError::QueueFull) => state.reject(StatusCode::INSUFFICIENT_STORAGE, "mailbox full"),
    }
}

// GET /v1/signals/{recipient}/{sender}?wait_ms=25000&after={id}
pub async fn get_signals(
    State(state): State<AppState>,
    Path((recipient, sender)): Path<(String, String)>,
    Query(params): Query<PollParams>,
) -> Response {
    let start = Instant::now();

    if *state.shutdown.borrow() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server shutting down").into_response();
    }

    let wait_ms = params.wait_ms.unwrap_or(25_000).min(state.config.max_wait_ms);
    let (recipient, sender) = (UserId::from(recipient), UserId::from(sender));
    let after = params.after.map(SignalId::new);

    // Register for wakeups before reading so a post in between is not missed.
    let notify = state.board.notifier(&recipient, &sender);
    let notified = notify.notified();

    let mut deliveries = state.board.read(&recipient, &sender, after.as_ref());

    if deliveries.is_empty() && wait_ms > 0 {
        let timeout = tokio::time::sleep(Duration::from_millis(wait_ms));
        tokio::pin!(timeout);

        tokio::select! {
            _ = notified => {
                deliveries = state.board.read(&recipient, &sender, after.as_ref());
            }
            _ = &mut timeout => {}
            _ = async {
                let mut rx = state.shutdown.clone();
                let _ = rx.changed().await;
            } => {
                if *state.shutdown.borrow() {
                    return (StatusCode::SERVICE_UNAVAILABLE, "server shutting down").into_response();
                }
            }
        }
    }

    state
        .metrics
        .signals_delivered
        .inc_by(deliveries.len() as f64);
    state
        .metrics
        .request_latency
        .observe(start.elapsed().as_secs_f64());
    (StatusCode::OK, Json(deliveries)).into_response()
}

// DELETE /v1/signals/{recipient}/{sender}/{id}
pub async fn delete_signal(
    State(state): State<AppState>,
    Path((recipient, sender, id)): Path<(String, String, String)>,
) -> Response {
    let removed = state
        .board
        .delete(&recipient.into(), &sender.into(), &SignalId::new(id));
    if removed {
        state.metrics.signals_deleted.inc();
        state.record_gauges();
        StatusCode::NO_CONTENT.into_response()
    } else {
        state.reject(StatusCode::NOT_FOUND, "no such signal")
    }
}

// DELETE /v1/signals/{recipient}/{sender}
pub async fn purge_signals(
    State(state): State<AppState>,
    Path((recipient, sender)): Path<(String, String)>,
) -> Response {
    let removed = state.board.purge(&recipient.into(), &sender.into());
    state.metrics.signals_deleted.inc_by(removed as f64);
    state.record_gauges();
    StatusCode::NO_CONTENT.into_response()
}

// GET /health
pub async fn get_health(State(state): State<AppState>) -> Response {
    use serde_json::json;

    let response = json!({
        "status": "healthy",
        "mailboxes": state.board.mailbox_count(),
        "version": env!("CARGO_PKG_VERSION"),
    });

    (StatusCode::OK, Json(response)).into_response()
}

// GET /metrics
pub async fn get_metrics(State(state): State<AppState>) -> Response {
    state.record_gauges();
    let prometheus = state.metrics.export_prometheus();
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        prometheus,
    )
        .into_response()
}
