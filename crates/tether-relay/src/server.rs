use axum::{
    routing::{delete, get, post},
    Router,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::watch};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::{self, AppState};
use crate::config::RelayConfig;
use crate::mailbox::SignalBoard;
use crate::metrics::RelayMetrics;

pub struct RelayServer {
    config: RelayConfig,
    board: Arc<SignalBoard>,
    metrics: Arc<RelayMetrics>,
    shutdown_tx: watch::Sender<bool>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let metrics = Arc::new(RelayMetrics::new()?);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            board: Arc::new(SignalBoard::new()),
            metrics,
            shutdown_tx,
        })
    }

    pub fn board(&self) -> &Arc<SignalBoard> {
        &self.board
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            board: Arc::clone(&self.board),
            metrics: Arc::clone(&self.metrics),
            config: self.config.clone(),
            shutdown: self.shutdown_tx.subscribe(),
        };

        Router::new()
            .route(
                "/v1/signals/:recipient/:sender",
                post(api::post_signal)
                    .get(api::get_signals)
                    .delete(api::purge_signals),
            )
            .route("/v1/signals/:recipient/:sender/:id", delete(api::delete_signal))
            .route("/health", get(api::get_health))
            .route("/metrics", get(api::get_metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn start(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;

        tokio::spawn(Self::eviction_task(
            Arc::clone(&self.board),
            self.config.clone(),
            Arc::clone(&self.metrics),
            self.shutdown_tx.subscribe(),
        ));

        let app = self.router();
        info!("tether-relay listening on {}", addr);

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(Self::shutdown_signal(self.shutdown_tx.subscribe()))
            .await?;

        // Wake anything still parked in the eviction loop.
        let _ = self.shutdown_tx.send(true);
        info!("tether-relay stopped");
        Ok(())
    }

    async fn eviction_task(
        board: Arc<SignalBoard>,
        config: RelayConfig,
        metrics: Arc<RelayMetrics>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(config.eviction_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let (evicted, removed) =
                        board.evict(config.signal_ttl(), config.idle_mailbox_timeout());

                    metrics.signals_evicted.inc_by(evicted as f64);
                    metrics.active_mailboxes.set(board.mailbox_count() as f64);
                    metrics.pending_signals.set(board.pending_count() as f64);

                    if evicted > 0 || removed > 0 {
                        info!(evicted, removed, "evicted expired signals");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
        #[cfg(unix)]
        let mut sigterm = {
            use tokio::signal::unix::{signal, SignalKind};
            signal(SignalKind::terminate()).ok()
        };

        tokio::select! {
            _ = async {
                #[cfg(unix)]
                {
                    match sigterm {
                        Some(ref mut sigterm) => { sigterm.recv().await; }
                        None => std::future::pending::<()>().await,
                    }
                }
                #[cfg(not(unix))]
                {
                    std::future::pending::<()>().await;
                }
            } => {
                info!("Received SIGTERM, starting graceful shutdown");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, starting graceful shutdown");
            }
            _ = async {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            } => {
                info!("Shutdown requested");
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
