//! hooktrace server - HTTP/WebSocket wrapper for hooktrace-core
//!
//! This crate is a thin transport layer; all correlation logic lives in
//! `hooktrace-core`. It provides:
//!
//! - the ingest endpoint hooks post raw events to (fail open, always 202)
//! - query routes over the in-memory trace store
//! - a WebSocket stream of trace deltas for live observers
//!
//! ## Architecture
//!
//! ```text
//! POST /api/events ──► normalize ──► mpsc ──► ingest worker
//!                                              │ store.apply (write lock)
//!                                              │ trace log append (durability)
//!                                              └ broadcaster.publish
//! GET  /api/...    ──► store read lock (never waits on disk)
//! GET  /ws         ──► broadcaster subscription
//! ```
//!
//! Every inbound event funnels through the single worker task, so each state
//! transition runs to completion before the next; queries take the read half
//! of the lock and broadcast fan-out happens strictly after a mutation
//! commits.

pub mod routes;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use chrono::{Duration, Utc};
use tokio::sync::{mpsc, watch, RwLock};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use hooktrace_core::broadcast::Broadcaster;
use hooktrace_core::persist::TraceLog;
use hooktrace_core::store::TraceStore;
use hooktrace_core::{Config, HookEvent};

/// Depth of the ingest funnel between the HTTP handlers and the worker.
const INGEST_QUEUE_DEPTH: usize = 1024;

/// One message into the single mutation path.
enum IngestMsg {
    Event(HookEvent),
    /// Periodic eviction tick, handled in the worker so all mutation stays on
    /// one task
    Sweep,
}

/// Shared application state
pub struct AppState {
    pub store: RwLock<TraceStore>,
    pub broadcaster: Broadcaster,
    ingest_tx: mpsc::Sender<IngestMsg>,
}

impl AppState {
    /// Hand a normalized event to the ingest worker.
    ///
    /// Fire-and-forget: a full queue is logged and the event dropped rather
    /// than blocking the producer.
    pub fn enqueue(&self, event: HookEvent) {
        if let Err(e) = self.ingest_tx.try_send(IngestMsg::Event(event)) {
            tracing::warn!(error = %e, "Ingest queue rejected event");
        }
    }
}

/// The hooktrace server: owns the store, the trace log worker and the
/// eviction sweep.
pub struct TraceServer {
    state: Arc<AppState>,
    config: Config,
    shutdown_tx: watch::Sender<bool>,
}

impl TraceServer {
    /// Build the server: open the trace log, replay recent runs into the
    /// store, and spawn the ingest worker and eviction sweep.
    pub fn new(config: Config) -> hooktrace_core::Result<Self> {
        let data_dir = config.storage.resolve_data_dir();
        let mut log = TraceLog::open(&data_dir)?;

        let ttl = Duration::minutes(config.retention.run_ttl_minutes as i64);
        let mut store = TraceStore::new(ttl);

        let replayed = log.replay_recent(config.storage.replay_runs)?;
        let restored = replayed.len();
        for run in replayed {
            store.restore(run);
        }
        if restored > 0 {
            tracing::info!(runs = restored, "Replayed trace logs from disk");
        }

        let (ingest_tx, ingest_rx) = mpsc::channel(INGEST_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let state = Arc::new(AppState {
            store: RwLock::new(store),
            broadcaster: Broadcaster::new(),
            ingest_tx,
        });

        tokio::spawn(ingest_worker(
            Arc::clone(&state),
            log,
            ingest_rx,
            shutdown_rx.clone(),
        ));
        tokio::spawn(sweep_timer(
            Arc::clone(&state),
            config.retention.sweep_interval_secs,
            shutdown_rx,
        ));

        Ok(Self {
            state,
            config,
            shutdown_tx,
        })
    }

    /// Build the Axum router with all routes
    pub fn router(&self) -> Router {
        routes::create_router(Arc::clone(&self.state))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Get the socket address for the server
    pub fn addr(&self) -> hooktrace_core::Result<SocketAddr> {
        format!("{}:{}", self.config.server.bind, self.config.server.port)
            .parse()
            .map_err(|e| {
                hooktrace_core::Error::Config(format!("invalid bind address: {}", e))
            })
    }

    /// Run the server until ctrl-c, then stop the background tasks.
    pub async fn run(self) -> anyhow::Result<()> {
        let app = self.router();
        let addr = self.addr()?;

        tracing::info!("hooktrace server listening on http://{}", addr);
        tracing::info!("Endpoints:");
        tracing::info!("  GET  /health");
        tracing::info!("  POST /api/events");
        tracing::info!("  GET  /api/sessions");
        tracing::info!("  GET  /api/sessions/:id");
        tracing::info!("  GET  /api/sessions/:id/spans");
        tracing::info!("  GET  /api/sessions/:id/report");
        tracing::info!("  GET  /api/sessions/:id/transcript");
        tracing::info!("  GET  /ws");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Shutdown signal received");
            })
            .await?;

        // Stop the ingest worker and eviction sweep
        let _ = self.shutdown_tx.send(true);
        Ok(())
    }
}

/// The single mutation path: apply, persist, then broadcast.
async fn ingest_worker(
    state: Arc<AppState>,
    mut log: TraceLog,
    mut rx: mpsc::Receiver<IngestMsg>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let msg = tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        match msg {
            IngestMsg::Event(event) => {
                let applied = {
                    let mut store = state.store.write().await;
                    store.apply(&event)
                };

                // Durability point; a failure is logged, memory still advanced
                if let Err(e) = log.append_batch(&applied.records) {
                    tracing::warn!(
                        session_id = %event.session_id,
                        error = %e,
                        "Trace log append failed"
                    );
                }

                for update in &applied.updates {
                    state.broadcaster.publish(update);
                }
            }
            IngestMsg::Sweep => {
                let evicted = {
                    let mut store = state.store.write().await;
                    store.evict_expired(Utc::now())
                };
                for run_id in &evicted {
                    log.close(run_id);
                }
                state.broadcaster.prune_closed();
            }
        }
    }

    log.close_all();
    tracing::info!("Ingest worker stopped");
}

/// Feed periodic sweep ticks into the mutation path; cleanly stoppable.
async fn sweep_timer(
    state: Arc<AppState>,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let _ = state.ingest_tx.try_send(IngestMsg::Sweep);
            }
            _ = shutdown.changed() => break,
        }
    }
}
