//! Process Lifecycle
//!
//! Startup order: models first (a missing artifact aborts the process),
//! then the inference pool, persistence, hub and registry, then the HTTP
//! listener. Shutdown mirrors it: stop the external polling, close every
//! alert channel with "server_shutdown", drain the registered peer
//! connections under a deadline, join the inference workers, release the
//! models.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ab_glyph::FontArc;
use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};
use vigil_core::processor::EvidenceRecorder;
use vigil_core::{Inference, InferencePool, ModelManager};

use crate::config::ServerConfig;
use crate::db;
use crate::hub::AlertHub;
use crate::metrics;
use crate::recorder::Recorder;
use crate::registry::StreamRegistry;
use crate::routes::{self, AppState};
use crate::sink::{ExternalAlerts, ExternalSink, PollingController};
use crate::storage::EvidenceStore;

/// Deadline for closing the remaining peer connections on shutdown
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    metrics::register_all();
    let config = Arc::new(config);

    let models = ModelManager::load_once(&config.models).context("model load failed")?;
    let pool = Arc::new(InferencePool::new(
        models.clone(),
        config.inference_workers,
        config.inference_queue,
    ));
    let inference: Arc<dyn Inference> = pool.clone();

    let db_pool = db::connect(&config.database_url)
        .await
        .context("database connect failed")?;
    db::init_schema(&db_pool).await.context("schema init failed")?;

    let external_sink = config
        .telegram_bot_token
        .as_deref()
        .map(|token| Arc::new(ExternalSink::new(token)));
    let external_alerts = external_sink
        .clone()
        .map(|sink| Arc::new(ExternalAlerts::new(sink, db_pool.clone())));

    let hub = Arc::new(AlertHub::new(external_alerts));
    let registry = Arc::new(StreamRegistry::new());
    let recorder: Arc<dyn EvidenceRecorder> = Arc::new(Recorder::new(
        db_pool.clone(),
        EvidenceStore::new(config.evidence_root.clone()),
    ));
    let font = load_font(config.annotation_font_path.as_ref());

    let polling = external_sink.map(PollingController::start);

    let state = AppState {
        config: config.clone(),
        pool: db_pool,
        hub: hub.clone(),
        registry: registry.clone(),
        inference,
        recorder,
        font,
    };
    let app = routes::router(state);

    let listener = TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("bind failed on {}", config.bind_addr()))?;
    info!(addr = %config.bind_addr(), "vigil server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("server error")?;

    if let Some(polling) = polling {
        polling.stop().await;
    }

    hub.close_all("server_shutdown");

    let drain = async {
        for handle in registry.drain() {
            handle.teardown().await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_DRAIN, drain).await.is_err() {
        warn!("stream drain exceeded its deadline, remaining connections dropped");
    }

    // joins OS threads, keep it off the async runtime
    let pool_to_join = pool.clone();
    let _ = tokio::task::spawn_blocking(move || pool_to_join.shutdown()).await;

    models.cleanup();
    info!("vigil server stopped");
    Ok(())
}

fn load_font(path: Option<&PathBuf>) -> Option<FontArc> {
    let path = path?;
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "annotation font unreadable, labels disabled");
            return None;
        }
    };
    match FontArc::try_from_vec(bytes) {
        Ok(font) => Some(font),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "annotation font invalid, labels disabled");
            None
        }
    }
}
