//! The greenroom daemon: wires the stores, the pipeline, the background
//! tasks, and the HTTP control surface, then serves until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{Duration as ChronoDuration, Utc};
use tracing::{error, info, warn};

use gr_api::{api_router, ApiState, StaticKeyVerifier, StubAuthService};
use gr_core::config::Config;
use gr_knowledge::{
    ContextBuilder, ContextConfig, EmbeddingBackend, EmbeddingService, LocalEmbedder,
    RemoteEmbedder,
};
use gr_limiter::{EnhancedRateLimiter, RateLimitMonitor, SettingsWatcher};
use gr_memory::{PgWarmStore, TieredMemoryManager};
use gr_pipeline::{
    DeliveryWorker, EchoGenerator, EventBus, LogTransport, Orchestrator, RetryPolicy,
    SentenceSplitRefiner,
};
use gr_protocol::{PgProtocolStore, ProtocolManager};
use gr_review::PgReviewStore;
use gr_stores::{
    Database, DocumentStore, InMemoryDocumentStore, KeyValueStore, MemoryKv, RedisKv,
};
use gr_telemetry::MetricsCollector;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let config = Config::load().context("loading configuration")?;
    gr_telemetry::logging::init_logging("greenroom", "info");

    // -- stores -------------------------------------------------------------

    let kv: Arc<dyn KeyValueStore> = match RedisKv::connect(
        &config.stores.redis_url,
        Duration::from_millis(config.stores.kv_op_timeout_ms),
    )
    .await
    {
        Ok(kv) => Arc::new(kv),
        Err(e) => {
            warn!(error = %e, "KV store unreachable – falling back to the in-process store");
            Arc::new(MemoryKv::new())
        }
    };

    let db = Database::connect(&config.stores)
        .await
        .context("connecting to the relational store")?;
    db.ensure_schema().await.context("ensuring schema")?;

    let documents: Option<Arc<dyn DocumentStore>> = if config.stores.document_store_uri.is_some() {
        Some(Arc::new(InMemoryDocumentStore::new()))
    } else {
        info!("no document store configured – cold tier degrades to the warm store");
        None
    };

    // -- embeddings & context -----------------------------------------------

    let backend: Arc<dyn EmbeddingBackend> = if config.embeddings.use_local {
        Arc::new(LocalEmbedder::new(config.embeddings.local_model.clone()))
    } else {
        match (
            &config.embeddings.remote_api_url,
            std::env::var(&config.embeddings.remote_api_key_env).ok(),
        ) {
            (Some(url), Some(key)) => {
                Arc::new(RemoteEmbedder::new(key, url.clone(), "remote-embeddings", 1536))
            }
            _ => {
                warn!("remote embeddings not configured – using the local backend");
                Arc::new(LocalEmbedder::new(config.embeddings.local_model.clone()))
            }
        }
    };
    let embeddings = Arc::new(EmbeddingService::new(
        backend,
        config.embeddings.cache_capacity,
    ));
    info!(
        backend = embeddings.backend_name(),
        dimension = embeddings.dimension(),
        "embedding service ready"
    );

    let context = Arc::new(ContextBuilder::new(
        embeddings.clone(),
        documents.clone(),
        ContextConfig {
            similarity_threshold: config.embeddings.similarity_threshold(),
            ..ContextConfig::default()
        },
    ));

    // -- components ---------------------------------------------------------

    let metrics = Arc::new(MetricsCollector::with_defaults());
    let memory = Arc::new(TieredMemoryManager::new(
        kv.clone(),
        Arc::new(PgWarmStore::new(db.clone())),
        documents.clone(),
        embeddings,
        config.memory.clone(),
    ));
    let protocol = Arc::new(ProtocolManager::new(
        Arc::new(PgProtocolStore::new(db.clone())),
        config.protocol.clone(),
    ));
    let reviews: Arc<dyn gr_review::ReviewStore> = Arc::new(PgReviewStore::new(db.clone()));

    let settings = match &config.rate_limits.config_path {
        Some(path) => SettingsWatcher::watching(path),
        None => SettingsWatcher::from_defaults(),
    };
    let limiter = Arc::new(EnhancedRateLimiter::new(kv.clone(), settings));
    let monitor = Arc::new(RateLimitMonitor::new(kv.clone()));

    let bus = EventBus::new();
    let delivery = DeliveryWorker::new(
        reviews.clone(),
        Arc::new(LogTransport),
        Some(memory.clone()),
        metrics.clone(),
        Duration::from_millis(config.pipeline.bubble_delay_ms),
    );
    let _delivery_loop = delivery.clone().run(bus.subscribe());

    // Until a chat-platform adapter and real providers are attached, the
    // echo generator keeps the full loop exercisable end to end.
    warn!("no AI provider configured – using the built-in echo generator");
    let orchestrator = Arc::new(Orchestrator::new(
        protocol.clone(),
        context,
        Arc::new(EchoGenerator),
        Arc::new(SentenceSplitRefiner::default()),
        reviews.clone(),
        limiter.clone(),
        metrics.clone(),
        delivery.clone(),
        config.pipeline.clone(),
        RetryPolicy::default(),
    ));
    orchestrator.recover().await.context("startup recovery")?;

    // -- background tasks ---------------------------------------------------

    let _cleanup = protocol.spawn_cleanup_task();
    let _monitor_loop = monitor
        .clone()
        .spawn(Duration::from_secs(config.rate_limits.monitor_interval_secs));
    let _consolidation = spawn_consolidation_task(memory.clone());

    // -- http surface -------------------------------------------------------

    let state = Arc::new(ApiState {
        reviews,
        protocol,
        limiter,
        monitor,
        kv,
        db: Some(db),
        documents,
        bus,
        pipeline: Some(orchestrator.clone()),
        verifier: Arc::new(StaticKeyVerifier::new(config.auth.dashboard_api_key.clone())),
        auth_service: Arc::new(StubAuthService),
        metrics,
        start_time: std::time::Instant::now(),
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr, "control surface listening");

    let shutdown_grace = Duration::from_secs(config.pipeline.shutdown_grace_secs);
    axum::serve(listener, api_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupt received");
        })
        .await
        .context("http server")?;

    orchestrator.shutdown(shutdown_grace).await;
    info!("goodbye");
    Ok(())
}

/// Hourly memory consolidation over recently active users. Never dies:
/// failures are logged and the next tick proceeds.
fn spawn_consolidation_task(memory: Arc<TieredMemoryManager>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let since = Utc::now() - ChronoDuration::days(7);
            let users = match memory.recent_user_ids(since).await {
                Ok(users) => users,
                Err(e) => {
                    error!(error = %e, "consolidation user listing failed");
                    continue;
                }
            };
            for user_id in users {
                match memory.consolidate(&user_id).await {
                    Ok(stats) if !stats.is_noop() => {
                        info!(user_id, ?stats, "scheduled consolidation")
                    }
                    Ok(_) => {}
                    Err(e) => warn!(user_id, error = %e, "consolidation failed"),
                }
            }
        }
    })
}
