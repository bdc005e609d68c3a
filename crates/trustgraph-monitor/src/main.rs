mod analyzer;
mod api;
mod assessor;
mod broadcast;
mod config;
mod scheduler;
mod store;

use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};
use clap::Parser;

use analyzer::TrustAnalyzer;
use api::AppState;
use assessor::{ChatCompletionClient, DisabledCompletion, QualitativeAssessor, TextCompletion};
use broadcast::EventBroadcaster;
use config::Config;
use scheduler::MonitorScheduler;
use store::ActivityStore;
use trustgraph_ledger::{LedgerClient, LedgerSource};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trustgraph_monitor=info,trustgraph_ledger=info".parse().unwrap()),
        )
        .init();

    let config = Config::parse();

    if config.api_secret.is_none() {
        tracing::warn!(
            "No --api-secret set. Mutating routes are unauthenticated. \
             Set TRUSTGRAPH_API_SECRET in production."
        );
    }

    let store = match config.db_path {
        Some(ref path) => ActivityStore::with_db(path)?,
        None => {
            tracing::warn!(
                "No --db-path set. Monitoring data is in-memory only and \
                 will be lost on restart. Set TRUSTGRAPH_DB_PATH in production."
            );
            ActivityStore::in_memory()?
        }
    };

    let ledger: Arc<dyn LedgerSource> = Arc::new(LedgerClient::new(
        config.ledger_provider,
        &config.ledger_url,
        config.ledger_api_key.clone(),
        config.ledger_timeout(),
    )?);
    if config.ledger_api_key.is_none() {
        tracing::warn!("No --ledger-api-key set. Upstream requests are sent unauthenticated.");
    }

    let completion: Arc<dyn TextCompletion> = match config.llm_api_key.clone() {
        Some(key) => {
            tracing::info!("Assessments use model {} at {}", config.llm_model, config.llm_url);
            Arc::new(ChatCompletionClient::new(&config.llm_url, key, config.llm_model.clone())?)
        }
        None => {
            tracing::warn!("No --llm-api-key set. Every assessment uses the fallback narrative.");
            Arc::new(DisabledCompletion)
        }
    };
    let assessor = QualitativeAssessor::new(completion, config.llm_timeout(), config.prompt_sample);

    let events = EventBroadcaster::new(config.event_queue);
    let analyzer = Arc::new(TrustAnalyzer::new(
        store.clone(),
        assessor,
        events.clone(),
        config.analyzer_config(),
    ));
    let scheduler = MonitorScheduler::new(
        store.clone(),
        ledger,
        analyzer.clone(),
        events.clone(),
        config.scheduler_config(),
    );

    for target in &config.monitor {
        let (_, created) = store.register_agent(&target.address, target.address.as_str(), "unknown")?;
        if created {
            tracing::info!(agent = %target.address, "Registered start-up agent");
        }
        scheduler.start_monitoring(&target.address, target.chain_id)?;
    }
    scheduler.start_sweep();

    let state = AppState {
        store,
        analyzer,
        scheduler: scheduler.clone(),
        events,
        api_secret: config.api_secret.clone(),
    };

    let app = Router::new()
        .route("/health",                         get(api::health))
        .route("/stats",                          get(api::get_stats))
        .route("/agents",                         get(api::list_agents).post(api::register_agent))
        .route("/agents/{address}",               get(api::get_agent))
        .route("/agents/{address}/status",        put(api::update_status))
        .route("/agents/{address}/transactions",  get(api::agent_transactions))
        .route("/agents/{address}/trust-scores",  get(api::agent_trust_scores))
        .route("/transactions/{hash}",            get(api::get_transaction))
        .route("/alerts",                         get(api::list_alerts))
        .route("/alerts/{id}/resolve",            post(api::resolve_alert))
        .route("/monitor/start",                  post(api::monitor_start))
        .route("/monitor/stop",                   post(api::monitor_stop))
        .route("/analyze",                        post(api::analyze))
        .route("/ingest/webhook",                 post(api::ingest_webhook))
        .route("/ws/events",                      get(api::ws_events))
        .with_state(state);

    tracing::info!("trustgraph-monitor listening on {}", config.listen);
    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Ctrl-C handler failed: {e}");
            }
            tracing::info!("Shutting down");
        })
        .await?;

    scheduler.shutdown().await;
    Ok(())
}
