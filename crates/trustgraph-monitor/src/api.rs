//! REST + WebSocket control surface.
//!
//! Read-only:
//!   GET  /health
//!   GET  /stats
//!   GET  /agents?status=&limit=
//!   GET  /agents/{address}
//!   GET  /agents/{address}/transactions?limit=
//!   GET  /agents/{address}/trust-scores?limit=
//!   GET  /transactions/{hash}
//!   GET  /alerts?agent=&unresolved=&limit=
//!   GET  /ws/events?agent=          (live event stream)
//!
//! Mutating (Bearer secret when configured):
//!   POST /agents
//!   PUT  /agents/{address}/status
//!   POST /alerts/{id}/resolve
//!   POST /monitor/start, /monitor/stop
//!   POST /analyze
//!   POST /ingest/webhook            (Moralis Streams delivery)

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use trustgraph_core::types::parse_tx_hash;
use trustgraph_core::{Address, Agent, AgentStatus, Transaction, TrustError};
use trustgraph_ledger::{chain, normalize};

use crate::analyzer::TrustAnalyzer;
use crate::broadcast::{EventBroadcaster, Subscription, Topic, TrustEvent};
use crate::scheduler::{record_activity, MonitorScheduler};
use crate::store::{ActivityStore, AlertFilter, StoreStats};

// ============================================================================
// App state
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    pub store:      ActivityStore,
    pub analyzer:   Arc<TrustAnalyzer>,
    pub scheduler:  MonitorScheduler,
    pub events:     EventBroadcaster,
    /// Shared secret for mutating routes.
    /// None = unauthenticated (dev/local only).
    pub api_secret: Option<String>,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub struct ApiError {
    status:  StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    fn not_found(what: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("{what} not found"))
    }
}

impl From<TrustError> for ApiError {
    fn from(e: TrustError) -> Self {
        let status = match &e {
            TrustError::Validation(_) => StatusCode::BAD_REQUEST,
            TrustError::InsufficientData { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            TrustError::Persistence(_) => StatusCode::SERVICE_UNAVAILABLE,
            TrustError::DataSource(_) => StatusCode::BAD_GATEWAY,
        };
        if status.is_server_error() {
            tracing::warn!("Request failed: {e}");
        }
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Auth
// ============================================================================

fn ct_eq(a: &str, b: &str) -> bool {
    // No early return on length mismatch.
    let a = a.as_bytes();
    let b = b.as_bytes();
    let len = a.len().max(b.len());
    let mut diff: u8 = (a.len() != b.len()) as u8;
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= x ^ y;
    }
    diff == 0
}

fn authorize(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let Some(ref secret) = state.api_secret else {
        return Ok(());
    };
    let expected = format!("Bearer {secret}");
    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if ct_eq(provided, &expected) {
        Ok(())
    } else {
        Err(ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized"))
    }
}

fn require_agent(state: &AppState, address: &Address) -> ApiResult<Agent> {
    state.store.get_agent(address)?.ok_or_else(|| ApiError::not_found("agent"))
}

fn default_limit() -> usize { 50 }
fn default_score_limit() -> usize { 20 }
fn default_true() -> bool { true }

// ============================================================================
// Health / stats
// ============================================================================

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Serialize)]
struct StatsView {
    #[serde(flatten)]
    store:            StoreStats,
    monitored_agents: usize,
    live_subscribers: usize,
    agent_topics:     usize,
}

pub async fn get_stats(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(StatsView {
        store:            state.store.stats()?,
        monitored_agents: state.scheduler.monitored().len(),
        live_subscribers: state.events.subscriber_count(&Topic::Global),
        agent_topics:     state.events.topic_count(),
    }))
}

// ============================================================================
// Agents
// ============================================================================

#[derive(Deserialize)]
pub struct AgentsParams {
    status: Option<String>,
    #[serde(default = "default_limit")]
    limit:  usize,
}

pub async fn list_agents(
    State(state): State<AppState>,
    Query(params): Query<AgentsParams>,
) -> ApiResult<impl IntoResponse> {
    let status = params.status.as_deref().map(str::parse::<AgentStatus>).transpose()?;
    let mut agents = state.store.list_agents(status)?;
    agents.truncate(params.limit.min(200));
    Ok(Json(json!({ "count": agents.len(), "agents": agents })))
}

#[derive(Deserialize)]
pub struct RegisterRequest {
    address:  String,
    name:     String,
    #[serde(default, alias = "type")]
    category: Option<String>,
    #[serde(default, alias = "chainId")]
    chain_id: Option<u64>,
    /// Start polling immediately.
    #[serde(default = "default_true")]
    monitor:  bool,
}

pub async fn register_agent(
    State(state): State<AppState>,
    headers:      HeaderMap,
    Json(req):    Json<RegisterRequest>,
) -> ApiResult<Response> {
    authorize(&state, &headers)?;
    let address = Address::parse(&req.address)?;
    let name = req.name.trim();
    if name.is_empty() {
        return Err(TrustError::validation("name must not be empty").into());
    }
    let chain_id = req.chain_id.unwrap_or(chain::ETHEREUM);
    chain::chain_name(chain_id).map_err(TrustError::from)?;
    let category = req.category.as_deref().map(str::trim).filter(|c| !c.is_empty()).unwrap_or("unknown");

    let (agent, created) = state.store.register_agent(&address, name, category)?;
    if !created {
        return Err(ApiError::new(StatusCode::CONFLICT, "agent already registered"));
    }
    tracing::info!(agent = %address, name, category, "Registered agent");

    let monitoring = req.monitor && state.scheduler.start_monitoring(&address, chain_id)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "agent": agent, "monitoring": monitoring, "chain_id": chain_id })),
    )
        .into_response())
}

pub async fn get_agent(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let address = Address::parse(&address)?;
    let agent = require_agent(&state, &address)?;
    let latest = state.store.latest_snapshot(&address)?;
    let open_alerts = state.store.open_alerts(&address)?.len();
    let transactions = state.store.transaction_count(&address)?;
    let chain_id = state
        .scheduler
        .monitored()
        .into_iter()
        .find(|(a, _)| *a == address)
        .map(|(_, c)| c);
    Ok(Json(json!({
        "agent": agent,
        "latest_score": latest,
        "transactions": transactions,
        "open_alerts": open_alerts,
        "monitoring": chain_id.is_some(),
        "chain_id": chain_id,
    })))
}

#[derive(Deserialize)]
pub struct StatusRequest {
    status: String,
}

pub async fn update_status(
    State(state): State<AppState>,
    headers:      HeaderMap,
    Path(address): Path<String>,
    Json(req):    Json<StatusRequest>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers)?;
    let address = Address::parse(&address)?;
    let status: AgentStatus = req.status.parse()?;
    let agent = state
        .store
        .set_status(&address, status)?
        .ok_or_else(|| ApiError::not_found("agent"))?;
    state.events.publish(TrustEvent::agent_status(&address, &agent));
    tracing::info!(agent = %address, %status, "Agent status changed");
    Ok(Json(agent))
}

#[derive(Deserialize)]
pub struct LimitParams {
    limit: Option<usize>,
}

pub async fn agent_transactions(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(params): Query<LimitParams>,
) -> ApiResult<impl IntoResponse> {
    let address = Address::parse(&address)?;
    require_agent(&state, &address)?;
    let limit = params.limit.unwrap_or_else(default_limit).min(500);
    let txs = state.store.recent_transactions(&address, limit)?;
    Ok(Json(json!({ "agent": address, "count": txs.len(), "transactions": txs })))
}

pub async fn agent_trust_scores(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(params): Query<LimitParams>,
) -> ApiResult<impl IntoResponse> {
    let address = Address::parse(&address)?;
    require_agent(&state, &address)?;
    let limit = params.limit.unwrap_or_else(default_score_limit).min(200);
    let scores = state.store.recent_snapshots(&address, limit)?;
    Ok(Json(json!({ "agent": address, "count": scores.len(), "trust_scores": scores })))
}

pub async fn get_transaction(
    State(state): State<AppState>,
    Path(hash):   Path<String>,
) -> ApiResult<impl IntoResponse> {
    let hash = parse_tx_hash(&hash)?;
    let tx = state.store.get_transaction(&hash)?.ok_or_else(|| ApiError::not_found("transaction"))?;
    Ok(Json(tx))
}

// ============================================================================
// Alerts
// ============================================================================

#[derive(Deserialize)]
pub struct AlertsParams {
    agent:      Option<String>,
    #[serde(default)]
    unresolved: bool,
    #[serde(default = "default_limit")]
    limit:      usize,
}

pub async fn list_alerts(
    State(state): State<AppState>,
    Query(params): Query<AlertsParams>,
) -> ApiResult<impl IntoResponse> {
    let filter = AlertFilter {
        agent:           params.agent.as_deref().map(Address::parse).transpose()?,
        unresolved_only: params.unresolved,
        limit:           params.limit.min(500),
    };
    let alerts = state.store.alerts(&filter)?;
    Ok(Json(json!({ "count": alerts.len(), "alerts": alerts })))
}

pub async fn resolve_alert(
    State(state): State<AppState>,
    headers:      HeaderMap,
    Path(id):     Path<i64>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers)?;
    let alert = state.store.resolve_alert(id)?.ok_or_else(|| ApiError::not_found("alert"))?;
    Ok(Json(alert))
}

// ============================================================================
// Monitoring / analysis
// ============================================================================

#[derive(Deserialize)]
pub struct MonitorRequest {
    #[serde(alias = "agentAddress")]
    agent_address: String,
    #[serde(default, alias = "chainId")]
    chain_id:      Option<u64>,
}

pub async fn monitor_start(
    State(state): State<AppState>,
    headers:      HeaderMap,
    Json(req):    Json<MonitorRequest>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers)?;
    let address = Address::parse(&req.agent_address)?;
    require_agent(&state, &address)?;
    let chain_id = req.chain_id.unwrap_or(chain::ETHEREUM);
    let started = state.scheduler.start_monitoring(&address, chain_id)?;
    Ok(Json(json!({
        "agent": address,
        "chain_id": chain_id,
        "started": started,
        "monitoring": true,
    })))
}

pub async fn monitor_stop(
    State(state): State<AppState>,
    headers:      HeaderMap,
    Json(req):    Json<MonitorRequest>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers)?;
    let address = Address::parse(&req.agent_address)?;
    let stopped = state.scheduler.stop_monitoring(&address).await;
    Ok(Json(json!({
        "agent": address,
        "stopped": stopped,
        "monitoring": state.scheduler.is_monitoring(&address),
    })))
}

#[derive(Deserialize)]
pub struct AnalyzeRequest {
    #[serde(alias = "agentAddress")]
    agent_address: String,
}

pub async fn analyze(
    State(state): State<AppState>,
    headers:      HeaderMap,
    Json(req):    Json<AnalyzeRequest>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers)?;
    let address = Address::parse(&req.agent_address)?;
    require_agent(&state, &address)?;
    let outcome = state.analyzer.analyze_agent(&address).await?;
    Ok(Json(outcome))
}

// ============================================================================
// Webhook ingestion
// ============================================================================

/// Attributes each record to the registered agent on its `from` side, else
/// its `to` side. Idempotent by transaction hash.
pub async fn ingest_webhook(
    State(state): State<AppState>,
    headers:      HeaderMap,
    Json(body):   Json<Value>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers)?;
    let known: HashSet<Address> = state
        .store
        .list_agents(None)?
        .into_iter()
        .filter_map(|a| Address::parse(&a.address).ok())
        .collect();

    let batch = normalize::moralis_stream(body, |from, to| {
        if known.contains(from) {
            Some(from.clone())
        } else {
            to.filter(|t| known.contains(*t)).cloned()
        }
    })
    .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;

    // Same per-agent serialisation as the pollers.
    let mut by_agent: BTreeMap<&str, Vec<Transaction>> = BTreeMap::new();
    for tx in &batch.transactions {
        by_agent.entry(tx.agent.as_str()).or_default().push(tx.clone());
    }
    let mut stored = 0;
    for (agent, txs) in by_agent {
        let agent = Address::parse(agent)?;
        let _guard = state.analyzer.locks().acquire(&agent).await;
        stored += record_activity(&state.store, &state.events, &txs)?.len();
    }

    tracing::debug!(
        chain_id = batch.chain_id,
        stored,
        rejected = batch.rejected,
        unmatched = batch.unmatched,
        "Webhook delivery",
    );
    Ok(Json(json!({
        "chain_id": batch.chain_id,
        "confirmed": batch.confirmed,
        "stored": stored,
        "duplicates": batch.transactions.len() - stored,
        "rejected": batch.rejected,
        "unmatched": batch.unmatched,
    })))
}

// ============================================================================
// WebSocket events
// ============================================================================

#[derive(Deserialize)]
pub struct EventsParams {
    agent: Option<String>,
}

pub async fn ws_events(
    ws:            WebSocketUpgrade,
    State(state):  State<AppState>,
    Query(params): Query<EventsParams>,
) -> ApiResult<Response> {
    let topic = match params.agent.as_deref() {
        Some(raw) => Topic::Agent(Address::parse(raw)?),
        None => Topic::Global,
    };
    let sub = state.events.subscribe(topic);
    Ok(ws.on_upgrade(|socket| ws_events_task(socket, sub)))
}

async fn ws_events_task(mut socket: WebSocket, mut sub: Subscription) {
    loop {
        tokio::select! {
            event = sub.recv() => {
                let Some(event) = event else { break };
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("WS events serialize error: {e}"),
                }
            }
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    sub.unsubscribe();
}
