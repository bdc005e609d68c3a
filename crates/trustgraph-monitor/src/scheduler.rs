//! Monitoring scheduler.
//!
//! Two tiers of periodic work:
//!   - one poll task per monitored agent, fetching ledger activity every
//!     `poll_interval` and storing first sightings;
//!   - one global sweep every `sweep_interval`, re-scoring each active agent
//!     that is due.
//!
//! Poll tasks never share state except through the store. Within one agent,
//! fetch → store → score is serialised by the analyzer's per-agent lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use trustgraph_core::{
    Address, AgentStatus, Transaction, TrustError, DEFAULT_POLL_INTERVAL_SECS,
    DEFAULT_SWEEP_INTERVAL_SECS, MIN_TRANSACTIONS_FOR_ANALYSIS,
};
use trustgraph_ledger::{chain, LedgerSource};

use crate::analyzer::TrustAnalyzer;
use crate::broadcast::{EventBroadcaster, TrustEvent};
use crate::store::{now_secs, ActivityStore};

/// Sweep decision for one agent.
///
/// Due when the agent has at least `min_transactions` and either has never
/// been scored, or its last score is at least `interval_secs` old and some
/// transaction is newer than it.
pub fn should_analyze(
    tx_count: usize,
    min_transactions: usize,
    last_score_ts: Option<u64>,
    latest_tx_ts: Option<u64>,
    now: u64,
    interval_secs: u64,
) -> bool {
    if tx_count < min_transactions {
        return false;
    }
    match last_score_ts {
        None => true,
        Some(scored) => {
            now.saturating_sub(scored) >= interval_secs && latest_tx_ts.is_some_and(|ts| ts > scored)
        }
    }
}

/// Store a fetched batch and announce each first sighting.
pub fn record_activity(
    store: &ActivityStore,
    events: &EventBroadcaster,
    txs: &[Transaction],
) -> Result<Vec<Transaction>, TrustError> {
    let fresh = store.insert_transactions(txs)?;
    for tx in &fresh {
        if let Ok(agent) = Address::parse(&tx.agent) {
            events.publish(TrustEvent::new_transaction(&agent, tx));
        }
    }
    Ok(fresh)
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval:    Duration,
    /// Also the minimum age of a score before it is recomputed.
    pub sweep_interval:   Duration,
    pub min_transactions: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval:    Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            sweep_interval:   Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            min_transactions: MIN_TRANSACTIONS_FOR_ANALYSIS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub considered:   usize,
    pub analyzed:     usize,
    pub not_due:      usize,
    pub skipped_busy: usize,
    pub failed:       usize,
}

// ============================================================================
// MonitorScheduler
// ============================================================================

struct Worker {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Worker {
    async fn halt(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!("Worker join error: {e}");
        }
    }
}

struct Inner {
    store:    ActivityStore,
    ledger:   Arc<dyn LedgerSource>,
    analyzer: Arc<TrustAnalyzer>,
    events:   EventBroadcaster,
    config:   SchedulerConfig,
    pollers:  Mutex<HashMap<Address, (u64, Worker)>>,
    sweep:    Mutex<Option<Worker>>,
}

#[derive(Clone)]
pub struct MonitorScheduler {
    inner: Arc<Inner>,
}

impl MonitorScheduler {
    pub fn new(
        store: ActivityStore,
        ledger: Arc<dyn LedgerSource>,
        analyzer: Arc<TrustAnalyzer>,
        events: EventBroadcaster,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                ledger,
                analyzer,
                events,
                config,
                pollers: Mutex::new(HashMap::new()),
                sweep: Mutex::new(None),
            }),
        }
    }

    fn pollers(&self) -> std::sync::MutexGuard<'_, HashMap<Address, (u64, Worker)>> {
        self.inner.pollers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start polling `address` on `chain_id`. Returns `false` when it was
    /// already being polled. The agent must be registered.
    pub fn start_monitoring(&self, address: &Address, chain_id: u64) -> Result<bool, TrustError> {
        chain::chain_name(chain_id)?;
        if self.inner.store.get_agent(address)?.is_none() {
            return Err(TrustError::validation(format!("unknown agent {address}")));
        }

        let mut pollers = self.pollers();
        if pollers.contains_key(address) {
            return Ok(false);
        }
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(poll_loop(self.inner.clone(), address.clone(), chain_id, stop_rx));
        pollers.insert(address.clone(), (chain_id, Worker { stop, task }));

        tracing::info!(agent = %address, chain_id, "Monitoring started");
        Ok(true)
    }

    /// Cancel the agent's poll task and wait for it to exit. Returns `false`
    /// when it was not being polled.
    pub async fn stop_monitoring(&self, address: &Address) -> bool {
        let worker = self.pollers().remove(address);
        match worker {
            Some((_, worker)) => {
                worker.halt().await;
                tracing::info!(agent = %address, "Monitoring stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_monitoring(&self, address: &Address) -> bool {
        self.pollers().contains_key(address)
    }

    /// Polled agents with their chain, sorted by address.
    pub fn monitored(&self) -> Vec<(Address, u64)> {
        let mut out: Vec<_> = self.pollers().iter().map(|(a, (c, _))| (a.clone(), *c)).collect();
        out.sort();
        out
    }

    /// Start the periodic sweep. Returns `false` when already running.
    pub fn start_sweep(&self) -> bool {
        let mut sweep = self.inner.sweep.lock().unwrap_or_else(|e| e.into_inner());
        if sweep.is_some() {
            return false;
        }
        let (stop, mut stop_rx) = watch::channel(false);
        let this = self.clone();
        let period = self.inner.config.sweep_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {}
                }
                let summary = this.run_sweep().await;
                tracing::debug!(?summary, "Sweep finished");
            }
        });
        *sweep = Some(Worker { stop, task });
        tracing::info!("Scoring sweep started (every {}s)", period.as_secs());
        true
    }

    /// Score every active agent that is due. Analyses run in parallel and
    /// are all joined before returning.
    pub async fn run_sweep(&self) -> SweepSummary {
        let mut summary = SweepSummary::default();
        let agents = match self.inner.store.list_agents(Some(AgentStatus::Active)) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!("Sweep could not list agents: {e}");
                return summary;
            }
        };

        let now = now_secs();
        let interval = self.inner.config.sweep_interval.as_secs();
        let mut set = JoinSet::new();

        for agent in agents {
            summary.considered += 1;
            let Ok(address) = Address::parse(&agent.address) else {
                summary.failed += 1;
                continue;
            };
            match self.is_due(&address, now, interval) {
                Ok(true) => {}
                Ok(false) => {
                    summary.not_due += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(agent = %address, "Sweep check failed: {e}");
                    summary.failed += 1;
                    continue;
                }
            }
            let analyzer = self.inner.analyzer.clone();
            set.spawn(async move {
                let result = analyzer.try_analyze_agent(&address).await;
                (address, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Some(Ok(_)))) => summary.analyzed += 1,
                Ok((address, None)) => {
                    tracing::debug!(agent = %address, "Analysis already in flight, skipped");
                    summary.skipped_busy += 1;
                }
                Ok((address, Some(Err(e)))) => {
                    tracing::warn!(agent = %address, retryable = e.is_retryable(), "Analysis failed: {e}");
                    summary.failed += 1;
                }
                Err(e) => {
                    tracing::error!("Analysis task panicked: {e}");
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    fn is_due(&self, address: &Address, now: u64, interval: u64) -> Result<bool, TrustError> {
        let store = &self.inner.store;
        let count = store.transaction_count(address)?;
        let last = store.latest_snapshot(address)?.map(|s| s.timestamp);
        let latest_tx = store.latest_transaction_ts(address)?;
        Ok(should_analyze(count, self.inner.config.min_transactions, last, latest_tx, now, interval))
    }

    /// Stop the sweep and every poll task, waiting for each to exit.
    pub async fn shutdown(&self) {
        let sweep = self.inner.sweep.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = sweep {
            worker.halt().await;
        }
        let pollers: Vec<_> = self.pollers().drain().collect();
        let count = pollers.len();
        for (_, (_, worker)) in pollers {
            worker.halt().await;
        }
        tracing::info!("Scheduler stopped ({count} pollers)");
    }
}

/// Cancellation lands only while waiting for the tick, the fetch or the
/// per-agent lock. The store batch after them runs to completion.
async fn poll_loop(inner: Arc<Inner>, address: Address, chain_id: u64, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(inner.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = ticker.tick() => {}
        }

        let fetched = tokio::select! {
            biased;
            _ = stop.changed() => break,
            r = inner.ledger.fetch_activity(&address, chain_id) => r,
        };
        let txs = match fetched {
            Ok(txs) => txs,
            Err(e) => {
                tracing::warn!(agent = %address, retryable = e.is_retryable(), "Ledger fetch failed: {e}");
                continue;
            }
        };

        let _guard = tokio::select! {
            biased;
            _ = stop.changed() => break,
            g = inner.analyzer.locks().acquire(&address) => g,
        };
        match record_activity(&inner.store, &inner.events, &txs) {
            Ok(fresh) if !fresh.is_empty() => {
                tracing::debug!(agent = %address, new = fresh.len(), "Stored new transactions");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(agent = %address, "Storing activity failed: {e}"),
        }
    }
    tracing::debug!(agent = %address, "Poller exited");
}
