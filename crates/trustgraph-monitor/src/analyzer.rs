//! One scoring cycle for one agent: window → factors → assessment → score →
//! snapshot → anomalies → alerts → events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::OwnedMutexGuard;

use trustgraph_core::alerts::{self, AlertParams};
use trustgraph_core::anomaly::{self, Anomaly, ThreatAssessment};
use trustgraph_core::factors::{self, FactorParams};
use trustgraph_core::{
    composer, Address, Alert, TrustError, TrustScoreFactors, TrustScoreSnapshot, BASELINE_DEPTH,
    DEFAULT_WINDOW_SIZE, INSUFFICIENT_DATA_CONFIDENCE, INSUFFICIENT_DATA_NARRATIVE,
    MIN_TRANSACTIONS_FOR_ANALYSIS, NEUTRAL_SCORE,
};

use crate::assessor::{AssessmentInput, QualitativeAssessor};
use crate::broadcast::{EventBroadcaster, TrustEvent};
use crate::store::{ActivityStore, CycleRecord, CycleWrite};

// ============================================================================
// Per-agent in-flight locks
// ============================================================================

/// At most one holder per agent. Shared by the analyzer and the pollers so a
/// scoring cycle never interleaves with a store batch for the same agent.
/// A slot is dropped once nobody holds or waits on it.
#[derive(Clone, Default)]
pub struct AgentLocks {
    slots: Arc<Mutex<HashMap<Address, Arc<tokio::sync::Mutex<()>>>>>,
}

impl AgentLocks {
    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<Address, Arc<tokio::sync::Mutex<()>>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, agent: &Address) -> Arc<tokio::sync::Mutex<()>> {
        self.slots().entry(agent.clone()).or_default().clone()
    }

    fn guard(&self, agent: &Address, held: OwnedMutexGuard<()>) -> AgentGuard {
        AgentGuard { held: Some(held), agent: agent.clone(), locks: self.clone() }
    }

    pub async fn acquire(&self, agent: &Address) -> AgentGuard {
        let held = self.slot(agent).lock_owned().await;
        self.guard(agent, held)
    }

    /// `None` when another holder is active.
    pub fn try_acquire(&self, agent: &Address) -> Option<AgentGuard> {
        let held = self.slot(agent).try_lock_owned().ok()?;
        Some(self.guard(agent, held))
    }

    fn release(&self, agent: &Address) {
        let mut slots = self.slots();
        // The map's own reference is the only one left.
        if slots.get(agent).is_some_and(|m| Arc::strong_count(m) == 1) {
            slots.remove(agent);
        }
    }
}

/// Exclusive hold on one agent. Releasing the last hold frees the slot.
pub struct AgentGuard {
    held:  Option<OwnedMutexGuard<()>>,
    agent: Address,
    locks: AgentLocks,
}

impl Drop for AgentGuard {
    fn drop(&mut self) {
        drop(self.held.take());
        self.locks.release(&self.agent);
    }
}

// ============================================================================
// Configuration / outcome
// ============================================================================

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Most recent transactions fed to the factor calculator.
    pub window_size:      usize,
    pub min_transactions: usize,
    /// Prior snapshots averaged into the anomaly baseline.
    pub baseline_depth:   usize,
    pub factors:          FactorParams,
    pub alerts:           AlertParams,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            window_size:      DEFAULT_WINDOW_SIZE,
            min_transactions: MIN_TRANSACTIONS_FOR_ANALYSIS,
            baseline_depth:   BASELINE_DEPTH,
            factors:          FactorParams::default(),
            alerts:           AlertParams::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AnalysisOutcome {
    /// A snapshot was persisted.
    Scored {
        snapshot:            TrustScoreSnapshot,
        previous_score:      Option<f64>,
        threat:              ThreatAssessment,
        anomalies:           Vec<Anomaly>,
        alerts:              Vec<Alert>,
        /// Candidate alerts dropped because the rule was already open.
        suppressed:          usize,
        assessment_fallback: bool,
    },
    /// Too little history. Nothing was persisted.
    Insufficient {
        agent:       Address,
        trust_score: f64,
        factors:     TrustScoreFactors,
        narrative:   &'static str,
        confidence:  f64,
        available:   usize,
        required:    usize,
    },
}

// ============================================================================
// TrustAnalyzer
// ============================================================================

pub struct TrustAnalyzer {
    store:    ActivityStore,
    assessor: QualitativeAssessor,
    events:   EventBroadcaster,
    locks:    AgentLocks,
    config:   AnalyzerConfig,
}

impl TrustAnalyzer {
    pub fn new(
        store: ActivityStore,
        assessor: QualitativeAssessor,
        events: EventBroadcaster,
        config: AnalyzerConfig,
    ) -> Self {
        Self { store, assessor, events, locks: AgentLocks::default(), config }
    }

    pub fn locks(&self) -> &AgentLocks {
        &self.locks
    }

    /// Run a cycle, waiting for any cycle already in flight for this agent.
    pub async fn analyze_agent(&self, address: &Address) -> Result<AnalysisOutcome, TrustError> {
        let _guard = self.locks.acquire(address).await;
        self.run_cycle(address).await
    }

    /// Run a cycle unless one is already in flight; `None` when skipped.
    pub async fn try_analyze_agent(&self, address: &Address) -> Option<Result<AnalysisOutcome, TrustError>> {
        let _guard = self.locks.try_acquire(address)?;
        Some(self.run_cycle(address).await)
    }

    async fn run_cycle(&self, address: &Address) -> Result<AnalysisOutcome, TrustError> {
        let agent = self
            .store
            .get_agent(address)?
            .ok_or_else(|| TrustError::validation(format!("unknown agent {address}")))?;
        let window = self.store.recent_transactions(address, self.config.window_size)?;

        let reading = factors::compute(&window, &self.config.factors);
        let required = self.config.min_transactions.max(1);
        let shortfall = match factors::require_minimum(window.len(), required) {
            Err(TrustError::InsufficientData { available, required }) => Some((available, required)),
            _ if !reading.has_signal() => Some((0, required)),
            _ => None,
        };
        if let Some((available, required)) = shortfall {
            tracing::debug!(agent = %address, available, required, "Not enough history to score");
            return Ok(AnalysisOutcome::Insufficient {
                agent: address.clone(),
                trust_score: NEUTRAL_SCORE,
                factors: TrustScoreFactors::NEUTRAL,
                narrative: INSUFFICIENT_DATA_NARRATIVE,
                confidence: INSUFFICIENT_DATA_CONFIDENCE,
                available,
                required,
            });
        }

        let baseline = self.store.recent_snapshots(address, self.config.baseline_depth)?;
        let open = self.store.open_alerts(address)?;

        let assessment = self
            .assessor
            .assess(&AssessmentInput {
                agent:       &agent,
                recent:      &window,
                factors:     &reading.factors,
                open_alerts: open.len(),
            })
            .await;

        let score = composer::compose(&reading.factors, assessment.risk_level);
        let threat = anomaly::classify(score, &reading.factors);
        let previous_score = baseline.first().map(|s| s.score);

        let history: Vec<TrustScoreFactors> = baseline.iter().map(|s| s.factors).collect();
        let anomalies = anomaly::detect(&reading.factors, &history);
        let drafts = alerts::evaluate(score, &reading.factors, &anomalies, &self.config.alerts);
        let candidates = drafts.len();
        let drafts = alerts::retain_new(drafts, &open);
        let suppressed = candidates - drafts.len();
        if suppressed > 0 {
            tracing::debug!(agent = %address, suppressed, "Alert rules already open, duplicates dropped");
        }

        let fresh: Vec<String> = window.iter().filter(|t| !t.analyzed).map(|t| t.hash.clone()).collect();
        let CycleRecord { snapshot, alerts: raised } = self.store.commit_cycle(
            address,
            &CycleWrite {
                score,
                factors: &reading.factors,
                narrative: &assessment.narrative,
                confidence: assessment.confidence,
                analyzed: &fresh,
                alerts: &drafts,
            },
        )?;

        // Only committed state is announced.
        self.events
            .publish(TrustEvent::score_update(address, &agent.name, &snapshot, previous_score, threat));
        for alert in &raised {
            self.events.publish(TrustEvent::alert(address, alert));
        }

        tracing::info!(
            agent = %address,
            score,
            previous = ?previous_score,
            threat = %threat.level,
            alerts = raised.len(),
            suppressed,
            fallback = assessment.fallback,
            "Scored agent",
        );

        Ok(AnalysisOutcome::Scored {
            snapshot,
            previous_score,
            threat,
            anomalies,
            alerts: raised,
            suppressed,
            assessment_fallback: assessment.fallback,
        })
    }
}
