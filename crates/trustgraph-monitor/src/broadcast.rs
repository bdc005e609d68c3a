//! Topic-based fan-out of trust events to live subscribers.
//!
//! One bounded `broadcast` channel backs the global topic; agent topics are
//! created on first subscribe and pruned when their last subscriber leaves,
//! with a sweep of listener-less topics on every agent subscribe.
//! Publishing never blocks: a subscriber that falls more than the channel
//! capacity behind loses its oldest events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;

use trustgraph_core::anomaly::ThreatAssessment;
use trustgraph_core::{
    Address, Agent, AgentStatus, Alert, AlertType, Severity, Transaction, TrustScoreFactors,
    TrustScoreSnapshot, TxStatus,
};

use crate::assessor::format_tokens;

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrustEvent {
    TrustScoreUpdate {
        agent:          Address,
        agent_name:     String,
        trust_score:    f64,
        previous_score: Option<f64>,
        factors:        TrustScoreFactors,
        confidence:     f64,
        threat:         ThreatAssessment,
        timestamp:      u64,
    },
    NewTransaction {
        agent:     Address,
        hash:      String,
        from:      String,
        to:        Option<String>,
        /// Whole tokens, exact decimal.
        value:     String,
        status:    TxStatus,
        chain_id:  u64,
        timestamp: u64,
    },
    Alert {
        agent:      Address,
        alert_id:   i64,
        alert_type: AlertType,
        severity:   Severity,
        rule:       String,
        message:    String,
        details:    serde_json::Value,
        timestamp:  u64,
    },
    AgentStatus {
        agent:       Address,
        status:      AgentStatus,
        trust_score: f64,
        timestamp:   u64,
    },
}

impl TrustEvent {
    pub fn agent(&self) -> &Address {
        match self {
            TrustEvent::TrustScoreUpdate { agent, .. }
            | TrustEvent::NewTransaction { agent, .. }
            | TrustEvent::Alert { agent, .. }
            | TrustEvent::AgentStatus { agent, .. } => agent,
        }
    }

    pub fn score_update(
        agent: &Address,
        agent_name: &str,
        snapshot: &TrustScoreSnapshot,
        previous_score: Option<f64>,
        threat: ThreatAssessment,
    ) -> Self {
        TrustEvent::TrustScoreUpdate {
            agent: agent.clone(),
            agent_name: agent_name.to_string(),
            trust_score: snapshot.score,
            previous_score,
            factors: snapshot.factors,
            confidence: snapshot.confidence,
            threat,
            timestamp: snapshot.timestamp,
        }
    }

    pub fn new_transaction(agent: &Address, tx: &Transaction) -> Self {
        TrustEvent::NewTransaction {
            agent:     agent.clone(),
            hash:      tx.hash.clone(),
            from:      tx.from.clone(),
            to:        tx.to.clone(),
            value:     format_tokens(tx.value),
            status:    tx.status,
            chain_id:  tx.chain_id,
            timestamp: tx.timestamp,
        }
    }

    pub fn alert(agent: &Address, alert: &Alert) -> Self {
        TrustEvent::Alert {
            agent:      agent.clone(),
            alert_id:   alert.id,
            alert_type: alert.alert_type,
            severity:   alert.severity,
            rule:       alert.rule.clone(),
            message:    alert.message.clone(),
            details:    alert.details.clone(),
            timestamp:  alert.created_at,
        }
    }

    pub fn agent_status(agent: &Address, record: &Agent) -> Self {
        TrustEvent::AgentStatus {
            agent:       agent.clone(),
            status:      record.status,
            trust_score: record.trust_score,
            timestamp:   record.updated_at,
        }
    }
}

// ============================================================================
// Broadcaster
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Global,
    Agent(Address),
}

struct Inner {
    capacity: usize,
    global:   broadcast::Sender<TrustEvent>,
    agents:   Mutex<HashMap<Address, broadcast::Sender<TrustEvent>>>,
}

#[derive(Clone)]
pub struct EventBroadcaster {
    inner: Arc<Inner>,
}

impl EventBroadcaster {
    /// `capacity` bounds each topic's queue.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (global, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(Inner { capacity, global, agents: Mutex::new(HashMap::new()) }),
        }
    }

    fn agents(&self) -> std::sync::MutexGuard<'_, HashMap<Address, broadcast::Sender<TrustEvent>>> {
        self.inner.agents.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let rx = match &topic {
            Topic::Global => self.inner.global.subscribe(),
            Topic::Agent(address) => {
                let mut agents = self.agents();
                agents.retain(|_, tx| tx.receiver_count() > 0);
                agents
                    .entry(address.clone())
                    .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
                    .subscribe()
            }
        };
        Subscription { topic, rx: Some(rx), owner: self.clone() }
    }

    /// Deliver to the event's agent topic and to the global topic. Returns
    /// the number of receivers reached.
    pub fn publish(&self, event: TrustEvent) -> usize {
        let mut delivered = 0;
        if let Some(tx) = self.agents().get(event.agent()) {
            delivered += tx.send(event.clone()).unwrap_or(0);
        }
        delivered + self.inner.global.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        match topic {
            Topic::Global => self.inner.global.receiver_count(),
            Topic::Agent(address) => self.agents().get(address).map_or(0, |tx| tx.receiver_count()),
        }
    }

    /// Live agent topics.
    pub fn topic_count(&self) -> usize {
        self.agents().len()
    }

    /// Called after the departing receiver is dropped.
    fn release(&self, topic: &Topic) {
        let Topic::Agent(address) = topic else { return };
        let mut agents = self.agents();
        if agents.get(address).is_some_and(|tx| tx.receiver_count() == 0) {
            agents.remove(address);
        }
    }
}

pub struct Subscription {
    topic: Topic,
    /// Always `Some` until drop.
    rx:    Option<broadcast::Receiver<TrustEvent>>,
    owner: EventBroadcaster,
}

impl Subscription {
    /// Wait for the next event, skipping any lost to lag. The subscription
    /// keeps its topic open, so this only yields `None` after drop began.
    pub async fn recv(&mut self) -> Option<TrustEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(topic = ?self.topic, skipped = n, "Event subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<TrustEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        drop(self.rx.take());
        self.owner.release(&self.topic);
    }
}
