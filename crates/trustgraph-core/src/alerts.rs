//! Alert evaluation for a completed scoring cycle.
//!
//! Two independent sources feed candidate alerts: fixed thresholds on the
//! score and factors, and anomalies from [`crate::anomaly::detect`]. Each
//! triggering condition yields exactly one [`AlertDraft`] tagged with the
//! rule that fired. Candidates whose rule already has an unresolved alert for
//! the agent are dropped by [`retain_new`].

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::anomaly::{Anomaly, AnomalyKind};
use crate::constants::CRITICAL_SCORE;
use crate::factors::TrustScoreFactors;
use crate::types::{Alert, AlertType, Severity};

pub const RULE_CRITICAL_SCORE: &str = "critical_score";
pub const RULE_LOW_SUCCESS_RATE: &str = "low_success_rate";
pub const RULE_HIGH_RISK_LEVEL: &str = "high_risk_level";
pub const RULE_INCONSISTENT_BEHAVIOR: &str = "inconsistent_behavior";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertParams {
    /// Scores strictly below this raise a critical alert.
    pub critical_score:   f64,
    pub min_success_rate: f64,
    pub max_risk_level:   f64,
    pub min_consistency:  f64,
}

impl Default for AlertParams {
    fn default() -> Self {
        Self {
            critical_score:   CRITICAL_SCORE,
            min_success_rate: 70.0,
            max_risk_level:   50.0,
            min_consistency:  50.0,
        }
    }
}

/// An alert not yet persisted (no id, no timestamps).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertDraft {
    pub alert_type: AlertType,
    pub severity:   Severity,
    pub rule:       String,
    pub message:    String,
    pub details:    serde_json::Value,
}

/// Produce one draft per triggering condition, thresholds first, then
/// anomalies in detection order.
pub fn evaluate(
    score: f64,
    factors: &TrustScoreFactors,
    anomalies: &[Anomaly],
    params: &AlertParams,
) -> Vec<AlertDraft> {
    let mut drafts = Vec::new();

    if score < params.critical_score {
        drafts.push(AlertDraft {
            alert_type: AlertType::Critical,
            severity:   Severity::Critical,
            rule:       RULE_CRITICAL_SCORE.to_string(),
            message:    format!("Trust score critically low: {score:.0}/100"),
            details:    json!({ "score": score, "threshold": params.critical_score }),
        });
    }

    if factors.success_rate < params.min_success_rate {
        drafts.push(AlertDraft {
            alert_type: AlertType::Risk,
            severity:   Severity::High,
            rule:       RULE_LOW_SUCCESS_RATE.to_string(),
            message:    format!("Low transaction success rate: {:.0}%", factors.success_rate),
            details:    json!({
                "success_rate": factors.success_rate,
                "threshold": params.min_success_rate,
            }),
        });
    }

    if factors.risk_level > params.max_risk_level {
        drafts.push(AlertDraft {
            alert_type: AlertType::Risk,
            severity:   Severity::High,
            rule:       RULE_HIGH_RISK_LEVEL.to_string(),
            message:    format!("High risk level detected: {:.0}/100", factors.risk_level),
            details:    json!({
                "risk_level": factors.risk_level,
                "threshold": params.max_risk_level,
            }),
        });
    }

    if factors.behavioral_consistency < params.min_consistency {
        drafts.push(AlertDraft {
            alert_type: AlertType::Anomaly,
            severity:   Severity::Medium,
            rule:       RULE_INCONSISTENT_BEHAVIOR.to_string(),
            message:    "Inconsistent transaction behavior detected".to_string(),
            details:    json!({
                "behavioral_consistency": factors.behavioral_consistency,
                "threshold": params.min_consistency,
            }),
        });
    }

    drafts.extend(anomalies.iter().map(from_anomaly));
    drafts
}

fn from_anomaly(anomaly: &Anomaly) -> AlertDraft {
    let alert_type = match anomaly.kind {
        AnomalyKind::RiskIncrease => AlertType::Suspicious,
        _ => AlertType::Anomaly,
    };
    AlertDraft {
        alert_type,
        severity: anomaly.severity,
        rule:     anomaly.kind.as_str().to_string(),
        message:  anomaly.message.clone(),
        details:  json!({
            "current": anomaly.current,
            "baseline": anomaly.baseline,
            "confidence": anomaly.confidence,
        }),
    }
}

/// Drop drafts whose rule already has an unresolved alert in `open`.
///
/// `open` must belong to the same agent as the drafts. Duplicate rules
/// within `drafts` itself cannot occur since each rule fires at most once.
pub fn retain_new(drafts: Vec<AlertDraft>, open: &[Alert]) -> Vec<AlertDraft> {
    drafts
        .into_iter()
        .filter(|d| !open.iter().any(|a| !a.resolved && a.rule == d.rule))
        .collect()
}
