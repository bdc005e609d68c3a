//! Baseline anomaly detection and threat classification.
//!
//! Current factors are compared against the arithmetic mean of the agent's
//! own prior factor sets. Thresholds are fixed points, not learned, so the
//! same inputs always yield the same anomaly list.

use serde::Serialize;

use crate::factors::TrustScoreFactors;
use crate::types::Severity;

// ============================================================================
// Thresholds
// ============================================================================

/// Success-rate drop (points below baseline) that counts as anomalous.
pub const SUCCESS_RATE_DROP: f64 = 20.0;
/// Absolute volume deviation from baseline.
pub const VOLUME_DEVIATION: f64 = 30.0;
/// Absolute consistency floor (not baseline-relative).
pub const CONSISTENCY_FLOOR: f64 = 40.0;
/// Risk-level rise above baseline.
pub const RISK_RISE: f64 = 25.0;
/// Gas-efficiency drop below baseline.
pub const GAS_EFFICIENCY_DROP: f64 = 20.0;

// ============================================================================
// Output
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    SuccessRateDrop,
    VolumeAnomaly,
    BehavioralAnomaly,
    RiskIncrease,
    GasInefficiency,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::SuccessRateDrop   => "success_rate_drop",
            AnomalyKind::VolumeAnomaly     => "volume_anomaly",
            AnomalyKind::BehavioralAnomaly => "behavioral_anomaly",
            AnomalyKind::RiskIncrease      => "risk_increase",
            AnomalyKind::GasInefficiency   => "gas_inefficiency",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Anomaly {
    pub kind:       AnomalyKind,
    pub severity:   Severity,
    pub message:    String,
    pub confidence: f64,
    /// Current value of the factor that tripped.
    pub current:    f64,
    /// Baseline it was compared with (the floor for absolute checks).
    pub baseline:   f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThreatAssessment {
    pub level:       Severity,
    pub description: &'static str,
}

// ============================================================================
// Detection
// ============================================================================

/// Compare `current` against the mean of `history`.
///
/// Returns nothing when there is no history to compare with.
pub fn detect(current: &TrustScoreFactors, history: &[TrustScoreFactors]) -> Vec<Anomaly> {
    let Some(avg) = TrustScoreFactors::mean(history) else {
        return Vec::new();
    };
    let mut anomalies = Vec::new();

    if current.success_rate < avg.success_rate - SUCCESS_RATE_DROP {
        anomalies.push(Anomaly {
            kind:       AnomalyKind::SuccessRateDrop,
            severity:   Severity::High,
            message:    format!(
                "Success rate dropped significantly: {:.0}% (avg: {:.0}%)",
                current.success_rate, avg.success_rate,
            ),
            confidence: 0.85,
            current:    current.success_rate,
            baseline:   avg.success_rate,
        });
    }

    if (current.transaction_volume - avg.transaction_volume).abs() > VOLUME_DEVIATION {
        anomalies.push(Anomaly {
            kind:       AnomalyKind::VolumeAnomaly,
            severity:   Severity::Medium,
            message:    format!(
                "Unusual transaction volume detected: {:.0} (avg: {:.0})",
                current.transaction_volume, avg.transaction_volume,
            ),
            confidence: 0.75,
            current:    current.transaction_volume,
            baseline:   avg.transaction_volume,
        });
    }

    if current.behavioral_consistency < CONSISTENCY_FLOOR {
        anomalies.push(Anomaly {
            kind:       AnomalyKind::BehavioralAnomaly,
            severity:   Severity::Medium,
            message:    "Highly inconsistent behavior pattern detected".to_string(),
            confidence: 0.80,
            current:    current.behavioral_consistency,
            baseline:   CONSISTENCY_FLOOR,
        });
    }

    if current.risk_level > avg.risk_level + RISK_RISE {
        anomalies.push(Anomaly {
            kind:       AnomalyKind::RiskIncrease,
            severity:   Severity::High,
            message:    format!(
                "Risk level increased significantly: {:.0} (avg: {:.0})",
                current.risk_level, avg.risk_level,
            ),
            confidence: 0.90,
            current:    current.risk_level,
            baseline:   avg.risk_level,
        });
    }

    if current.gas_efficiency < avg.gas_efficiency - GAS_EFFICIENCY_DROP {
        anomalies.push(Anomaly {
            kind:       AnomalyKind::GasInefficiency,
            severity:   Severity::Low,
            message:    format!(
                "Gas efficiency decreased: {:.0}% (avg: {:.0}%)",
                current.gas_efficiency, avg.gas_efficiency,
            ),
            confidence: 0.70,
            current:    current.gas_efficiency,
            baseline:   avg.gas_efficiency,
        });
    }

    anomalies
}

// ============================================================================
// Classification
// ============================================================================

/// Step-function threat level from a score and its factors.
pub fn classify(score: f64, factors: &TrustScoreFactors) -> ThreatAssessment {
    if score < 30.0 || factors.risk_level > 70.0 {
        return ThreatAssessment {
            level:       Severity::Critical,
            description: "Immediate attention required. High risk of malicious activity.",
        };
    }
    if score < 50.0 || factors.risk_level > 50.0 || factors.success_rate < 60.0 {
        return ThreatAssessment {
            level:       Severity::High,
            description: "Elevated risk detected. Close monitoring recommended.",
        };
    }
    if score < 70.0 || factors.behavioral_consistency < 50.0 {
        return ThreatAssessment {
            level:       Severity::Medium,
            description: "Moderate risk. Regular monitoring advised.",
        };
    }
    ThreatAssessment {
        level:       Severity::Low,
        description: "Low risk. Agent behavior appears normal.",
    }
}
