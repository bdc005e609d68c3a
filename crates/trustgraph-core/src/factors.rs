//! Behavioural factor computation.
//!
//! Six sub-scores, each in [0, 100], derived from an agent's most recent
//! transaction window:
//!
//!   transaction_volume     : average value per tx vs. a reference size
//!   transaction_frequency  : txs per day vs. a reference rate
//!   gas_efficiency         : 100 − scaled average fee
//!   success_rate           : share of successful txs
//!   behavioral_consistency : 100 − scaled std-dev of tx value
//!   risk_level             : 2 × failure share (higher = worse)
//!
//! Aggregates are computed over sorted inputs and exact integer sums so the
//! result depends only on the multiset of transactions, not their order.

use serde::{Deserialize, Serialize};

use crate::constants::{BASE_UNITS_PER_TOKEN, NEUTRAL_FACTOR};
use crate::error::TrustError;
use crate::types::{Transaction, TxStatus};

const SECS_PER_DAY: f64 = 86_400.0;

// ============================================================================
// Factors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrustScoreFactors {
    pub transaction_volume:     f64,
    pub transaction_frequency:  f64,
    pub gas_efficiency:         f64,
    pub success_rate:           f64,
    pub behavioral_consistency: f64,
    /// Higher = riskier. Inverted when blended into the final score.
    pub risk_level:             f64,
}

impl TrustScoreFactors {
    pub const NEUTRAL: TrustScoreFactors = TrustScoreFactors {
        transaction_volume:     NEUTRAL_FACTOR,
        transaction_frequency:  NEUTRAL_FACTOR,
        gas_efficiency:         NEUTRAL_FACTOR,
        success_rate:           NEUTRAL_FACTOR,
        behavioral_consistency: NEUTRAL_FACTOR,
        risk_level:             NEUTRAL_FACTOR,
    };

    /// Factor values paired with their names, in declaration order.
    pub fn named(&self) -> [(&'static str, f64); 6] {
        [
            ("transaction_volume", self.transaction_volume),
            ("transaction_frequency", self.transaction_frequency),
            ("gas_efficiency", self.gas_efficiency),
            ("success_rate", self.success_rate),
            ("behavioral_consistency", self.behavioral_consistency),
            ("risk_level", self.risk_level),
        ]
    }

    /// Arithmetic mean of each factor across `history`; `None` when empty.
    pub fn mean(history: &[TrustScoreFactors]) -> Option<TrustScoreFactors> {
        if history.is_empty() {
            return None;
        }
        let n = history.len() as f64;
        let avg = |f: fn(&TrustScoreFactors) -> f64| history.iter().map(f).sum::<f64>() / n;
        Some(TrustScoreFactors {
            transaction_volume:     avg(|f| f.transaction_volume),
            transaction_frequency:  avg(|f| f.transaction_frequency),
            gas_efficiency:         avg(|f| f.gas_efficiency),
            success_rate:           avg(|f| f.success_rate),
            behavioral_consistency: avg(|f| f.behavioral_consistency),
            risk_level:             avg(|f| f.risk_level),
        })
    }
}

impl Default for TrustScoreFactors {
    fn default() -> Self {
        Self::NEUTRAL
    }
}

// ============================================================================
// Parameters
// ============================================================================

/// Reference scales used to normalise raw aggregates onto [0, 100].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorParams {
    /// Average tx value (whole tokens) that maps to a volume score of 100.
    pub volume_reference:    f64,
    /// Txs per day that map to a frequency score of 100.
    pub frequency_reference: f64,
    /// Points lost per whole token of average fee.
    pub gas_cost_scale:      f64,
    /// Points lost per whole token of value std-dev.
    pub consistency_scale:   f64,
    /// Lower bound on the window's time span, in days.
    pub min_span_days:       f64,
}

impl Default for FactorParams {
    fn default() -> Self {
        Self {
            volume_reference:    10.0,
            frequency_reference: 10.0,
            gas_cost_scale:      1_000.0,
            consistency_scale:   10.0,
            min_span_days:       1.0,
        }
    }
}

// ============================================================================
// Output
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FactorReading {
    pub factors:     TrustScoreFactors,
    /// Transactions the factors were computed from. Zero means the factors
    /// are the neutral defaults and carry no real signal.
    pub sample_size: usize,
}

impl FactorReading {
    pub fn has_signal(&self) -> bool {
        self.sample_size > 0
    }
}

// ============================================================================
// Public entry points
// ============================================================================

/// Fail with `InsufficientData` when fewer than `required` transactions exist.
pub fn require_minimum(available: usize, required: usize) -> Result<(), TrustError> {
    if available < required {
        return Err(TrustError::InsufficientData { available, required });
    }
    Ok(())
}

/// Compute all six factors over `window`.
pub fn compute(window: &[Transaction], params: &FactorParams) -> FactorReading {
    if window.is_empty() {
        return FactorReading { factors: TrustScoreFactors::NEUTRAL, sample_size: 0 };
    }
    let n = window.len() as f64;

    // Volume: exact integer sum, converted once.
    let total_value = window.iter().fold(0u128, |acc, tx| acc.saturating_add(tx.value));
    let avg_value = to_tokens(total_value) / n;
    let transaction_volume = avg_value / params.volume_reference * 100.0;

    // Frequency over the window's span, floored so tiny spans don't explode.
    let span_days = if window.len() > 1 {
        let first = window.iter().map(|tx| tx.timestamp).min().unwrap_or(0);
        let last = window.iter().map(|tx| tx.timestamp).max().unwrap_or(0);
        (last - first) as f64 / SECS_PER_DAY
    } else {
        params.min_span_days
    };
    let per_day = n / span_days.max(params.min_span_days);
    let transaction_frequency = per_day / params.frequency_reference * 100.0;

    // Fee: txs without gas data contribute zero cost but still count.
    let total_gas = window
        .iter()
        .filter_map(Transaction::gas_cost)
        .fold(0u128, u128::saturating_add);
    let avg_gas = to_tokens(total_gas) / n;
    let gas_efficiency = 100.0 - avg_gas * params.gas_cost_scale;

    let successes = window.iter().filter(|tx| tx.status == TxStatus::Success).count() as f64;
    let failures = window.iter().filter(|tx| tx.status == TxStatus::Failed).count() as f64;
    let success_rate = successes / n * 100.0;
    let risk_level = failures / n * 100.0 * 2.0;

    let mut values: Vec<f64> = window.iter().map(|tx| to_tokens(tx.value)).collect();
    values.sort_by(f64::total_cmp);
    let behavioral_consistency = 100.0 - population_std_dev(&values) * params.consistency_scale;

    FactorReading {
        factors: TrustScoreFactors {
            transaction_volume:     bound(transaction_volume),
            transaction_frequency:  bound(transaction_frequency),
            gas_efficiency:         bound(gas_efficiency),
            success_rate:           bound(success_rate),
            behavioral_consistency: bound(behavioral_consistency),
            risk_level:             bound(risk_level),
        },
        sample_size: window.len(),
    }
}

/// Base units → whole tokens.
pub fn to_tokens(base_units: u128) -> f64 {
    base_units as f64 / BASE_UNITS_PER_TOKEN
}

// ============================================================================
// Helpers
// ============================================================================

/// Round to a whole point and clamp into [0, 100]. NaN maps to 0.
fn bound(x: f64) -> f64 {
    if x.is_nan() {
        return 0.0;
    }
    x.round().clamp(0.0, 100.0)
}

fn population_std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    var.sqrt()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const ONE_TOKEN: u128 = 1_000_000_000_000_000_000;
    const DAY: u64 = 86_400;

    fn tx(i: u64, value: u128, status: TxStatus) -> Transaction {
        Transaction {
            hash:         format!("0x{:064x}", i),
            agent:        "0x00000000000000000000000000000000000000aa".into(),
            from:         "0x00000000000000000000000000000000000000aa".into(),
            to:           Some("0x00000000000000000000000000000000000000bb".into()),
            value,
            gas_used:     Some(21_000),
            gas_price:    Some(1_000_000_000), // 1 gwei
            status,
            chain_id:     1,
            block_number: 1_000 + i,
            timestamp:    1_700_000_000 + i * 3_600,
            analyzed:     false,
        }
    }

    fn assert_all_bounded(f: &TrustScoreFactors) {
        for (name, v) in f.named() {
            assert!((0.0..=100.0).contains(&v), "{name} = {v} out of range");
        }
    }

    #[test]
    fn empty_window_is_neutral_without_signal() {
        let r = compute(&[], &FactorParams::default());
        assert_eq!(r.factors, TrustScoreFactors::NEUTRAL);
        assert!(!r.has_signal());
    }

    #[test]
    fn nine_of_ten_successful() {
        let mut window: Vec<_> = (0..10).map(|i| tx(i, ONE_TOKEN, TxStatus::Success)).collect();
        window[3].status = TxStatus::Failed;

        let f = compute(&window, &FactorParams::default()).factors;
        assert_eq!(f.success_rate, 90.0);
        assert_eq!(f.risk_level, 20.0);
        assert_eq!(f.behavioral_consistency, 100.0); // uniform values
        assert_eq!(f.transaction_volume, 10.0);      // 1 token vs. 10 reference
    }

    #[test]
    fn all_failed_saturates_risk() {
        let window: Vec<_> = (0..8).map(|i| tx(i, ONE_TOKEN, TxStatus::Failed)).collect();
        let f = compute(&window, &FactorParams::default()).factors;
        assert_eq!(f.success_rate, 0.0);
        assert_eq!(f.risk_level, 100.0);
        assert_all_bounded(&f);
    }

    #[test]
    fn extreme_values_stay_in_range() {
        let mut whale = tx(0, u128::MAX, TxStatus::Success);
        whale.gas_used = Some(u128::MAX);
        whale.gas_price = Some(u128::MAX);
        let f = compute(&[whale.clone()], &FactorParams::default()).factors;
        assert_all_bounded(&f);
        assert_eq!(f.transaction_volume, 100.0);
        assert_eq!(f.gas_efficiency, 0.0);

        let mixed = vec![whale, tx(1, 0, TxStatus::Pending), tx(2, 1, TxStatus::Failed)];
        assert_all_bounded(&compute(&mixed, &FactorParams::default()).factors);
    }

    #[test]
    fn single_transaction_uses_one_day_span() {
        let f = compute(&[tx(0, ONE_TOKEN, TxStatus::Success)], &FactorParams::default()).factors;
        // 1 tx/day vs. 10 reference.
        assert_eq!(f.transaction_frequency, 10.0);
    }

    #[test]
    fn burst_within_one_day_is_floored() {
        // 5 txs in the same second: span floor of 1 day → 5/day → 50.
        let window: Vec<_> = (0..5)
            .map(|i| Transaction { timestamp: 1_700_000_000, ..tx(i, ONE_TOKEN, TxStatus::Success) })
            .collect();
        assert_eq!(compute(&window, &FactorParams::default()).factors.transaction_frequency, 50.0);
    }

    #[test]
    fn frequency_over_multi_day_span() {
        // 21 txs spread evenly over 7 days → 3/day → 30.
        let window: Vec<_> = (0..21)
            .map(|i| Transaction {
                timestamp: 1_700_000_000 + i * (7 * DAY) / 20,
                ..tx(i, ONE_TOKEN, TxStatus::Success)
            })
            .collect();
        assert_eq!(compute(&window, &FactorParams::default()).factors.transaction_frequency, 30.0);
    }

    #[test]
    fn volatile_values_reduce_consistency() {
        let window: Vec<_> = (0..10)
            .map(|i| tx(i, if i % 2 == 0 { 0 } else { 4 * ONE_TOKEN }, TxStatus::Success))
            .collect();
        // std-dev = 2 tokens → 100 − 20.
        assert_eq!(compute(&window, &FactorParams::default()).factors.behavioral_consistency, 80.0);
    }

    #[test]
    fn order_does_not_change_factors() {
        let window: Vec<_> = (0..30)
            .map(|i| {
                let status = if i % 7 == 0 { TxStatus::Failed } else { TxStatus::Success };
                tx(i, (i as u128 * 37 % 11) * ONE_TOKEN / 3, status)
            })
            .collect();
        let mut reversed = window.clone();
        reversed.reverse();
        let mut shuffled = window.clone();
        shuffled.rotate_left(13);
        shuffled.swap(2, 25);

        let params = FactorParams::default();
        let base = compute(&window, &params);
        assert_eq!(base, compute(&reversed, &params));
        assert_eq!(base, compute(&shuffled, &params));
    }

    #[test]
    fn require_minimum_reports_counts() {
        assert!(require_minimum(5, 5).is_ok());
        assert_eq!(
            require_minimum(2, 5),
            Err(TrustError::InsufficientData { available: 2, required: 5 })
        );
    }

    #[test]
    fn mean_of_history() {
        let a = TrustScoreFactors { success_rate: 90.0, ..TrustScoreFactors::NEUTRAL };
        let b = TrustScoreFactors { success_rate: 100.0, ..TrustScoreFactors::NEUTRAL };
        let m = TrustScoreFactors::mean(&[a, b]).unwrap();
        assert_eq!(m.success_rate, 95.0);
        assert_eq!(m.risk_level, 50.0);
        assert!(TrustScoreFactors::mean(&[]).is_none());
    }
}
