//! Final score blend.
//!
//!   S = 0.15·volume + 0.15·frequency + 0.15·gas + 0.25·success
//!     + 0.20·consistency + 0.10·(100 − risk)
//!
//! rounded to a whole point and clamped to [0, 100].

use crate::constants::{
    WEIGHT_CONSISTENCY, WEIGHT_FREQUENCY, WEIGHT_GAS_EFFICIENCY, WEIGHT_INVERSE_RISK,
    WEIGHT_SUCCESS_RATE, WEIGHT_VOLUME,
};
use crate::factors::TrustScoreFactors;

/// Blend `factors` into a trust score, taking the risk term from
/// `risk_signal` (the assessor's risk estimate) instead of `factors.risk_level`.
pub fn compose(factors: &TrustScoreFactors, risk_signal: f64) -> f64 {
    let risk = if risk_signal.is_nan() { 100.0 } else { risk_signal.clamp(0.0, 100.0) };
    let score = factors.transaction_volume * WEIGHT_VOLUME
        + factors.transaction_frequency * WEIGHT_FREQUENCY
        + factors.gas_efficiency * WEIGHT_GAS_EFFICIENCY
        + factors.success_rate * WEIGHT_SUCCESS_RATE
        + factors.behavioral_consistency * WEIGHT_CONSISTENCY
        + (100.0 - risk) * WEIGHT_INVERSE_RISK;

    if score.is_nan() {
        return 0.0;
    }
    score.round().clamp(0.0, 100.0)
}

/// Blend using the factors' own risk level.
pub fn compose_factors(factors: &TrustScoreFactors) -> f64 {
    compose(factors, factors.risk_level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_sum_to_one() {
        let sum = WEIGHT_VOLUME
            + WEIGHT_FREQUENCY
            + WEIGHT_GAS_EFFICIENCY
            + WEIGHT_SUCCESS_RATE
            + WEIGHT_CONSISTENCY
            + WEIGHT_INVERSE_RISK;
        assert!((sum - 1.0).abs() < 1e-12, "sum={sum}");
    }

    #[test]
    fn neutral_factors_give_neutral_score() {
        assert_eq!(compose_factors(&TrustScoreFactors::NEUTRAL), 50.0);
    }

    #[test]
    fn perfect_and_worst_agents_hit_the_bounds() {
        let perfect = TrustScoreFactors {
            transaction_volume:     100.0,
            transaction_frequency:  100.0,
            gas_efficiency:         100.0,
            success_rate:           100.0,
            behavioral_consistency: 100.0,
            risk_level:             0.0,
        };
        assert_eq!(compose_factors(&perfect), 100.0);

        let worst = TrustScoreFactors {
            transaction_volume:     0.0,
            transaction_frequency:  0.0,
            gas_efficiency:         0.0,
            success_rate:           0.0,
            behavioral_consistency: 0.0,
            risk_level:             100.0,
        };
        assert_eq!(compose_factors(&worst), 0.0);
    }

    #[test]
    fn fewer_failures_score_higher() {
        let base = TrustScoreFactors {
            transaction_volume:     10.0,
            transaction_frequency:  100.0,
            gas_efficiency:         100.0,
            success_rate:           90.0,
            behavioral_consistency: 100.0,
            risk_level:             20.0,
        };
        let failing = TrustScoreFactors { success_rate: 50.0, risk_level: 100.0, ..base };
        assert!(compose_factors(&base) > compose_factors(&failing));
    }

    #[test]
    fn window_order_does_not_change_the_score() {
        use crate::factors::{compute, FactorParams};
        use crate::types::{Transaction, TxStatus};

        let window: Vec<Transaction> = (0..24u64)
            .map(|i| Transaction {
                hash:         format!("0x{:064x}", i),
                agent:        "0x00000000000000000000000000000000000000aa".into(),
                from:         "0x00000000000000000000000000000000000000aa".into(),
                to:           Some("0x00000000000000000000000000000000000000bb".into()),
                value:        (i as u128 % 7 + 1) * 250_000_000_000_000_000,
                gas_used:     Some(21_000 + i as u128 * 1_000),
                gas_price:    Some(1_000_000_000 + i as u128 * 10_000_000),
                status:       if i % 5 == 0 { TxStatus::Failed } else { TxStatus::Success },
                chain_id:     1,
                block_number: 1_000 + i,
                timestamp:    1_700_000_000 + i * i * 600,
                analyzed:     false,
            })
            .collect();

        let mut reversed = window.clone();
        reversed.reverse();
        let mut interleaved: Vec<_> = window.iter().step_by(2).cloned().collect();
        interleaved.extend(window.iter().skip(1).step_by(2).rev().cloned());
        let mut rotated = window.clone();
        rotated.rotate_left(9);

        let params = FactorParams::default();
        let reference = compute(&window, &params).factors;
        for shuffled in [reversed, interleaved, rotated] {
            let factors = compute(&shuffled, &params).factors;
            for ((name, a), (_, b)) in reference.named().into_iter().zip(factors.named()) {
                assert!((a - b).abs() < 1e-9, "{name}: {a} vs {b}");
            }
            assert_eq!(compose_factors(&factors), compose_factors(&reference));
            assert_eq!(compose(&factors, 30.0), compose(&reference, 30.0));
        }
    }

    #[test]
    fn out_of_range_risk_signal_is_clamped() {
        let f = TrustScoreFactors::NEUTRAL;
        assert_eq!(compose(&f, 500.0), compose(&f, 100.0));
        assert_eq!(compose(&f, -20.0), compose(&f, 0.0));
    }
}
