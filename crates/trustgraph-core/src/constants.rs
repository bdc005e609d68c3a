// ============================================================================
// Scoring constants
// ============================================================================

// --- Units ------------------------------------------------------------------

/// Base units per whole native token (wei per ETH on EVM chains).
pub const BASE_UNITS_PER_TOKEN: f64 = 1e18;

// --- Analysis window --------------------------------------------------------

/// Most recent transactions fed to the Factor Calculator.
pub const DEFAULT_WINDOW_SIZE: usize = 100;

/// Recent transactions summarised inside the assessor prompt.
pub const DEFAULT_PROMPT_SAMPLE: usize = 10;

/// Below this many stored transactions an agent gets a neutral result.
pub const MIN_TRANSACTIONS_FOR_ANALYSIS: usize = 5;

/// Prior snapshots used as the anomaly baseline.
pub const BASELINE_DEPTH: usize = 5;

// --- Neutral / fallback results ---------------------------------------------

/// Value every factor takes when there is no usable history.
pub const NEUTRAL_FACTOR: f64 = 50.0;

/// Score reported for agents without enough history.
pub const NEUTRAL_SCORE: f64 = 50.0;

/// Confidence reported with a neutral (insufficient data) result.
pub const INSUFFICIENT_DATA_CONFIDENCE: f64 = 0.3;

/// Confidence reported when the narrative generator is unavailable.
pub const FALLBACK_CONFIDENCE: f64 = 0.6;

/// Confidence ceiling for model-backed assessments.
pub const MAX_CONFIDENCE: f64 = 0.95;

pub const INSUFFICIENT_DATA_NARRATIVE: &str =
    "Insufficient transaction history for comprehensive analysis.";

pub const FALLBACK_NARRATIVE: &str =
    "AI analysis temporarily unavailable. Trust score calculated based on transaction metrics.";

// --- Score blend ------------------------------------------------------------
// Weights sum to 1.0. Risk enters inverted as (100 - risk_level).

pub const WEIGHT_VOLUME: f64 = 0.15;
pub const WEIGHT_FREQUENCY: f64 = 0.15;
pub const WEIGHT_GAS_EFFICIENCY: f64 = 0.15;
pub const WEIGHT_SUCCESS_RATE: f64 = 0.25;
pub const WEIGHT_CONSISTENCY: f64 = 0.20;
pub const WEIGHT_INVERSE_RISK: f64 = 0.10;

// --- Trust score bands ------------------------------------------------------

/// Score below which a `critical` alert is raised.
pub const CRITICAL_SCORE: f64 = 30.0;
pub const WARNING_SCORE: f64 = 50.0;
pub const GOOD_SCORE: f64 = 70.0;
pub const EXCELLENT_SCORE: f64 = 85.0;

// --- Scheduling -------------------------------------------------------------

/// Ledger polling interval per monitored agent.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Global re-scoring sweep interval.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;
