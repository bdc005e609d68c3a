use std::str::FromStr;
use std::time::Duration;

use clap::Parser;

use trustgraph_core::alerts::AlertParams;
use trustgraph_core::factors::FactorParams;
use trustgraph_core::{Address, BASELINE_DEPTH};
use trustgraph_ledger::{chain, Provider};

use crate::analyzer::AnalyzerConfig;
use crate::scheduler::SchedulerConfig;

#[derive(Parser, Debug)]
#[command(name = "trustgraph-monitor", about = "On-chain agent trust monitor")]
pub struct Config {
    /// HTTP listen address.
    #[arg(long, default_value = "0.0.0.0:8090", env = "TRUSTGRAPH_LISTEN")]
    pub listen: std::net::SocketAddr,

    /// Path to the SQLite database file.
    /// If absent, data is in-memory only and lost on restart.
    #[arg(long, env = "TRUSTGRAPH_DB_PATH")]
    pub db_path: Option<std::path::PathBuf>,

    /// Shared secret for mutating routes.
    /// When set, requests must include `Authorization: Bearer <secret>`.
    #[arg(long, env = "TRUSTGRAPH_API_SECRET")]
    pub api_secret: Option<String>,

    /// Ledger indexing provider: `moralis` or `generic`.
    #[arg(long, default_value = "moralis", env = "TRUSTGRAPH_LEDGER_PROVIDER")]
    pub ledger_provider: Provider,

    #[arg(long, default_value = "https://deep-index.moralis.io/api/v2", env = "TRUSTGRAPH_LEDGER_URL")]
    pub ledger_url: String,

    #[arg(long, env = "MORALIS_API_KEY")]
    pub ledger_api_key: Option<String>,

    #[arg(long, default_value_t = 15)]
    pub ledger_timeout_secs: u64,

    /// Base URL of an OpenAI-compatible chat completions API.
    #[arg(long, default_value = "https://api.openai.com/v1", env = "TRUSTGRAPH_LLM_URL")]
    pub llm_url: String,

    /// Without a key every assessment uses the fallback narrative.
    #[arg(long, env = "OPENAI_API_KEY")]
    pub llm_api_key: Option<String>,

    #[arg(long, default_value = "gpt-4.1", env = "TRUSTGRAPH_LLM_MODEL")]
    pub llm_model: String,

    #[arg(long, default_value_t = 30)]
    pub llm_timeout_secs: u64,

    /// Ledger poll period per monitored agent.
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    pub poll_interval_secs: u64,

    /// Scoring sweep period; also the minimum age of a score before it is
    /// recomputed.
    #[arg(long, default_value_t = 300, value_parser = clap::value_parser!(u64).range(1..))]
    pub sweep_interval_secs: u64,

    /// History required before an agent is scored. At least one.
    #[arg(
        long,
        default_value_t = 5,
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..),
    )]
    pub min_transactions: usize,

    /// Most recent transactions used for scoring.
    #[arg(long, default_value_t = 100)]
    pub window_size: usize,

    /// Recent transactions summarised in the assessment prompt.
    #[arg(long, default_value_t = 10)]
    pub prompt_sample: usize,

    /// Scores below this raise a critical alert.
    #[arg(long, default_value_t = 30.0)]
    pub critical_score: f64,

    /// Per-topic event queue length for live subscribers.
    #[arg(long, default_value_t = 256)]
    pub event_queue: usize,

    /// Agent to monitor at start-up, as `address[:chain_id]` (chain defaults
    /// to 1). Repeatable.
    #[arg(long = "monitor", value_name = "ADDRESS[:CHAIN]")]
    pub monitor: Vec<MonitorTarget>,
}

impl Config {
    pub fn ledger_timeout(&self) -> Duration {
        Duration::from_secs(self.ledger_timeout_secs)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }

    pub fn analyzer_config(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            window_size:      self.window_size.max(1),
            min_transactions: self.min_transactions,
            baseline_depth:   BASELINE_DEPTH,
            factors:          FactorParams::default(),
            alerts:           AlertParams { critical_score: self.critical_score, ..AlertParams::default() },
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval:    Duration::from_secs(self.poll_interval_secs),
            sweep_interval:   Duration::from_secs(self.sweep_interval_secs),
            min_transactions: self.min_transactions,
        }
    }
}

/// `address[:chain_id]` from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorTarget {
    pub address:  Address,
    pub chain_id: u64,
}

impl FromStr for MonitorTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, chain_id) = match s.split_once(':') {
            Some((addr, chain)) => {
                let id = chain
                    .parse::<u64>()
                    .map_err(|e| format!("invalid chain id '{chain}': {e}"))?;
                (addr, id)
            }
            None => (s, chain::ETHEREUM),
        };
        chain::chain_name(chain_id).map_err(|e| e.to_string())?;
        let address = Address::parse(addr).map_err(|e| e.to_string())?;
        Ok(Self { address, chain_id })
    }
}
