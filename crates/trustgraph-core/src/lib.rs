pub mod alerts;
pub mod anomaly;
pub mod composer;
pub mod constants;
pub mod error;
pub mod factors;
pub mod types;

pub use constants::*;
pub use error::TrustError;
pub use factors::TrustScoreFactors;
pub use types::{Address, Agent, AgentStatus, Alert, AlertType, Severity, Transaction, TrustScoreSnapshot, TxStatus};
