use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrustError {
    /// Upstream ledger or model unavailable or malformed. Retried next cycle.
    #[error("data source error: {0}")]
    DataSource(String),

    /// Fewer transactions than the analysis minimum. Callers turn this into
    /// a neutral, low-confidence result.
    #[error("insufficient data: {available} transactions, {required} required")]
    InsufficientData { available: usize, required: usize },

    /// Store unavailable. The cycle aborts for this agent only.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Malformed address or input at the boundary. Never retried.
    #[error("validation error: {0}")]
    Validation(String),
}

impl TrustError {
    /// Whether the failing operation should simply be attempted again on the
    /// next scheduled tick.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TrustError::DataSource(_) | TrustError::Persistence(_))
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        TrustError::Validation(msg.into())
    }

    pub fn persistence(err: impl std::fmt::Display) -> Self {
        TrustError::Persistence(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(TrustError::DataSource("timeout".into()).is_retryable());
        assert!(TrustError::Persistence("locked".into()).is_retryable());
        assert!(!TrustError::validation("bad address").is_retryable());
        assert!(!TrustError::InsufficientData { available: 1, required: 5 }.is_retryable());
    }
}
