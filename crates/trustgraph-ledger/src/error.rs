use thiserror::Error;
use trustgraph_core::TrustError;

#[derive(Debug, Error)]
pub enum DataSourceError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("upstream timed out")]
    Timeout,
    #[error("upstream returned status {code}")]
    Status { code: u16, retryable: bool },
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("unsupported chain id: {0}")]
    UnsupportedChain(u64),
}

impl DataSourceError {
    /// Rate limits and server errors are retried on the next tick.
    pub fn from_status(code: u16) -> Self {
        DataSourceError::Status { code, retryable: code == 429 || (500..600).contains(&code) }
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        DataSourceError::Malformed(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            DataSourceError::Http(_) | DataSourceError::Timeout => true,
            DataSourceError::Status { retryable, .. } => *retryable,
            DataSourceError::Malformed(_) | DataSourceError::UnsupportedChain(_) => false,
        }
    }
}

impl From<reqwest::Error> for DataSourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DataSourceError::Timeout
        } else if let Some(status) = e.status() {
            DataSourceError::from_status(status.as_u16())
        } else if e.is_decode() {
            DataSourceError::Malformed(e.to_string())
        } else {
            DataSourceError::Http(e.to_string())
        }
    }
}

impl From<DataSourceError> for TrustError {
    fn from(e: DataSourceError) -> Self {
        match e {
            DataSourceError::UnsupportedChain(_) => TrustError::Validation(e.to_string()),
            other => TrustError::DataSource(other.to_string()),
        }
    }
}
