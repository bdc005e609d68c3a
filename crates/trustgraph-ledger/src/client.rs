use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use trustgraph_core::{Address, Transaction};

use crate::chain;
use crate::error::DataSourceError;
use crate::normalize::{self, Batch};

/// Anything that can produce an agent's recent transactions.
///
/// The scheduler and analyzer depend on this trait only, so tests can swap
/// in a fixed fake instead of a live indexer.
#[async_trait]
pub trait LedgerSource: Send + Sync {
    /// Transactions touching `address` on `chain_id`, newest first.
    async fn fetch_activity(
        &self,
        address: &Address,
        chain_id: u64,
    ) -> Result<Vec<Transaction>, DataSourceError>;
}

// ============================================================================
// Provider selection
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// Moralis deep-index REST API (`X-API-Key` auth).
    Moralis,
    /// Any endpoint serving the generic activity shape at
    /// `GET {base}/activity/{address}?chain={chain_id}`.
    Generic,
}

impl FromStr for Provider {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "moralis" => Ok(Provider::Moralis),
            "generic" => Ok(Provider::Generic),
            other => Err(format!("unknown ledger provider '{other}' (expected moralis or generic)")),
        }
    }
}

// ============================================================================
// LedgerClient
// ============================================================================

/// HTTP client for one indexing provider.
pub struct LedgerClient {
    provider: Provider,
    base_url: String,
    api_key:  Option<String>,
    http:     reqwest::Client,
}

impl LedgerClient {
    pub fn new(
        provider: Provider,
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, DataSourceError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DataSourceError::Http(e.to_string()))?;
        Ok(Self {
            provider,
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
            http,
        })
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    fn activity_url(&self, address: &Address, chain_id: u64) -> Result<String, DataSourceError> {
        let name = chain::chain_name(chain_id)?;
        Ok(match self.provider {
            Provider::Moralis => format!("{}/{}?chain={}", self.base_url, address, name),
            Provider::Generic => format!("{}/activity/{}?chain={}", self.base_url, address, chain_id),
        })
    }

    async fn get_json(&self, url: &str) -> Result<Value, DataSourceError> {
        let mut req = self.http.get(url);
        if let Some(key) = &self.api_key {
            req = req.header("X-API-Key", key);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DataSourceError::from_status(status.as_u16()));
        }
        Ok(resp.json::<Value>().await?)
    }
}

#[async_trait]
impl LedgerSource for LedgerClient {
    async fn fetch_activity(
        &self,
        address: &Address,
        chain_id: u64,
    ) -> Result<Vec<Transaction>, DataSourceError> {
        let url = self.activity_url(address, chain_id)?;
        let body = self.get_json(&url).await?;

        let Batch { transactions, rejected } = match self.provider {
            Provider::Moralis => normalize::moralis_activity(body, address, chain_id)?,
            Provider::Generic => normalize::generic_activity(body, address, chain_id)?,
        };
        if rejected > 0 {
            tracing::warn!(agent = %address, rejected, "Dropped malformed upstream records");
        }
        tracing::debug!(agent = %address, chain_id, count = transactions.len(), "Fetched activity");
        Ok(transactions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(provider: Provider) -> LedgerClient {
        LedgerClient::new(provider, "https://indexer.test/api/v2/", None, Duration::from_secs(5))
            .unwrap()
    }

    fn addr() -> Address {
        Address::parse("0x00000000000000000000000000000000000000aa").unwrap()
    }

    #[test]
    fn provider_parses_case_insensitively() {
        assert_eq!("Moralis".parse::<Provider>().unwrap(), Provider::Moralis);
        assert_eq!("generic".parse::<Provider>().unwrap(), Provider::Generic);
        assert!("alchemy".parse::<Provider>().is_err());
    }

    #[test]
    fn moralis_url_uses_chain_name() {
        let url = client(Provider::Moralis).activity_url(&addr(), 42161).unwrap();
        assert_eq!(
            url,
            "https://indexer.test/api/v2/0x00000000000000000000000000000000000000aa?chain=arbitrum"
        );
    }

    #[test]
    fn generic_url_uses_chain_id() {
        let url = client(Provider::Generic).activity_url(&addr(), 56).unwrap();
        assert_eq!(
            url,
            "https://indexer.test/api/v2/activity/0x00000000000000000000000000000000000000aa?chain=56"
        );
    }

    #[tokio::test]
    async fn unsupported_chain_fails_before_any_request() {
        let err = client(Provider::Moralis).fetch_activity(&addr(), 10).await.unwrap_err();
        assert!(matches!(err, DataSourceError::UnsupportedChain(10)));
    }
}
