//! Canonical records shared by the ledger gateway, the store and the scoring
//! pipeline.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TrustError;
use crate::factors::TrustScoreFactors;

// ============================================================================
// Address / hash validation
// ============================================================================

/// A validated EVM account address, canonicalised to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn parse(raw: &str) -> Result<Self, TrustError> {
        let raw = raw.trim();
        let body = raw
            .strip_prefix("0x")
            .or_else(|| raw.strip_prefix("0X"))
            .ok_or_else(|| TrustError::validation(format!("address '{raw}' must start with 0x")))?;
        let bytes = hex::decode(body)
            .map_err(|e| TrustError::validation(format!("address '{raw}' is not hex: {e}")))?;
        if bytes.len() != 20 {
            return Err(TrustError::validation(format!(
                "address '{raw}' must be 20 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Address(format!("0x{}", hex::encode(bytes))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Address {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Address {
    type Error = TrustError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Address::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

/// Validate and canonicalise a 32-byte transaction hash.
pub fn parse_tx_hash(raw: &str) -> Result<String, TrustError> {
    let body = raw
        .trim()
        .strip_prefix("0x")
        .ok_or_else(|| TrustError::validation(format!("tx hash '{raw}' must start with 0x")))?;
    let bytes = hex::decode(body)
        .map_err(|e| TrustError::validation(format!("tx hash '{raw}' is not hex: {e}")))?;
    if bytes.len() != 32 {
        return Err(TrustError::validation(format!(
            "tx hash '{raw}' must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(format!("0x{}", hex::encode(bytes)))
}

// ============================================================================
// Agent
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Suspended,
    Flagged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Chain address; the agent's unique identity.
    pub address:     String,
    pub name:        String,
    pub category:    String,
    /// Equals the score of the latest snapshot (or the neutral default).
    pub trust_score: f64,
    pub status:      AgentStatus,
    pub created_at:  u64,
    pub updated_at:  u64,
}

// ============================================================================
// Transaction
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Success,
    Failed,
    Pending,
}

/// One on-chain transaction attributed to a monitored agent.
///
/// Immutable once stored except for `analyzed`. Quantities are integer base
/// units; they serialise as decimal strings so no JSON consumer rounds them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash:         String,
    pub agent:        String,
    pub from:         String,
    /// `None` for contract creations.
    pub to:           Option<String>,
    #[serde(with = "base_units")]
    pub value:        u128,
    #[serde(with = "opt_base_units")]
    pub gas_used:     Option<u128>,
    #[serde(with = "opt_base_units")]
    pub gas_price:    Option<u128>,
    pub status:       TxStatus,
    pub chain_id:     u64,
    pub block_number: u64,
    /// Unix seconds.
    pub timestamp:    u64,
    pub analyzed:     bool,
}

impl Transaction {
    /// Total fee paid in base units, when both gas fields are known.
    pub fn gas_cost(&self) -> Option<u128> {
        match (self.gas_used, self.gas_price) {
            (Some(used), Some(price)) => Some(used.saturating_mul(price)),
            _ => None,
        }
    }
}

// ============================================================================
// Trust score snapshot
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustScoreSnapshot {
    pub id:         i64,
    pub agent:      String,
    pub score:      f64,
    pub factors:    TrustScoreFactors,
    pub narrative:  String,
    pub confidence: f64,
    pub timestamp:  u64,
}

// ============================================================================
// Alert
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
    Anomaly,
    Risk,
    Critical,
    Suspicious,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id:          i64,
    pub agent:       String,
    pub alert_type:  AlertType,
    pub severity:    Severity,
    /// Name of the triggering condition, e.g. `low_success_rate`.
    pub rule:        String,
    pub message:     String,
    /// Triggering numbers, kept for audit.
    pub details:     serde_json::Value,
    pub resolved:    bool,
    pub resolved_at: Option<u64>,
    pub created_at:  u64,
}

// ============================================================================
// String forms (store columns, query parameters)
// ============================================================================

macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self { $($ty::$variant => $s),+ }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = TrustError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($ty::$variant),)+
                    other => Err(TrustError::validation(format!(
                        concat!("unknown ", stringify!($ty), " '{}'"), other
                    ))),
                }
            }
        }
    };
}

string_enum!(AgentStatus { Active => "active", Suspended => "suspended", Flagged => "flagged" });
string_enum!(TxStatus { Success => "success", Failed => "failed", Pending => "pending" });
string_enum!(AlertType {
    Anomaly => "anomaly",
    Risk => "risk",
    Critical => "critical",
    Suspicious => "suspicious",
});
string_enum!(Severity { Low => "low", Medium => "medium", High => "high", Critical => "critical" });

// ============================================================================
// Base-unit serde helpers
// ============================================================================

/// `u128` <-> decimal string.
pub mod base_units {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u128, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u128, D::Error> {
        let s = String::deserialize(d)?;
        s.parse::<u128>().map_err(D::Error::custom)
    }
}

/// `Option<u128>` <-> decimal string or null.
pub mod opt_base_units {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<u128>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(v) => s.serialize_str(&v.to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u128>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|s| s.parse::<u128>().map_err(D::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_is_canonicalised_to_lowercase() {
        let a = Address::parse("0xAbCdEf0123456789abcdef0123456789ABCDEF01").unwrap();
        assert_eq!(a.as_str(), "0xabcdef0123456789abcdef0123456789abcdef01");
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        for bad in ["", "abcdef", "0x1234", "0xzz", "0xabcdef0123456789abcdef0123456789abcdef0102"] {
            assert!(
                matches!(Address::parse(bad), Err(TrustError::Validation(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn tx_hash_requires_32_bytes() {
        let ok = format!("0x{}", "ab".repeat(32));
        assert_eq!(parse_tx_hash(&ok).unwrap(), ok);
        assert!(parse_tx_hash("0xabcd").is_err());
        assert!(parse_tx_hash(&"ab".repeat(32)).is_err());
    }

    #[test]
    fn value_serialises_as_decimal_string() {
        let tx = Transaction {
            hash:         format!("0x{}", "11".repeat(32)),
            agent:        "0x0000000000000000000000000000000000000001".into(),
            from:         "0x0000000000000000000000000000000000000001".into(),
            to:           None,
            value:        u128::MAX,
            gas_used:     Some(21_000),
            gas_price:    None,
            status:       TxStatus::Success,
            chain_id:     1,
            block_number: 7,
            timestamp:    1_700_000_000,
            analyzed:     false,
        };
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["value"], u128::MAX.to_string());
        assert_eq!(json["gas_used"], "21000");
        assert!(json["gas_price"].is_null());
        assert_eq!(json["status"], "success");

        let back: Transaction = serde_json::from_value(json).unwrap();
        assert_eq!(back, tx);
    }

    #[test]
    fn string_enums_parse_their_own_output() {
        assert_eq!("flagged".parse::<AgentStatus>().unwrap(), AgentStatus::Flagged);
        assert_eq!(Severity::Critical.as_str(), "critical");
        assert!("urgent".parse::<Severity>().is_err());
        assert!(Severity::Critical > Severity::High && Severity::Medium > Severity::Low);
    }
}
