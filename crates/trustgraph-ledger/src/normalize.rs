//! Normalisation boundary: untyped provider JSON → canonical [`Transaction`].
//!
//! Three shapes are understood:
//!
//!   generic        : `[{hash, from, to, value, gas, gasPrice, blockNumber,
//!                     timestampSeconds, statusCode}]`
//!   Moralis REST   : `{result: [{hash, from_address, to_address, value, gas,
//!                     gas_price, receipt_status, block_number, block_timestamp}]}`
//!   Moralis stream : `{chainId, block?, txs: [{hash, fromAddress, toAddress,
//!                     value, gas, gasPrice, receiptStatus, ...}]}`
//!
//! A record missing a required field, or carrying one that does not parse,
//! is rejected and counted. An envelope of the wrong shape rejects the whole
//! payload. Nothing is guessed.

use chrono::DateTime;
use serde::Deserialize;
use serde_json::Value;
use trustgraph_core::types::parse_tx_hash;
use trustgraph_core::{Address, Transaction, TxStatus};

use crate::chain;
use crate::error::DataSourceError;

// ============================================================================
// Output
// ============================================================================

/// Records accepted from one upstream response, newest first.
#[derive(Debug, Default)]
pub struct Batch {
    pub transactions: Vec<Transaction>,
    pub rejected:     usize,
}

/// Records accepted from one stream delivery.
#[derive(Debug)]
pub struct StreamBatch {
    pub chain_id:     u64,
    pub confirmed:    bool,
    pub transactions: Vec<Transaction>,
    pub rejected:     usize,
    /// Well-formed records that touch no known agent.
    pub unmatched:    usize,
}

// ============================================================================
// Scalars
// ============================================================================

/// Parse an integer quantity written as decimal or `0x`-prefixed hex.
pub fn parse_quantity(raw: &str) -> Result<u128, DataSourceError> {
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some("") => return Err(DataSourceError::malformed("empty hex quantity")),
        Some(hex) => u128::from_str_radix(hex, 16),
        None => raw.parse::<u128>(),
    };
    parsed.map_err(|e| DataSourceError::malformed(format!("quantity '{raw}': {e}")))
}

/// Unix seconds from either a decimal string or an RFC 3339 timestamp.
pub fn parse_timestamp(raw: &str) -> Result<u64, DataSourceError> {
    let raw = raw.trim();
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        return raw
            .parse::<u64>()
            .map_err(|e| DataSourceError::malformed(format!("timestamp '{raw}': {e}")));
    }
    let dt = DateTime::parse_from_rfc3339(raw)
        .map_err(|e| DataSourceError::malformed(format!("timestamp '{raw}': {e}")))?;
    u64::try_from(dt.timestamp())
        .map_err(|_| DataSourceError::malformed(format!("timestamp '{raw}' before epoch")))
}

/// A JSON scalar that may arrive as a number or a string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Number(u64),
    Text(String),
}

impl Scalar {
    fn quantity(&self) -> Result<u128, DataSourceError> {
        match self {
            Scalar::Number(n) => Ok(u128::from(*n)),
            Scalar::Text(s) => parse_quantity(s),
        }
    }

    fn small(&self, field: &str) -> Result<u64, DataSourceError> {
        u64::try_from(self.quantity()?)
            .map_err(|_| DataSourceError::malformed(format!("{field} out of range")))
    }

    fn timestamp(&self) -> Result<u64, DataSourceError> {
        match self {
            Scalar::Number(n) => Ok(*n),
            Scalar::Text(s) => parse_timestamp(s),
        }
    }
}

/// Receipt status: 1 = success, 0 = failed, absent = not yet mined.
fn receipt_status(raw: Option<&Scalar>) -> Result<TxStatus, DataSourceError> {
    match raw {
        None => Ok(TxStatus::Pending),
        Some(Scalar::Text(s)) if s.is_empty() => Ok(TxStatus::Pending),
        Some(s) => match s.quantity()? {
            1 => Ok(TxStatus::Success),
            0 => Ok(TxStatus::Failed),
            other => Err(DataSourceError::malformed(format!("receipt status {other}"))),
        },
    }
}

fn counterparty(raw: Option<&str>) -> Result<Option<Address>, DataSourceError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => Address::parse(s).map(Some).map_err(|e| DataSourceError::malformed(e.to_string())),
    }
}

fn required<'a, T>(v: &'a Option<T>, field: &str) -> Result<&'a T, DataSourceError> {
    v.as_ref().ok_or_else(|| DataSourceError::malformed(format!("missing {field}")))
}

// ============================================================================
// Canonical intermediate
// ============================================================================

/// A validated upstream record not yet attributed to an agent.
struct Record {
    hash:         String,
    from:         Address,
    to:           Option<Address>,
    value:        u128,
    gas_used:     Option<u128>,
    gas_price:    Option<u128>,
    status:       TxStatus,
    block_number: u64,
    timestamp:    u64,
}

impl Record {
    fn attribute(self, agent: &Address, chain_id: u64) -> Transaction {
        Transaction {
            hash:         self.hash,
            agent:        agent.to_string(),
            from:         self.from.into_string(),
            to:           self.to.map(Address::into_string),
            value:        self.value,
            gas_used:     self.gas_used,
            gas_price:    self.gas_price,
            status:       self.status,
            chain_id,
            block_number: self.block_number,
            timestamp:    self.timestamp,
            analyzed:     false,
        }
    }
}

fn hash(raw: &Option<String>) -> Result<String, DataSourceError> {
    parse_tx_hash(required(raw, "hash")?).map_err(|e| DataSourceError::malformed(e.to_string()))
}

fn optional_quantity(raw: Option<&Scalar>) -> Result<Option<u128>, DataSourceError> {
    raw.map(Scalar::quantity).transpose()
}

// ============================================================================
// Generic shape
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenericTx {
    hash:              Option<String>,
    from:              Option<String>,
    to:                Option<String>,
    value:             Option<Scalar>,
    gas:               Option<Scalar>,
    gas_price:         Option<Scalar>,
    block_number:      Option<Scalar>,
    timestamp_seconds: Option<Scalar>,
    status_code:       Option<Scalar>,
}

impl GenericTx {
    fn validate(&self) -> Result<Record, DataSourceError> {
        Ok(Record {
            hash:         hash(&self.hash)?,
            from:         counterparty(self.from.as_deref())?
                .ok_or_else(|| DataSourceError::malformed("missing from"))?,
            to:           counterparty(self.to.as_deref())?,
            value:        required(&self.value, "value")?.quantity()?,
            gas_used:     optional_quantity(self.gas.as_ref())?,
            gas_price:    optional_quantity(self.gas_price.as_ref())?,
            status:       receipt_status(self.status_code.as_ref())?,
            block_number: required(&self.block_number, "blockNumber")?.small("blockNumber")?,
            timestamp:    required(&self.timestamp_seconds, "timestampSeconds")?.timestamp()?,
        })
    }
}

/// Normalise a generic-collaborator response (a bare JSON array).
pub fn generic_activity(body: Value, agent: &Address, chain_id: u64) -> Result<Batch, DataSourceError> {
    let Value::Array(records) = body else {
        return Err(DataSourceError::malformed("expected a JSON array of transactions"));
    };
    Ok(collect(records, agent, chain_id, |r: GenericTx| r.validate()))
}

// ============================================================================
// Moralis wallet history
// ============================================================================

#[derive(Deserialize)]
struct MoralisTx {
    hash:             Option<String>,
    from_address:     Option<String>,
    to_address:       Option<String>,
    value:            Option<Scalar>,
    gas:              Option<Scalar>,
    receipt_gas_used: Option<Scalar>,
    gas_price:        Option<Scalar>,
    receipt_status:   Option<Scalar>,
    block_number:     Option<Scalar>,
    block_timestamp:  Option<String>,
}

impl MoralisTx {
    fn validate(&self) -> Result<Record, DataSourceError> {
        let timestamp = parse_timestamp(required(&self.block_timestamp, "block_timestamp")?)?;
        Ok(Record {
            hash: hash(&self.hash)?,
            from: counterparty(self.from_address.as_deref())?
                .ok_or_else(|| DataSourceError::malformed("missing from_address"))?,
            to: counterparty(self.to_address.as_deref())?,
            value: required(&self.value, "value")?.quantity()?,
            // Prefer the receipt's actual usage over the gas limit.
            gas_used: optional_quantity(self.receipt_gas_used.as_ref().or(self.gas.as_ref()))?,
            gas_price: optional_quantity(self.gas_price.as_ref())?,
            status: receipt_status(self.receipt_status.as_ref())?,
            block_number: required(&self.block_number, "block_number")?.small("block_number")?,
            timestamp,
        })
    }
}

/// Normalise a Moralis `/{address}?chain=` response.
pub fn moralis_activity(body: Value, agent: &Address, chain_id: u64) -> Result<Batch, DataSourceError> {
    let Value::Object(mut envelope) = body else {
        return Err(DataSourceError::malformed("expected a JSON object"));
    };
    let Some(Value::Array(records)) = envelope.remove("result") else {
        return Err(DataSourceError::malformed("missing result array"));
    };
    Ok(collect(records, agent, chain_id, |r: MoralisTx| r.validate()))
}

// ============================================================================
// Moralis streams webhook
// ============================================================================

#[derive(Deserialize)]
struct StreamEnvelope {
    #[serde(rename = "chainId")]
    chain_id:  Scalar,
    #[serde(default)]
    confirmed: bool,
    #[serde(default)]
    block:     Option<StreamBlock>,
    txs:       Vec<Value>,
}

#[derive(Deserialize)]
struct StreamBlock {
    number:    Option<Scalar>,
    timestamp: Option<Scalar>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamTx {
    hash:             Option<String>,
    from_address:     Option<String>,
    to_address:       Option<String>,
    value:            Option<Scalar>,
    gas:              Option<Scalar>,
    receipt_gas_used: Option<Scalar>,
    gas_price:        Option<Scalar>,
    receipt_status:   Option<Scalar>,
    block_number:     Option<Scalar>,
    block_timestamp:  Option<Scalar>,
}

impl StreamTx {
    fn validate(&self, block: Option<&StreamBlock>) -> Result<Record, DataSourceError> {
        let block_number = self
            .block_number
            .as_ref()
            .or_else(|| block.and_then(|b| b.number.as_ref()))
            .ok_or_else(|| DataSourceError::malformed("missing blockNumber"))?;
        let timestamp = self
            .block_timestamp
            .as_ref()
            .or_else(|| block.and_then(|b| b.timestamp.as_ref()))
            .ok_or_else(|| DataSourceError::malformed("missing blockTimestamp"))?;
        Ok(Record {
            hash:         hash(&self.hash)?,
            from:         counterparty(self.from_address.as_deref())?
                .ok_or_else(|| DataSourceError::malformed("missing fromAddress"))?,
            to:           counterparty(self.to_address.as_deref())?,
            value:        required(&self.value, "value")?.quantity()?,
            gas_used:     optional_quantity(self.receipt_gas_used.as_ref().or(self.gas.as_ref()))?,
            gas_price:    optional_quantity(self.gas_price.as_ref())?,
            status:       receipt_status(self.receipt_status.as_ref())?,
            block_number: block_number.small("blockNumber")?,
            timestamp:    timestamp.timestamp()?,
        })
    }
}

/// Normalise one streams delivery.
///
/// `resolve(from, to)` returns the monitored agent a record belongs to, if
/// any. Records no agent claims are counted in `unmatched`.
pub fn moralis_stream<F>(body: Value, resolve: F) -> Result<StreamBatch, DataSourceError>
where
    F: Fn(&Address, Option<&Address>) -> Option<Address>,
{
    let envelope: StreamEnvelope = serde_json::from_value(body)
        .map_err(|e| DataSourceError::malformed(format!("stream envelope: {e}")))?;
    let chain_id = envelope.chain_id.small("chainId")?;
    chain::chain_name(chain_id)?;

    let mut out = StreamBatch {
        chain_id,
        confirmed:    envelope.confirmed,
        transactions: Vec::with_capacity(envelope.txs.len()),
        rejected:     0,
        unmatched:    0,
    };
    for raw in envelope.txs {
        let record = serde_json::from_value::<StreamTx>(raw)
            .map_err(|e| DataSourceError::malformed(e.to_string()))
            .and_then(|tx| tx.validate(envelope.block.as_ref()));
        match record {
            Ok(record) => match resolve(&record.from, record.to.as_ref()) {
                Some(agent) => out.transactions.push(record.attribute(&agent, chain_id)),
                None => out.unmatched += 1,
            },
            Err(e) => {
                tracing::warn!("Rejected stream record: {e}");
                out.rejected += 1;
            }
        }
    }
    sort_newest_first(&mut out.transactions);
    Ok(out)
}

// ============================================================================
// Helpers
// ============================================================================

fn collect<R, F>(records: Vec<Value>, agent: &Address, chain_id: u64, validate: F) -> Batch
where
    R: for<'de> Deserialize<'de>,
    F: Fn(R) -> Result<Record, DataSourceError>,
{
    let mut batch = Batch { transactions: Vec::with_capacity(records.len()), rejected: 0 };
    for raw in records {
        let record = serde_json::from_value::<R>(raw)
            .map_err(|e| DataSourceError::malformed(e.to_string()))
            .and_then(&validate);
        match record {
            Ok(record) => batch.transactions.push(record.attribute(agent, chain_id)),
            Err(e) => {
                tracing::warn!(agent = %agent, "Rejected upstream record: {e}");
                batch.rejected += 1;
            }
        }
    }
    sort_newest_first(&mut batch.transactions);
    batch
}

/// Newest block first; ties broken by timestamp then hash for a stable order.
pub fn sort_newest_first(txs: &mut [Transaction]) {
    txs.sort_by(|a, b| {
        b.block_number
            .cmp(&a.block_number)
            .then(b.timestamp.cmp(&a.timestamp))
            .then_with(|| a.hash.cmp(&b.hash))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const AGENT: &str = "0x00000000000000000000000000000000000000AA";
    const PEER: &str = "0x00000000000000000000000000000000000000bb";

    fn agent() -> Address {
        Address::parse(AGENT).unwrap()
    }

    fn h(i: u8) -> String {
        format!("0x{}", hex_byte(i).repeat(32))
    }

    fn hex_byte(i: u8) -> String {
        format!("{i:02x}")
    }

    // ── scalars ─────────────────────────────────────────────────────────────

    #[test]
    fn quantities_accept_decimal_and_hex() {
        assert_eq!(parse_quantity("1000000000000000000").unwrap(), 1_000_000_000_000_000_000);
        assert_eq!(parse_quantity("0x0de0b6b3a7640000").unwrap(), 1_000_000_000_000_000_000);
        assert_eq!(parse_quantity("0").unwrap(), 0);
        assert!(parse_quantity("").is_err());
        assert!(parse_quantity("0x").is_err());
        assert!(parse_quantity("1.5").is_err());
        assert!(parse_quantity("-1").is_err());
    }

    #[test]
    fn timestamps_accept_seconds_and_rfc3339() {
        assert_eq!(parse_timestamp("1700000000").unwrap(), 1_700_000_000);
        assert_eq!(parse_timestamp("2023-11-14T22:13:20.000Z").unwrap(), 1_700_000_000);
        assert!(parse_timestamp("yesterday").is_err());
        assert!(parse_timestamp("1969-12-31T00:00:00Z").is_err());
    }

    // ── generic shape ───────────────────────────────────────────────────────

    #[test]
    fn generic_records_normalise() {
        let body = json!([{
            "hash": h(1),
            "from": AGENT,
            "to": PEER,
            "value": "1500000000000000000",
            "gas": 21000,
            "gasPrice": "0x3b9aca00",
            "blockNumber": 100,
            "timestampSeconds": 1_700_000_000u64,
            "statusCode": 1,
        }]);
        let batch = generic_activity(body, &agent(), 1).unwrap();
        assert_eq!(batch.rejected, 0);
        let tx = &batch.transactions[0];
        assert_eq!(tx.hash, h(1));
        assert_eq!(tx.agent, "0x00000000000000000000000000000000000000aa");
        assert_eq!(tx.from, "0x00000000000000000000000000000000000000aa");
        assert_eq!(tx.to.as_deref(), Some(PEER));
        assert_eq!(tx.value, 1_500_000_000_000_000_000);
        assert_eq!(tx.gas_used, Some(21_000));
        assert_eq!(tx.gas_price, Some(1_000_000_000));
        assert_eq!(tx.status, TxStatus::Success);
        assert!(!tx.analyzed);
    }

    #[test]
    fn generic_bad_record_is_rejected_not_guessed() {
        let body = json!([
            { "hash": h(1), "from": AGENT, "value": "1", "blockNumber": 1, "timestampSeconds": 1, "statusCode": 0 },
            { "hash": "0x1234", "from": AGENT, "value": "1", "blockNumber": 2, "timestampSeconds": 2 },
            { "hash": h(3), "from": AGENT, "value": "1", "blockNumber": 3 },
            { "hash": h(4), "from": AGENT, "value": "1.2", "blockNumber": 4, "timestampSeconds": 4 },
        ]);
        let batch = generic_activity(body, &agent(), 1).unwrap();
        assert_eq!(batch.transactions.len(), 1);
        assert_eq!(batch.rejected, 3);
        assert_eq!(batch.transactions[0].status, TxStatus::Failed);
        assert_eq!(batch.transactions[0].to, None);
    }

    #[test]
    fn generic_wrong_envelope_fails() {
        assert!(matches!(
            generic_activity(json!({ "result": [] }), &agent(), 1),
            Err(DataSourceError::Malformed(_))
        ));
    }

    // ── Moralis REST ────────────────────────────────────────────────────────

    #[test]
    fn moralis_history_is_sorted_newest_first() {
        let body = json!({
            "cursor": null,
            "result": [
                {
                    "hash": h(1), "from_address": AGENT, "to_address": PEER,
                    "value": "10", "gas": "50000", "receipt_gas_used": "21000",
                    "gas_price": "7", "receipt_status": "1",
                    "block_number": "10", "block_timestamp": "2023-11-14T22:13:20.000Z"
                },
                {
                    "hash": h(2), "from_address": PEER, "to_address": AGENT,
                    "value": "20", "gas": "21000", "gas_price": "7", "receipt_status": "0",
                    "block_number": "12", "block_timestamp": "2023-11-14T22:15:00.000Z"
                }
            ]
        });
        let batch = moralis_activity(body, &agent(), 137).unwrap();
        let hashes: Vec<_> = batch.transactions.iter().map(|t| t.hash.clone()).collect();
        assert_eq!(hashes, vec![h(2), h(1)]);
        assert_eq!(batch.transactions[1].gas_used, Some(21_000));
        assert_eq!(batch.transactions[1].timestamp, 1_700_000_000);
        assert_eq!(batch.transactions[0].status, TxStatus::Failed);
        assert!(batch.transactions.iter().all(|t| t.chain_id == 137));
    }

    #[test]
    fn moralis_missing_timestamp_rejects_record() {
        let body = json!({ "result": [{
            "hash": h(1), "from_address": AGENT, "value": "1",
            "receipt_status": "1", "block_number": "1"
        }]});
        let batch = moralis_activity(body, &agent(), 1).unwrap();
        assert!(batch.transactions.is_empty());
        assert_eq!(batch.rejected, 1);
    }

    #[test]
    fn moralis_without_result_fails() {
        assert!(moralis_activity(json!({ "message": "Invalid key" }), &agent(), 1).is_err());
        assert!(moralis_activity(json!([]), &agent(), 1).is_err());
    }

    // ── streams ─────────────────────────────────────────────────────────────

    fn resolve_agent(from: &Address, to: Option<&Address>) -> Option<Address> {
        let a = agent();
        (from == &a || to == Some(&a)).then_some(a)
    }

    #[test]
    fn stream_attributes_by_either_side() {
        let body = json!({
            "chainId": "0x89",
            "confirmed": true,
            "block": { "number": "500", "timestamp": "1700000000" },
            "txs": [
                { "hash": h(1), "fromAddress": PEER, "toAddress": AGENT, "value": "5", "receiptStatus": "1" },
                { "hash": h(2), "fromAddress": PEER, "toAddress": PEER, "value": "5", "receiptStatus": "1" },
                { "hash": h(3), "fromAddress": AGENT, "value": "oops" }
            ]
        });
        let batch = moralis_stream(body, resolve_agent).unwrap();
        assert_eq!(batch.chain_id, 137);
        assert!(batch.confirmed);
        assert_eq!(batch.transactions.len(), 1);
        assert_eq!(batch.unmatched, 1);
        assert_eq!(batch.rejected, 1);

        let tx = &batch.transactions[0];
        assert_eq!(tx.agent, agent().to_string());
        assert_eq!(tx.block_number, 500);
        assert_eq!(tx.timestamp, 1_700_000_000);
    }

    #[test]
    fn stream_on_unknown_chain_is_rejected_whole() {
        let body = json!({ "chainId": "0xa", "txs": [] });
        assert!(matches!(
            moralis_stream(body, resolve_agent),
            Err(DataSourceError::UnsupportedChain(10))
        ));
        assert!(moralis_stream(json!({ "txs": [] }), resolve_agent).is_err());
    }
}
