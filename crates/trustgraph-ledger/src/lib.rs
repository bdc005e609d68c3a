// trustgraph-ledger: fetches an agent's transaction history from an
// indexing provider and normalises every provider shape into the canonical
// `Transaction` record. Parsers fail closed.

pub mod chain;
pub mod client;
pub mod error;
pub mod normalize;

pub use client::{LedgerClient, LedgerSource, Provider};
pub use error::DataSourceError;
