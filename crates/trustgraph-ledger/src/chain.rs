//! Supported EVM chains and their provider identifiers.

use crate::error::DataSourceError;

pub const ETHEREUM: u64 = 1;
pub const BSC: u64 = 56;
pub const POLYGON: u64 = 137;
pub const ARBITRUM: u64 = 42161;

pub const SUPPORTED_CHAINS: [u64; 4] = [ETHEREUM, POLYGON, ARBITRUM, BSC];

/// Provider chain name (`?chain=` query value) for `chain_id`.
pub fn chain_name(chain_id: u64) -> Result<&'static str, DataSourceError> {
    match chain_id {
        ETHEREUM => Ok("eth"),
        POLYGON  => Ok("polygon"),
        ARBITRUM => Ok("arbitrum"),
        BSC      => Ok("bsc"),
        other    => Err(DataSourceError::UnsupportedChain(other)),
    }
}

pub fn is_supported(chain_id: u64) -> bool {
    SUPPORTED_CHAINS.contains(&chain_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_chains_map_to_names() {
        assert_eq!(chain_name(1).unwrap(), "eth");
        assert_eq!(chain_name(137).unwrap(), "polygon");
        assert_eq!(chain_name(42161).unwrap(), "arbitrum");
        assert_eq!(chain_name(56).unwrap(), "bsc");
    }

    #[test]
    fn unknown_chain_is_not_defaulted() {
        assert!(matches!(chain_name(10), Err(DataSourceError::UnsupportedChain(10))));
        assert!(!is_supported(0));
    }
}
