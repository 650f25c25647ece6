//! Chain state lookups the engine depends on but does not implement.

use async_trait::async_trait;
use quorum_types::{Chain, Coin, Network, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountState {
    pub nonce: u64,
    pub balance: u64,
}

/// Indexer-backed view of a ledger. Failures are reported with
/// `ErrorKind::ChainProvider` and are retryable.
#[async_trait]
pub trait ChainStateProvider: Send + Sync {
    /// Unspent coins held by any of `addresses`.
    async fn get_candidate_coins(
        &self,
        chain: Chain,
        network: Network,
        addresses: &[String],
    ) -> Result<Vec<Coin>>;

    async fn get_nonce_and_balance(
        &self,
        chain: Chain,
        network: Network,
        address: &str,
    ) -> Result<AccountState>;

    /// Submits a signed transaction and returns its txid.
    async fn broadcast(&self, chain: Chain, network: Network, signed_tx: &str) -> Result<String>;

    /// Confirmations of something mined at `mint_height` (`None` = mempool).
    async fn get_confirmations(
        &self,
        chain: Chain,
        network: Network,
        mint_height: Option<u64>,
    ) -> Result<u32>;

    /// Height the transaction was mined at, if mined.
    async fn get_tx_height(&self, chain: Chain, network: Network, txid: &str)
        -> Result<Option<u64>>;
}

/// Confirmations at `tip` for something mined at `mint_height`.
pub fn confirmations_at(tip: u64, mint_height: Option<u64>) -> u32 {
    match mint_height {
        Some(height) if height <= tip => u32::try_from(tip - height + 1).unwrap_or(u32::MAX),
        _ => 0,
    }
}

/// Fee rate estimates per confirmation target.
#[async_trait]
pub trait FeeEstimator: Send + Sync {
    /// Maps each requested nb-blocks target to a fee per kb; negative values
    /// mean no estimate is available for that target.
    async fn estimate(
        &self,
        chain: Chain,
        network: Network,
        nb_blocks: &[u32],
    ) -> Result<HashMap<u32, i64>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmations_at() {
        assert_eq!(confirmations_at(100, None), 0);
        assert_eq!(confirmations_at(100, Some(100)), 1);
        assert_eq!(confirmations_at(100, Some(95)), 6);
        assert_eq!(confirmations_at(100, Some(101)), 0);
    }
}
