//! Chain adapters and the external chain interfaces the engine consumes.
//!
//! - [`adapter`]: the `ChainAdapter` contract and `ChainRegistry`
//! - [`utxo`]: Bitcoin-family P2WSH multisig
//! - [`account`]: Ethereum-family nonce accounts
//! - [`provider`]: `ChainStateProvider` and `FeeEstimator`
//! - [`fees`]: fee level computation

pub mod account;
pub mod adapter;
pub mod fees;
pub mod provider;
pub mod utxo;

pub use account::AccountChainAdapter;
pub use adapter::*;
pub use fees::FeeLevelService;
pub use provider::{confirmations_at, AccountState, ChainStateProvider, FeeEstimator};
pub use utxo::UtxoChainAdapter;
