//! Persistence and wallet-scoped locking.
//!
//! [`WalletStore`] holds the four durable collections: wallets (with their
//! copayers), addresses, proposals (with their actions) and rejection
//! counters. [`LockManager`] serializes mutating operations per wallet.

pub mod etcd_lock;
pub mod lock;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use quorum_types::{
    Address, CopayerId, ProposalId, ProposalStatus, RejectionCounter, Result, TxProposal, Wallet,
    WalletId,
};

pub use etcd_lock::EtcdLockBackend;
pub use lock::{LocalLockBackend, LockBackend, LockManager};
pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn store_wallet(&self, wallet: &Wallet) -> Result<()>;

    async fn fetch_wallet(&self, wallet_id: &WalletId) -> Result<Option<Wallet>>;

    async fn list_wallets(&self) -> Result<Vec<Wallet>>;

    /// Inserts or replaces an address, keyed by (wallet, address string).
    async fn store_address(&self, address: &Address) -> Result<()>;

    /// All addresses of a wallet ordered by path (receive branch first).
    async fn fetch_addresses(&self, wallet_id: &WalletId) -> Result<Vec<Address>>;

    async fn store_proposal(&self, proposal: &TxProposal) -> Result<()>;

    async fn fetch_proposal(
        &self,
        wallet_id: &WalletId,
        proposal_id: &ProposalId,
    ) -> Result<Option<TxProposal>>;

    /// Proposals of a wallet, oldest first, optionally filtered by status.
    async fn fetch_proposals(
        &self,
        wallet_id: &WalletId,
        status: Option<ProposalStatus>,
    ) -> Result<Vec<TxProposal>>;

    /// Proposals in `status` across every wallet, oldest first.
    async fn fetch_proposals_by_status(&self, status: ProposalStatus) -> Result<Vec<TxProposal>>;

    async fn remove_proposal(&self, wallet_id: &WalletId, proposal_id: &ProposalId) -> Result<()>;

    async fn fetch_rejection_counter(
        &self,
        wallet_id: &WalletId,
        copayer_id: &CopayerId,
    ) -> Result<Option<RejectionCounter>>;

    async fn store_rejection_counter(&self, counter: &RejectionCounter) -> Result<()>;
}
