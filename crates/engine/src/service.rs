//! The operations exposed to transports.
//!
//! Every request names the acting copayer. Mutating operations run under the
//! wallet lock and are bounded by the server execution time; display reads
//! do not take the lock.

use quorum_chains::{ChainRegistry, ChainStateProvider, FeeEstimator, FeeLevelService, TxBlob};
use quorum_storage::{LockManager, WalletStore};
use quorum_types::{
    Address, Chain, Copayer, CopayerId, EngineConfig, ErrorKind, FeeLevel, Network, ProposalId,
    ProposalStatus, Result, TxProposal, Wallet, WalletId,
};
use std::future::Future;
use std::sync::Arc;
use tracing::error;

use crate::addresses::AddressManager;
use crate::proposals::{Balance, FeeSpec, PendingProposal, ProposalEngine, ProposalRequest, Vote};
use crate::selector::SendMaxInfo;
use crate::registry::{authorize, NewCopayer, NewWallet, WalletRegistry};

pub struct WalletService {
    store: Arc<dyn WalletStore>,
    chains: Arc<ChainRegistry>,
    registry: WalletRegistry,
    addresses: Arc<AddressManager>,
    proposals: ProposalEngine,
    fees: Arc<FeeLevelService>,
    locks: LockManager,
}

impl WalletService {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn WalletStore>,
        chains: Arc<ChainRegistry>,
        provider: Arc<dyn ChainStateProvider>,
        estimator: Arc<dyn FeeEstimator>,
        locks: LockManager,
    ) -> Self {
        let fees = Arc::new(FeeLevelService::new(
            chains.clone(),
            estimator,
            config.fees.clone(),
        ));
        let addresses = Arc::new(AddressManager::new(
            store.clone(),
            chains.clone(),
            provider.clone(),
            config.address.clone(),
        ));
        let proposals = ProposalEngine::new(
            store.clone(),
            chains.clone(),
            provider,
            fees.clone(),
            addresses.clone(),
            &config,
        );

        Self {
            registry: WalletRegistry::new(store.clone(), config.max_keys),
            store,
            chains,
            addresses,
            proposals,
            fees,
            locks,
        }
    }

    /// Runs `operation` under the wallet lock, failing with `REQUEST_TIMEOUT`
    /// if the whole request outlives the server execution time.
    async fn locked<T, F>(&self, wallet_id: &WalletId, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let bound = self.locks.config().server_exe_time();
        match tokio::time::timeout(bound, self.locks.with_lock(wallet_id, operation)).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Request exceeded server execution time wallet_id={} limit_secs={}",
                    wallet_id,
                    bound.as_secs()
                );
                Err(ErrorKind::RequestTimeout.into())
            }
        }
    }

    /// Loads a wallet and checks the acting copayer belongs to it.
    async fn member(&self, wallet_id: &WalletId, copayer_id: &CopayerId) -> Result<(Wallet, Copayer)> {
        let wallet = self.registry.get(wallet_id).await?;
        let copayer = authorize(&wallet, copayer_id)?.clone();
        Ok((wallet, copayer))
    }

    async fn complete_member(
        &self,
        wallet_id: &WalletId,
        copayer_id: &CopayerId,
    ) -> Result<(Wallet, Copayer)> {
        let (wallet, copayer) = self.member(wallet_id, copayer_id).await?;
        if !wallet.is_complete() {
            return Err(ErrorKind::WalletNotComplete.into());
        }
        Ok((wallet, copayer))
    }

    // ========================================================================
    // Wallets
    // ========================================================================

    /// Registers a wallet and joins its creator as the first copayer.
    pub async fn create_wallet(
        &self,
        params: NewWallet,
        creator: NewCopayer,
    ) -> Result<(Wallet, Copayer)> {
        self.chains.get(params.chain)?;
        let wallet = self.registry.create(params).await?;
        self.locked(&wallet.id, self.registry.join(&wallet.id, creator))
            .await
    }

    pub async fn join_wallet(
        &self,
        wallet_id: &WalletId,
        copayer: NewCopayer,
    ) -> Result<(Wallet, Copayer)> {
        self.locked(wallet_id, self.registry.join(wallet_id, copayer))
            .await
    }

    pub async fn get_wallet(&self, wallet_id: &WalletId, copayer_id: &CopayerId) -> Result<Wallet> {
        let (wallet, _) = self.member(wallet_id, copayer_id).await?;
        Ok(wallet)
    }

    // ========================================================================
    // Addresses
    // ========================================================================

    pub async fn derive_address(
        &self,
        wallet_id: &WalletId,
        copayer_id: &CopayerId,
        ignore_max_gap: bool,
    ) -> Result<Address> {
        self.locked(wallet_id, async {
            let (wallet, _) = self.complete_member(wallet_id, copayer_id).await?;
            self.addresses
                .derive_next(&wallet, false, ignore_max_gap)
                .await
        })
        .await
    }

    pub async fn get_addresses(
        &self,
        wallet_id: &WalletId,
        copayer_id: &CopayerId,
    ) -> Result<Vec<Address>> {
        let (wallet, _) = self.member(wallet_id, copayer_id).await?;
        self.addresses.list(&wallet, None).await
    }

    // ========================================================================
    // Proposals
    // ========================================================================

    pub async fn create_proposal(
        &self,
        wallet_id: &WalletId,
        copayer_id: &CopayerId,
        request: ProposalRequest,
    ) -> Result<TxProposal> {
        self.locked(wallet_id, async {
            let (wallet, copayer) = self.complete_member(wallet_id, copayer_id).await?;
            self.proposals.create(&wallet, &copayer, request).await
        })
        .await
    }

    pub async fn publish_proposal(
        &self,
        wallet_id: &WalletId,
        copayer_id: &CopayerId,
        proposal_id: &ProposalId,
        proposal_signature: &str,
    ) -> Result<TxProposal> {
        self.locked(wallet_id, async {
            let (wallet, copayer) = self.complete_member(wallet_id, copayer_id).await?;
            self.proposals
                .publish(&wallet, &copayer, proposal_id, proposal_signature)
                .await
        })
        .await
    }

    pub async fn vote_proposal(
        &self,
        wallet_id: &WalletId,
        copayer_id: &CopayerId,
        proposal_id: &ProposalId,
        vote: Vote,
    ) -> Result<TxProposal> {
        self.locked(wallet_id, async {
            let (wallet, copayer) = self.complete_member(wallet_id, copayer_id).await?;
            self.proposals
                .vote(&wallet, &copayer, proposal_id, vote)
                .await
        })
        .await
    }

    pub async fn broadcast_proposal(
        &self,
        wallet_id: &WalletId,
        copayer_id: &CopayerId,
        proposal_id: &ProposalId,
    ) -> Result<TxProposal> {
        self.locked(wallet_id, async {
            let (wallet, _) = self.complete_member(wallet_id, copayer_id).await?;
            self.proposals.broadcast(&wallet, proposal_id).await
        })
        .await
    }

    pub async fn remove_proposal(
        &self,
        wallet_id: &WalletId,
        copayer_id: &CopayerId,
        proposal_id: &ProposalId,
    ) -> Result<()> {
        self.locked(wallet_id, async {
            let (wallet, _) = self.complete_member(wallet_id, copayer_id).await?;
            self.proposals.remove(&wallet, proposal_id).await
        })
        .await
    }

    /// Proposals of a wallet, optionally filtered by status, oldest first.
    pub async fn get_proposals(
        &self,
        wallet_id: &WalletId,
        copayer_id: &CopayerId,
        status: Option<ProposalStatus>,
    ) -> Result<Vec<TxProposal>> {
        let (wallet, _) = self.member(wallet_id, copayer_id).await?;
        self.proposals.list(&wallet, status).await
    }

    /// Pending and accepted proposals with their remaining delete lock time.
    pub async fn get_pending_proposals(
        &self,
        wallet_id: &WalletId,
        copayer_id: &CopayerId,
    ) -> Result<Vec<PendingProposal>> {
        let (wallet, _) = self.member(wallet_id, copayer_id).await?;
        self.proposals.list_pending(&wallet).await
    }

    pub async fn get_proposal(
        &self,
        wallet_id: &WalletId,
        copayer_id: &CopayerId,
        proposal_id: &ProposalId,
    ) -> Result<TxProposal> {
        let (wallet, _) = self.member(wallet_id, copayer_id).await?;
        self.proposals.get(&wallet, proposal_id).await
    }

    /// What a copayer signs to accept (slots) or publish (the whole blob).
    pub async fn get_signing_blob(
        &self,
        wallet_id: &WalletId,
        copayer_id: &CopayerId,
        proposal_id: &ProposalId,
    ) -> Result<TxBlob> {
        let (wallet, _) = self.complete_member(wallet_id, copayer_id).await?;
        let proposal = self.proposals.get(&wallet, proposal_id).await?;
        self.proposals.signing_blob(&wallet, &proposal)
    }

    // ========================================================================
    // Fees and confirmations
    // ========================================================================

    /// Total, reserved and available funds. Reads without the wallet lock.
    pub async fn get_balance(&self, wallet_id: &WalletId, copayer_id: &CopayerId) -> Result<Balance> {
        let (wallet, _) = self.member(wallet_id, copayer_id).await?;
        self.proposals.balance(&wallet).await
    }

    pub async fn get_send_max_info(
        &self,
        wallet_id: &WalletId,
        copayer_id: &CopayerId,
        fee: FeeSpec,
        exclude_unconfirmed: bool,
    ) -> Result<SendMaxInfo> {
        let (wallet, _) = self.complete_member(wallet_id, copayer_id).await?;
        self.proposals
            .send_max(&wallet, fee, exclude_unconfirmed)
            .await
    }

    pub async fn get_fee_levels(&self, chain: Chain, network: Network) -> Result<Vec<FeeLevel>> {
        self.fees.get_fee_levels(chain, network).await
    }

    /// Confirms the wallet's broadcast proposals that have been mined.
    pub async fn refresh_confirmations(&self, wallet_id: &WalletId) -> Result<usize> {
        self.locked(wallet_id, async {
            let wallet = self.registry.get(wallet_id).await?;
            self.proposals.refresh_confirmations(&wallet).await
        })
        .await
    }

    /// Wallets that have proposals waiting for confirmation.
    pub async fn wallets_awaiting_confirmation(&self) -> Result<Vec<WalletId>> {
        let mut wallet_ids: Vec<WalletId> = self
            .store
            .fetch_proposals_by_status(ProposalStatus::Broadcast)
            .await?
            .into_iter()
            .map(|p| p.wallet_id)
            .collect();
        wallet_ids.sort();
        wallet_ids.dedup();
        Ok(wallet_ids)
    }
}
