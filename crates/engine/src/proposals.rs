//! Transaction proposals: creation, publication, voting, broadcast and
//! removal.
//!
//! Callers hold the wallet lock around every mutating operation; nothing
//! here is persisted until all chain lookups for the operation succeeded.

use chrono::{Duration, Utc};
use quorum_chains::{
    AccountState, ChainAdapter, ChainRegistry, ChainStateProvider, FeeLevelService, SignatureSet,
    TxBlob, TxPlan, WalletKeys,
};
use quorum_crypto::{parse_public_key, verify_digest};
use quorum_storage::WalletStore;
use quorum_types::{
    Action, ActionType, Address, Coin, Copayer, CopayerId, DerivationPath, EngineConfig,
    ErrorKind, FeeLevelName, ProposalConfig, ProposalId, ProposalStatus, RejectionCounter, Result,
    TxOutput, TxProposal, Wallet, WalletError,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::addresses::AddressManager;
use crate::fsm::ProposalFsm;
use crate::registry::authorize;
use crate::selector::{SendMaxInfo, UtxoSelector};

/// How the fee rate of a new proposal is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FeeSpec {
    Level(FeeLevelName),
    PerKb(u64),
}

impl Default for FeeSpec {
    fn default() -> Self {
        FeeSpec::Level(FeeLevelName::Normal)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateOptions {
    /// Persist as `temporary`; drafts do not reserve coins until published.
    #[serde(default)]
    pub draft: bool,
    /// Compute the proposal without persisting anything.
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub exclude_unconfirmed: bool,
    #[serde(default)]
    pub message: Option<String>,
    /// An existing wallet address to receive change.
    #[serde(default)]
    pub change_address: Option<String>,
    /// Client-chosen id; retrying with the same id returns the stored proposal.
    #[serde(default)]
    pub proposal_id: Option<ProposalId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalRequest {
    pub outputs: Vec<TxOutput>,
    #[serde(default)]
    pub fee: FeeSpec,
    #[serde(default)]
    pub options: CreateOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub action: ActionType,
    /// One signature per signing slot; empty for rejections.
    #[serde(default)]
    pub signatures: Vec<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

/// An outstanding proposal and the seconds left before it may be removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingProposal {
    pub proposal: TxProposal,
    pub delete_lock_secs: i64,
}

/// `txid:vout` of every coin reserved by an outstanding proposal.
fn locked_coins(outstanding: &[TxProposal]) -> HashSet<String> {
    outstanding
        .iter()
        .flat_map(|p| p.inputs.iter().map(Coin::key))
        .collect()
}

/// Amount plus fee promised by outstanding account-chain proposals.
fn reserved_amount(outstanding: &[TxProposal]) -> u64 {
    outstanding
        .iter()
        .map(|p| p.total_amount().saturating_add(p.fee))
        .sum()
}

/// Spendable funds of one wallet address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressBalance {
    pub address: String,
    pub path: Option<DerivationPath>,
    pub amount: u64,
}

/// Spendable funds, split by whether outstanding proposals reserve them.
/// Coins that are not yet spendable are left out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub total_amount: u64,
    pub locked_amount: u64,
    pub available_amount: u64,
    pub total_confirmed_amount: u64,
    pub locked_confirmed_amount: u64,
    pub available_confirmed_amount: u64,
    pub by_address: Vec<AddressBalance>,
}

impl Balance {
    fn from_coins(coins: &[Coin], locked: &HashSet<String>) -> Self {
        let mut balance = Balance::default();
        let mut by_address: BTreeMap<&str, AddressBalance> = BTreeMap::new();
        for coin in coins.iter().filter(|c| c.spendable) {
            let is_locked = locked.contains(&coin.key());
            balance.total_amount += coin.amount;
            if is_locked {
                balance.locked_amount += coin.amount;
            }
            if coin.confirmations > 0 {
                balance.total_confirmed_amount += coin.amount;
                if is_locked {
                    balance.locked_confirmed_amount += coin.amount;
                }
            }
            by_address
                .entry(coin.address.as_str())
                .or_insert_with(|| AddressBalance {
                    address: coin.address.clone(),
                    path: coin.path,
                    amount: 0,
                })
                .amount += coin.amount;
        }
        balance.available_amount = balance.total_amount - balance.locked_amount;
        balance.available_confirmed_amount =
            balance.total_confirmed_amount - balance.locked_confirmed_amount;
        balance.by_address = by_address.into_values().collect();
        balance
    }
}

fn bad_signatures() -> WalletError {
    WalletError::new(ErrorKind::ServerCompromised, "bad signatures")
}

pub struct ProposalEngine {
    store: Arc<dyn WalletStore>,
    chains: Arc<ChainRegistry>,
    provider: Arc<dyn ChainStateProvider>,
    fees: Arc<FeeLevelService>,
    addresses: Arc<AddressManager>,
    selector: UtxoSelector,
    config: ProposalConfig,
}

impl ProposalEngine {
    pub fn new(
        store: Arc<dyn WalletStore>,
        chains: Arc<ChainRegistry>,
        provider: Arc<dyn ChainStateProvider>,
        fees: Arc<FeeLevelService>,
        addresses: Arc<AddressManager>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            chains,
            provider,
            fees,
            addresses,
            selector: UtxoSelector::new(config.selection.clone()),
            config: config.proposal.clone(),
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn get(&self, wallet: &Wallet, proposal_id: &ProposalId) -> Result<TxProposal> {
        self.store
            .fetch_proposal(&wallet.id, proposal_id)
            .await?
            .ok_or_else(|| ErrorKind::TxNotFound.into())
    }

    pub async fn list(
        &self,
        wallet: &Wallet,
        status: Option<ProposalStatus>,
    ) -> Result<Vec<TxProposal>> {
        self.store.fetch_proposals(&wallet.id, status).await
    }

    /// Pending and accepted proposals, oldest first.
    pub async fn list_pending(&self, wallet: &Wallet) -> Result<Vec<PendingProposal>> {
        Ok(self
            .outstanding(wallet)
            .await?
            .into_iter()
            .map(|proposal| PendingProposal {
                delete_lock_secs: self.delete_lock_remaining(&proposal),
                proposal,
            })
            .collect())
    }

    /// Seconds until `proposal` may be removed.
    pub fn delete_lock_remaining(&self, proposal: &TxProposal) -> i64 {
        let unlock = proposal.created_on + Duration::seconds(self.config.delete_locktime_secs);
        (unlock - Utc::now()).num_seconds().max(0)
    }

    /// The unsigned transaction copayers sign to accept `proposal`.
    pub fn signing_blob(&self, wallet: &Wallet, proposal: &TxProposal) -> Result<TxBlob> {
        let (_, _, blob) = self.unsigned_tx(wallet, proposal)?;
        Ok(blob)
    }

    async fn outstanding(&self, wallet: &Wallet) -> Result<Vec<TxProposal>> {
        Ok(self
            .store
            .fetch_proposals(&wallet.id, None)
            .await?
            .into_iter()
            .filter(TxProposal::is_outstanding)
            .collect())
    }

    fn unsigned_tx(
        &self,
        wallet: &Wallet,
        proposal: &TxProposal,
    ) -> Result<(Arc<dyn ChainAdapter>, WalletKeys, TxBlob)> {
        let adapter = self.chains.get(proposal.chain)?;
        let keys = WalletKeys::from_wallet(wallet)?;
        let blob = adapter.build_unsigned_tx(&keys, &TxPlan::from_proposal(proposal))?;
        Ok((adapter, keys, blob))
    }

    // ========================================================================
    // Create
    // ========================================================================

    pub async fn create(
        &self,
        wallet: &Wallet,
        creator: &Copayer,
        request: ProposalRequest,
    ) -> Result<TxProposal> {
        if !wallet.is_complete() {
            return Err(ErrorKind::WalletNotComplete.into());
        }
        let ProposalRequest {
            outputs,
            fee,
            options,
        } = request;

        if let Some(id) = &options.proposal_id {
            if let Some(existing) = self.store.fetch_proposal(&wallet.id, id).await? {
                debug!("Proposal already exists proposal_id={}", id);
                return Ok(existing);
            }
        }

        let adapter = self.chains.get(wallet.chain)?;
        Self::validate_outputs(adapter.as_ref(), wallet, &outputs)?;
        self.check_backoff(wallet, &creator.id).await?;

        let (fee_level, fee_per_kb) = self.resolve_fee(wallet, fee).await?;

        let mut proposal = TxProposal {
            id: options.proposal_id.clone().unwrap_or_else(ProposalId::generate),
            wallet_id: wallet.id.clone(),
            chain: wallet.chain,
            network: wallet.network,
            creator_id: creator.id.clone(),
            outputs,
            inputs: Vec::new(),
            change_address: None,
            nonce: None,
            from_address: None,
            fee: 0,
            fee_level,
            fee_per_kb,
            status: if options.draft {
                ProposalStatus::Temporary
            } else {
                ProposalStatus::Pending
            },
            created_on: Utc::now(),
            actions: Vec::new(),
            required_signatures: wallet.m,
            wallet_n: wallet.n,
            message: options.message.clone(),
            proposal_signature: None,
            txid: None,
            broadcast_on: None,
            exclude_unconfirmed: options.exclude_unconfirmed,
        };

        let outstanding = self.outstanding(wallet).await?;
        let mut change_amount = 0;
        if adapter.is_utxo_based() {
            change_amount = self
                .select_inputs(adapter.as_ref(), wallet, &mut proposal, &outstanding)
                .await?;
            if change_amount > 0 {
                if let Some(requested) = &options.change_address {
                    proposal.change_address = Some(self.owned_address(wallet, requested).await?);
                }
            }
        } else {
            self.assign_nonce(adapter.as_ref(), wallet, &mut proposal, &outstanding)
                .await?;
        }

        if options.dry_run {
            debug!(
                "Dry-run proposal wallet_id={} fee={} inputs={}",
                wallet.id,
                proposal.fee,
                proposal.inputs.len()
            );
            return Ok(proposal);
        }

        if change_amount > 0 && proposal.change_address.is_none() {
            proposal.change_address = Some(self.addresses.derive_next(wallet, true, true).await?);
        }
        self.unsigned_tx(wallet, &proposal)?;

        if let Some(change) = proposal.change_address.as_mut() {
            if !change.has_activity {
                change.has_activity = true;
                self.store.store_address(change).await?;
            }
        }
        self.store.store_proposal(&proposal).await?;

        info!(
            "Created proposal wallet_id={} proposal_id={} status={} amount={} fee={} inputs={}",
            wallet.id,
            proposal.id,
            proposal.status,
            proposal.total_amount(),
            proposal.fee,
            proposal.inputs.len()
        );
        Ok(proposal)
    }

    async fn resolve_fee(&self, wallet: &Wallet, fee: FeeSpec) -> Result<(Option<FeeLevelName>, u64)> {
        let (level, fee_per_kb) = match fee {
            FeeSpec::Level(level) => (
                Some(level),
                self.fees
                    .fee_per_kb(wallet.chain, wallet.network, level)
                    .await?,
            ),
            FeeSpec::PerKb(value) => (None, value),
        };
        if fee_per_kb == 0 {
            return Err(WalletError::invalid_request("Fee per kb must be positive"));
        }
        Ok((level, fee_per_kb))
    }

    fn validate_outputs(adapter: &dyn ChainAdapter, wallet: &Wallet, outputs: &[TxOutput]) -> Result<()> {
        if outputs.is_empty() {
            return Err(WalletError::invalid_request("No outputs were specified"));
        }
        for output in outputs {
            if !adapter.validate_address(&output.to_address, wallet.network) {
                return Err(WalletError::new(
                    ErrorKind::InvalidAddress,
                    format!("Invalid address {}", output.to_address),
                ));
            }
            if output.amount == 0 {
                return Err(WalletError::invalid_request("Invalid amount"));
            }
            if output.amount < adapter.dust_threshold() {
                return Err(WalletError::new(
                    ErrorKind::DustAmount,
                    format!(
                        "Amount {} is below the dust threshold {}",
                        output.amount,
                        adapter.dust_threshold()
                    ),
                ));
            }
        }
        Ok(())
    }

    async fn check_backoff(&self, wallet: &Wallet, creator_id: &CopayerId) -> Result<()> {
        let Some(counter) = self
            .store
            .fetch_rejection_counter(&wallet.id, creator_id)
            .await?
        else {
            return Ok(());
        };
        if counter.count <= self.config.backoff_offset {
            return Ok(());
        }
        let elapsed = Utc::now() - counter.last_rejection_on;
        if elapsed < Duration::seconds(self.config.backoff_time_secs) {
            warn!(
                "Proposal creation in backoff wallet_id={} copayer_id={} rejections={}",
                wallet.id, creator_id, counter.count
            );
            return Err(ErrorKind::TxCannotCreate.into());
        }
        Ok(())
    }

    /// Coins held by the wallet's addresses, with paths and confirmations.
    async fn wallet_coins(&self, wallet: &Wallet) -> Result<Vec<Coin>> {
        let paths: HashMap<String, DerivationPath> = self
            .addresses
            .list(wallet, None)
            .await?
            .into_iter()
            .map(|a| (a.address, a.path))
            .collect();
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        let addresses: Vec<String> = paths.keys().cloned().collect();

        let mut coins = self
            .provider
            .get_candidate_coins(wallet.chain, wallet.network, &addresses)
            .await?;
        coins.retain(|c| paths.contains_key(&c.address));

        let mut confirmations: HashMap<Option<u64>, u32> = HashMap::new();
        for coin in coins.iter_mut() {
            coin.path = paths.get(&coin.address).copied();
            coin.confirmations = match confirmations.get(&coin.mint_height) {
                Some(count) => *count,
                None => {
                    let count = self
                        .provider
                        .get_confirmations(wallet.chain, wallet.network, coin.mint_height)
                        .await?;
                    confirmations.insert(coin.mint_height, count);
                    count
                }
            };
        }
        Ok(coins)
    }

    /// Fills inputs and fee; returns the change amount.
    async fn select_inputs(
        &self,
        adapter: &dyn ChainAdapter,
        wallet: &Wallet,
        proposal: &mut TxProposal,
        outstanding: &[TxProposal],
    ) -> Result<u64> {
        let coins = self.wallet_coins(wallet).await?;
        let locked = locked_coins(outstanding);
        let model = adapter.fee_model(wallet.quorum(), proposal.outputs.len(), proposal.fee_per_kb);

        let selection = self.selector.select_inputs(
            &coins,
            &locked,
            proposal.total_amount(),
            &model,
            proposal.exclude_unconfirmed,
        )?;
        proposal.inputs = selection.inputs;
        proposal.fee = selection.fee;
        Ok(selection.change)
    }

    async fn owned_address(&self, wallet: &Wallet, address: &str) -> Result<Address> {
        self.addresses
            .list(wallet, None)
            .await?
            .into_iter()
            .find(|a| a.address == address)
            .ok_or_else(|| {
                WalletError::new(
                    ErrorKind::InvalidChangeAddress,
                    format!("Change address {} does not belong to the wallet", address),
                )
            })
    }

    /// Account chains: picks the next free nonce and checks the balance
    /// against what outstanding proposals already spend.
    async fn assign_nonce(
        &self,
        adapter: &dyn ChainAdapter,
        wallet: &Wallet,
        proposal: &mut TxProposal,
        outstanding: &[TxProposal],
    ) -> Result<()> {
        let (from, state) = self.account_state(adapter, wallet).await?;

        // Broadcast transfers may not be mined yet, so the provider's nonce
        // can still lag behind them.
        let in_flight = self
            .store
            .fetch_proposals(&wallet.id, Some(ProposalStatus::Broadcast))
            .await?;
        let next_free = outstanding
            .iter()
            .chain(in_flight.iter())
            .filter_map(|p| p.nonce.map(|n| n + p.outputs.len() as u64))
            .max()
            .unwrap_or(0);
        let reserved = reserved_amount(outstanding);

        let amount = proposal.total_amount();
        let fee = adapter.estimate_fee(wallet.quorum(), 0, proposal.outputs.len(), proposal.fee_per_kb);
        let available = state.balance.saturating_sub(reserved);

        if state.balance < amount {
            return Err(WalletError::new(
                ErrorKind::InsufficientFunds,
                format!("Insufficient funds: have {}, need {}", state.balance, amount),
            ));
        }
        if available < amount {
            return Err(ErrorKind::LockedFunds.into());
        }
        if available < amount.saturating_add(fee) {
            return Err(ErrorKind::InsufficientFundsForFee.into());
        }

        proposal.nonce = Some(state.nonce.max(next_free));
        proposal.from_address = Some(from);
        proposal.fee = fee;
        Ok(())
    }

    async fn account_state(
        &self,
        adapter: &dyn ChainAdapter,
        wallet: &Wallet,
    ) -> Result<(String, AccountState)> {
        let keys = WalletKeys::from_wallet(wallet)?;
        let from = adapter.derive_address(&keys, &DerivationPath::new(false, 0))?;
        let state = self
            .provider
            .get_nonce_and_balance(wallet.chain, wallet.network, &from)
            .await?;
        Ok((from, state))
    }

    // ========================================================================
    // Balance
    // ========================================================================

    /// Funds held by the wallet and how much of them outstanding proposals
    /// have reserved.
    pub async fn balance(&self, wallet: &Wallet) -> Result<Balance> {
        if !wallet.is_complete() {
            return Ok(Balance::default());
        }
        let adapter = self.chains.get(wallet.chain)?;
        let outstanding = self.outstanding(wallet).await?;

        if !adapter.is_utxo_based() {
            let (from, state) = self.account_state(adapter.as_ref(), wallet).await?;
            let locked = reserved_amount(&outstanding).min(state.balance);
            return Ok(Balance {
                total_amount: state.balance,
                locked_amount: locked,
                available_amount: state.balance - locked,
                total_confirmed_amount: state.balance,
                locked_confirmed_amount: locked,
                available_confirmed_amount: state.balance - locked,
                by_address: vec![AddressBalance {
                    address: from,
                    path: Some(DerivationPath::new(false, 0)),
                    amount: state.balance,
                }],
            });
        }

        let coins = self.wallet_coins(wallet).await?;
        Ok(Balance::from_coins(&coins, &locked_coins(&outstanding)))
    }

    /// The largest single-output amount the wallet can send right now.
    pub async fn send_max(
        &self,
        wallet: &Wallet,
        fee: FeeSpec,
        exclude_unconfirmed: bool,
    ) -> Result<SendMaxInfo> {
        if !wallet.is_complete() {
            return Err(ErrorKind::WalletNotComplete.into());
        }
        let adapter = self.chains.get(wallet.chain)?;
        let (_, fee_per_kb) = self.resolve_fee(wallet, fee).await?;
        let outstanding = self.outstanding(wallet).await?;

        if !adapter.is_utxo_based() {
            let (_, state) = self.account_state(adapter.as_ref(), wallet).await?;
            let available = state.balance.saturating_sub(reserved_amount(&outstanding));
            let fee = adapter.estimate_fee(wallet.quorum(), 0, 1, fee_per_kb);
            let amount = available.saturating_sub(fee);
            if amount == 0 || amount < adapter.dust_threshold() {
                return Ok(SendMaxInfo {
                    fee_per_kb,
                    ..Default::default()
                });
            }
            return Ok(SendMaxInfo {
                amount,
                fee,
                fee_per_kb,
                ..Default::default()
            });
        }

        let coins = self.wallet_coins(wallet).await?;
        let model = adapter.fee_model(wallet.quorum(), 1, fee_per_kb);
        let info = self.selector.send_max(
            &coins,
            &locked_coins(&outstanding),
            &model,
            exclude_unconfirmed,
        );
        debug!(
            "Send max wallet_id={} amount={} fee={} inputs={}",
            wallet.id,
            info.amount,
            info.fee,
            info.inputs.len()
        );
        Ok(info)
    }

    // ========================================================================
    // Publish
    // ========================================================================

    pub async fn publish(
        &self,
        wallet: &Wallet,
        copayer: &Copayer,
        proposal_id: &ProposalId,
        proposal_signature: &str,
    ) -> Result<TxProposal> {
        let mut proposal = self.get(wallet, proposal_id).await?;
        if proposal.status != ProposalStatus::Temporary {
            debug!("Proposal already published proposal_id={}", proposal.id);
            return Ok(proposal);
        }
        if proposal.creator_id != copayer.id {
            return Err(WalletError::new(
                ErrorKind::NotAuthorized,
                "Only the creator can publish a proposal",
            ));
        }

        let (adapter, _, blob) = self.unsigned_tx(wallet, &proposal)?;
        let request_key = parse_public_key(&copayer.request_pub_key)?;
        if !verify_digest(&request_key, blob.proposal_digest(), proposal_signature) {
            return Err(WalletError::new(
                ErrorKind::NotAuthorized,
                "Invalid proposal signature",
            ));
        }

        self.ensure_inputs_available(adapter.as_ref(), wallet, &proposal)
            .await?;

        let mut fsm = ProposalFsm::new(proposal.id.clone(), proposal.status);
        proposal.status = fsm.publish()?;
        proposal.proposal_signature = Some(proposal_signature.to_string());
        self.store.store_proposal(&proposal).await?;

        info!(
            "Published proposal wallet_id={} proposal_id={}",
            wallet.id, proposal.id
        );
        Ok(proposal)
    }

    /// Drafts do not reserve anything, so their inputs (or nonces) may have
    /// been taken or spent since creation.
    async fn ensure_inputs_available(
        &self,
        adapter: &dyn ChainAdapter,
        wallet: &Wallet,
        proposal: &TxProposal,
    ) -> Result<()> {
        let others: Vec<TxProposal> = self
            .outstanding(wallet)
            .await?
            .into_iter()
            .filter(|p| p.id != proposal.id)
            .collect();

        if adapter.is_utxo_based() {
            let locked = locked_coins(&others);
            let addresses: Vec<String> = proposal
                .inputs
                .iter()
                .map(|c| c.address.clone())
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            let current: HashSet<String> = self
                .provider
                .get_candidate_coins(wallet.chain, wallet.network, &addresses)
                .await?
                .iter()
                .map(Coin::key)
                .collect();

            let unavailable = proposal
                .inputs
                .iter()
                .filter(|c| locked.contains(&c.key()) || !current.contains(&c.key()))
                .count();
            if unavailable > 0 {
                warn!(
                    "Proposal inputs unavailable proposal_id={} count={}",
                    proposal.id, unavailable
                );
                return Err(ErrorKind::UnavailableUtxos.into());
            }
        } else if let Some(nonce) = proposal.nonce {
            let end = nonce + proposal.outputs.len() as u64;
            let clash = others.iter().any(|p| match p.nonce {
                Some(n) => n < end && nonce < n + p.outputs.len() as u64,
                None => false,
            });
            if clash {
                return Err(WalletError::new(
                    ErrorKind::UnavailableUtxos,
                    format!("Nonce {} is already used by another proposal", nonce),
                ));
            }
        }
        Ok(())
    }

    // ========================================================================
    // Vote
    // ========================================================================

    pub async fn vote(
        &self,
        wallet: &Wallet,
        copayer: &Copayer,
        proposal_id: &ProposalId,
        vote: Vote,
    ) -> Result<TxProposal> {
        let mut proposal = self.get(wallet, proposal_id).await?;
        if proposal.has_voted(&copayer.id) {
            return Err(ErrorKind::CopayerVoted.into());
        }
        if proposal.status != ProposalStatus::Pending {
            return Err(ErrorKind::TxNotPending.into());
        }

        let mut fsm = ProposalFsm::new(proposal.id.clone(), proposal.status);
        let signatures = match vote.action {
            ActionType::Accept => {
                self.verify_vote_signatures(wallet, copayer, &proposal, &vote.signatures)?;
                vote.signatures
            }
            ActionType::Reject => Vec::new(),
        };
        proposal.actions.push(Action {
            copayer_id: copayer.id.clone(),
            action_type: vote.action,
            comment: vote.comment,
            signatures,
            created_on: Utc::now(),
        });

        match vote.action {
            ActionType::Accept => {
                if proposal.accept_count() >= proposal.required_signatures {
                    proposal.status = fsm.accept()?;
                }
            }
            ActionType::Reject => {
                let remaining = proposal.wallet_n.saturating_sub(proposal.reject_count());
                if remaining < proposal.required_signatures {
                    proposal.status = fsm.reject()?;
                }
            }
        }
        self.store.store_proposal(&proposal).await?;

        match vote.action {
            ActionType::Accept if proposal.status == ProposalStatus::Accepted => {
                self.reset_rejections(wallet, &proposal.creator_id).await?;
            }
            ActionType::Reject => {
                self.record_rejection(wallet, &proposal.creator_id).await?;
            }
            _ => {}
        }

        info!(
            "Vote recorded wallet_id={} proposal_id={} copayer_id={} action={:?} accepts={} rejects={} status={}",
            wallet.id,
            proposal.id,
            copayer.id,
            vote.action,
            proposal.accept_count(),
            proposal.reject_count(),
            proposal.status
        );
        Ok(proposal)
    }

    fn verify_vote_signatures(
        &self,
        wallet: &Wallet,
        copayer: &Copayer,
        proposal: &TxProposal,
        signatures: &[String],
    ) -> Result<()> {
        let (adapter, keys, blob) = self.unsigned_tx(wallet, proposal)?;
        if signatures.len() != blob.slots.len() {
            warn!(
                "Wrong signature count proposal_id={} copayer_id={} got={} want={}",
                proposal.id,
                copayer.id,
                signatures.len(),
                blob.slots.len()
            );
            return Err(bad_signatures());
        }
        for (slot, signature) in blob.slots.iter().zip(signatures) {
            let key = keys.ring.derive_for(copayer.index, &slot.path)?;
            if !adapter.verify_vote_signature(&blob, slot, &key, signature) {
                warn!(
                    "Signature does not verify proposal_id={} copayer_id={} path={}",
                    proposal.id, copayer.id, slot.path
                );
                return Err(bad_signatures());
            }
        }
        Ok(())
    }

    async fn record_rejection(&self, wallet: &Wallet, creator_id: &CopayerId) -> Result<()> {
        let count = self
            .store
            .fetch_rejection_counter(&wallet.id, creator_id)
            .await?
            .map_or(0, |c| c.count);
        self.store
            .store_rejection_counter(&RejectionCounter {
                wallet_id: wallet.id.clone(),
                copayer_id: creator_id.clone(),
                count: count.saturating_add(1),
                last_rejection_on: Utc::now(),
            })
            .await
    }

    async fn reset_rejections(&self, wallet: &Wallet, creator_id: &CopayerId) -> Result<()> {
        if let Some(mut counter) = self
            .store
            .fetch_rejection_counter(&wallet.id, creator_id)
            .await?
        {
            if counter.count > 0 {
                counter.count = 0;
                self.store.store_rejection_counter(&counter).await?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Broadcast, confirm, remove
    // ========================================================================

    pub async fn broadcast(&self, wallet: &Wallet, proposal_id: &ProposalId) -> Result<TxProposal> {
        let mut proposal = self.get(wallet, proposal_id).await?;
        if matches!(
            proposal.status,
            ProposalStatus::Broadcast | ProposalStatus::Confirmed
        ) {
            return Err(ErrorKind::TxAlreadyBroadcasted.into());
        }
        if proposal.status != ProposalStatus::Accepted {
            return Err(ErrorKind::TxNotAccepted.into());
        }

        let (adapter, keys, blob) = self.unsigned_tx(wallet, &proposal)?;
        let sets = proposal
            .actions
            .iter()
            .filter(|a| a.action_type == ActionType::Accept)
            .map(|a| {
                Ok(SignatureSet {
                    copayer_index: authorize(wallet, &a.copayer_id)?.index,
                    signatures: a.signatures.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let signed = adapter.apply_signatures(&blob, &keys, &sets)?;

        let txid = match self
            .provider
            .broadcast(proposal.chain, proposal.network, &signed.raw)
            .await
        {
            Ok(txid) => txid,
            Err(e) => {
                warn!(
                    "Broadcast failed wallet_id={} proposal_id={}: {}",
                    wallet.id, proposal.id, e
                );
                return Err(e);
            }
        };
        if txid != signed.txid {
            debug!(
                "Provider txid differs from computed txid provider={} computed={}",
                txid, signed.txid
            );
        }

        let mut fsm = ProposalFsm::new(proposal.id.clone(), proposal.status);
        proposal.status = fsm.broadcast()?;
        proposal.txid = Some(txid);
        proposal.broadcast_on = Some(Utc::now());
        self.store.store_proposal(&proposal).await?;

        info!(
            "Broadcast proposal wallet_id={} proposal_id={} txid={}",
            wallet.id,
            proposal.id,
            proposal.txid.as_deref().unwrap_or_default()
        );
        Ok(proposal)
    }

    /// Promotes a broadcast proposal once its transaction is mined. Returns
    /// the proposal, changed or not.
    pub async fn confirm(&self, wallet: &Wallet, proposal_id: &ProposalId) -> Result<TxProposal> {
        let mut proposal = self.get(wallet, proposal_id).await?;
        if proposal.status != ProposalStatus::Broadcast {
            return Err(WalletError::invalid_request(format!(
                "Proposal {} is not broadcast",
                proposal.id
            )));
        }
        let txid = proposal
            .txid
            .clone()
            .ok_or_else(|| WalletError::invalid_request("Broadcast proposal has no txid"))?;

        let height = self
            .provider
            .get_tx_height(proposal.chain, proposal.network, &txid)
            .await?;
        let confirmations = match height {
            Some(_) => {
                self.provider
                    .get_confirmations(proposal.chain, proposal.network, height)
                    .await?
            }
            None => 0,
        };
        if confirmations == 0 {
            return Ok(proposal);
        }

        let mut fsm = ProposalFsm::new(proposal.id.clone(), proposal.status);
        proposal.status = fsm.confirm()?;
        self.store.store_proposal(&proposal).await?;
        info!(
            "Confirmed proposal wallet_id={} proposal_id={} txid={} confirmations={}",
            wallet.id, proposal.id, txid, confirmations
        );
        Ok(proposal)
    }

    /// Runs [`confirm`](Self::confirm) over every broadcast proposal of the
    /// wallet. Returns how many were confirmed.
    pub async fn refresh_confirmations(&self, wallet: &Wallet) -> Result<usize> {
        let broadcast = self
            .store
            .fetch_proposals(&wallet.id, Some(ProposalStatus::Broadcast))
            .await?;
        let mut confirmed = 0;
        for proposal in broadcast {
            if self.confirm(wallet, &proposal.id).await?.status == ProposalStatus::Confirmed {
                confirmed += 1;
            }
        }
        Ok(confirmed)
    }

    pub async fn remove(&self, wallet: &Wallet, proposal_id: &ProposalId) -> Result<()> {
        let proposal = self.get(wallet, proposal_id).await?;
        if !matches!(
            proposal.status,
            ProposalStatus::Temporary | ProposalStatus::Pending
        ) {
            return Err(ErrorKind::TxNotPending.into());
        }
        let remaining = self.delete_lock_remaining(&proposal);
        if remaining > 0 {
            return Err(WalletError::new(
                ErrorKind::TxCannotRemove,
                format!(
                    "Cannot remove this tx proposal for another {} seconds",
                    remaining
                ),
            ));
        }

        let mut fsm = ProposalFsm::new(proposal.id.clone(), proposal.status);
        fsm.expire()?;
        self.store.remove_proposal(&wallet.id, &proposal.id).await?;

        info!(
            "Removed proposal wallet_id={} proposal_id={}",
            wallet.id, proposal.id
        );
        Ok(())
    }
}
