//! Common test utilities and infrastructure for integration tests.
#![allow(dead_code)]

pub mod fixtures;
pub mod mock_services;

pub use fixtures::*;
pub use mock_services::*;

use quorum_chains::ChainRegistry;
use quorum_crypto::KeyPair;
use quorum_engine::{ConfirmationMonitor, NewWallet, ProposalRequest, Vote, WalletService};
use quorum_storage::{InMemoryStore, LockManager, WalletStore};
use quorum_types::{
    ActionType, Address, Chain, Coin, EngineConfig, Network, ProposalId, Result, TxProposal,
    Wallet,
};
use std::sync::Arc;
use std::time::Duration;

pub const TIP: u64 = 1_000;
pub const FEE_PER_KB: i64 = 10_000;

/// A service wired to in-process doubles.
pub struct TestContext {
    pub service: Arc<WalletService>,
    pub chain: Arc<MockChainState>,
    pub fees: Arc<MockFeeEstimator>,
    pub store: Arc<dyn WalletStore>,
    pub chains: Arc<ChainRegistry>,
    pub locks: LockManager,
}

/// A complete wallet and the private side of its copayers, in join order.
pub struct TestWallet {
    pub wallet: Wallet,
    pub copayers: Vec<TestCopayer>,
}

impl TestWallet {
    pub fn copayer(&self, index: usize) -> &TestCopayer {
        &self.copayers[index]
    }
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_store(config, Arc::new(InMemoryStore::new()))
    }

    pub fn with_store(config: EngineConfig, store: Arc<dyn WalletStore>) -> Self {
        Self::with_parts(
            config,
            store,
            Arc::new(MockChainState::new(TIP)),
            Arc::new(MockFeeEstimator::new(FEE_PER_KB)),
        )
    }

    /// Builds a service over existing parts, e.g. to simulate a restart.
    pub fn with_parts(
        config: EngineConfig,
        store: Arc<dyn WalletStore>,
        chain: Arc<MockChainState>,
        fees: Arc<MockFeeEstimator>,
    ) -> Self {
        let locks = LockManager::local(config.lock.clone());
        let chains = Arc::new(ChainRegistry::with_defaults(&config));
        let service = Arc::new(WalletService::new(
            config,
            store.clone(),
            chains.clone(),
            chain.clone(),
            fees.clone(),
            locks.clone(),
        ));
        Self {
            service,
            chain,
            fees,
            store,
            chains,
            locks,
        }
    }

    /// Creates an m-of-n wallet and joins all n copayers.
    pub async fn setup_wallet(&self, chain: Chain, m: usize, n: usize) -> TestWallet {
        let copayers = copayers(n);
        let wallet_key = KeyPair::generate();
        let params = NewWallet {
            name: "integration".to_string(),
            chain,
            network: Network::Testnet,
            m,
            n,
            pub_key: wallet_key.public_key(),
        };

        let (mut wallet, _) = self
            .service
            .create_wallet(params, copayers[0].join_request(&wallet_key))
            .await
            .unwrap();
        for copayer in &copayers[1..] {
            let (joined, _) = self
                .service
                .join_wallet(&wallet.id, copayer.join_request(&wallet_key))
                .await
                .unwrap();
            wallet = joined;
        }
        assert!(wallet.is_complete());

        TestWallet { wallet, copayers }
    }

    pub async fn new_address(&self, tw: &TestWallet) -> Address {
        self.service
            .derive_address(&tw.wallet.id, &tw.copayer(0).id(), false)
            .await
            .unwrap()
    }

    /// Pays `amount` to a fresh wallet address, mined at the current tip.
    pub async fn fund(&self, tw: &TestWallet, amount: u64) -> Coin {
        let address = self.new_address(tw).await;
        self.chain
            .add_coin(&address.address, amount, Some(self.chain.tip()))
            .await
    }

    pub async fn create(
        &self,
        tw: &TestWallet,
        creator: usize,
        request: ProposalRequest,
    ) -> Result<TxProposal> {
        self.service
            .create_proposal(&tw.wallet.id, &tw.copayer(creator).id(), request)
            .await
    }

    pub async fn accept(
        &self,
        tw: &TestWallet,
        voter: usize,
        proposal_id: &ProposalId,
    ) -> Result<TxProposal> {
        let copayer = tw.copayer(voter);
        let blob = self
            .service
            .get_signing_blob(&tw.wallet.id, &copayer.id(), proposal_id)
            .await?;
        let vote = Vote {
            action: ActionType::Accept,
            signatures: copayer.sign_slots(&blob),
            comment: None,
        };
        self.service
            .vote_proposal(&tw.wallet.id, &copayer.id(), proposal_id, vote)
            .await
    }

    pub async fn reject(
        &self,
        tw: &TestWallet,
        voter: usize,
        proposal_id: &ProposalId,
    ) -> Result<TxProposal> {
        let vote = Vote {
            action: ActionType::Reject,
            signatures: Vec::new(),
            comment: Some("no".to_string()),
        };
        self.service
            .vote_proposal(&tw.wallet.id, &tw.copayer(voter).id(), proposal_id, vote)
            .await
    }

    pub async fn broadcast(&self, tw: &TestWallet, proposal_id: &ProposalId) -> Result<TxProposal> {
        self.service
            .broadcast_proposal(&tw.wallet.id, &tw.copayer(0).id(), proposal_id)
            .await
    }

    pub async fn proposal(&self, tw: &TestWallet, proposal_id: &ProposalId) -> TxProposal {
        self.service
            .get_proposal(&tw.wallet.id, &tw.copayer(0).id(), proposal_id)
            .await
            .unwrap()
    }

    pub fn monitor(&self) -> ConfirmationMonitor {
        ConfirmationMonitor::new(self.service.clone(), Duration::from_secs(60))
    }
}
