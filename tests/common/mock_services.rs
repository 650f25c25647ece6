//! In-process doubles for the chain state provider and fee estimator.

use async_trait::async_trait;
use quorum_chains::{confirmations_at, AccountState, ChainStateProvider, FeeEstimator};
use quorum_crypto::hash_data;
use quorum_types::{Chain, Coin, Network, Result, WalletError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Scriptable ledger shared by every chain and network.
pub struct MockChainState {
    tip: AtomicU64,
    coins: Arc<Mutex<HashMap<String, Vec<Coin>>>>,
    accounts: Arc<Mutex<HashMap<String, AccountState>>>,
    tx_heights: Arc<Mutex<HashMap<String, u64>>>,
    broadcasts: Arc<Mutex<Vec<String>>>,
    fail_broadcast: AtomicBool,
    /// Delay added to every coin lookup.
    latency_ms: AtomicU64,
    next_txid: AtomicU64,
}

impl MockChainState {
    pub fn new(tip: u64) -> Self {
        Self {
            tip: AtomicU64::new(tip),
            coins: Arc::new(Mutex::new(HashMap::new())),
            accounts: Arc::new(Mutex::new(HashMap::new())),
            tx_heights: Arc::new(Mutex::new(HashMap::new())),
            broadcasts: Arc::new(Mutex::new(Vec::new())),
            fail_broadcast: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            next_txid: AtomicU64::new(1),
        }
    }

    pub fn tip(&self) -> u64 {
        self.tip.load(Ordering::SeqCst)
    }

    pub fn set_tip(&self, tip: u64) {
        self.tip.store(tip, Ordering::SeqCst);
    }

    /// Adds an unspent coin paying `address`.
    pub async fn add_coin(&self, address: &str, amount: u64, mint_height: Option<u64>) -> Coin {
        let n = self.next_txid.fetch_add(1, Ordering::SeqCst);
        let coin = Coin {
            txid: format!("{:064x}", n),
            vout: 0,
            address: address.to_string(),
            amount,
            spendable: true,
            mint_height,
            path: None,
            confirmations: 0,
        };
        self.coins
            .lock()
            .await
            .entry(address.to_string())
            .or_default()
            .push(coin.clone());
        coin
    }

    pub async fn set_account(&self, address: &str, nonce: u64, balance: u64) {
        self.accounts
            .lock()
            .await
            .insert(address.to_string(), AccountState { nonce, balance });
    }

    /// Marks `txid` as mined at `height`.
    pub async fn mine(&self, txid: &str, height: u64) {
        self.tx_heights.lock().await.insert(txid.to_string(), height);
    }

    pub async fn broadcasts(&self) -> Vec<String> {
        self.broadcasts.lock().await.clone()
    }

    pub fn fail_broadcasts(&self, fail: bool) {
        self.fail_broadcast.store(fail, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChainStateProvider for MockChainState {
    async fn get_candidate_coins(
        &self,
        _chain: Chain,
        _network: Network,
        addresses: &[String],
    ) -> Result<Vec<Coin>> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        let coins = self.coins.lock().await;
        Ok(addresses
            .iter()
            .filter_map(|a| coins.get(a))
            .flatten()
            .cloned()
            .collect())
    }

    async fn get_nonce_and_balance(
        &self,
        _chain: Chain,
        _network: Network,
        address: &str,
    ) -> Result<AccountState> {
        Ok(self
            .accounts
            .lock()
            .await
            .get(address)
            .copied()
            .unwrap_or_default())
    }

    async fn broadcast(&self, _chain: Chain, _network: Network, signed_tx: &str) -> Result<String> {
        if self.fail_broadcast.load(Ordering::SeqCst) {
            return Err(WalletError::chain_provider("Broadcast rejected: node unreachable"));
        }
        self.broadcasts.lock().await.push(signed_tx.to_string());
        Ok(hex::encode(hash_data(signed_tx.as_bytes())))
    }

    async fn get_confirmations(
        &self,
        _chain: Chain,
        _network: Network,
        mint_height: Option<u64>,
    ) -> Result<u32> {
        Ok(confirmations_at(self.tip(), mint_height))
    }

    async fn get_tx_height(
        &self,
        _chain: Chain,
        _network: Network,
        txid: &str,
    ) -> Result<Option<u64>> {
        Ok(self.tx_heights.lock().await.get(txid).copied())
    }
}

/// Fee estimates per nb-blocks target, with a fallback for unset targets.
pub struct MockFeeEstimator {
    samples: Arc<Mutex<HashMap<u32, i64>>>,
    fallback: i64,
}

impl MockFeeEstimator {
    pub fn new(fallback: i64) -> Self {
        Self {
            samples: Arc::new(Mutex::new(HashMap::new())),
            fallback,
        }
    }

    pub async fn set(&self, nb_blocks: u32, fee_per_kb: i64) {
        self.samples.lock().await.insert(nb_blocks, fee_per_kb);
    }
}

#[async_trait]
impl FeeEstimator for MockFeeEstimator {
    async fn estimate(
        &self,
        _chain: Chain,
        _network: Network,
        nb_blocks: &[u32],
    ) -> Result<HashMap<u32, i64>> {
        let samples = self.samples.lock().await;
        Ok(nb_blocks
            .iter()
            .map(|n| (*n, samples.get(n).copied().unwrap_or(self.fallback)))
            .collect())
    }
}
