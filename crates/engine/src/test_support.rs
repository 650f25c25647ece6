//! Key fixtures and in-process chain doubles shared by the engine unit tests.

use async_trait::async_trait;
use bitcoin::bip32::{ChildNumber, Xpriv, Xpub};
use bitcoin::secp256k1::Secp256k1;
use chrono::Utc;
use quorum_chains::{confirmations_at, AccountState, ChainStateProvider, FeeEstimator, TxBlob};
use quorum_crypto::{copayer_hash, copayer_id, hash_data, KeyPair};
use quorum_types::{
    Chain, Coin, Copayer, DerivationPath, Network, Result, Wallet, WalletError, WalletId,
    WalletStatus,
};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::registry::NewCopayer;

pub fn xpriv(seed: u8) -> Xpriv {
    Xpriv::new_master(bitcoin::Network::Testnet, &[seed; 32]).unwrap()
}

pub fn xpub(seed: u8) -> String {
    Xpub::from_priv(&Secp256k1::new(), &xpriv(seed)).to_string()
}

pub fn child_signer(seed: u8, path: &DerivationPath) -> KeyPair {
    let children = [
        ChildNumber::from_normal_idx(path.branch()).unwrap(),
        ChildNumber::from_normal_idx(path.index).unwrap(),
    ];
    let child = xpriv(seed).derive_priv(&Secp256k1::new(), &children).unwrap();
    KeyPair::from_bytes(&child.private_key.secret_bytes()).unwrap()
}

/// Signatures of the copayer seeded with `seed` for every slot of `blob`.
pub fn sign_slots(seed: u8, blob: &TxBlob) -> Vec<String> {
    blob.slots
        .iter()
        .map(|slot| child_signer(seed, &slot.path).sign_digest(slot.digest_bytes().unwrap()))
        .collect()
}

/// Key material of a test wallet: one seed per copayer.
pub struct TestKeys {
    pub seeds: Vec<u8>,
    pub wallet_key: KeyPair,
    pub request_keys: Vec<KeyPair>,
}

impl TestKeys {
    pub fn new(seeds: &[u8]) -> Self {
        Self {
            seeds: seeds.to_vec(),
            wallet_key: KeyPair::generate(),
            request_keys: seeds.iter().map(|_| KeyPair::generate()).collect(),
        }
    }

    pub fn name(index: usize) -> String {
        format!("copayer-{}", index)
    }

    /// A complete wallet built without going through the registry.
    pub fn complete_wallet(&self, chain: Chain, m: usize) -> Wallet {
        let id = WalletId::generate();
        let copayers = self
            .seeds
            .iter()
            .enumerate()
            .map(|(index, seed)| {
                let xpub = xpub(*seed);
                Copayer {
                    id: copayer_id(&xpub),
                    wallet_id: id.clone(),
                    name: Self::name(index),
                    xpub,
                    request_pub_key: self.request_keys[index].public_key(),
                    index,
                    created_on: Utc::now(),
                }
            })
            .collect();

        Wallet {
            id,
            name: "test".to_string(),
            chain,
            network: Network::Testnet,
            m,
            n: self.seeds.len(),
            pub_key: self.wallet_key.public_key(),
            copayers,
            status: WalletStatus::Complete,
            created_on: Utc::now(),
            deleted: false,
        }
    }
}

pub fn new_copayer(keys: &TestKeys, index: usize) -> NewCopayer {
    let name = TestKeys::name(index);
    let xpub = xpub(keys.seeds[index]);
    let request_pub_key = keys.request_keys[index].public_key();
    let copayer_signature = keys
        .wallet_key
        .sign(copayer_hash(&name, &xpub, &request_pub_key).as_bytes());
    NewCopayer {
        name,
        xpub,
        request_pub_key,
        copayer_signature,
    }
}

#[derive(Default)]
pub struct ChainState {
    pub tip: u64,
    pub coins: Vec<Coin>,
    pub accounts: HashMap<String, AccountState>,
    pub tx_heights: HashMap<String, u64>,
    pub broadcasts: Vec<String>,
    pub fail_broadcast: bool,
    next_txid: u64,
}

/// Scriptable chain state provider.
#[derive(Default)]
pub struct MockChain {
    pub state: Mutex<ChainState>,
}

impl MockChain {
    pub fn new(tip: u64) -> Self {
        let chain = Self::default();
        chain.state.lock().unwrap().tip = tip;
        chain
    }

    pub fn add_coin(&self, address: &str, amount: u64, mint_height: Option<u64>) -> Coin {
        let mut state = self.state.lock().unwrap();
        state.next_txid += 1;
        let coin = Coin {
            txid: format!("{:064x}", state.next_txid),
            vout: 0,
            address: address.to_string(),
            amount,
            spendable: true,
            mint_height,
            path: None,
            confirmations: 0,
        };
        state.coins.push(coin.clone());
        coin
    }

    pub fn set_account(&self, address: &str, nonce: u64, balance: u64) {
        self.state
            .lock()
            .unwrap()
            .accounts
            .insert(address.to_string(), AccountState { nonce, balance });
    }

    pub fn broadcasts(&self) -> Vec<String> {
        self.state.lock().unwrap().broadcasts.clone()
    }
}

#[async_trait]
impl ChainStateProvider for MockChain {
    async fn get_candidate_coins(
        &self,
        _chain: Chain,
        _network: Network,
        addresses: &[String],
    ) -> Result<Vec<Coin>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .coins
            .iter()
            .filter(|c| addresses.contains(&c.address))
            .cloned()
            .collect())
    }

    async fn get_nonce_and_balance(
        &self,
        _chain: Chain,
        _network: Network,
        address: &str,
    ) -> Result<AccountState> {
        let state = self.state.lock().unwrap();
        Ok(state.accounts.get(address).copied().unwrap_or_default())
    }

    async fn broadcast(&self, _chain: Chain, _network: Network, signed_tx: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if state.fail_broadcast {
            return Err(WalletError::chain_provider("node rejected transaction"));
        }
        state.broadcasts.push(signed_tx.to_string());
        Ok(hex::encode(hash_data(signed_tx.as_bytes())))
    }

    async fn get_confirmations(
        &self,
        _chain: Chain,
        _network: Network,
        mint_height: Option<u64>,
    ) -> Result<u32> {
        Ok(confirmations_at(self.state.lock().unwrap().tip, mint_height))
    }

    async fn get_tx_height(&self, _chain: Chain, _network: Network, txid: &str) -> Result<Option<u64>> {
        Ok(self.state.lock().unwrap().tx_heights.get(txid).copied())
    }
}

/// Returns the same fee for every target.
pub struct FlatFees(pub i64);

#[async_trait]
impl FeeEstimator for FlatFees {
    async fn estimate(
        &self,
        _chain: Chain,
        _network: Network,
        nb_blocks: &[u32],
    ) -> Result<HashMap<u32, i64>> {
        Ok(nb_blocks.iter().map(|n| (*n, self.0)).collect())
    }
}
