use crate::config::{AppConfig, ChainsConfig};
use async_trait::async_trait;
use bitcoin::bip32::{ChildNumber, Xpriv, Xpub};
use bitcoin::secp256k1::Secp256k1;
use quorum_chains::{
    confirmations_at, AccountState, ChainRegistry, ChainStateProvider, FeeEstimator, TxBlob,
};
use quorum_crypto::{hash_data, KeyPair};
use quorum_engine::{ConfirmationMonitor, WalletService};
use quorum_storage::{EtcdLockBackend, LockManager, SqliteStore, WalletStore};
use quorum_types::{Chain, Coin, Network, Result, WalletError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Ledger view of one chain and network.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    #[serde(default)]
    pub tip: u64,
    #[serde(default)]
    pub coins: Vec<Coin>,
    #[serde(default)]
    pub accounts: HashMap<String, AccountState>,
    #[serde(default)]
    pub tx_heights: HashMap<String, u64>,
    /// Fee per kb keyed by nb-blocks target.
    #[serde(default)]
    pub fee_samples: HashMap<u32, i64>,
}

/// Chain state file, keyed by `"<chain>:<network>"` (e.g. `btc:testnet`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainSnapshot {
    #[serde(default)]
    pub networks: HashMap<String, NetworkSnapshot>,
}

#[derive(Debug, Serialize)]
struct OutboxEntry<'a> {
    chain: Chain,
    network: Network,
    txid: &'a str,
    raw: &'a str,
    queued_at: chrono::DateTime<chrono::Utc>,
}

/// Offline chain state provider backed by a JSON snapshot.
///
/// Broadcasts are not relayed anywhere; they are appended to an outbox file
/// for an operator to submit.
pub struct SnapshotChainState {
    snapshot: ChainSnapshot,
    outbox_path: String,
}

impl SnapshotChainState {
    pub fn new(snapshot: ChainSnapshot, outbox_path: impl Into<String>) -> Self {
        Self {
            snapshot,
            outbox_path: outbox_path.into(),
        }
    }

    pub fn load(config: &ChainsConfig) -> Result<Self> {
        let snapshot = if Path::new(&config.snapshot_path).exists() {
            let data = std::fs::read_to_string(&config.snapshot_path).map_err(|e| {
                WalletError::config(format!(
                    "Failed to read chain snapshot {}: {}",
                    config.snapshot_path, e
                ))
            })?;
            serde_json::from_str(&data)
                .map_err(|e| WalletError::config(format!("Invalid chain snapshot: {}", e)))?
        } else {
            warn!(
                "Chain snapshot {} not found, starting with an empty ledger",
                config.snapshot_path
            );
            ChainSnapshot::default()
        };

        info!(
            "Loaded chain snapshot path={} networks={}",
            config.snapshot_path,
            snapshot.networks.len()
        );
        Ok(Self::new(snapshot, config.outbox_path.clone()))
    }

    fn network(&self, chain: Chain, network: Network) -> Option<&NetworkSnapshot> {
        self.snapshot
            .networks
            .get(&format!("{}:{}", chain, network))
    }
}

#[async_trait]
impl ChainStateProvider for SnapshotChainState {
    async fn get_candidate_coins(
        &self,
        chain: Chain,
        network: Network,
        addresses: &[String],
    ) -> Result<Vec<Coin>> {
        Ok(self
            .network(chain, network)
            .map(|n| {
                n.coins
                    .iter()
                    .filter(|c| addresses.contains(&c.address))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_nonce_and_balance(
        &self,
        chain: Chain,
        network: Network,
        address: &str,
    ) -> Result<AccountState> {
        Ok(self
            .network(chain, network)
            .and_then(|n| n.accounts.get(address).copied())
            .unwrap_or_default())
    }

    async fn broadcast(&self, chain: Chain, network: Network, signed_tx: &str) -> Result<String> {
        let txid = hex::encode(hash_data(signed_tx.as_bytes()));
        let entry = OutboxEntry {
            chain,
            network,
            txid: &txid,
            raw: signed_tx,
            queued_at: chrono::Utc::now(),
        };
        let mut line = serde_json::to_string(&entry)
            .map_err(|e| WalletError::chain_provider(format!("Failed to encode outbox entry: {}", e)))?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.outbox_path)
            .await
            .map_err(|e| WalletError::chain_provider(format!("Failed to open outbox: {}", e)))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| WalletError::chain_provider(format!("Failed to write outbox: {}", e)))?;

        info!("Queued transaction chain={} network={} txid={}", chain, network, txid);
        Ok(txid)
    }

    async fn get_confirmations(
        &self,
        chain: Chain,
        network: Network,
        mint_height: Option<u64>,
    ) -> Result<u32> {
        let tip = self.network(chain, network).map(|n| n.tip).unwrap_or(0);
        Ok(confirmations_at(tip, mint_height))
    }

    async fn get_tx_height(
        &self,
        chain: Chain,
        network: Network,
        txid: &str,
    ) -> Result<Option<u64>> {
        Ok(self
            .network(chain, network)
            .and_then(|n| n.tx_heights.get(txid).copied()))
    }
}

#[async_trait]
impl FeeEstimator for SnapshotChainState {
    async fn estimate(
        &self,
        chain: Chain,
        network: Network,
        nb_blocks: &[u32],
    ) -> Result<HashMap<u32, i64>> {
        let samples = self.network(chain, network).map(|n| &n.fee_samples);
        Ok(nb_blocks
            .iter()
            .map(|target| {
                let fee = samples.and_then(|s| s.get(target).copied()).unwrap_or(-1);
                (*target, fee)
            })
            .collect())
    }
}

pub struct QuorumWalletApp {
    config: AppConfig,
    service: Arc<WalletService>,
}

impl QuorumWalletApp {
    pub async fn new(config: AppConfig) -> Result<Self> {
        config.validate()?;

        info!("Initializing quorum wallet service");
        info!("Database: {}", config.storage.db_path);
        info!("Lock backend: {}", config.lock.backend);

        let engine = config.engine_config();

        let store: Arc<dyn WalletStore> = if config.storage.db_path == ":memory:" {
            Arc::new(SqliteStore::open_in_memory()?)
        } else {
            Arc::new(SqliteStore::open(&config.storage.db_path)?)
        };

        let locks = match config.lock.backend.as_str() {
            "etcd" => {
                let backend = EtcdLockBackend::connect(config.lock.etcd_endpoints.clone()).await?;
                LockManager::new(Arc::new(backend), engine.lock.clone())
            }
            _ => LockManager::local(engine.lock.clone()),
        };

        let chain_state = Arc::new(SnapshotChainState::load(&config.chains)?);
        let chains = Arc::new(ChainRegistry::with_defaults(&engine));
        debug!("Registered chains: {:?}", chains.chains());

        let service = Arc::new(WalletService::new(
            engine,
            store,
            chains,
            chain_state.clone(),
            chain_state,
            locks,
        ));

        Ok(Self { config, service })
    }

    pub fn service(&self) -> &WalletService {
        &self.service
    }

    pub async fn run_monitor(&self, interval_secs: Option<u64>) -> Result<()> {
        let interval = interval_secs.unwrap_or(self.config.service.monitor_interval_secs);
        ConfirmationMonitor::new(self.service.clone(), Duration::from_secs(interval))
            .run()
            .await
    }
}

// ============================================================================
// Copayer-side signing
// ============================================================================

fn bitcoin_network(network: Network) -> bitcoin::Network {
    match network {
        Network::Livenet => bitcoin::Network::Bitcoin,
        Network::Testnet => bitcoin::Network::Testnet,
        Network::Regtest => bitcoin::Network::Regtest,
    }
}

/// A fresh extended key pair for a copayer: `(xpriv, xpub)`.
pub fn generate_extended_key(network: Network) -> Result<(String, String)> {
    let seed: [u8; 32] = rand::random();
    let xpriv = Xpriv::new_master(bitcoin_network(network), &seed)
        .map_err(|e| WalletError::invalid_request(format!("Failed to create master key: {}", e)))?;
    let xpub = Xpub::from_priv(&Secp256k1::new(), &xpriv);
    Ok((xpriv.to_string(), xpub.to_string()))
}

/// Signs every slot of `blob` with the child keys of `xpriv`.
pub fn sign_slots(xpriv: &str, blob: &TxBlob) -> Result<Vec<String>> {
    let secp = Secp256k1::new();
    let master = Xpriv::from_str(xpriv)
        .map_err(|e| WalletError::invalid_request(format!("Invalid xpriv: {}", e)))?;

    blob.slots
        .iter()
        .map(|slot| {
            let children = [
                ChildNumber::from_normal_idx(slot.path.branch()),
                ChildNumber::from_normal_idx(slot.path.index),
            ];
            let children = children
                .into_iter()
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| WalletError::invalid_request(format!("Invalid path {}: {}", slot.path, e)))?;
            let child = master
                .derive_priv(&secp, &children)
                .map_err(|e| WalletError::invalid_request(format!("Derivation failed: {}", e)))?;
            let key = KeyPair::from_bytes(&child.private_key.secret_bytes())?;
            Ok(key.sign_digest(slot.digest_bytes()?))
        })
        .collect()
}

/// The creator's signature over a draft, required to publish it.
pub fn sign_proposal(request_key: &str, blob: &TxBlob) -> Result<String> {
    Ok(KeyPair::from_hex(request_key)?.sign_digest(blob.proposal_digest()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> SnapshotChainState {
        let mut network = NetworkSnapshot {
            tip: 120,
            ..Default::default()
        };
        network.coins.push(Coin {
            txid: "aa".repeat(32),
            vout: 1,
            address: "tb1qfunded".to_string(),
            amount: 50_000,
            spendable: true,
            mint_height: Some(100),
            path: None,
            confirmations: 0,
        });
        network.fee_samples.insert(2, 40_000);
        network.tx_heights.insert("bb".repeat(32), 118);

        let mut snapshot = ChainSnapshot::default();
        snapshot.networks.insert("btc:testnet".to_string(), network);
        SnapshotChainState::new(snapshot, "unused.jsonl")
    }

    #[tokio::test]
    async fn test_snapshot_serves_coins_by_address() {
        let state = snapshot();
        let coins = state
            .get_candidate_coins(
                Chain::Btc,
                Network::Testnet,
                &["tb1qfunded".to_string(), "tb1qempty".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(coins.len(), 1);

        let none = state
            .get_candidate_coins(Chain::Btc, Network::Livenet, &["tb1qfunded".to_string()])
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_heights_and_fees() {
        let state = snapshot();
        let height = state
            .get_tx_height(Chain::Btc, Network::Testnet, &"bb".repeat(32))
            .await
            .unwrap();
        assert_eq!(height, Some(118));
        let confirmations = state
            .get_confirmations(Chain::Btc, Network::Testnet, height)
            .await
            .unwrap();
        assert_eq!(confirmations, 3);

        let fees = state
            .estimate(Chain::Btc, Network::Testnet, &[1, 2])
            .await
            .unwrap();
        assert_eq!(fees[&1], -1);
        assert_eq!(fees[&2], 40_000);
    }

    #[tokio::test]
    async fn test_broadcast_appends_to_outbox() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = dir.path().join("outbox.jsonl");
        let state = SnapshotChainState::new(ChainSnapshot::default(), outbox.to_string_lossy());

        let first = state.broadcast(Chain::Btc, Network::Testnet, "0100").await.unwrap();
        state.broadcast(Chain::Btc, Network::Testnet, "0200").await.unwrap();
        assert_eq!(first, hex::encode(hash_data(b"0100")));

        let written = std::fs::read_to_string(&outbox).unwrap();
        assert_eq!(written.lines().count(), 2);
        assert!(written.contains(&first));
    }

    #[test]
    fn test_generated_keys_round_trip() {
        let (xpriv, xpub) = generate_extended_key(Network::Testnet).unwrap();
        assert!(xpriv.starts_with("tprv"));
        assert!(xpub.starts_with("tpub"));
    }
}
