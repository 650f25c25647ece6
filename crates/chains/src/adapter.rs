//! Per-chain strategy used by the engine.
//!
//! The engine never matches on a chain name. Everything that differs between
//! ledgers (size model, address format, transaction encoding, signature
//! application) lives behind [`ChainAdapter`].

use bitcoin::secp256k1::PublicKey;
use quorum_crypto::PublicKeyRing;
use quorum_types::{
    Chain, Coin, DerivationPath, FeeLevelName, Network, Quorum, Result, TxOutput, TxProposal,
    Wallet, WalletError,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// Key material
// ============================================================================

/// Public key material of a complete wallet.
#[derive(Debug, Clone)]
pub struct WalletKeys {
    pub ring: PublicKeyRing,
    pub quorum: Quorum,
    pub network: Network,
}

impl WalletKeys {
    pub fn from_wallet(wallet: &Wallet) -> Result<Self> {
        let ring = PublicKeyRing::from_strings(&wallet.xpubs(), wallet.network)?;
        Ok(Self {
            ring,
            quorum: wallet.quorum(),
            network: wallet.network,
        })
    }
}

// ============================================================================
// Fee model
// ============================================================================

/// One row of a chain's fee level table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeeLevelDef {
    pub name: FeeLevelName,
    pub nb_blocks: u32,
    pub default_value: u64,
    pub multiplier: Option<f64>,
}

/// Size and fee figures for one prospective transaction shape, used by coin
/// selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeeModel {
    /// Estimated size with no inputs (outputs plus change).
    pub base_size: u64,
    pub size_per_input: u64,
    pub fee_per_kb: u64,
    pub max_tx_size: u64,
    pub dust_threshold: u64,
}

impl FeeModel {
    pub fn base_fee(&self) -> f64 {
        self.base_size as f64 * self.fee_per_kb as f64 / 1000.0
    }

    pub fn fee_per_input(&self) -> f64 {
        self.size_per_input as f64 * self.fee_per_kb as f64 / 1000.0
    }

    pub fn size_for(&self, input_count: usize) -> u64 {
        self.base_size + self.size_per_input * input_count as u64
    }

    pub fn fee_for(&self, input_count: usize) -> u64 {
        (self.base_fee() + self.fee_per_input() * input_count as f64).round() as u64
    }
}

// ============================================================================
// Transaction plans and blobs
// ============================================================================

/// Everything needed to encode an unsigned transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxPlan {
    pub network: Network,
    pub quorum: Quorum,
    pub inputs: Vec<Coin>,
    pub outputs: Vec<TxOutput>,
    pub change_address: Option<String>,
    pub change_amount: u64,
    pub fee: u64,
    pub fee_per_kb: u64,
    pub nonce: Option<u64>,
    pub from_address: Option<String>,
}

impl TxPlan {
    pub fn from_proposal(proposal: &TxProposal) -> Self {
        let change_amount = if proposal.change_address.is_some() {
            proposal.change_amount()
        } else {
            0
        };
        Self {
            network: proposal.network,
            quorum: Quorum {
                m: proposal.required_signatures,
                n: proposal.wallet_n,
            },
            inputs: proposal.inputs.clone(),
            outputs: proposal.outputs.clone(),
            change_address: proposal.change_address.as_ref().map(|a| a.address.clone()),
            change_amount,
            fee: proposal.fee,
            fee_per_kb: proposal.fee_per_kb,
            nonce: proposal.nonce,
            from_address: proposal.from_address.clone(),
        }
    }
}

/// A digest every approving copayer signs with their key at `path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningSlot {
    pub path: DerivationPath,
    /// 32-byte digest, hex encoded.
    pub digest: String,
}

impl SigningSlot {
    pub fn new(path: DerivationPath, digest: [u8; 32]) -> Self {
        Self {
            path,
            digest: hex::encode(digest),
        }
    }

    pub fn digest_bytes(&self) -> Result<[u8; 32]> {
        let bytes = hex::decode(&self.digest)
            .map_err(|e| WalletError::invalid_request(format!("Invalid digest hex: {}", e)))?;
        bytes
            .try_into()
            .map_err(|_| WalletError::invalid_request("Digest must be 32 bytes"))
    }
}

/// Encoded unsigned transaction and its signing slots, in slot order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxBlob {
    pub raw: String,
    pub slots: Vec<SigningSlot>,
}

impl TxBlob {
    /// Digest of the whole unsigned encoding; the creator signs this when
    /// publishing a draft.
    pub fn proposal_digest(&self) -> [u8; 32] {
        quorum_crypto::hash_data(self.raw.as_bytes())
    }
}

/// One approver's signatures, one per slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureSet {
    pub copayer_index: usize,
    pub signatures: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTx {
    pub raw: String,
    pub txid: String,
}

// ============================================================================
// Adapter trait
// ============================================================================

pub trait ChainAdapter: Send + Sync {
    fn chain(&self) -> Chain;

    fn is_utxo_based(&self) -> bool;

    fn fee_levels(&self) -> &'static [FeeLevelDef];

    /// Outputs below this amount are dust.
    fn dust_threshold(&self) -> u64;

    fn max_tx_size_bytes(&self) -> u64;

    fn derive_address(&self, keys: &WalletKeys, path: &DerivationPath) -> Result<String>;

    fn validate_address(&self, address: &str, network: Network) -> bool;

    /// Estimated size in bytes (or gas units for account chains).
    fn estimate_size(&self, quorum: Quorum, input_count: usize, output_count: usize) -> u64;

    fn estimate_fee(
        &self,
        quorum: Quorum,
        input_count: usize,
        output_count: usize,
        fee_per_kb: u64,
    ) -> u64;

    /// Paths copayers sign at, one per slot, in slot order.
    fn signing_paths(&self, plan: &TxPlan) -> Result<Vec<DerivationPath>>;

    fn build_unsigned_tx(&self, keys: &WalletKeys, plan: &TxPlan) -> Result<TxBlob>;

    fn apply_signatures(
        &self,
        blob: &TxBlob,
        keys: &WalletKeys,
        sets: &[SignatureSet],
    ) -> Result<SignedTx>;

    /// Size figures for coin selection with `output_count` outputs plus change.
    fn fee_model(&self, quorum: Quorum, output_count: usize, fee_per_kb: u64) -> FeeModel {
        let base_size = self.estimate_size(quorum, 0, output_count + 1);
        let size_per_input = self
            .estimate_size(quorum, 1, output_count + 1)
            .saturating_sub(base_size);
        FeeModel {
            base_size,
            size_per_input,
            fee_per_kb,
            max_tx_size: self.max_tx_size_bytes(),
            dust_threshold: self.dust_threshold(),
        }
    }

    fn verify_vote_signature(
        &self,
        _blob: &TxBlob,
        slot: &SigningSlot,
        public_key: &PublicKey,
        signature: &str,
    ) -> bool {
        match slot.digest_bytes() {
            Ok(digest) => quorum_crypto::verify_digest(public_key, digest, signature),
            Err(_) => false,
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Maps each supported chain to its adapter.
#[derive(Clone, Default)]
pub struct ChainRegistry {
    adapters: HashMap<Chain, Arc<dyn ChainAdapter>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the bundled UTXO and account adapters.
    pub fn with_defaults(config: &quorum_types::EngineConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::utxo::UtxoChainAdapter::new(
            config.selection.min_output_amount,
            config.selection.max_tx_size_kb * 1000,
        )));
        registry.register(Arc::new(crate::account::AccountChainAdapter::new()));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn ChainAdapter>) {
        self.adapters.insert(adapter.chain(), adapter);
    }

    pub fn get(&self, chain: Chain) -> Result<Arc<dyn ChainAdapter>> {
        self.adapters
            .get(&chain)
            .cloned()
            .ok_or_else(|| WalletError::invalid_request(format!("Unsupported chain: {}", chain)))
    }

    pub fn chains(&self) -> Vec<Chain> {
        self.adapters.keys().copied().collect()
    }
}
