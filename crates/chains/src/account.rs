//! Ethereum-family adapter.
//!
//! Account wallets send from the first copayer's key at `m/0/0`. Each output
//! becomes one transfer with its own nonce, and every approver signs the
//! keccak256 digest of each transfer's canonical JSON encoding. For these
//! chains `fee_per_kb` carries the gas price in wei.

use bitcoin::secp256k1::PublicKey;
use quorum_types::{
    Chain, DerivationPath, FeeLevelName, Network, Quorum, Result, WalletError,
};
use serde::{Deserialize, Serialize};

use crate::adapter::{
    ChainAdapter, FeeLevelDef, SignatureSet, SignedTx, SigningSlot, TxBlob, TxPlan, WalletKeys,
};

/// Gas used by a plain value transfer.
pub const GAS_LIMIT: u64 = 21_000;

static ETH_FEE_LEVELS: [FeeLevelDef; 5] = [
    FeeLevelDef {
        name: FeeLevelName::Urgent,
        nb_blocks: 1,
        default_value: 10_000_000_000,
        multiplier: None,
    },
    FeeLevelDef {
        name: FeeLevelName::Priority,
        nb_blocks: 2,
        default_value: 5_000_000_000,
        multiplier: None,
    },
    FeeLevelDef {
        name: FeeLevelName::Normal,
        nb_blocks: 3,
        default_value: 1_000_000_000,
        multiplier: None,
    },
    FeeLevelDef {
        name: FeeLevelName::Economy,
        nb_blocks: 4,
        default_value: 1_000_000_000,
        multiplier: None,
    },
    FeeLevelDef {
        name: FeeLevelName::SuperEconomy,
        nb_blocks: 4,
        default_value: 1_000_000_000,
        multiplier: None,
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountTransfer {
    pub from: String,
    pub to: String,
    pub value: u64,
    pub nonce: u64,
    pub gas_price: u64,
    pub gas_limit: u64,
    #[serde(default)]
    pub data: Option<String>,
}

impl AccountTransfer {
    pub fn digest(&self) -> Result<[u8; 32]> {
        let encoded = serde_json::to_vec(self)
            .map_err(|e| WalletError::invalid_request(format!("Failed to encode transfer: {}", e)))?;
        Ok(quorum_crypto::keccak256(&encoded))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UnsignedAccountTx {
    transfers: Vec<AccountTransfer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Endorsement {
    public_key: String,
    signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SignedAccountTx {
    transfers: Vec<AccountTransfer>,
    endorsements: Vec<Vec<Endorsement>>,
}

/// `0x` followed by the last 20 bytes of keccak256 over the uncompressed key.
pub fn address_from_public_key(key: &PublicKey) -> String {
    let uncompressed = key.serialize_uncompressed();
    let hash = quorum_crypto::keccak256(&uncompressed[1..]);
    format!("0x{}", hex::encode(&hash[12..]))
}

#[derive(Debug, Clone, Default)]
pub struct AccountChainAdapter;

impl AccountChainAdapter {
    pub fn new() -> Self {
        Self
    }

    fn sending_path() -> DerivationPath {
        DerivationPath::new(false, 0)
    }
}

impl ChainAdapter for AccountChainAdapter {
    fn chain(&self) -> Chain {
        Chain::Eth
    }

    fn is_utxo_based(&self) -> bool {
        false
    }

    fn fee_levels(&self) -> &'static [FeeLevelDef] {
        &ETH_FEE_LEVELS
    }

    fn dust_threshold(&self) -> u64 {
        0
    }

    fn max_tx_size_bytes(&self) -> u64 {
        u64::MAX
    }

    fn derive_address(&self, keys: &WalletKeys, path: &DerivationPath) -> Result<String> {
        let key = keys.ring.derive_for(0, path)?;
        Ok(address_from_public_key(&key))
    }

    fn validate_address(&self, address: &str, _network: Network) -> bool {
        match address.strip_prefix("0x") {
            Some(body) => body.len() == 40 && hex::decode(body).is_ok(),
            None => false,
        }
    }

    /// Gas units; account transactions have no inputs.
    fn estimate_size(&self, _quorum: Quorum, _input_count: usize, output_count: usize) -> u64 {
        GAS_LIMIT * output_count as u64
    }

    fn estimate_fee(
        &self,
        quorum: Quorum,
        input_count: usize,
        output_count: usize,
        fee_per_kb: u64,
    ) -> u64 {
        self.estimate_size(quorum, input_count, output_count)
            .saturating_mul(fee_per_kb)
    }

    fn signing_paths(&self, plan: &TxPlan) -> Result<Vec<DerivationPath>> {
        Ok(vec![Self::sending_path(); plan.outputs.len()])
    }

    fn build_unsigned_tx(&self, keys: &WalletKeys, plan: &TxPlan) -> Result<TxBlob> {
        let from = match &plan.from_address {
            Some(from) => from.clone(),
            None => self.derive_address(keys, &Self::sending_path())?,
        };
        let nonce = plan
            .nonce
            .ok_or_else(|| WalletError::invalid_request("Account transaction requires a nonce"))?;

        let mut transfers = Vec::with_capacity(plan.outputs.len());
        let mut slots = Vec::with_capacity(plan.outputs.len());
        for (i, output) in plan.outputs.iter().enumerate() {
            if !self.validate_address(&output.to_address, plan.network) {
                return Err(WalletError::new(
                    quorum_types::ErrorKind::InvalidAddress,
                    format!("Invalid address {}", output.to_address),
                ));
            }
            let transfer = AccountTransfer {
                from: from.clone(),
                to: output.to_address.to_lowercase(),
                value: output.amount,
                nonce: nonce + i as u64,
                gas_price: plan.fee_per_kb,
                gas_limit: GAS_LIMIT,
                data: output.data.clone(),
            };
            slots.push(SigningSlot::new(Self::sending_path(), transfer.digest()?));
            transfers.push(transfer);
        }

        let raw = serde_json::to_string(&UnsignedAccountTx { transfers })
            .map_err(|e| WalletError::invalid_request(format!("Failed to encode tx: {}", e)))?;
        Ok(TxBlob { raw, slots })
    }

    fn apply_signatures(
        &self,
        blob: &TxBlob,
        keys: &WalletKeys,
        sets: &[SignatureSet],
    ) -> Result<SignedTx> {
        let unsigned: UnsignedAccountTx = serde_json::from_str(&blob.raw)
            .map_err(|e| WalletError::invalid_request(format!("Invalid account tx: {}", e)))?;
        if sets.len() < keys.quorum.m {
            return Err(WalletError::invalid_request(format!(
                "Need {} signature sets, got {}",
                keys.quorum.m,
                sets.len()
            )));
        }

        let mut endorsements = Vec::with_capacity(blob.slots.len());
        for (i, slot) in blob.slots.iter().enumerate() {
            let mut slot_endorsements = Vec::with_capacity(keys.quorum.m);
            for set in sets.iter().take(keys.quorum.m) {
                let signature = set.signatures.get(i).ok_or_else(|| {
                    WalletError::invalid_request(format!(
                        "Copayer {} has no signature for transfer {}",
                        set.copayer_index, i
                    ))
                })?;
                let key = keys.ring.derive_for(set.copayer_index, &slot.path)?;
                slot_endorsements.push(Endorsement {
                    public_key: hex::encode(key.serialize()),
                    signature: signature.clone(),
                });
            }
            endorsements.push(slot_endorsements);
        }

        let raw = serde_json::to_string(&SignedAccountTx {
            transfers: unsigned.transfers,
            endorsements,
        })
        .map_err(|e| WalletError::invalid_request(format!("Failed to encode signed tx: {}", e)))?;
        let txid = format!("0x{}", hex::encode(quorum_crypto::keccak256(raw.as_bytes())));

        Ok(SignedTx { raw, txid })
    }
}
