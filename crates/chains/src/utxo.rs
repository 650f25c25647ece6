//! Bitcoin-family adapter.
//!
//! Wallet addresses are P2WSH sorted multisig scripts built from every
//! copayer's child key at the address path (P2WPKH for single-key wallets).
//! Copayers sign the segwit v0 sighash of each input with `SIGHASH_ALL`.

use bitcoin::address::NetworkUnchecked;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::consensus::deserialize;
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::script::Builder;
use bitcoin::secp256k1::PublicKey;
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, CompressedPublicKey, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
    Txid, Witness,
};
use quorum_types::{
    Chain, DerivationPath, ErrorKind, FeeLevelName, Network, Quorum, Result, WalletError,
};
use std::str::FromStr;

use crate::adapter::{
    ChainAdapter, FeeLevelDef, SignatureSet, SignedTx, SigningSlot, TxBlob, TxPlan, WalletKeys,
};

/// Version, locktime, counts and segwit marker.
const TX_OVERHEAD: f64 = 10.0;
/// Extra room so estimates err on the high side.
const SIZE_SAFETY_MARGIN: f64 = 1.02;

const P2WPKH_INPUT_SIZE: f64 = 69.0;
const P2WSH_SCRIPT_SIZE: u64 = 34;
const P2WPKH_SCRIPT_SIZE: u64 = 22;
const OUTPUT_VALUE_AND_LENGTH: u64 = 9;

static BTC_FEE_LEVELS: [FeeLevelDef; 5] = [
    FeeLevelDef {
        name: FeeLevelName::Urgent,
        nb_blocks: 2,
        default_value: 75_000,
        multiplier: Some(1.5),
    },
    FeeLevelDef {
        name: FeeLevelName::Priority,
        nb_blocks: 2,
        default_value: 50_000,
        multiplier: None,
    },
    FeeLevelDef {
        name: FeeLevelName::Normal,
        nb_blocks: 3,
        default_value: 30_000,
        multiplier: None,
    },
    FeeLevelDef {
        name: FeeLevelName::Economy,
        nb_blocks: 6,
        default_value: 25_000,
        multiplier: None,
    },
    FeeLevelDef {
        name: FeeLevelName::SuperEconomy,
        nb_blocks: 24,
        default_value: 10_000,
        multiplier: None,
    },
];

pub fn bitcoin_network(network: Network) -> bitcoin::Network {
    match network {
        Network::Livenet => bitcoin::Network::Bitcoin,
        Network::Testnet => bitcoin::Network::Testnet,
        Network::Regtest => bitcoin::Network::Regtest,
    }
}

#[derive(Debug, Clone)]
pub struct UtxoChainAdapter {
    dust_threshold: u64,
    max_tx_size: u64,
}

impl UtxoChainAdapter {
    pub fn new(dust_threshold: u64, max_tx_size: u64) -> Self {
        Self {
            dust_threshold,
            max_tx_size,
        }
    }

    fn input_size(quorum: Quorum) -> f64 {
        if quorum.n == 1 {
            return P2WPKH_INPUT_SIZE;
        }
        // outpoint + script length + sequence, then the witness at a quarter weight
        let witness = (quorum.m * 74 + quorum.n * 34) as f64 / 4.0;
        32.0 + 4.0 + 1.0 + witness + 4.0
    }

    fn output_size(quorum: Quorum) -> u64 {
        let script = if quorum.n == 1 {
            P2WPKH_SCRIPT_SIZE
        } else {
            P2WSH_SCRIPT_SIZE
        };
        script + OUTPUT_VALUE_AND_LENGTH
    }

    /// `m <sorted keys> n OP_CHECKMULTISIG`
    pub fn witness_script(keys: &WalletKeys, path: &DerivationPath) -> Result<ScriptBuf> {
        let sorted = keys.ring.derive_sorted(path)?;
        let mut builder = Builder::new().push_int(keys.quorum.m as i64);
        for key in &sorted {
            builder = builder.push_key(&bitcoin::PublicKey::new(*key));
        }
        Ok(builder
            .push_int(sorted.len() as i64)
            .push_opcode(OP_CHECKMULTISIG)
            .into_script())
    }

    fn address_for(keys: &WalletKeys, path: &DerivationPath) -> Result<Address> {
        let network = bitcoin_network(keys.network);
        if keys.ring.len() == 1 {
            let key = keys.ring.derive_for(0, path)?;
            Ok(Address::p2wpkh(&CompressedPublicKey(key), network))
        } else {
            let script = Self::witness_script(keys, path)?;
            Ok(Address::p2wsh(&script, network))
        }
    }

    fn parse_address(address: &str, network: Network) -> Result<Address> {
        let invalid = || {
            WalletError::new(
                ErrorKind::InvalidAddress,
                format!("Invalid address {} for network {}", address, network),
            )
        };
        Address::<NetworkUnchecked>::from_str(address)
            .map_err(|_| invalid())?
            .require_network(bitcoin_network(network))
            .map_err(|_| invalid())
    }

    fn decode_tx(raw: &str) -> Result<Transaction> {
        let bytes = hex::decode(raw)
            .map_err(|e| WalletError::invalid_request(format!("Invalid tx hex: {}", e)))?;
        deserialize(&bytes)
            .map_err(|e| WalletError::invalid_request(format!("Failed to deserialize tx: {}", e)))
    }

    fn signature_bytes(signature: &str) -> Result<Vec<u8>> {
        let signature = quorum_crypto::parse_signature(signature)
            .ok_or_else(|| WalletError::invalid_request("Malformed signature"))?;
        let mut bytes = signature.serialize_der().to_vec();
        bytes.push(EcdsaSighashType::All as u8);
        Ok(bytes)
    }
}

impl Default for UtxoChainAdapter {
    fn default() -> Self {
        Self::new(5000, 100_000)
    }
}

impl ChainAdapter for UtxoChainAdapter {
    fn chain(&self) -> Chain {
        Chain::Btc
    }

    fn is_utxo_based(&self) -> bool {
        true
    }

    fn fee_levels(&self) -> &'static [FeeLevelDef] {
        &BTC_FEE_LEVELS
    }

    fn dust_threshold(&self) -> u64 {
        self.dust_threshold
    }

    fn max_tx_size_bytes(&self) -> u64 {
        self.max_tx_size
    }

    fn derive_address(&self, keys: &WalletKeys, path: &DerivationPath) -> Result<String> {
        Ok(Self::address_for(keys, path)?.to_string())
    }

    fn validate_address(&self, address: &str, network: Network) -> bool {
        Address::<NetworkUnchecked>::from_str(address)
            .map(|a| a.is_valid_for_network(bitcoin_network(network)))
            .unwrap_or(false)
    }

    fn estimate_size(&self, quorum: Quorum, input_count: usize, output_count: usize) -> u64 {
        let size = TX_OVERHEAD
            + Self::input_size(quorum) * input_count as f64
            + (Self::output_size(quorum) * output_count as u64) as f64;
        (size * SIZE_SAFETY_MARGIN).ceil() as u64
    }

    fn estimate_fee(
        &self,
        quorum: Quorum,
        input_count: usize,
        output_count: usize,
        fee_per_kb: u64,
    ) -> u64 {
        let size = self.estimate_size(quorum, input_count, output_count);
        (size as f64 * fee_per_kb as f64 / 1000.0).round() as u64
    }

    fn signing_paths(&self, plan: &TxPlan) -> Result<Vec<DerivationPath>> {
        plan.inputs
            .iter()
            .map(|coin| {
                coin.path.ok_or_else(|| {
                    WalletError::invalid_request(format!(
                        "Input {} is not owned by a wallet address",
                        coin.key()
                    ))
                })
            })
            .collect()
    }

    fn build_unsigned_tx(&self, keys: &WalletKeys, plan: &TxPlan) -> Result<TxBlob> {
        let paths = self.signing_paths(plan)?;

        let mut tx_inputs = Vec::with_capacity(plan.inputs.len());
        for coin in &plan.inputs {
            let txid = Txid::from_str(&coin.txid)
                .map_err(|e| WalletError::invalid_request(format!("Invalid txid: {}", e)))?;
            tx_inputs.push(TxIn {
                previous_output: OutPoint {
                    txid,
                    vout: coin.vout,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::default(),
            });
        }

        let mut tx_outputs = Vec::with_capacity(plan.outputs.len() + 1);
        for output in &plan.outputs {
            let address = Self::parse_address(&output.to_address, plan.network)?;
            tx_outputs.push(TxOut {
                value: Amount::from_sat(output.amount),
                script_pubkey: address.script_pubkey(),
            });
        }
        if let Some(change_address) = &plan.change_address {
            if plan.change_amount > 0 {
                let address = Self::parse_address(change_address, plan.network)
                    .map_err(|e| WalletError::new(ErrorKind::InvalidChangeAddress, e.message))?;
                tx_outputs.push(TxOut {
                    value: Amount::from_sat(plan.change_amount),
                    script_pubkey: address.script_pubkey(),
                });
            }
        }

        let unsigned_tx = Transaction {
            version: Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: tx_inputs,
            output: tx_outputs,
        };

        let mut slots = Vec::with_capacity(paths.len());
        {
            let mut sighash_cache = SighashCache::new(&unsigned_tx);
            for (i, (coin, path)) in plan.inputs.iter().zip(&paths).enumerate() {
                let value = Amount::from_sat(coin.amount);
                let digest = if keys.ring.len() == 1 {
                    let script_pubkey = Self::address_for(keys, path)?.script_pubkey();
                    sighash_cache
                        .p2wpkh_signature_hash(i, &script_pubkey, value, EcdsaSighashType::All)
                        .map_err(|e| {
                            WalletError::invalid_request(format!("Sighash error: {}", e))
                        })?
                        .to_byte_array()
                } else {
                    let witness_script = Self::witness_script(keys, path)?;
                    sighash_cache
                        .p2wsh_signature_hash(i, &witness_script, value, EcdsaSighashType::All)
                        .map_err(|e| {
                            WalletError::invalid_request(format!("Sighash error: {}", e))
                        })?
                        .to_byte_array()
                };
                slots.push(SigningSlot::new(*path, digest));
            }
        }

        tracing::debug!(
            "Built unsigned tx inputs={} outputs={} fee={}",
            unsigned_tx.input.len(),
            unsigned_tx.output.len(),
            plan.fee
        );

        Ok(TxBlob {
            raw: serialize_hex(&unsigned_tx),
            slots,
        })
    }

    fn apply_signatures(
        &self,
        blob: &TxBlob,
        keys: &WalletKeys,
        sets: &[SignatureSet],
    ) -> Result<SignedTx> {
        let mut tx = Self::decode_tx(&blob.raw)?;
        if blob.slots.len() != tx.input.len() {
            return Err(WalletError::invalid_request(format!(
                "Expected {} signing slots, got {}",
                tx.input.len(),
                blob.slots.len()
            )));
        }
        if sets.len() < keys.quorum.m {
            return Err(WalletError::invalid_request(format!(
                "Need {} signature sets, got {}",
                keys.quorum.m,
                sets.len()
            )));
        }

        for (i, slot) in blob.slots.iter().enumerate() {
            let mut signed: Vec<(PublicKey, Vec<u8>)> = Vec::with_capacity(sets.len());
            for set in sets {
                let signature = set.signatures.get(i).ok_or_else(|| {
                    WalletError::invalid_request(format!(
                        "Copayer {} has no signature for input {}",
                        set.copayer_index, i
                    ))
                })?;
                let key = keys.ring.derive_for(set.copayer_index, &slot.path)?;
                signed.push((key, Self::signature_bytes(signature)?));
            }

            let witness = if keys.ring.len() == 1 {
                let (key, signature) = &signed[0];
                Witness::from_slice(&[signature.clone(), key.serialize().to_vec()])
            } else {
                // CHECKMULTISIG expects signatures in script key order.
                signed.sort_by_key(|(key, _)| key.serialize());
                let witness_script = Self::witness_script(keys, &slot.path)?;
                let mut items: Vec<Vec<u8>> = Vec::with_capacity(keys.quorum.m + 2);
                items.push(Vec::new());
                items.extend(
                    signed
                        .into_iter()
                        .take(keys.quorum.m)
                        .map(|(_, signature)| signature),
                );
                items.push(witness_script.to_bytes());
                Witness::from_slice(&items)
            };
            tx.input[i].witness = witness;
        }

        let txid = tx.compute_txid().to_string();
        tracing::info!("Finalized tx txid={} inputs={}", txid, tx.input.len());

        Ok(SignedTx {
            raw: serialize_hex(&tx),
            txid,
        })
    }
}
