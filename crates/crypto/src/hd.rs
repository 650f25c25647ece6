//! BIP32 public derivation over copayer extended keys.
//!
//! Only non-hardened derivation is possible since the server never holds
//! private keys. Each copayer's xpub is treated as the account-level key and
//! addresses are derived at `account/<isChange>/<index>`.

use bitcoin::bip32::{ChildNumber, Xpub};
use bitcoin::secp256k1::{PublicKey, Secp256k1};
use bitcoin::NetworkKind;
use quorum_types::{DerivationPath, Network, Result, WalletError};
use std::str::FromStr;

/// Parses an extended public key and checks it belongs to `network`.
pub fn parse_xpub(xpub: &str, network: Network) -> Result<Xpub> {
    let key = Xpub::from_str(xpub)
        .map_err(|e| WalletError::invalid_request(format!("Invalid extended public key: {}", e)))?;

    let expected = match network {
        Network::Livenet => NetworkKind::Main,
        Network::Testnet | Network::Regtest => NetworkKind::Test,
    };
    if key.network != expected {
        return Err(WalletError::invalid_request(format!(
            "Extended public key is not valid for network {}",
            network
        )));
    }
    Ok(key)
}

/// Derives the child public key of `xpub` at `path`.
pub fn derive_child(xpub: &Xpub, path: &DerivationPath) -> Result<PublicKey> {
    let secp = Secp256k1::verification_only();
    let children = [
        ChildNumber::from_normal_idx(path.branch())
            .map_err(|e| WalletError::invalid_request(format!("Invalid branch: {}", e)))?,
        ChildNumber::from_normal_idx(path.index)
            .map_err(|e| WalletError::invalid_request(format!("Invalid index: {}", e)))?,
    ];

    let child = xpub
        .derive_pub(&secp, &children)
        .map_err(|e| WalletError::invalid_request(format!("Derivation failed at {}: {}", path, e)))?;

    tracing::trace!("Derived child key at {}: {}", path, child.public_key);
    Ok(child.public_key)
}

/// The extended public keys of a wallet, in copayer order.
#[derive(Debug, Clone)]
pub struct PublicKeyRing {
    xpubs: Vec<Xpub>,
}

impl PublicKeyRing {
    pub fn new(xpubs: Vec<Xpub>) -> Self {
        Self { xpubs }
    }

    pub fn from_strings(xpubs: &[String], network: Network) -> Result<Self> {
        let xpubs = xpubs
            .iter()
            .map(|x| parse_xpub(x, network))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { xpubs })
    }

    pub fn len(&self) -> usize {
        self.xpubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xpubs.is_empty()
    }

    /// Child keys at `path`, in copayer order.
    pub fn derive(&self, path: &DerivationPath) -> Result<Vec<PublicKey>> {
        self.xpubs.iter().map(|x| derive_child(x, path)).collect()
    }

    /// Child keys at `path`, sorted lexicographically by serialization
    /// (the order used in sorted multisig scripts).
    pub fn derive_sorted(&self, path: &DerivationPath) -> Result<Vec<PublicKey>> {
        let mut keys = self.derive(path)?;
        keys.sort_by_key(|k| k.serialize());
        Ok(keys)
    }

    /// Child key of a single copayer at `path`.
    pub fn derive_for(&self, copayer_index: usize, path: &DerivationPath) -> Result<PublicKey> {
        let xpub = self.xpubs.get(copayer_index).ok_or_else(|| {
            WalletError::invalid_request(format!("No copayer at index {}", copayer_index))
        })?;
        derive_child(xpub, path)
    }
}
