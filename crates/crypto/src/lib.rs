//! Hashing, request-key signatures and BIP32 public derivation.

pub mod hd;

use bitcoin::secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey};
use quorum_types::{CopayerId, ErrorKind, Result, WalletError};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use sha3::Keccak256;

pub use hd::{parse_xpub, PublicKeyRing};

/// A secp256k1 key pair. Copayers use one as their request key and the
/// wallet creator uses one to authorize joins.
pub struct KeyPair {
    secret_key: SecretKey,
    public_key: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secp = Secp256k1::signing_only();
        loop {
            let mut bytes = [0u8; 32];
            OsRng.fill_bytes(&mut bytes);
            if let Ok(secret_key) = SecretKey::from_slice(&bytes) {
                let public_key = PublicKey::from_secret_key(&secp, &secret_key);
                return Self {
                    secret_key,
                    public_key,
                };
            }
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 32 {
            return Err(WalletError::invalid_request(
                "Invalid key length: expected 32 bytes",
            ));
        }
        let secret_key = SecretKey::from_slice(bytes)
            .map_err(|e| WalletError::invalid_request(format!("Failed to parse private key: {}", e)))?;
        let secp = Secp256k1::signing_only();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Ok(Self {
            secret_key,
            public_key,
        })
    }

    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key)
            .map_err(|e| WalletError::invalid_request(format!("Invalid private key hex: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    /// DER signature (hex) over `sha256(message)`.
    pub fn sign(&self, message: &[u8]) -> String {
        self.sign_digest(hash_data(message))
    }

    /// DER signature (hex) over a precomputed 32-byte digest.
    pub fn sign_digest(&self, digest: [u8; 32]) -> String {
        let secp = Secp256k1::signing_only();
        let signature = secp.sign_ecdsa(&Message::from_digest(digest), &self.secret_key);
        hex::encode(&signature.serialize_der()[..])
    }

    /// Compressed public key, hex encoded.
    pub fn public_key(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    pub fn private_key(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }
}

pub fn parse_public_key(hex_key: &str) -> Result<PublicKey> {
    let bytes = hex::decode(hex_key)
        .map_err(|e| WalletError::invalid_request(format!("Invalid public key hex: {}", e)))?;
    PublicKey::from_slice(&bytes)
        .map_err(|e| WalletError::invalid_request(format!("Invalid public key: {}", e)))
}

/// Decodes a DER or 64-byte compact ECDSA signature and normalizes it to low-S.
pub fn parse_signature(hex_sig: &str) -> Option<Signature> {
    let bytes = hex::decode(hex_sig).ok()?;
    let mut signature = if bytes.len() == 64 {
        Signature::from_compact(&bytes).ok()?
    } else {
        Signature::from_der(&bytes).ok()?
    };
    signature.normalize_s();
    Some(signature)
}

/// Verifies an ECDSA signature over a 32-byte digest.
pub fn verify_digest(public_key: &PublicKey, digest: [u8; 32], signature: &str) -> bool {
    let Some(signature) = parse_signature(signature) else {
        return false;
    };
    let secp = Secp256k1::verification_only();
    secp.verify_ecdsa(&Message::from_digest(digest), &signature, public_key)
        .is_ok()
}

/// Verifies a request signature over `sha256(message)`.
pub fn verify_signature(public_key: &str, message: &[u8], signature: &str) -> Result<()> {
    let public_key = parse_public_key(public_key)?;
    if verify_digest(&public_key, hash_data(message), signature) {
        Ok(())
    } else {
        Err(WalletError::new(ErrorKind::NotAuthorized, "Invalid signature"))
    }
}

pub fn hash_data(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Copayer ids are derived from the extended public key so every server
/// instance assigns the same id.
pub fn copayer_id(xpub: &str) -> CopayerId {
    CopayerId(hex::encode(hash_data(xpub.as_bytes())))
}

/// The message a joining copayer's entry is signed over with the wallet key.
pub fn copayer_hash(name: &str, xpub: &str, request_pub_key: &str) -> String {
    format!("{}|{}|{}", name, xpub, request_pub_key)
}
