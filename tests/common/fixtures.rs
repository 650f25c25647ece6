//! Key material and request fixtures.

use bitcoin::bip32::{ChildNumber, Xpriv, Xpub};
use bitcoin::secp256k1::Secp256k1;
use quorum_chains::TxBlob;
use quorum_crypto::{copayer_hash, copayer_id, KeyPair};
use quorum_engine::{CreateOptions, FeeSpec, NewCopayer, ProposalRequest};
use quorum_types::{CopayerId, TxOutput};

pub const BTC_DESTINATION: &str = "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx";
pub const ETH_DESTINATION: &str = "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf";

/// A copayer's private side: extended key for signing inputs and request
/// key for signing drafts.
pub struct TestCopayer {
    pub name: String,
    pub xpriv: Xpriv,
    pub xpub: String,
    pub request_key: KeyPair,
}

impl TestCopayer {
    /// Deterministic extended key from `seed`; the request key is random.
    pub fn new(seed: u8) -> Self {
        let xpriv = Xpriv::new_master(bitcoin::Network::Testnet, &[seed; 32]).unwrap();
        let xpub = Xpub::from_priv(&Secp256k1::new(), &xpriv).to_string();
        Self {
            name: format!("copayer-{}", seed),
            xpriv,
            xpub,
            request_key: KeyPair::generate(),
        }
    }

    pub fn id(&self) -> CopayerId {
        copayer_id(&self.xpub)
    }

    /// Join request signed with the wallet join key.
    pub fn join_request(&self, wallet_key: &KeyPair) -> NewCopayer {
        let request_pub_key = self.request_key.public_key();
        let signature =
            wallet_key.sign(copayer_hash(&self.name, &self.xpub, &request_pub_key).as_bytes());
        NewCopayer {
            name: self.name.clone(),
            xpub: self.xpub.clone(),
            request_pub_key,
            copayer_signature: signature,
        }
    }

    /// One signature per signing slot, from the slot's child key.
    pub fn sign_slots(&self, blob: &TxBlob) -> Vec<String> {
        let secp = Secp256k1::new();
        blob.slots
            .iter()
            .map(|slot| {
                let path = [
                    ChildNumber::from_normal_idx(slot.path.branch()).unwrap(),
                    ChildNumber::from_normal_idx(slot.path.index).unwrap(),
                ];
                let child = self.xpriv.derive_priv(&secp, &path).unwrap();
                KeyPair::from_bytes(&child.private_key.secret_bytes())
                    .unwrap()
                    .sign_digest(slot.digest_bytes().unwrap())
            })
            .collect()
    }

    pub fn sign_proposal(&self, blob: &TxBlob) -> String {
        self.request_key.sign_digest(blob.proposal_digest())
    }
}

/// Copayers seeded 1..=n.
pub fn copayers(n: usize) -> Vec<TestCopayer> {
    (1..=n as u8).map(TestCopayer::new).collect()
}

/// A single-output payment at the default fee level.
pub fn payment(to: &str, amount: u64) -> ProposalRequest {
    ProposalRequest {
        outputs: vec![TxOutput {
            to_address: to.to_string(),
            amount,
            message: None,
            data: None,
        }],
        fee: FeeSpec::default(),
        options: CreateOptions::default(),
    }
}

pub fn draft_payment(to: &str, amount: u64) -> ProposalRequest {
    let mut request = payment(to, amount);
    request.options.draft = true;
    request
}
