use chrono::Utc;
use quorum_crypto::{copayer_hash, copayer_id, parse_public_key, parse_xpub, verify_signature};
use quorum_storage::WalletStore;
use quorum_types::{
    Chain, Copayer, CopayerId, ErrorKind, Network, Quorum, Result, Wallet, WalletError, WalletId,
    WalletStatus,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Parameters of a new wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWallet {
    pub name: String,
    pub chain: Chain,
    pub network: Network,
    pub m: usize,
    pub n: usize,
    /// Compressed public half of the wallet join key.
    pub pub_key: String,
}

/// A copayer asking to join a wallet.
///
/// `copayer_signature` is made with the wallet join key over
/// `copayer_hash(name, xpub, request_pub_key)`, proving the joiner was
/// invited by whoever holds the wallet secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCopayer {
    pub name: String,
    pub xpub: String,
    pub request_pub_key: String,
    pub copayer_signature: String,
}

/// Wallet, copayer and quorum metadata.
pub struct WalletRegistry {
    store: Arc<dyn WalletStore>,
    max_keys: usize,
}

impl WalletRegistry {
    pub fn new(store: Arc<dyn WalletStore>, max_keys: usize) -> Self {
        Self { store, max_keys }
    }

    pub async fn create(&self, params: NewWallet) -> Result<Wallet> {
        if params.name.trim().is_empty() {
            return Err(WalletError::invalid_request("Wallet name is required"));
        }
        let quorum = Quorum::new(params.m, params.n, self.max_keys)?;
        parse_public_key(&params.pub_key)?;

        let wallet = Wallet {
            id: WalletId::generate(),
            name: params.name,
            chain: params.chain,
            network: params.network,
            m: quorum.m,
            n: quorum.n,
            pub_key: params.pub_key,
            copayers: Vec::new(),
            status: WalletStatus::Pending,
            created_on: Utc::now(),
            deleted: false,
        };
        self.store.store_wallet(&wallet).await?;

        info!(
            "Created wallet wallet_id={} chain={} network={} quorum={}-of-{}",
            wallet.id, wallet.chain, wallet.network, wallet.m, wallet.n
        );
        Ok(wallet)
    }

    pub async fn join(&self, wallet_id: &WalletId, request: NewCopayer) -> Result<(Wallet, Copayer)> {
        let mut wallet = self.get(wallet_id).await?;

        let message = copayer_hash(&request.name, &request.xpub, &request.request_pub_key);
        verify_signature(
            &wallet.pub_key,
            message.as_bytes(),
            &request.copayer_signature,
        )
        .map_err(|_| WalletError::new(ErrorKind::NotAuthorized, "Bad request: invalid copayer signature"))?;

        parse_xpub(&request.xpub, wallet.network)?;
        parse_public_key(&request.request_pub_key)?;

        let id = copayer_id(&request.xpub);
        if wallet.copayer(&id).is_some() {
            return Err(ErrorKind::CopayerRegistered.into());
        }
        if wallet.copayers.len() >= wallet.n {
            return Err(ErrorKind::WalletFull.into());
        }

        let copayer = Copayer {
            id,
            wallet_id: wallet.id.clone(),
            name: request.name,
            xpub: request.xpub,
            request_pub_key: request.request_pub_key,
            index: wallet.copayers.len(),
            created_on: Utc::now(),
        };
        wallet.copayers.push(copayer.clone());
        if wallet.copayers.len() == wallet.n {
            wallet.status = WalletStatus::Complete;
        }
        self.store.store_wallet(&wallet).await?;

        info!(
            "Copayer joined wallet_id={} copayer_id={} index={} complete={}",
            wallet.id,
            copayer.id,
            copayer.index,
            wallet.is_complete()
        );
        Ok((wallet, copayer))
    }

    pub async fn get(&self, wallet_id: &WalletId) -> Result<Wallet> {
        match self.store.fetch_wallet(wallet_id).await? {
            Some(wallet) if !wallet.deleted => Ok(wallet),
            _ => Err(ErrorKind::WalletNotFound.into()),
        }
    }
}

/// The acting copayer, which must belong to `wallet`.
pub fn authorize<'a>(wallet: &'a Wallet, copayer_id: &CopayerId) -> Result<&'a Copayer> {
    wallet.copayer(copayer_id).ok_or_else(|| {
        WalletError::new(
            ErrorKind::NotAuthorized,
            format!("Copayer {} is not a member of wallet {}", copayer_id, wallet.id),
        )
    })
}
