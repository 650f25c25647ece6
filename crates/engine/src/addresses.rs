//! Deterministic address allocation with an unused-address gap limit.
//!
//! Addresses live at `m/<0|1>/<index>` on every copayer's extended key and
//! are issued in index order per branch. Issuing stops once too many
//! addresses in a row have never seen activity, so a wallet restored from its
//! keys can always find every funded address by scanning a bounded gap.

use chrono::Utc;
use quorum_chains::{ChainRegistry, ChainStateProvider, WalletKeys};
use quorum_storage::WalletStore;
use quorum_types::{Address, AddressConfig, DerivationPath, ErrorKind, Result, Wallet, WalletError};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

pub struct AddressManager {
    store: Arc<dyn WalletStore>,
    chains: Arc<ChainRegistry>,
    provider: Arc<dyn ChainStateProvider>,
    config: AddressConfig,
}

/// Number of addresses after the last one with activity.
fn trailing_unused(addresses: &[Address]) -> usize {
    addresses
        .iter()
        .rev()
        .take_while(|a| !a.has_activity)
        .count()
}

impl AddressManager {
    pub fn new(
        store: Arc<dyn WalletStore>,
        chains: Arc<ChainRegistry>,
        provider: Arc<dyn ChainStateProvider>,
        config: AddressConfig,
    ) -> Self {
        Self {
            store,
            chains,
            provider,
            config,
        }
    }

    /// Addresses of `wallet`, optionally restricted to one branch, in path order.
    pub async fn list(&self, wallet: &Wallet, is_change: Option<bool>) -> Result<Vec<Address>> {
        let addresses = self.store.fetch_addresses(&wallet.id).await?;
        Ok(addresses
            .into_iter()
            .filter(|a| is_change.map_or(true, |c| a.path.is_change == c))
            .collect())
    }

    /// The last issued address of a branch, without issuing a new one.
    pub async fn peek_current(&self, wallet: &Wallet, is_change: bool) -> Result<Option<Address>> {
        Ok(self.list(wallet, Some(is_change)).await?.pop())
    }

    /// Issues and persists the next address of a branch.
    ///
    /// Fails with `MAIN_ADDRESS_GAP_REACHED` once the unused run reaches the
    /// gap limit. `ignore_max_gap` relaxes the limit to the scan gap.
    pub async fn derive_next(
        &self,
        wallet: &Wallet,
        is_change: bool,
        ignore_max_gap: bool,
    ) -> Result<Address> {
        let adapter = self.chains.get(wallet.chain)?;
        let keys = WalletKeys::from_wallet(wallet)?;

        let mut branch = self.list(wallet, Some(is_change)).await?;
        let limit = if ignore_max_gap {
            self.config.scan_address_gap
        } else {
            self.config.max_main_address_gap
        };

        if trailing_unused(&branch) >= limit {
            self.refresh_activity(wallet, &mut branch, limit).await?;
            if trailing_unused(&branch) >= limit {
                info!(
                    "Address gap reached wallet_id={} branch={} limit={}",
                    wallet.id,
                    u32::from(is_change),
                    limit
                );
                return Err(ErrorKind::MainAddressGapReached.into());
            }
        }

        let index = match branch.last() {
            Some(last) => last.path.index.checked_add(1).ok_or_else(|| {
                WalletError::invalid_request("Address index space exhausted")
            })?,
            None => 0,
        };
        let path = DerivationPath::new(is_change, index);

        let address = Address {
            wallet_id: wallet.id.clone(),
            chain: wallet.chain,
            network: wallet.network,
            address: adapter.derive_address(&keys, &path)?,
            path,
            has_activity: false,
            created_on: Utc::now(),
        };
        self.store.store_address(&address).await?;

        debug!(
            "Issued address wallet_id={} path={} address={}",
            wallet.id, path, address.address
        );
        Ok(address)
    }

    /// Flags the given wallet addresses as used. Returns how many changed.
    pub async fn mark_used(&self, wallet: &Wallet, addresses: &[String]) -> Result<usize> {
        let wanted: HashSet<&str> = addresses.iter().map(String::as_str).collect();
        let mut changed = 0;
        for mut address in self.list(wallet, None).await? {
            if !address.has_activity && wanted.contains(address.address.as_str()) {
                address.has_activity = true;
                self.store.store_address(&address).await?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Asks the chain whether any address in the trailing unused run now
    /// holds coins, and marks those as used.
    async fn refresh_activity(
        &self,
        wallet: &Wallet,
        branch: &mut [Address],
        limit: usize,
    ) -> Result<()> {
        let start = branch.len().saturating_sub(limit);
        let trailing: Vec<String> = branch[start..]
            .iter()
            .filter(|a| !a.has_activity)
            .map(|a| a.address.clone())
            .collect();
        if trailing.is_empty() {
            return Ok(());
        }

        let coins = self
            .provider
            .get_candidate_coins(wallet.chain, wallet.network, &trailing)
            .await?;
        let funded: HashSet<&str> = coins.iter().map(|c| c.address.as_str()).collect();

        for address in branch[start..].iter_mut() {
            if !address.has_activity && funded.contains(address.address.as_str()) {
                address.has_activity = true;
                self.store.store_address(address).await?;
            }
        }
        debug!(
            "Refreshed address activity wallet_id={} checked={} funded={}",
            wallet.id,
            trailing.len(),
            funded.len()
        );
        Ok(())
    }
}
