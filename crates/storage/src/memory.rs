use async_trait::async_trait;
use quorum_types::{
    Address, CopayerId, ProposalId, ProposalStatus, RejectionCounter, Result, TxProposal, Wallet,
    WalletId,
};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::WalletStore;

/// Ephemeral store for tests and single-shot tools.
#[derive(Default)]
pub struct InMemoryStore {
    wallets: RwLock<HashMap<WalletId, Wallet>>,
    addresses: RwLock<HashMap<WalletId, Vec<Address>>>,
    proposals: RwLock<HashMap<ProposalId, TxProposal>>,
    rejection_counters: RwLock<HashMap<(WalletId, CopayerId), RejectionCounter>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn oldest_first(mut proposals: Vec<TxProposal>) -> Vec<TxProposal> {
    proposals.sort_by(|a, b| {
        a.created_on
            .cmp(&b.created_on)
            .then_with(|| a.id.cmp(&b.id))
    });
    proposals
}

#[async_trait]
impl WalletStore for InMemoryStore {
    async fn store_wallet(&self, wallet: &Wallet) -> Result<()> {
        self.wallets
            .write()
            .await
            .insert(wallet.id.clone(), wallet.clone());
        Ok(())
    }

    async fn fetch_wallet(&self, wallet_id: &WalletId) -> Result<Option<Wallet>> {
        Ok(self.wallets.read().await.get(wallet_id).cloned())
    }

    async fn list_wallets(&self) -> Result<Vec<Wallet>> {
        let mut wallets: Vec<Wallet> = self.wallets.read().await.values().cloned().collect();
        wallets.sort_by(|a, b| a.created_on.cmp(&b.created_on));
        Ok(wallets)
    }

    async fn store_address(&self, address: &Address) -> Result<()> {
        let mut addresses = self.addresses.write().await;
        let entries = addresses.entry(address.wallet_id.clone()).or_default();
        match entries.iter_mut().find(|a| a.address == address.address) {
            Some(existing) => *existing = address.clone(),
            None => entries.push(address.clone()),
        }
        Ok(())
    }

    async fn fetch_addresses(&self, wallet_id: &WalletId) -> Result<Vec<Address>> {
        let mut addresses = self
            .addresses
            .read()
            .await
            .get(wallet_id)
            .cloned()
            .unwrap_or_default();
        addresses.sort_by_key(|a| a.path);
        Ok(addresses)
    }

    async fn store_proposal(&self, proposal: &TxProposal) -> Result<()> {
        self.proposals
            .write()
            .await
            .insert(proposal.id.clone(), proposal.clone());
        Ok(())
    }

    async fn fetch_proposal(
        &self,
        wallet_id: &WalletId,
        proposal_id: &ProposalId,
    ) -> Result<Option<TxProposal>> {
        Ok(self
            .proposals
            .read()
            .await
            .get(proposal_id)
            .filter(|p| &p.wallet_id == wallet_id)
            .cloned())
    }

    async fn fetch_proposals(
        &self,
        wallet_id: &WalletId,
        status: Option<ProposalStatus>,
    ) -> Result<Vec<TxProposal>> {
        let proposals = self
            .proposals
            .read()
            .await
            .values()
            .filter(|p| &p.wallet_id == wallet_id)
            .filter(|p| status.map_or(true, |s| p.status == s))
            .cloned()
            .collect();
        Ok(oldest_first(proposals))
    }

    async fn fetch_proposals_by_status(&self, status: ProposalStatus) -> Result<Vec<TxProposal>> {
        let proposals = self
            .proposals
            .read()
            .await
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect();
        Ok(oldest_first(proposals))
    }

    async fn remove_proposal(&self, wallet_id: &WalletId, proposal_id: &ProposalId) -> Result<()> {
        let mut proposals = self.proposals.write().await;
        if proposals
            .get(proposal_id)
            .map_or(false, |p| &p.wallet_id == wallet_id)
        {
            proposals.remove(proposal_id);
        }
        Ok(())
    }

    async fn fetch_rejection_counter(
        &self,
        wallet_id: &WalletId,
        copayer_id: &CopayerId,
    ) -> Result<Option<RejectionCounter>> {
        Ok(self
            .rejection_counters
            .read()
            .await
            .get(&(wallet_id.clone(), copayer_id.clone()))
            .cloned())
    }

    async fn store_rejection_counter(&self, counter: &RejectionCounter) -> Result<()> {
        self.rejection_counters.write().await.insert(
            (counter.wallet_id.clone(), counter.copayer_id.clone()),
            counter.clone(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use quorum_types::{Chain, DerivationPath, Network};

    fn address(wallet_id: &WalletId, path: DerivationPath, s: &str) -> Address {
        Address {
            wallet_id: wallet_id.clone(),
            chain: Chain::Btc,
            network: Network::Testnet,
            address: s.to_string(),
            path,
            has_activity: false,
            created_on: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_addresses_are_ordered_by_path_and_replaced_in_place() {
        let store = InMemoryStore::new();
        let wallet_id = WalletId::from("w1");

        store
            .store_address(&address(&wallet_id, DerivationPath::new(true, 0), "c0"))
            .await
            .unwrap();
        store
            .store_address(&address(&wallet_id, DerivationPath::new(false, 1), "r1"))
            .await
            .unwrap();
        store
            .store_address(&address(&wallet_id, DerivationPath::new(false, 0), "r0"))
            .await
            .unwrap();

        let mut used = address(&wallet_id, DerivationPath::new(false, 1), "r1");
        used.has_activity = true;
        store.store_address(&used).await.unwrap();

        let all = store.fetch_addresses(&wallet_id).await.unwrap();
        let names: Vec<&str> = all.iter().map(|a| a.address.as_str()).collect();
        assert_eq!(names, vec!["r0", "r1", "c0"]);
        assert!(all[1].has_activity);
    }

    #[tokio::test]
    async fn test_rejection_counters_are_per_copayer() {
        let store = InMemoryStore::new();
        let wallet_id = WalletId::from("w1");
        let counter = RejectionCounter {
            wallet_id: wallet_id.clone(),
            copayer_id: CopayerId::from("c1"),
            count: 3,
            last_rejection_on: Utc::now(),
        };
        store.store_rejection_counter(&counter).await.unwrap();

        let fetched = store
            .fetch_rejection_counter(&wallet_id, &CopayerId::from("c1"))
            .await
            .unwrap();
        assert_eq!(fetched.map(|c| c.count), Some(3));
        assert!(store
            .fetch_rejection_counter(&wallet_id, &CopayerId::from("c2"))
            .await
            .unwrap()
            .is_none());
    }
}
