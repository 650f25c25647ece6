//! Durable SQLite store.
//!
//! Each collection is a table with its lookup columns broken out and the full
//! record kept as a JSON payload.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use quorum_types::{
    Address, CopayerId, ProposalId, ProposalStatus, RejectionCounter, Result, TxProposal, Wallet,
    WalletError, WalletId,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::WalletStore;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS wallets (
        id TEXT PRIMARY KEY,
        created_on TEXT NOT NULL,
        payload TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS addresses (
        wallet_id TEXT NOT NULL,
        address TEXT NOT NULL,
        is_change INTEGER NOT NULL,
        path_index INTEGER NOT NULL,
        payload TEXT NOT NULL,
        PRIMARY KEY (wallet_id, address)
    );
    CREATE TABLE IF NOT EXISTS proposals (
        id TEXT PRIMARY KEY,
        wallet_id TEXT NOT NULL,
        status TEXT NOT NULL,
        created_on TEXT NOT NULL,
        payload TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_proposals_wallet ON proposals (wallet_id, status);
    CREATE TABLE IF NOT EXISTS rejection_counters (
        wallet_id TEXT NOT NULL,
        copayer_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        PRIMARY KEY (wallet_id, copayer_id)
    );
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| WalletError::storage(format!("Failed to open database: {}", e)))?;
        Self::with_connection(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            WalletError::storage(format!("Failed to open in-memory database: {}", e))
        })?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| WalletError::storage(format!("Failed to create schema: {}", e)))?;
        tracing::debug!("Wallet store schema initialized");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| WalletError::storage(format!("Lock error: {}", e)))
    }

    fn query_payloads<T: DeserializeOwned>(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<T>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| WalletError::storage(format!("Query error: {}", e)))?;
        let rows = stmt
            .query_map(args, |row| row.get::<_, String>(0))
            .map_err(|e| WalletError::storage(format!("Query error: {}", e)))?;

        let mut records = Vec::new();
        for row in rows {
            let payload = row.map_err(|e| WalletError::storage(format!("Row error: {}", e)))?;
            records.push(decode(&payload)?);
        }
        Ok(records)
    }

    fn query_payload<T: DeserializeOwned>(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Option<T>> {
        let conn = self.conn()?;
        let payload: Option<String> = conn
            .query_row(sql, args, |row| row.get(0))
            .optional()
            .map_err(|e| WalletError::storage(format!("Query error: {}", e)))?;
        payload.as_deref().map(decode).transpose()
    }
}

/// Fixed-width timestamps so text ordering matches time ordering.
fn timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn encode<T: Serialize>(record: &T) -> Result<String> {
    serde_json::to_string(record)
        .map_err(|e| WalletError::storage(format!("Failed to encode record: {}", e)))
}

fn decode<T: DeserializeOwned>(payload: &str) -> Result<T> {
    serde_json::from_str(payload)
        .map_err(|e| WalletError::storage(format!("Failed to decode record: {}", e)))
}

#[async_trait]
impl WalletStore for SqliteStore {
    async fn store_wallet(&self, wallet: &Wallet) -> Result<()> {
        let payload = encode(wallet)?;
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO wallets (id, created_on, payload) VALUES (?1, ?2, ?3)",
                params![wallet.id.as_str(), timestamp(&wallet.created_on), payload],
            )
            .map_err(|e| WalletError::storage(format!("Failed to save wallet: {}", e)))?;
        tracing::debug!("Saved wallet wallet_id={}", wallet.id);
        Ok(())
    }

    async fn fetch_wallet(&self, wallet_id: &WalletId) -> Result<Option<Wallet>> {
        self.query_payload(
            "SELECT payload FROM wallets WHERE id = ?1",
            &[&wallet_id.as_str()],
        )
    }

    async fn list_wallets(&self) -> Result<Vec<Wallet>> {
        self.query_payloads("SELECT payload FROM wallets ORDER BY created_on, id", &[])
    }

    async fn store_address(&self, address: &Address) -> Result<()> {
        let payload = encode(address)?;
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO addresses (wallet_id, address, is_change, path_index, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    address.wallet_id.as_str(),
                    address.address,
                    address.path.is_change,
                    address.path.index,
                    payload
                ],
            )
            .map_err(|e| WalletError::storage(format!("Failed to save address: {}", e)))?;
        Ok(())
    }

    async fn fetch_addresses(&self, wallet_id: &WalletId) -> Result<Vec<Address>> {
        self.query_payloads(
            "SELECT payload FROM addresses WHERE wallet_id = ?1 ORDER BY is_change, path_index",
            &[&wallet_id.as_str()],
        )
    }

    async fn store_proposal(&self, proposal: &TxProposal) -> Result<()> {
        let payload = encode(proposal)?;
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO proposals (id, wallet_id, status, created_on, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    proposal.id.as_str(),
                    proposal.wallet_id.as_str(),
                    proposal.status.as_str(),
                    timestamp(&proposal.created_on),
                    payload
                ],
            )
            .map_err(|e| WalletError::storage(format!("Failed to save proposal: {}", e)))?;
        tracing::debug!(
            "Saved proposal proposal_id={} status={}",
            proposal.id,
            proposal.status
        );
        Ok(())
    }

    async fn fetch_proposal(
        &self,
        wallet_id: &WalletId,
        proposal_id: &ProposalId,
    ) -> Result<Option<TxProposal>> {
        self.query_payload(
            "SELECT payload FROM proposals WHERE id = ?1 AND wallet_id = ?2",
            &[&proposal_id.as_str(), &wallet_id.as_str()],
        )
    }

    async fn fetch_proposals(
        &self,
        wallet_id: &WalletId,
        status: Option<ProposalStatus>,
    ) -> Result<Vec<TxProposal>> {
        match status {
            Some(status) => self.query_payloads(
                "SELECT payload FROM proposals WHERE wallet_id = ?1 AND status = ?2
                 ORDER BY created_on, id",
                &[&wallet_id.as_str(), &status.as_str()],
            ),
            None => self.query_payloads(
                "SELECT payload FROM proposals WHERE wallet_id = ?1 ORDER BY created_on, id",
                &[&wallet_id.as_str()],
            ),
        }
    }

    async fn fetch_proposals_by_status(&self, status: ProposalStatus) -> Result<Vec<TxProposal>> {
        self.query_payloads(
            "SELECT payload FROM proposals WHERE status = ?1 ORDER BY created_on, id",
            &[&status.as_str()],
        )
    }

    async fn remove_proposal(&self, wallet_id: &WalletId, proposal_id: &ProposalId) -> Result<()> {
        self.conn()?
            .execute(
                "DELETE FROM proposals WHERE id = ?1 AND wallet_id = ?2",
                params![proposal_id.as_str(), wallet_id.as_str()],
            )
            .map_err(|e| WalletError::storage(format!("Failed to remove proposal: {}", e)))?;
        Ok(())
    }

    async fn fetch_rejection_counter(
        &self,
        wallet_id: &WalletId,
        copayer_id: &CopayerId,
    ) -> Result<Option<RejectionCounter>> {
        self.query_payload(
            "SELECT payload FROM rejection_counters WHERE wallet_id = ?1 AND copayer_id = ?2",
            &[&wallet_id.as_str(), &copayer_id.as_str()],
        )
    }

    async fn store_rejection_counter(&self, counter: &RejectionCounter) -> Result<()> {
        let payload = encode(counter)?;
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO rejection_counters (wallet_id, copayer_id, payload)
                 VALUES (?1, ?2, ?3)",
                params![counter.wallet_id.as_str(), counter.copayer_id.as_str(), payload],
            )
            .map_err(|e| WalletError::storage(format!("Failed to save rejection counter: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use quorum_types::{
        Chain, Copayer, DerivationPath, FeeLevelName, Network, TxOutput, WalletStatus,
    };
    use tempfile::TempDir;

    fn wallet() -> Wallet {
        let id = WalletId::from("wallet-1");
        Wallet {
            id: id.clone(),
            name: "treasury".to_string(),
            chain: Chain::Btc,
            network: Network::Testnet,
            m: 2,
            n: 3,
            pub_key: "02aa".to_string(),
            copayers: vec![Copayer {
                id: CopayerId::from("c1"),
                wallet_id: id,
                name: "alice".to_string(),
                xpub: "tpub".to_string(),
                request_pub_key: "03bb".to_string(),
                index: 0,
                created_on: Utc::now(),
            }],
            status: WalletStatus::Pending,
            created_on: Utc::now(),
            deleted: false,
        }
    }

    fn proposal(id: &str, status: ProposalStatus, age_secs: i64) -> TxProposal {
        TxProposal {
            id: ProposalId::from(id),
            wallet_id: WalletId::from("wallet-1"),
            chain: Chain::Btc,
            network: Network::Testnet,
            creator_id: CopayerId::from("c1"),
            outputs: vec![TxOutput {
                to_address: "tb1q".to_string(),
                amount: 10_000,
                message: None,
                data: None,
            }],
            inputs: vec![],
            change_address: None,
            nonce: None,
            from_address: None,
            fee: 500,
            fee_level: Some(FeeLevelName::Normal),
            fee_per_kb: 10_000,
            status,
            created_on: Utc::now() - Duration::seconds(age_secs),
            actions: vec![],
            required_signatures: 2,
            wallet_n: 3,
            message: None,
            proposal_signature: None,
            txid: None,
            broadcast_on: None,
            exclude_unconfirmed: false,
        }
    }

    #[tokio::test]
    async fn test_wallet_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wallets.db");

        let original = wallet();
        {
            let store = SqliteStore::open(&path).unwrap();
            store.store_wallet(&original).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let loaded = store
            .fetch_wallet(&WalletId::from("wallet-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, original);
        assert_eq!(store.list_wallets().await.unwrap().len(), 1);
        assert!(store
            .fetch_wallet(&WalletId::from("missing"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_proposals_filter_order_and_remove() {
        let store = SqliteStore::open_in_memory().unwrap();
        let wallet_id = WalletId::from("wallet-1");
        store
            .store_proposal(&proposal("newer", ProposalStatus::Pending, 10))
            .await
            .unwrap();
        store
            .store_proposal(&proposal("older", ProposalStatus::Pending, 100))
            .await
            .unwrap();
        store
            .store_proposal(&proposal("sent", ProposalStatus::Broadcast, 50))
            .await
            .unwrap();

        let pending = store
            .fetch_proposals(&wallet_id, Some(ProposalStatus::Pending))
            .await
            .unwrap();
        let ids: Vec<&str> = pending.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["older", "newer"]);

        assert_eq!(store.fetch_proposals(&wallet_id, None).await.unwrap().len(), 3);
        assert_eq!(
            store
                .fetch_proposals_by_status(ProposalStatus::Broadcast)
                .await
                .unwrap()
                .len(),
            1
        );

        store
            .remove_proposal(&wallet_id, &ProposalId::from("older"))
            .await
            .unwrap();
        assert!(store
            .fetch_proposal(&wallet_id, &ProposalId::from("older"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_addresses_and_counters_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let wallet_id = WalletId::from("wallet-1");

        for (is_change, index, s) in [(true, 0, "c0"), (false, 1, "r1"), (false, 0, "r0")] {
            store
                .store_address(&Address {
                    wallet_id: wallet_id.clone(),
                    chain: Chain::Btc,
                    network: Network::Testnet,
                    address: s.to_string(),
                    path: DerivationPath::new(is_change, index),
                    has_activity: false,
                    created_on: Utc::now(),
                })
                .await
                .unwrap();
        }
        let addresses = store.fetch_addresses(&wallet_id).await.unwrap();
        let names: Vec<&str> = addresses.iter().map(|a| a.address.as_str()).collect();
        assert_eq!(names, vec!["r0", "r1", "c0"]);

        let counter = RejectionCounter {
            wallet_id: wallet_id.clone(),
            copayer_id: CopayerId::from("c1"),
            count: 11,
            last_rejection_on: Utc::now(),
        };
        store.store_rejection_counter(&counter).await.unwrap();
        let loaded = store
            .fetch_rejection_counter(&wallet_id, &CopayerId::from("c1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.count, 11);
    }
}
