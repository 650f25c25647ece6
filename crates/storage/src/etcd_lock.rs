//! etcd lease lock for deployments with several service instances.

use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, PutOptions, Txn, TxnOp};
use quorum_types::{Result, WalletError};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::lock::LockBackend;

pub struct EtcdLockBackend {
    client: Client,
    /// Lease granted for each token this instance holds.
    leases: Mutex<HashMap<String, i64>>,
}

impl EtcdLockBackend {
    pub async fn connect(endpoints: Vec<String>) -> Result<Self> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(|e| WalletError::storage(format!("Failed to connect to etcd: {}", e)))?;

        Ok(Self {
            client,
            leases: Mutex::new(HashMap::new()),
        })
    }

    async fn revoke(&self, lease_id: i64) {
        let mut client = self.client.clone();
        if let Err(e) = client.lease_revoke(lease_id).await {
            warn!("Failed to revoke lease_id={}: {}", lease_id, e);
        }
    }
}

#[async_trait]
impl LockBackend for EtcdLockBackend {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut client = self.client.clone();
        let ttl_secs = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);

        let lease_resp = client
            .lease_grant(ttl_secs, None)
            .await
            .map_err(|e| WalletError::storage(format!("Failed to create lease: {}", e)))?;
        let lease_id = lease_resp.id();

        let txn = Txn::new()
            .when(vec![Compare::create_revision(
                key.as_bytes(),
                CompareOp::Equal,
                0,
            )])
            .and_then(vec![TxnOp::put(
                key.as_bytes(),
                token.as_bytes(),
                Some(PutOptions::new().with_lease(lease_id)),
            )])
            .or_else(vec![]);

        let txn_resp = client
            .txn(txn)
            .await
            .map_err(|e| WalletError::storage(format!("Failed to acquire lock: {}", e)))?;

        if !txn_resp.succeeded() {
            self.revoke(lease_id).await;
            return Ok(false);
        }

        self.leases.lock().await.insert(token.to_string(), lease_id);
        info!("Acquired lock key={} lease_id={}", key, lease_id);
        Ok(true)
    }

    async fn release(&self, key: &str, token: &str) -> Result<()> {
        let mut client = self.client.clone();

        let txn = Txn::new()
            .when(vec![Compare::value(
                key.as_bytes(),
                CompareOp::Equal,
                token.as_bytes(),
            )])
            .and_then(vec![TxnOp::delete(key.as_bytes(), None)])
            .or_else(vec![]);

        let txn_resp = client
            .txn(txn)
            .await
            .map_err(|e| WalletError::storage(format!("Failed to release lock: {}", e)))?;

        if !txn_resp.succeeded() {
            warn!("Lock key={} was no longer held by this instance", key);
        }

        let lease_id = self.leases.lock().await.remove(token);
        if let Some(lease_id) = lease_id {
            self.revoke(lease_id).await;
        }

        info!("Released lock key={}", key);
        Ok(())
    }
}
