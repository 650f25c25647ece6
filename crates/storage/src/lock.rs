//! Wallet-scoped mutual exclusion.
//!
//! A lock is a lease: it is held under a random token and expires after
//! `exe_time` even if the holder never releases it. Releases are
//! token-checked so a holder that outlived its lease cannot free a lease
//! granted to someone else.

use async_trait::async_trait;
use quorum_types::{ErrorKind, LockConfig, Result, WalletError, WalletId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Upper bound between acquisition attempts when no release is observed.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Takes the lease on `key` for `token` if it is free or expired.
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Frees the lease on `key` only if it is still held by `token`.
    async fn release(&self, key: &str, token: &str) -> Result<()>;

    /// Waits at most `max` for a release that may free `key`.
    async fn wait_for_release(&self, _key: &str, max: Duration) {
        tokio::time::sleep(max.min(RETRY_INTERVAL)).await;
    }
}

struct Lease {
    token: String,
    expires_at: Instant,
}

/// In-process backend for single-instance deployments.
#[derive(Default)]
pub struct LocalLockBackend {
    leases: Mutex<HashMap<String, Lease>>,
    released: Notify,
}

impl LocalLockBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockBackend for LocalLockBackend {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();
        if let Some(lease) = leases.get(key) {
            if lease.expires_at > now {
                return Ok(false);
            }
            warn!("Force-releasing expired lock key={}", key);
        }
        leases.insert(
            key.to_string(),
            Lease {
                token: token.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, token: &str) -> Result<()> {
        let mut leases = self.leases.lock().await;
        match leases.get(key) {
            Some(lease) if lease.token == token => {
                leases.remove(key);
                drop(leases);
                self.released.notify_waiters();
            }
            _ => debug!("Lock key={} no longer held by this token", key),
        }
        Ok(())
    }

    async fn wait_for_release(&self, _key: &str, max: Duration) {
        let _ = tokio::time::timeout(max.min(RETRY_INTERVAL), self.released.notified()).await;
    }
}

/// Releases a lease whose holder was dropped before it could release it
/// (e.g. a request cancelled by its timeout).
struct LeaseGuard {
    backend: Arc<dyn LockBackend>,
    key: String,
    token: String,
    armed: bool,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let backend = self.backend.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = backend.release(&key, &token).await {
                    warn!("Failed to release abandoned lock key={}: {}", key, e);
                }
            });
        }
    }
}

#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    config: LockConfig,
}

impl LockManager {
    pub fn new(backend: Arc<dyn LockBackend>, config: LockConfig) -> Self {
        Self { backend, config }
    }

    pub fn local(config: LockConfig) -> Self {
        Self::new(Arc::new(LocalLockBackend::new()), config)
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    fn key(wallet_id: &WalletId) -> String {
        format!("/locks/wallet/{}", wallet_id)
    }

    /// Runs `operation` while holding the wallet's lock.
    ///
    /// Fails with `LOCKED` if the lock cannot be taken within the wait time.
    /// The lock is released whatever the outcome of `operation`.
    pub async fn with_lock<T, F>(&self, wallet_id: &WalletId, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let key = Self::key(wallet_id);
        let token = uuid::Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.config.wait_time();

        loop {
            if self
                .backend
                .try_acquire(&key, &token, self.config.exe_time())
                .await?
            {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("Timed out waiting for wallet lock wallet_id={}", wallet_id);
                return Err(WalletError::new(
                    ErrorKind::Locked,
                    format!("Wallet {} is locked by another operation", wallet_id),
                ));
            }
            self.backend.wait_for_release(&key, deadline - now).await;
        }

        let mut guard = LeaseGuard {
            backend: self.backend.clone(),
            key: key.clone(),
            token: token.clone(),
            armed: true,
        };
        debug!("Acquired wallet lock wallet_id={}", wallet_id);

        let started = Instant::now();
        let result = operation.await;
        let held = started.elapsed();

        if held > self.config.exe_time() {
            error!(
                "Wallet lock held past its lease wallet_id={} held_secs={} lease_secs={}",
                wallet_id,
                held.as_secs(),
                self.config.exe_time_secs
            );
        }

        guard.armed = false;
        if let Err(e) = self.backend.release(&key, &token).await {
            warn!("Failed to release wallet lock wallet_id={}: {}", wallet_id, e);
        }
        debug!("Released wallet lock wallet_id={}", wallet_id);

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(wait_secs: u64, exe_secs: u64) -> LockConfig {
        LockConfig {
            wait_time_secs: wait_secs,
            exe_time_secs: exe_secs,
        }
    }

    #[tokio::test]
    async fn test_release_is_token_checked() {
        let backend = LocalLockBackend::new();
        let ttl = Duration::from_secs(60);

        assert!(backend.try_acquire("k", "a", ttl).await.unwrap());
        assert!(!backend.try_acquire("k", "b", ttl).await.unwrap());

        backend.release("k", "b").await.unwrap();
        assert!(!backend.try_acquire("k", "b", ttl).await.unwrap());

        backend.release("k", "a").await.unwrap();
        assert!(backend.try_acquire("k", "b", ttl).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_taken_over() {
        let backend = LocalLockBackend::new();
        assert!(backend
            .try_acquire("k", "a", Duration::from_secs(5))
            .await
            .unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(backend
            .try_acquire("k", "b", Duration::from_secs(5))
            .await
            .unwrap());

        // The late holder's release must not free the new lease.
        backend.release("k", "a").await.unwrap();
        assert!(!backend
            .try_acquire("k", "c", Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_operations_on_one_wallet_are_serialized() {
        let manager = LockManager::local(config(5, 60));
        let wallet_id = WalletId::from("w1");
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let manager = manager.clone();
                let wallet_id = wallet_id.clone();
                let active = active.clone();
                let max_active = max_active.clone();
                tokio::spawn(async move {
                    manager
                        .with_lock(&wallet_id, async {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            max_active.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            active.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout_returns_locked() {
        let backend = Arc::new(LocalLockBackend::new());
        let manager = LockManager::new(backend.clone(), config(1, 60));
        let wallet_id = WalletId::from("w1");

        backend
            .try_acquire(&LockManager::key(&wallet_id), "other", Duration::from_secs(60))
            .await
            .unwrap();

        let err = manager
            .with_lock(&wallet_id, async { Ok(()) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Locked);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_lock_is_released_after_failure() {
        let manager = LockManager::local(config(1, 60));
        let wallet_id = WalletId::from("w1");

        let result: Result<()> = manager
            .with_lock(&wallet_id, async {
                Err(WalletError::invalid_request("boom"))
            })
            .await;
        assert!(result.is_err());

        let value = manager.with_lock(&wallet_id, async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_different_wallets_do_not_contend() {
        let manager = LockManager::local(config(1, 60));
        let outer = manager.clone();

        let value = outer
            .with_lock(&WalletId::from("w1"), async {
                manager
                    .with_lock(&WalletId::from("w2"), async { Ok(1) })
                    .await
            })
            .await
            .unwrap();
        assert_eq!(value, 1);
    }
}
