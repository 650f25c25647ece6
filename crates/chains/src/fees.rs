//! Fee level computation from per-target estimates.

use quorum_types::{Chain, FeeConfig, FeeLevel, FeeLevelName, Network, Result, WalletError};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::adapter::{ChainRegistry, FeeLevelDef};
use crate::provider::FeeEstimator;

struct CachedLevels {
    stored_at: Instant,
    levels: Vec<FeeLevel>,
}

/// Computes the named fee levels of a chain.
///
/// Every level samples its own nb-blocks target and, when the estimator has
/// nothing for it, the next `fee_levels_fallback` targets before settling on
/// the level's default value. Results are forced to be non-increasing from
/// `urgent` down to `superEconomy`. Only complete samples are cached; a stale
/// cache entry is still served when the estimator fails.
pub struct FeeLevelService {
    registry: Arc<ChainRegistry>,
    estimator: Arc<dyn FeeEstimator>,
    config: FeeConfig,
    cache: RwLock<HashMap<(Chain, Network), CachedLevels>>,
}

impl FeeLevelService {
    pub fn new(
        registry: Arc<ChainRegistry>,
        estimator: Arc<dyn FeeEstimator>,
        config: FeeConfig,
    ) -> Self {
        Self {
            registry,
            estimator,
            config,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn cache_duration(&self) -> Duration {
        Duration::from_secs(self.config.cache_duration_secs)
    }

    fn sample_points(&self, table: &[FeeLevelDef]) -> Vec<u32> {
        let points: BTreeSet<u32> = table
            .iter()
            .flat_map(|level| level.nb_blocks..=level.nb_blocks + self.config.fee_levels_fallback)
            .collect();
        points.into_iter().collect()
    }

    fn pick(&self, samples: &HashMap<u32, i64>, level: &FeeLevelDef) -> Option<(u32, u64)> {
        (level.nb_blocks..=level.nb_blocks + self.config.fee_levels_fallback).find_map(|n| {
            match samples.get(&n) {
                Some(fee) if *fee >= 0 => Some((n, *fee as u64)),
                _ => None,
            }
        })
    }

    pub async fn get_fee_levels(&self, chain: Chain, network: Network) -> Result<Vec<FeeLevel>> {
        let stale = {
            let cache = self.cache.read().await;
            match cache.get(&(chain, network)) {
                Some(entry) if entry.stored_at.elapsed() < self.cache_duration() => {
                    debug!("Fee levels cache hit chain={} network={}", chain, network);
                    return Ok(entry.levels.clone());
                }
                Some(entry) => Some(entry.levels.clone()),
                None => None,
            }
        };

        let adapter = self.registry.get(chain)?;
        let table = adapter.fee_levels();
        let points = self.sample_points(table);

        let samples = match self.estimator.estimate(chain, network, &points).await {
            Ok(samples) => samples,
            Err(e) => {
                warn!("Error estimating fee chain={} network={}: {}", chain, network, e);
                if let Some(levels) = stale {
                    warn!("Using old cached fee levels");
                    return Ok(levels);
                }
                return Ok(Self::defaults(table));
            }
        };

        let failed: Vec<u32> = points
            .iter()
            .copied()
            .filter(|p| samples.get(p).map_or(true, |fee| *fee < 0))
            .collect();
        if !failed.is_empty() {
            info!(
                "Could not compute fee estimation in {} for {:?} blocks",
                network, failed
            );
        }

        let mut levels: Vec<FeeLevel> = table
            .iter()
            .map(|level| {
                let (nb_blocks, fee_per_kb) = match self.pick(&samples, level) {
                    Some((n, fee)) => (Some(n), fee),
                    None => (None, level.default_value),
                };
                let multiplier = level.multiplier.unwrap_or(1.0);
                FeeLevel {
                    level: level.name,
                    fee_per_kb: (fee_per_kb as f64 * multiplier).round() as u64,
                    nb_blocks,
                }
            })
            .collect();

        for i in 1..levels.len() {
            levels[i].fee_per_kb = levels[i].fee_per_kb.min(levels[i - 1].fee_per_kb);
        }

        if failed.is_empty() {
            self.cache.write().await.insert(
                (chain, network),
                CachedLevels {
                    stored_at: Instant::now(),
                    levels: levels.clone(),
                },
            );
        } else {
            warn!("Not caching default values. Failed: {}", failed.len());
        }

        Ok(levels)
    }

    /// Fee per kb of one named level.
    pub async fn fee_per_kb(
        &self,
        chain: Chain,
        network: Network,
        level: FeeLevelName,
    ) -> Result<u64> {
        self.get_fee_levels(chain, network)
            .await?
            .into_iter()
            .find(|l| l.level == level)
            .map(|l| l.fee_per_kb)
            .ok_or_else(|| {
                WalletError::invalid_request(format!("Fee level {} not defined for {}", level, chain))
            })
    }

    fn defaults(table: &[FeeLevelDef]) -> Vec<FeeLevel> {
        table
            .iter()
            .map(|level| FeeLevel {
                level: level.name,
                fee_per_kb: level.default_value,
                nb_blocks: None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use quorum_types::EngineConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct StaticEstimator {
        samples: Mutex<Option<HashMap<u32, i64>>>,
        calls: AtomicUsize,
    }

    impl StaticEstimator {
        fn new(samples: Option<HashMap<u32, i64>>) -> Arc<Self> {
            Arc::new(Self {
                samples: Mutex::new(samples),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl FeeEstimator for StaticEstimator {
        async fn estimate(
            &self,
            _chain: Chain,
            _network: Network,
            nb_blocks: &[u32],
        ) -> Result<HashMap<u32, i64>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.samples.lock().unwrap().clone() {
                Some(samples) => Ok(nb_blocks
                    .iter()
                    .map(|n| (*n, samples.get(n).copied().unwrap_or(-1)))
                    .collect()),
                None => Err(WalletError::chain_provider("estimator offline")),
            }
        }
    }

    fn service(estimator: Arc<StaticEstimator>) -> FeeLevelService {
        let config = EngineConfig::default();
        FeeLevelService::new(
            Arc::new(ChainRegistry::with_defaults(&config)),
            estimator,
            config.fees,
        )
    }

    fn full_samples() -> HashMap<u32, i64> {
        (1..=30).map(|n| (n, 100_000 / n as i64)).collect()
    }

    #[tokio::test]
    async fn test_levels_from_samples_with_multiplier() {
        let service = service(StaticEstimator::new(Some(full_samples())));
        let levels = service.get_fee_levels(Chain::Btc, Network::Livenet).await.unwrap();

        assert_eq!(levels.len(), 5);
        assert_eq!(levels[0].level, FeeLevelName::Urgent);
        assert_eq!(levels[0].fee_per_kb, 75_000);
        assert_eq!(levels[1].fee_per_kb, 50_000);
        assert_eq!(levels[2].fee_per_kb, 33_333);
        assert_eq!(levels[4].nb_blocks, Some(24));
    }

    #[tokio::test]
    async fn test_falls_back_to_later_targets_then_defaults() {
        let mut samples = full_samples();
        samples.insert(2, -1);
        for n in 24..=26 {
            samples.remove(&n);
        }
        let service = service(StaticEstimator::new(Some(samples)));
        let levels = service.get_fee_levels(Chain::Btc, Network::Livenet).await.unwrap();

        // priority falls back from 2 to 3 blocks
        assert_eq!(levels[1].nb_blocks, Some(3));
        assert_eq!(levels[1].fee_per_kb, 33_333);
        // superEconomy has no samples at all
        assert_eq!(levels[4].nb_blocks, None);
        assert_eq!(levels[4].fee_per_kb, 10_000);
    }

    #[tokio::test]
    async fn test_levels_are_monotonic() {
        let mut samples = full_samples();
        samples.insert(6, 90_000);
        let service = service(StaticEstimator::new(Some(samples)));
        let levels = service.get_fee_levels(Chain::Btc, Network::Livenet).await.unwrap();

        for pair in levels.windows(2) {
            assert!(pair[0].fee_per_kb >= pair[1].fee_per_kb);
        }
    }

    #[tokio::test]
    async fn test_complete_samples_are_cached() {
        let estimator = StaticEstimator::new(Some(full_samples()));
        let service = service(estimator.clone());

        service.get_fee_levels(Chain::Btc, Network::Livenet).await.unwrap();
        service.get_fee_levels(Chain::Btc, Network::Livenet).await.unwrap();
        assert_eq!(estimator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_partial_samples_are_not_cached() {
        let mut samples = full_samples();
        samples.insert(3, -1);
        let estimator = StaticEstimator::new(Some(samples));
        let service = service(estimator.clone());

        service.get_fee_levels(Chain::Btc, Network::Livenet).await.unwrap();
        service.get_fee_levels(Chain::Btc, Network::Livenet).await.unwrap();
        assert_eq!(estimator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_estimator_failure_uses_defaults() {
        let service = service(StaticEstimator::new(None));
        let levels = service.get_fee_levels(Chain::Eth, Network::Livenet).await.unwrap();

        assert_eq!(levels[0].fee_per_kb, 10_000_000_000);
        assert!(levels.iter().all(|l| l.nb_blocks.is_none()));
    }

    #[tokio::test]
    async fn test_fee_per_kb_by_name() {
        let service = service(StaticEstimator::new(None));
        let fee = service
            .fee_per_kb(Chain::Btc, Network::Testnet, FeeLevelName::Economy)
            .await
            .unwrap();
        assert_eq!(fee, 25_000);
    }
}
