use quorum_types::{EngineConfig, LockConfig, Quorum, WalletError};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub service: ServiceConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    pub storage: StorageConfig,
    pub lock: LockSettings,
    pub chains: ChainsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub log_level: String,
    pub monitor_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file; `:memory:` keeps everything in the process.
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSettings {
    pub backend: String, // "local" or "etcd"
    pub etcd_endpoints: Vec<String>,
    pub wait_time_secs: u64,
    pub exe_time_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainsConfig {
    /// JSON chain state the offline provider serves.
    pub snapshot_path: String,
    /// Signed transactions are appended here, one JSON object per line.
    pub outbox_path: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            service: ServiceConfig {
                log_level: "info".to_string(),
                monitor_interval_secs: 60,
            },
            storage: StorageConfig {
                db_path: "quorum-wallet.db".to_string(),
            },
            lock: LockSettings {
                backend: "local".to_string(),
                etcd_endpoints: vec!["http://127.0.0.1:2379".to_string()],
                wait_time_secs: engine.lock.wait_time_secs,
                exe_time_secs: engine.lock.exe_time_secs,
            },
            chains: ChainsConfig {
                snapshot_path: "chain-state.json".to_string(),
                outbox_path: "outbox.jsonl".to_string(),
            },
            engine,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, WalletError> {
        let mut app_config = AppConfig::default();

        // Try to load from file if exists
        if Path::new("config/default.toml").exists() {
            let settings = config::Config::builder()
                .add_source(config::File::with_name("config/default"))
                .build()
                .map_err(|e| WalletError::config(format!("Failed to load config file: {}", e)))?;

            app_config = settings
                .try_deserialize::<AppConfig>()
                .map_err(|e| WalletError::config(format!("Invalid config file: {}", e)))?;
        }

        // Override with environment variables
        Self::override_from_env(&mut app_config)?;

        Ok(app_config)
    }

    fn override_from_env(config: &mut AppConfig) -> Result<(), WalletError> {
        if let Ok(db_path) = std::env::var("QW_DB_PATH") {
            config.storage.db_path = db_path;
        }

        if let Ok(backend) = std::env::var("QW_LOCK_BACKEND") {
            config.lock.backend = backend;
        }

        if let Ok(etcd_endpoints) = std::env::var("ETCD_ENDPOINTS") {
            config.lock.etcd_endpoints = etcd_endpoints
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Ok(log_level) = std::env::var("QW_LOG_LEVEL") {
            config.service.log_level = log_level;
        }

        if let Ok(wait) = std::env::var("QW_LOCK_WAIT_SECS") {
            config.lock.wait_time_secs = wait
                .parse()
                .map_err(|e| WalletError::config(format!("Invalid QW_LOCK_WAIT_SECS: {}", e)))?;
        }

        if let Ok(exe) = std::env::var("QW_LOCK_EXE_SECS") {
            config.lock.exe_time_secs = exe
                .parse()
                .map_err(|e| WalletError::config(format!("Invalid QW_LOCK_EXE_SECS: {}", e)))?;
        }

        if let Ok(snapshot) = std::env::var("QW_SNAPSHOT_PATH") {
            config.chains.snapshot_path = snapshot;
        }

        if let Ok(outbox) = std::env::var("QW_OUTBOX_PATH") {
            config.chains.outbox_path = outbox;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), WalletError> {
        match self.lock.backend.as_str() {
            "local" => {}
            "etcd" => {
                if self.lock.etcd_endpoints.is_empty() {
                    return Err(WalletError::config(
                        "etcd lock backend needs at least one endpoint",
                    ));
                }
            }
            other => {
                return Err(WalletError::config(format!(
                    "Unknown lock backend '{}' (expected local or etcd)",
                    other
                )));
            }
        }

        if self.lock.wait_time_secs == 0 || self.lock.exe_time_secs == 0 {
            return Err(WalletError::config("Lock timeouts must be positive"));
        }

        if self.storage.db_path.is_empty() {
            return Err(WalletError::config("db_path cannot be empty"));
        }

        if self.service.monitor_interval_secs == 0 {
            return Err(WalletError::config("monitor_interval_secs must be positive"));
        }

        // A 1-of-max_keys wallet must be representable.
        Quorum::new(1, self.engine.max_keys, self.engine.max_keys)?;

        let address = &self.engine.address;
        if address.max_main_address_gap == 0
            || address.scan_address_gap < address.max_main_address_gap
        {
            return Err(WalletError::config(
                "scan_address_gap must be at least max_main_address_gap, which must be positive",
            ));
        }

        Ok(())
    }

    /// The immutable engine configuration, with lock timeouts taken from the
    /// `lock` section.
    pub fn engine_config(&self) -> EngineConfig {
        let mut engine = self.engine.clone();
        engine.lock = LockConfig {
            wait_time_secs: self.lock.wait_time_secs,
            exe_time_secs: self.lock.exe_time_secs,
        };
        engine
    }
}
