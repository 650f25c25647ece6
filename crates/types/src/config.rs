use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, WalletError};

/// Tunables for coin selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// A coin worth more than `amount * factor + single input fee` is "big".
    pub max_single_utxo_factor: f64,
    /// Minimum net contribution of a coin, relative to the amount.
    pub min_tx_amount_vs_utxo_factor: f64,
    /// Fee considered significant relative to the amount.
    pub max_fee_vs_tx_amount_factor: f64,
    /// Max fee of many small inputs relative to a single big input.
    pub max_fee_vs_single_utxo_fee_factor: f64,
    /// Outputs and change below this are dust.
    pub min_output_amount: u64,
    pub max_tx_size_kb: u64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            max_single_utxo_factor: 2.0,
            min_tx_amount_vs_utxo_factor: 0.1,
            max_fee_vs_tx_amount_factor: 0.05,
            max_fee_vs_single_utxo_fee_factor: 5.0,
            min_output_amount: 5000,
            max_tx_size_kb: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    pub wait_time_secs: u64,
    /// Lease length; a holder still running after this is force-released.
    pub exe_time_secs: u64,
}

impl LockConfig {
    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_secs)
    }

    pub fn exe_time(&self) -> Duration {
        Duration::from_secs(self.exe_time_secs)
    }

    /// Bound on a whole request: 1.5x the lock lease.
    pub fn server_exe_time(&self) -> Duration {
        Duration::from_millis(self.exe_time_secs * 1500)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_time_secs: 20,
            exe_time_secs: 6000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressConfig {
    pub max_main_address_gap: usize,
    pub scan_address_gap: usize,
}

impl Default for AddressConfig {
    fn default() -> Self {
        Self {
            max_main_address_gap: 20,
            scan_address_gap: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalConfig {
    pub delete_locktime_secs: i64,
    pub backoff_offset: u32,
    pub backoff_time_secs: i64,
}

impl Default for ProposalConfig {
    fn default() -> Self {
        Self {
            delete_locktime_secs: 600,
            backoff_offset: 10,
            backoff_time_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeConfig {
    /// Further nb-blocks targets tried before a level falls back to its default.
    pub fee_levels_fallback: u32,
    pub cache_duration_secs: u64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            fee_levels_fallback: 2,
            cache_duration_secs: 360,
        }
    }
}

/// Immutable configuration handed to every engine component at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub max_keys: usize,
    pub selection: SelectionConfig,
    pub lock: LockConfig,
    pub address: AddressConfig,
    pub proposal: ProposalConfig,
    pub fees: FeeConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_keys: Self::MAX_KEYS,
            selection: SelectionConfig::default(),
            lock: LockConfig::default(),
            address: AddressConfig::default(),
            proposal: ProposalConfig::default(),
            fees: FeeConfig::default(),
        }
    }
}

impl EngineConfig {
    pub const MAX_KEYS: usize = 100;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_keys == 0 {
            return Err(WalletError::config("max_keys cannot be 0"));
        }
        if self.address.scan_address_gap < self.address.max_main_address_gap {
            return Err(WalletError::config(format!(
                "scan_address_gap ({}) must be >= max_main_address_gap ({})",
                self.address.scan_address_gap, self.address.max_main_address_gap
            )));
        }
        if self.lock.wait_time_secs == 0 || self.lock.exe_time_secs == 0 {
            return Err(WalletError::config("lock timeouts must be positive"));
        }
        if self.selection.max_single_utxo_factor <= 0.0
            || self.selection.max_fee_vs_single_utxo_fee_factor <= 0.0
        {
            return Err(WalletError::config("selection factors must be positive"));
        }
        Ok(())
    }
}
