//! Shared types for the quorum wallet engine: errors, identifiers, records
//! and the immutable engine configuration.

pub mod config;
pub mod error;
pub mod model;

pub use config::{AddressConfig, EngineConfig, FeeConfig, LockConfig, ProposalConfig, SelectionConfig};
pub use error::{ErrorKind, Result, WalletError};
pub use model::*;
