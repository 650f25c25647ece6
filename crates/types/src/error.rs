use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error kinds surfaced to callers unchanged.
///
/// The string form of each kind is the stable code a transport layer
/// reports next to the human message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    WalletNotFound,
    WalletFull,
    WalletNotComplete,
    CopayerRegistered,
    MainAddressGapReached,
    InsufficientFunds,
    InsufficientFundsForFee,
    LockedFunds,
    DustAmount,
    TxNotFound,
    TxNotPending,
    TxNotAccepted,
    TxAlreadyBroadcasted,
    TxCannotCreate,
    TxCannotRemove,
    TxMaxSizeExceeded,
    UnavailableUtxos,
    CopayerVoted,
    NotAuthorized,
    ServerCompromised,
    MissingPrivateKey,
    EncryptedPrivateKey,
    InvalidAddress,
    InvalidChangeAddress,
    InvalidRequest,
    Locked,
    RequestTimeout,
    ChainProvider,
    Storage,
    Config,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::WalletNotFound => "WALLET_NOT_FOUND",
            ErrorKind::WalletFull => "WALLET_FULL",
            ErrorKind::WalletNotComplete => "WALLET_NOT_COMPLETE",
            ErrorKind::CopayerRegistered => "COPAYER_REGISTERED",
            ErrorKind::MainAddressGapReached => "MAIN_ADDRESS_GAP_REACHED",
            ErrorKind::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorKind::InsufficientFundsForFee => "INSUFFICIENT_FUNDS_FOR_FEE",
            ErrorKind::LockedFunds => "LOCKED_FUNDS",
            ErrorKind::DustAmount => "DUST_AMOUNT",
            ErrorKind::TxNotFound => "TX_NOT_FOUND",
            ErrorKind::TxNotPending => "TX_NOT_PENDING",
            ErrorKind::TxNotAccepted => "TX_NOT_ACCEPTED",
            ErrorKind::TxAlreadyBroadcasted => "TX_ALREADY_BROADCASTED",
            ErrorKind::TxCannotCreate => "TX_CANNOT_CREATE",
            ErrorKind::TxCannotRemove => "TX_CANNOT_REMOVE",
            ErrorKind::TxMaxSizeExceeded => "TX_MAX_SIZE_EXCEEDED",
            ErrorKind::UnavailableUtxos => "UNAVAILABLE_UTXOS",
            ErrorKind::CopayerVoted => "COPAYER_VOTED",
            ErrorKind::NotAuthorized => "NOT_AUTHORIZED",
            ErrorKind::ServerCompromised => "SERVER_COMPROMISED",
            ErrorKind::MissingPrivateKey => "MISSING_PRIVATE_KEY",
            ErrorKind::EncryptedPrivateKey => "ENCRYPTED_PRIVATE_KEY",
            ErrorKind::InvalidAddress => "INVALID_ADDRESS",
            ErrorKind::InvalidChangeAddress => "INVALID_CHANGE_ADDRESS",
            ErrorKind::InvalidRequest => "INVALID_REQUEST",
            ErrorKind::Locked => "LOCKED",
            ErrorKind::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorKind::ChainProvider => "CHAIN_PROVIDER",
            ErrorKind::Storage => "STORAGE",
            ErrorKind::Config => "CONFIG",
        }
    }

    /// Default human message for kinds that are usually raised without detail.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorKind::WalletNotFound => "Wallet not found",
            ErrorKind::WalletFull => "Wallet full",
            ErrorKind::WalletNotComplete => "Wallet is not complete",
            ErrorKind::CopayerRegistered => "Copayer ID already registered on server",
            ErrorKind::MainAddressGapReached => {
                "Maximum number of consecutive addresses without activity reached"
            }
            ErrorKind::InsufficientFunds => "Insufficient funds",
            ErrorKind::InsufficientFundsForFee => "Insufficient funds for fee",
            ErrorKind::LockedFunds => "Funds are locked by pending transaction proposals",
            ErrorKind::DustAmount => "Amount below dust threshold",
            ErrorKind::TxNotFound => "Transaction proposal not found",
            ErrorKind::TxNotPending => "The transaction proposal is not pending",
            ErrorKind::TxNotAccepted => "The transaction proposal is not accepted",
            ErrorKind::TxAlreadyBroadcasted => "The transaction proposal is already broadcasted",
            ErrorKind::TxCannotCreate => {
                "Cannot create TX proposal during backoff time. Please try again in a few minutes"
            }
            ErrorKind::TxCannotRemove => {
                "Cannot remove this tx proposal during locktime. Please try again in a few minutes"
            }
            ErrorKind::TxMaxSizeExceeded => "TX exceeds maximum allowed size",
            ErrorKind::UnavailableUtxos => "Unavailable unspent outputs",
            ErrorKind::CopayerVoted => "Copayer already voted on this transaction proposal",
            ErrorKind::NotAuthorized => "Not authorized",
            ErrorKind::ServerCompromised => "Server response could not be verified",
            ErrorKind::MissingPrivateKey => "Missing private keys to sign",
            ErrorKind::EncryptedPrivateKey => "Private key is encrypted, cannot sign",
            ErrorKind::InvalidAddress => "Invalid address",
            ErrorKind::InvalidChangeAddress => "Invalid change address",
            ErrorKind::InvalidRequest => "Invalid request",
            ErrorKind::Locked => "Wallet is locked",
            ErrorKind::RequestTimeout => "Request exceeded the server execution time",
            ErrorKind::ChainProvider => "Chain state provider error",
            ErrorKind::Storage => "Storage error",
            ErrorKind::Config => "Configuration error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// A structured (kind, message) error.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct WalletError {
    pub kind: ErrorKind,
    pub message: String,
}

impl WalletError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Errors a caller may retry without any cleanup.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Locked
                | ErrorKind::LockedFunds
                | ErrorKind::ChainProvider
                | ErrorKind::RequestTimeout
        )
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Storage, message)
    }

    pub fn chain_provider(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ChainProvider, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }
}

impl From<ErrorKind> for WalletError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind, kind.default_message())
    }
}

pub type Result<T> = std::result::Result<T, WalletError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_code_and_message() {
        let err = WalletError::from(ErrorKind::WalletFull);
        assert_eq!(err.to_string(), "WALLET_FULL: Wallet full");

        let err = WalletError::new(ErrorKind::LockedFunds, "2 coins reserved");
        assert_eq!(err.kind(), ErrorKind::LockedFunds);
        assert_eq!(err.to_string(), "LOCKED_FUNDS: 2 coins reserved");
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(WalletError::from(ErrorKind::Locked).is_retryable());
        assert!(WalletError::from(ErrorKind::LockedFunds).is_retryable());
        assert!(WalletError::chain_provider("timeout").is_retryable());
        assert!(!WalletError::from(ErrorKind::DustAmount).is_retryable());
        assert!(!WalletError::from(ErrorKind::CopayerVoted).is_retryable());
    }

    #[test]
    fn test_kind_serializes_as_code() {
        let json = serde_json::to_string(&ErrorKind::MainAddressGapReached).unwrap();
        assert_eq!(json, "\"MAIN_ADDRESS_GAP_REACHED\"");
    }
}
