//! Error types for polygon-ops

use ethers::types::{Address, H256};
use std::time::Duration;
use thiserror::Error;

/// Main error type for on-chain operations
#[derive(Error, Debug)]
pub enum OpsError {
    #[error("Configuration error: missing or invalid {field}: {message}")]
    Config { field: String, message: String },

    #[error("Invalid amount {input:?}: {message}")]
    InvalidAmount { input: String, message: String },

    #[error("Insufficient {asset} for {account:?}: have {have}, need {need}")]
    InsufficientFunds {
        account: Address,
        asset: String,
        have: String,
        need: String,
    },

    #[error("{label} not confirmed after {waited:?} (tx {hash:?}); it may still confirm")]
    ConfirmationTimeout {
        label: String,
        hash: H256,
        waited: Duration,
    },

    #[error("{label} reverted on-chain (tx {hash:?}): {reason}")]
    OnChainRevert {
        label: String,
        hash: H256,
        reason: String,
    },

    #[error("Pending transactions for {account:?} did not drain within {elapsed:?}")]
    PendingQueueTimeout { account: Address, elapsed: Duration },

    #[error("Bridge did not credit {holder:?} within {elapsed:?}")]
    BridgeCreditTimeout { holder: Address, elapsed: Duration },

    #[error("External service error ({status}): {message}")]
    ExternalService { status: u16, message: String },

    #[error("Chain error: {0}")]
    Chain(String),

    #[error("Broadcast rejected: {0}")]
    Broadcast(String),

    #[error("Nonce error for {account:?}: {message}")]
    Nonce { account: Address, message: String },

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Contract error: {0}")]
    Contract(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OpsError {
    /// Shorthand for a configuration error naming the offending field
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        OpsError::Config {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Check if error is a transient transport failure worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, OpsError::Chain(_))
    }

    /// Timeouts leave the transaction in an unknown state; callers must
    /// re-check pending nonces before resubmitting.
    pub fn is_unknown_outcome(&self) -> bool {
        matches!(
            self,
            OpsError::ConfirmationTimeout { .. }
                | OpsError::PendingQueueTimeout { .. }
                | OpsError::BridgeCreditTimeout { .. }
        )
    }
}

impl From<ethers::providers::ProviderError> for OpsError {
    fn from(e: ethers::providers::ProviderError) -> Self {
        OpsError::Chain(e.to_string())
    }
}

impl From<ethers::signers::WalletError> for OpsError {
    fn from(e: ethers::signers::WalletError) -> Self {
        OpsError::Wallet(e.to_string())
    }
}

impl From<ethers::abi::Error> for OpsError {
    fn from(e: ethers::abi::Error) -> Self {
        OpsError::Contract(e.to_string())
    }
}

impl From<reqwest::Error> for OpsError {
    fn from(e: reqwest::Error) -> Self {
        OpsError::ExternalService {
            status: e.status().map(|s| s.as_u16()).unwrap_or(0),
            message: e.to_string(),
        }
    }
}

/// Result type for operations
pub type OpsResult<T> = Result<T, OpsError>;
