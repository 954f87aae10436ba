// SPDX-License-Identifier: MIT OR Apache-2.0
//! Error types for shard_tx.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for shard_tx operations.
pub type Result<T> = std::result::Result<T, TxError>;

/// Errors that can occur in shard_tx operations.
#[derive(Debug, Error)]
pub enum TxError {
    /// Network send failed.
    #[error("network error: {0}")]
    Network(String),

    /// Transaction failed.
    #[error("transaction failed: {0}")]
    TransactionFailed(String),

    /// State transition not valid.
    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for TxError {
    fn from(err: bincode::Error) -> Self {
        TxError::Serialization(err.to_string())
    }
}

/// Status code carried by transactions and wire messages.
///
/// Codes are data, not `Err` values: the RM records the first non-ok code in
/// its `ec` field and drives the abort path from it, and every response and
/// ACK carries one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrCode {
    /// Success.
    #[default]
    Ok,
    /// Row does not exist.
    NotFound,
    /// Row already exists.
    Duplication,
    /// Transaction aborted.
    TxAbort,
    /// Chosen as a deadlock victim.
    Victim,
    /// Aborted because a depended-on transaction aborted.
    Cascade,
    /// Deadlock detected while waiting for a lock.
    Deadlock,
    /// Internal protocol error.
    Internal,
}

impl ErrCode {
    /// Whether this code is the success code.
    pub fn is_ok(self) -> bool {
        self == ErrCode::Ok
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrCode::Ok => "EC_OK",
            ErrCode::NotFound => "EC_NOT_FOUND_ERROR",
            ErrCode::Duplication => "EC_DUPLICATION_ERROR",
            ErrCode::TxAbort => "EC_TX_ABORT",
            ErrCode::Victim => "EC_VICTIM",
            ErrCode::Cascade => "EC_CASCADE",
            ErrCode::Deadlock => "EC_DEADLOCK",
            ErrCode::Internal => "EC_INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_error() {
        let err = TxError::Network("connection refused".to_string());
        assert!(err.to_string().contains("network error"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_transaction_failed() {
        let err = TxError::TransactionFailed("commit error".to_string());
        assert!(err.to_string().contains("transaction failed"));
    }

    #[test]
    fn test_invalid_transition() {
        let err = TxError::InvalidTransition("ended -> committing".to_string());
        assert!(err.to_string().contains("invalid state transition"));
    }

    #[test]
    fn test_from_bincode_error() {
        let bincode_err = bincode::deserialize::<u64>(b"x").unwrap_err();
        let err: TxError = bincode_err.into();
        assert!(matches!(err, TxError::Serialization(_)));
    }

    #[test]
    fn test_err_code_default_is_ok() {
        assert_eq!(ErrCode::default(), ErrCode::Ok);
        assert!(ErrCode::Ok.is_ok());
        assert!(!ErrCode::NotFound.is_ok());
    }

    #[test]
    fn test_err_code_display() {
        assert_eq!(ErrCode::Ok.to_string(), "EC_OK");
        assert_eq!(ErrCode::Victim.to_string(), "EC_VICTIM");
        assert_eq!(ErrCode::Cascade.as_str(), "EC_CASCADE");
    }

    #[test]
    fn test_err_code_roundtrip() {
        let bytes = bincode::serialize(&ErrCode::Duplication).unwrap();
        let restored: ErrCode = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored, ErrCode::Duplication);
    }
}
