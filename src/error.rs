//! Error types for dispatch operations.

use thiserror::Error;

use crate::domain::OrderId;

/// Errors surfaced by the order store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transaction conflict, deadlock or lost connection. Safe to retry.
    #[error("transient store failure: {0}")]
    Transient(String),
    /// Any other backend failure.
    #[error("store backend error: {0}")]
    Backend(String),
    /// A row could not be mapped onto the domain model.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Transient(e.to_string())
            }
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // serialization_failure, deadlock_detected
                Some("40001") | Some("40P01") => StoreError::Transient(e.to_string()),
                _ => StoreError::Backend(e.to_string()),
            },
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Corrupt(e.to_string())
            }
            _ => StoreError::Backend(e.to_string()),
        }
    }
}

/// Errors from the external distance/geocoding provider.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Network(String),
    #[error("provider timed out")]
    Timeout,
    #[error("provider returned status {0}")]
    Status(String),
    #[error("could not parse provider response: {0}")]
    Parse(String),
    #[error("provider found no result")]
    NoResult,
    #[error("operation not supported by provider '{0}'")]
    Unsupported(&'static str),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else if e.is_decode() {
            ProviderError::Parse(e.to_string())
        } else {
            ProviderError::Network(e.to_string())
        }
    }
}

/// Errors returned by dispatch operations.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Rejected before any side effect.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Some requested orders are held or assigned elsewhere. Nothing was changed.
    #[error("orders unavailable: {order_ids:?}")]
    Conflict { order_ids: Vec<OrderId> },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("distance provider unavailable: {0}")]
    ProviderUnavailable(#[from] ProviderError),
    /// Store kept failing transiently after the retry budget was spent.
    #[error("store unavailable after {attempts} attempts: {source}")]
    TransientStore {
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Store(StoreError),
}

impl DispatchError {
    pub fn validation(msg: impl Into<String>) -> Self {
        DispatchError::Validation(msg.into())
    }

    pub fn conflict(mut order_ids: Vec<OrderId>) -> Self {
        order_ids.sort_unstable();
        order_ids.dedup();
        DispatchError::Conflict { order_ids }
    }

    /// Ids named by a conflict, empty for every other variant.
    pub fn conflicting_orders(&self) -> &[OrderId] {
        match self {
            DispatchError::Conflict { order_ids } => order_ids,
            _ => &[],
        }
    }
}

impl From<StoreError> for DispatchError {
    fn from(e: StoreError) -> Self {
        if e.is_transient() {
            DispatchError::TransientStore {
                attempts: 1,
                source: e,
            }
        } else {
            DispatchError::Store(e)
        }
    }
}

pub type Result<T, E = DispatchError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_sorts_and_dedups() {
        let err = DispatchError::conflict(vec![103, 101, 103]);
        assert_eq!(err.conflicting_orders(), &[101, 103]);
        assert!(DispatchError::validation("x").conflicting_orders().is_empty());
    }

    #[test]
    fn test_store_error_classification() {
        let transient: DispatchError = StoreError::Transient("deadlock".into()).into();
        assert!(matches!(transient, DispatchError::TransientStore { attempts: 1, .. }));

        let backend: DispatchError = StoreError::Backend("syntax".into()).into();
        assert!(matches!(backend, DispatchError::Store(_)));

        let pool: StoreError = sqlx::Error::PoolTimedOut.into();
        assert!(pool.is_transient());
    }
}
