//! Error types for charm-store operations

use thiserror::Error;

/// Charm URL parse and validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UrlError {
    #[error("invalid schema {schema:?} in charm URL {url:?}")]
    InvalidSchema { url: String, schema: String },

    #[error("invalid user {user:?} in charm URL {url:?}")]
    InvalidUser { url: String, user: String },

    #[error("invalid series {series:?} in charm URL {url:?}")]
    InvalidSeries { url: String, series: String },

    #[error("invalid charm or bundle name {name:?} in URL {url:?}")]
    InvalidName { url: String, name: String },

    #[error("invalid revision {revision:?} in charm URL {url:?}")]
    InvalidRevision { url: String, revision: String },

    #[error("cannot parse charm URL {url:?}: {reason}")]
    Malformed { url: String, reason: String },
}

/// Backing document-store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("query failed: {reason}")]
    QueryFailed { reason: String },

    #[error("cursor failed: {reason}")]
    CursorFailed { reason: String },
}

/// Cache lookup errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// A backend fetch failed; the error is cached for the queried key
    /// for the cache's lifetime.
    #[error("cannot fetch {url:?}: {reason}")]
    FetchFailed { url: String, reason: String },
}

/// Master error type for all charm-store operations.
#[derive(Debug, Clone, Error)]
pub enum CharmstoreError {
    #[error("URL error: {0}")]
    Url(#[from] UrlError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

/// Result type alias for charm-store operations.
pub type CharmstoreResult<T> = Result<T, CharmstoreError>;
