use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid cache key component: {0}")]
    InvalidKey(String),

    #[error("metadata encoding error: {0}")]
    Metadata(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum RegistryDbError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("latest version {latest} is not in the version set of {package}")]
    LatestNotKnown { package: String, latest: String },
}

/// Terminal failure of a refresh, broadcast to every waiter on the
/// affected in-flight key. Cloneable so one outcome can fan out.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefreshError {
    #[error("not found upstream: {0}")]
    NotFoundUpstream(String),

    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("cache store write failed: {0}")]
    StoreWrite(String),
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Refresh(#[from] RefreshError),

    #[error("artifact store error: {0}")]
    Store(#[from] StoreError),

    #[error("version registry error: {0}")]
    Registry(#[from] RegistryDbError),

    #[error("in-flight refresh abandoned for {0}")]
    RefreshAbandoned(String),
}

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("artifact store error: {0}")]
    Store(#[from] StoreError),

    #[error("version registry error: {0}")]
    Registry(#[from] RegistryDbError),
}
