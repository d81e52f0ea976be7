use thiserror::Error;

/// Errors raised by lease stores, change feeds and the worker loops.
#[derive(Debug, Error)]
pub enum Error {
    /// A lease read or write failed for a reason expected to clear up on
    /// its own (network, timeout, lock contention).
    #[error("transient lease store error: {0}")]
    TransientStore(String),

    /// A concurrent creator inserted the lease record first.
    #[error("lease '{0}' already exists")]
    AlreadyExists(String),

    /// The change feed subscription could not be established or dropped.
    #[error("change feed subscription failed: {0}")]
    FeedSubscription(String),

    /// Missing or invalid configuration. Fatal at startup.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A persisted document could not be decoded.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// Downstream processing rejected an event.
    #[error("handler failed: {0}")]
    Handler(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns `true` for failures the owning loop absorbs and retries on its
    /// next tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientStore(_) | Error::FeedSubscription(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
