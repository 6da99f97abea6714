use crate::feed::ItemId;

/// Failures reported by a [`crate::source::DataSource`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("network error: {0}")]
    Network(String),
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::NotAuthenticated => false,
            SourceError::Network(_) => true,
            SourceError::Server { status, .. } => *status >= 500 || *status == 429,
        }
    }
}

/// Feed-level load errors surfaced to the rendering layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("feed unavailable: {0}")]
    TransientNetwork(String),
    #[error("authentication expired")]
    AuthExpired,
    #[error("feed server error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("live updates were interrupted; feed may be incomplete")]
    ReconciliationGap,
}

impl From<SourceError> for FeedError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::NotAuthenticated => FeedError::AuthExpired,
            SourceError::Network(message) => FeedError::TransientNetwork(message),
            SourceError::Server { status, message } => FeedError::Server { status, message },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("media download failed: {0}")]
    Network(String),
    #[error("media could not be decoded: {0}")]
    Decode(String),
    #[error("media exceeds {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("media load cancelled")]
    Cancelled,
}

/// A live change event rejected at the reconciler boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    #[error("unknown change type {0:?}")]
    UnknownType(String),
    #[error("change event is missing an item id")]
    MissingId,
    #[error("change event for {0} has no version")]
    MissingVersion(ItemId),
    #[error("{kind} event for {id} carries no item")]
    MissingItem { kind: &'static str, id: ItemId },
    #[error("event id {event} does not match item id {item}")]
    IdMismatch { event: ItemId, item: ItemId },
    #[error("item {id} has invalid media url {url:?}")]
    InvalidMediaUrl { id: ItemId, url: String },
    #[error("malformed change payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("item {0} is not in the feed")]
    UnknownItem(ItemId),
    #[error("feed session is closed")]
    Closed,
    #[error("subscribe to live changes: {0}")]
    Subscribe(SourceError),
}
