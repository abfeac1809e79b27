use std::sync::Arc;

/// Represents a result type for operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur while fetching, caching or delivering values.
///
/// None of these are fatal to the host process. Lookups never return errors: they degrade to
/// cached or default values instead.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Invalid API base URL configuration.
    #[error("invalid api base url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The request was unauthorized, possibly due to an invalid SDK key.
    #[error("unauthorized, sdk_key is likely invalid")]
    Unauthorized,

    /// The backend answered with a non-2xx status.
    #[error("unexpected response status {0}")]
    UnexpectedStatus(u16),

    /// The transport failed before a response was received.
    #[error("transport error: {0}")]
    Transport(Arc<str>),

    /// Failed to serialize or deserialize a payload.
    #[error(transparent)]
    // serde_json::Error is not clonable, so we're wrapping it in an Arc.
    Serialization(Arc<serde_json::Error>),

    /// Durable store read or write failed.
    #[error("durable store error: {0}")]
    Storage(Arc<str>),

    /// An I/O error.
    #[error(transparent)]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Transport(value.without_url().to_string().into())
    }
}
