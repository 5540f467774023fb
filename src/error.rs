//! Error types
//!
//! Every failure is classified into one of four classes. None of them is
//! fatal to the page: network and storage failures degrade a feature,
//! registration failures disable offline support for the session, and
//! validation failures are reported back to the initiating UI action.

use thiserror::Error;

/// Failure classes shared by every component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Probe or fetch failure, recovered on the next scheduled attempt
    TransientNetwork,
    /// Cache or document write failure, feature degrades silently
    Storage,
    /// Worker registration failure, offline support disabled
    Registration,
    /// Local, recoverable user-facing warning
    Validation,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Probe(_) | Error::Fetch(_) => ErrorClass::TransientNetwork,
            Error::Storage(_) => ErrorClass::Storage,
            Error::Registration(_) => ErrorClass::Registration,
            Error::Validation(_) | Error::Decode(_) | Error::Config(_) => ErrorClass::Validation,
        }
    }
}

/// Liveness probe failure (logged, reported as "unreachable")
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("probe request failed: {0}")]
    Request(String),

    #[error("server answered HTTP {0}")]
    Status(u16),
}

/// Network fetch failure inside the worker
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network request to {url} failed: {reason}")]
    Network { url: String, reason: String },

    #[error("no response for {0}")]
    NoResponse(String),

    #[error("bad precaching response for {url}: HTTP {status}")]
    BadPrecacheResponse { url: String, status: u16 },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("quota exceeded writing {key} into {cache}")]
    QuotaExceeded { cache: String, key: String },

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("document persistence failed: {0}")]
    Persistence(String),

    #[error("document operation failed: {0}")]
    Document(String),

    #[error("conflicting precache entries for {url}: {first} vs {second}")]
    ConflictingEntries {
        url: String,
        first: String,
        second: String,
    },
}

impl From<anyhow::Error> for StorageError {
    fn from(err: anyhow::Error) -> Self {
        StorageError::Persistence(format!("{err:#}"))
    }
}

impl From<automerge::AutomergeError> for StorageError {
    fn from(err: automerge::AutomergeError) -> Self {
        StorageError::Document(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("background workers are not supported by this host")]
    Unsupported,

    #[error("registering {script_url} failed: {reason}")]
    Failed { script_url: String, reason: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("please select both departure and arrival cities ({selected} selected)")]
    IncompleteSelection { selected: usize },

    #[error("unknown input type {0:?}")]
    UnknownInputType(String),
}

/// Boundary decode failure for server-push events and worker messages
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown event {0:?}")]
    UnknownEvent(String),

    #[error("malformed payload for {event}: {source}")]
    Payload {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("missing page metadata {0:?}")]
    MissingMetadata(String),

    #[error("invalid url {url:?}: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("invalid route pattern {pattern:?}: {reason}")]
    Pattern { pattern: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
