//! Error types for wgmesh

use thiserror::Error;

/// Result type alias using wgmesh Error
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used by the HTTP and gRPC edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Unauthorized,
    Forbidden,
    Expired,
    Transient,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Expired => "expired",
            ErrorKind::Transient => "transient",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// wgmesh error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Resource already exists: {kind} with id {id}")]
    AlreadyExists { kind: String, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("No unique addresses available in network {0}")]
    NoAddressesAvailable(String),

    #[error("Invalid enrollment key")]
    InvalidKey,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Expired: {0}")]
    Expired(String),

    #[error("Operation timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    pub fn already_exists(kind: &str, id: impl std::fmt::Display) -> Self {
        Error::AlreadyExists {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }

    /// Taxonomy bucket for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::InvalidKey => ErrorKind::Validation,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::AlreadyExists { .. } | Error::Conflict(_) | Error::NoAddressesAvailable(_) => {
                ErrorKind::Conflict
            }
            Error::Unauthorized(_) | Error::Crypto(_) => ErrorKind::Unauthorized,
            Error::PermissionDenied(_) => ErrorKind::Forbidden,
            Error::Expired(_) => ErrorKind::Expired,
            Error::Io(_)
            | Error::Database(_)
            | Error::Timeout { .. }
            | Error::Broker(_)
            | Error::Upstream(_) => ErrorKind::Transient,
            Error::Serialization(_) | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a caller may retry the operation unchanged.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<ed25519_dalek::SignatureError> for Error {
    fn from(e: ed25519_dalek::SignatureError) -> Self {
        Error::Crypto(e.to_string())
    }
}

impl From<Error> for tonic::Status {
    fn from(e: Error) -> Self {
        match e {
            Error::NotFound { kind, id } => {
                tonic::Status::not_found(format!("{} {} not found", kind, id))
            }
            Error::AlreadyExists { kind, id } => {
                tonic::Status::already_exists(format!("{} {} already exists", kind, id))
            }
            Error::Timeout { seconds } => {
                tonic::Status::deadline_exceeded(format!("Operation timed out after {}s", seconds))
            }
            e => match e.kind() {
                ErrorKind::Validation => tonic::Status::invalid_argument(e.to_string()),
                ErrorKind::Conflict => tonic::Status::failed_precondition(e.to_string()),
                ErrorKind::Unauthorized | ErrorKind::Expired => {
                    tonic::Status::unauthenticated(e.to_string())
                }
                ErrorKind::Forbidden => tonic::Status::permission_denied(e.to_string()),
                ErrorKind::Transient => tonic::Status::unavailable(e.to_string()),
                _ => tonic::Status::internal(e.to_string()),
            },
        }
    }
}
