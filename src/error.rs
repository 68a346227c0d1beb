//! Error types for the Image Registry Operator
//!
//! Every failure is classified into an [`ErrorAction`]: transient failures go
//! back to the rate-limited queue, permanent ones are only surfaced through
//! status conditions until something external changes.

use std::fmt;
use thiserror::Error;

/// Classification of a failed cloud call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudErrorKind {
    /// The resource does not exist
    NotFound,
    /// The name is taken by somebody else
    AlreadyExists,
    /// The name is already taken by the caller
    AlreadyOwned,
    /// The resource exists but the credentials cannot reach it
    AccessDenied,
    /// The backend rejected the name
    InvalidName,
    /// Rate limited by the backend
    Throttled,
    /// Anything else
    Internal,
}

impl fmt::Display for CloudErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloudErrorKind::NotFound => write!(f, "not found"),
            CloudErrorKind::AlreadyExists => write!(f, "already exists"),
            CloudErrorKind::AlreadyOwned => write!(f, "already owned"),
            CloudErrorKind::AccessDenied => write!(f, "access denied"),
            CloudErrorKind::InvalidName => write!(f, "invalid name"),
            CloudErrorKind::Throttled => write!(f, "throttled"),
            CloudErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Operation cannot be fulfilled on {kind}/{name}: the object has been modified")]
    Conflict { kind: String, name: String },

    // =========================================================================
    // Storage Configuration Errors
    // =========================================================================
    #[error("storage is not configured")]
    StorageNotConfigured,

    #[error("exactly one storage backend must be configured, found: {0}")]
    MultipleStorageBackends(String),

    #[error("unable to read cloud credentials: {0}")]
    CredentialsUnavailable(String),

    #[error("invalid cloud credentials: {0}")]
    InvalidCredentials(String),

    #[error("invalid Azure cloud name {0:?}")]
    InvalidCloudName(String),

    #[error("unable to determine storage region for {backend}")]
    RegionUnavailable { backend: String },

    // =========================================================================
    // Storage Backend Errors
    // =========================================================================
    #[error("{backend} {operation} failed ({kind}): {message}")]
    Cloud {
        backend: String,
        operation: String,
        kind: CloudErrorKind,
        message: String,
    },

    #[error("{kind} {name} {reason}")]
    StorageUnavailable {
        kind: String,
        name: String,
        reason: String,
    },

    #[error("unable to generate a unique {kind} name after {attempts} attempts")]
    NameGenerationExhausted { kind: String, attempts: usize },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML encode error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Don't requeue, wait for an external change
    NoRequeue,
}

impl Error {
    /// Shorthand for a failed cloud call
    pub fn cloud(
        backend: impl Into<String>,
        operation: impl Into<String>,
        kind: CloudErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Error::Cloud {
            backend: backend.into(),
            operation: operation.into(),
            kind,
            message: message.into(),
        }
    }

    /// Map a kube error for the given object onto the operator taxonomy
    pub fn from_kube(err: kube::Error, kind: &str, name: &str) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 409 => Error::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(resp) if resp.code == 404 => Error::ResourceNotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            _ => Error::Kube(err),
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            Error::Configuration(_)
            | Error::StorageNotConfigured
            | Error::MultipleStorageBackends(_)
            | Error::InvalidCredentials(_)
            | Error::InvalidCloudName(_)
            | Error::RegionUnavailable { .. }
            | Error::StorageUnavailable { .. }
            | Error::NameGenerationExhausted { .. } => ErrorAction::NoRequeue,

            Error::Cloud { kind, .. } => match kind {
                CloudErrorKind::AccessDenied | CloudErrorKind::InvalidName => {
                    ErrorAction::NoRequeue
                }
                _ => ErrorAction::RequeueWithBackoff,
            },

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Optimistic concurrency loss on write
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ResourceNotFound { .. } => true,
            Error::Cloud { kind, .. } => *kind == CloudErrorKind::NotFound,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Condition reason used when this error is reported in status
    pub fn reason(&self) -> &'static str {
        match self {
            Error::StorageNotConfigured => "StorageNotConfigured",
            Error::MultipleStorageBackends(_) | Error::Configuration(_) => {
                "InvalidStorageConfiguration"
            }
            Error::CredentialsUnavailable(_) | Error::InvalidCredentials(_) => {
                "InvalidCredentials"
            }
            Error::InvalidCloudName(_) => "InvalidCloudName",
            Error::RegionUnavailable { .. } => "InvalidRegion",
            Error::StorageUnavailable { .. } => "StorageUnavailable",
            Error::NameGenerationExhausted { .. } => "NameGenerationFailed",
            Error::Cloud { kind, .. } => match kind {
                CloudErrorKind::AccessDenied => "AccessDenied",
                CloudErrorKind::InvalidName => "InvalidStorageName",
                _ => "StorageError",
            },
            Error::Conflict { .. } => "Conflict",
            _ => "Error",
        }
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of a failed apply step.
///
/// `Fatal` errors can only be fixed by an external change: the sync loop
/// reports them through conditions and does not requeue.
#[derive(Debug)]
pub enum ApplyError {
    Retryable(Error),
    Fatal(Error),
}

impl ApplyError {
    pub fn error(&self) -> &Error {
        match self {
            ApplyError::Retryable(e) | ApplyError::Fatal(e) => e,
        }
    }

    pub fn into_error(self) -> Error {
        match self {
            ApplyError::Retryable(e) | ApplyError::Fatal(e) => e,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ApplyError::Fatal(_))
    }
}

impl From<Error> for ApplyError {
    fn from(err: Error) -> Self {
        match err.action() {
            ErrorAction::NoRequeue => ApplyError::Fatal(err),
            ErrorAction::RequeueWithBackoff => ApplyError::Retryable(err),
        }
    }
}

impl fmt::Display for ApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error().fmt(f)
    }
}
