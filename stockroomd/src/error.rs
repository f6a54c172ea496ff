//! Daemon error types.

use stockroom_domain::DomainError;
use stockroom_exec::ExecError;
use stockroom_store::StoreError;
use thiserror::Error;

// =============================================================================
// Service errors
// =============================================================================

/// Errors returned to callers of the storefront intake.
///
/// Every variant maps to an HTTP-equivalent status and a stable machine code.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// `Idempotency-Key` missing or blank
    #[error("Idempotency-Key header is required")]
    KeyRequired,

    /// `Idempotency-Key` longer than the maximum
    #[error("Idempotency-Key is too long: {len} chars (max {max})")]
    KeyTooLong { len: usize, max: usize },

    /// Request body failed validation
    #[error("Invalid request: {field}: {reason}")]
    InvalidRequest { field: String, reason: String },

    /// Domain rule rejected the input
    #[error("Domain error: {0}")]
    Domain(DomainError),

    /// No business with this storefront public id
    #[error("Storefront not found: {0}")]
    StorefrontNotFound(String),

    /// Business exists but its storefront is switched off
    #[error("Storefront is disabled: {0}")]
    StorefrontDisabled(String),

    /// Client exceeded its request budget
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Coordinator or storage failure
    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl ServiceError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRequest { field: field.into(), reason: reason.into() }
    }

    /// HTTP-equivalent status code
    pub fn status_code(&self) -> u16 {
        match self {
            Self::KeyRequired
            | Self::KeyTooLong { .. }
            | Self::InvalidRequest { .. }
            | Self::Domain(_) => 400,
            Self::StorefrontDisabled(_) => 403,
            Self::StorefrontNotFound(_) => 404,
            Self::RateLimited => 429,
            Self::Exec(err) => match err {
                ExecError::ConflictingPayload { .. } | ExecError::InProgress { .. } => 409,
                ExecError::Domain(_) => 400,
                ExecError::RetryExhausted { .. }
                | ExecError::Transport(_)
                | ExecError::Invariant(_) => 500,
            },
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::KeyRequired => "idempotency_key_required",
            Self::KeyTooLong { .. } => "idempotency_key_too_long",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Domain(_) => "invalid_input",
            Self::StorefrontNotFound(_) => "storefront_not_found",
            Self::StorefrontDisabled(_) => "storefront_disabled",
            Self::RateLimited => "rate_limited",
            Self::Exec(err) => match err {
                ExecError::ConflictingPayload { .. } => "idempotency_conflict",
                ExecError::InProgress { .. } => "idempotency_in_progress",
                ExecError::RetryExhausted { .. } => "retry_exhausted",
                ExecError::Transport(_) => "storage_failure",
                ExecError::Domain(_) => "invalid_input",
                ExecError::Invariant(_) => "internal",
            },
        }
    }
}

impl From<DomainError> for ServiceError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::IdempotencyKeyRequired => Self::KeyRequired,
            DomainError::IdempotencyKeyTooLong { len, max } => Self::KeyTooLong { len, max },
            other => Self::Domain(other),
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        Self::Exec(ExecError::Transport(err))
    }
}

/// Result type for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

// =============================================================================
// Daemon errors
// =============================================================================

/// Daemon-level errors.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Domain error
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Execution error
    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),

    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;
