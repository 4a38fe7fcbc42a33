//! Error types for membership operations

use thiserror::Error;

/// Main membership error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MembershipError {
    /// A membership invariant was broken by the caller.
    ///
    /// These are programming errors: the offending call is aborted and no
    /// state is changed.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Dispatch was interrupted by a listener
    #[error("Listener dispatch interrupted")]
    Interrupted,

    /// Invalid argument supplied by the caller
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Message channel error
    #[error("Channel error: {0}")]
    Channel(String),

    /// Service lifecycle error
    #[error("Service error: {0}")]
    Service(String),
}

impl MembershipError {
    /// Create an invariant violation error
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Whether this error signals a broken invariant
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }
}

impl From<toml::de::Error> for MembershipError {
    fn from(err: toml::de::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Result type alias
pub type MembershipResult<T> = Result<T, MembershipError>;

/// Return an [`MembershipError::InvariantViolation`] unless the condition holds.
macro_rules! ensure_invariant {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::MembershipError::InvariantViolation(format!($($arg)+)));
        }
    };
}

pub(crate) use ensure_invariant;
