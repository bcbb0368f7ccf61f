//! Error kinds returned by the fabric table (spec §7).

use serde::{Deserialize, Serialize};

/// Unified error type for all fabric table operations.
///
/// Mirrors the message-carrying variant shape used throughout the workspace
/// (see `aura-core`'s `AuraError`), specialized to the error kinds the fabric
/// lifecycle state machine can actually produce.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
pub enum FabricTableError {
    /// Syntactically malformed input (bad length, oversized label, ...).
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of what was malformed.
        message: String,
    },

    /// The supplied `FabricIndex` refers to an unused or out-of-range slot.
    #[error("invalid fabric index: {message}")]
    InvalidFabricIndex {
        /// Description of the index in question.
        message: String,
    },

    /// Adding this fabric would violate invariant I4 and permit-colliding is off.
    #[error("fabric already exists: {message}")]
    FabricExists {
        /// Description of the colliding identity.
        message: String,
    },

    /// Read of an absent field (e.g. no ICAC on this entry).
    #[error("not found: {message}")]
    NotFound {
        /// Description of what was absent.
        message: String,
    },

    /// A destination-ID lookup found no matching candidate fabric.
    #[error("key not found: {message}")]
    KeyNotFound {
        /// Description of the failed lookup.
        message: String,
    },

    /// Certificate chain validation failed: signature, time window, key usage,
    /// or NOC-to-key mismatch.
    #[error("invalid credentials: {message}")]
    InvalidCredentials {
        /// Description of the validation failure.
        message: String,
    },

    /// The operation is illegal in the table's current lifecycle state.
    #[error("incorrect state: {message}")]
    IncorrectState {
        /// Description of the state conflict.
        message: String,
    },

    /// The in-memory slot limit or storage budget was exceeded.
    #[error("insufficient space: {message}")]
    InsufficientSpace {
        /// Description of the resource that ran out.
        message: String,
    },

    /// The underlying persistent storage reported an error.
    #[error("storage failure: {message}")]
    StorageFailure {
        /// Description of the underlying storage error.
        message: String,
    },

    /// An invariant was violated at runtime; should be unreachable from
    /// well-formed inputs and indicates a bug in the table itself.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the violated invariant.
        message: String,
    },
}

impl FabricTableError {
    /// Build an `InvalidArgument` error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Build an `InvalidFabricIndex` error.
    pub fn invalid_fabric_index(message: impl Into<String>) -> Self {
        Self::InvalidFabricIndex {
            message: message.into(),
        }
    }

    /// Build a `FabricExists` error.
    pub fn fabric_exists(message: impl Into<String>) -> Self {
        Self::FabricExists {
            message: message.into(),
        }
    }

    /// Build a `NotFound` error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Build a `KeyNotFound` error.
    pub fn key_not_found(message: impl Into<String>) -> Self {
        Self::KeyNotFound {
            message: message.into(),
        }
    }

    /// Build an `InvalidCredentials` error.
    pub fn invalid_credentials(message: impl Into<String>) -> Self {
        Self::InvalidCredentials {
            message: message.into(),
        }
    }

    /// Build an `IncorrectState` error.
    pub fn incorrect_state(message: impl Into<String>) -> Self {
        Self::IncorrectState {
            message: message.into(),
        }
    }

    /// Build an `InsufficientSpace` error.
    pub fn insufficient_space(message: impl Into<String>) -> Self {
        Self::InsufficientSpace {
            message: message.into(),
        }
    }

    /// Build a `StorageFailure` error.
    pub fn storage_failure(message: impl Into<String>) -> Self {
        Self::StorageFailure {
            message: message.into(),
        }
    }

    /// Build an `Internal` error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Short, stable category tag used in log fields.
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidArgument { .. } => "invalid_argument",
            Self::InvalidFabricIndex { .. } => "invalid_fabric_index",
            Self::FabricExists { .. } => "fabric_exists",
            Self::NotFound { .. } => "not_found",
            Self::KeyNotFound { .. } => "key_not_found",
            Self::InvalidCredentials { .. } => "invalid_credentials",
            Self::IncorrectState { .. } => "incorrect_state",
            Self::InsufficientSpace { .. } => "insufficient_space",
            Self::StorageFailure { .. } => "storage_failure",
            Self::Internal { .. } => "internal",
        }
    }

    /// Whether the caller might succeed by retrying the same call unchanged.
    ///
    /// Only storage failures are retryable; every other kind is a
    /// deterministic function of the caller's inputs and table state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageFailure { .. })
    }
}

/// Standard result type for fabric table operations.
pub type Result<T> = std::result::Result<T, FabricTableError>;
