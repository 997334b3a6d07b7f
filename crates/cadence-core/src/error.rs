//! Error types for cadence operations.
//!
//! Every failure carries a structured [`ErrorCode`] for programmatic handling
//! and, where one exists, a suggestion for resolving it.

use std::collections::HashMap;
use thiserror::Error;

/// Result type alias for cadence operations.
pub type CadenceResult<T> = Result<T, CadenceError>;

/// Main error type for all cadence operations.
#[derive(Error, Debug)]
pub enum CadenceError {
    /// Malformed outcome, date or other caller input.
    #[error("Invalid input: {message}")]
    InvalidInput {
        message: String,
        code: ErrorCode,
        details: HashMap<String, String>,
    },

    /// The caller has no usable identity.
    #[error("Not authenticated: {message}")]
    NotAuthenticated { message: String, code: ErrorCode },

    /// Quota exhausted or feature absent for the user's plan.
    #[error("Not entitled: {message}")]
    NotEntitled {
        message: String,
        code: ErrorCode,
        feature: Option<String>,
    },

    /// Missing item or record.
    #[error("Not found: {message}")]
    NotFound {
        message: String,
        code: ErrorCode,
        key: Option<String>,
    },

    /// The remote tier could not be reached.
    #[error("Store unavailable: {message}")]
    StoreUnavailable {
        message: String,
        code: ErrorCode,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A write was attempted against a tier the user's plan may not use.
    #[error("Policy violation: {message}")]
    PolicyViolation {
        message: String,
        code: ErrorCode,
        user_id: String,
    },

    /// Persisted structure did not have the expected shape.
    #[error("Corrupted state: {message}")]
    CorruptedState { message: String, code: ErrorCode },

    /// Database operation failed.
    #[error("Database error: {message}")]
    Database {
        message: String,
        code: ErrorCode,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error codes for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Validation (VAL_xxx)
    ValInvalidInput,
    ValMissingDifficulty,
    ValInvalidDate,

    // Authentication (AUTH_xxx)
    AuthMissingUser,

    // Entitlement (ENT_xxx)
    EntQuotaExhausted,
    EntFeatureAbsent,

    // Lookup (NF_xxx)
    NfItem,

    // Store (STO_xxx)
    StoRemoteUnavailable,
    StoTierPolicy,
    StoCorrupted,

    // Database (DB_xxx)
    DbOperationFailed,

    // Internal
    Internal,
}

impl ErrorCode {
    /// Get the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValInvalidInput => "VAL_001",
            ErrorCode::ValMissingDifficulty => "VAL_002",
            ErrorCode::ValInvalidDate => "VAL_003",
            ErrorCode::AuthMissingUser => "AUTH_001",
            ErrorCode::EntQuotaExhausted => "ENT_001",
            ErrorCode::EntFeatureAbsent => "ENT_002",
            ErrorCode::NfItem => "NF_001",
            ErrorCode::StoRemoteUnavailable => "STO_001",
            ErrorCode::StoTierPolicy => "STO_002",
            ErrorCode::StoCorrupted => "STO_003",
            ErrorCode::DbOperationFailed => "DB_001",
            ErrorCode::Internal => "INT_001",
        }
    }
}

impl CadenceError {
    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
            code: ErrorCode::ValInvalidInput,
            details: HashMap::new(),
        }
    }

    /// Create an invalid input error for a "correct" outcome without a usable difficulty.
    pub fn missing_difficulty(item_id: impl Into<String>) -> Self {
        let item_id = item_id.into();
        let mut details = HashMap::new();
        details.insert("item_id".to_string(), item_id.clone());
        Self::InvalidInput {
            message: format!("correct outcome for item '{}' needs hard, good or easy", item_id),
            code: ErrorCode::ValMissingDifficulty,
            details,
        }
    }

    /// Create an invalid date error.
    pub fn invalid_date(value: impl Into<String>) -> Self {
        let value = value.into();
        let mut details = HashMap::new();
        details.insert("value".to_string(), value.clone());
        Self::InvalidInput {
            message: format!("'{}' is not a calendar date", value),
            code: ErrorCode::ValInvalidDate,
            details,
        }
    }

    /// Create a not authenticated error.
    pub fn not_authenticated(message: impl Into<String>) -> Self {
        Self::NotAuthenticated {
            message: message.into(),
            code: ErrorCode::AuthMissingUser,
        }
    }

    /// Create a not entitled error for an exhausted quota.
    pub fn quota_exhausted(feature: impl Into<String>) -> Self {
        let feature = feature.into();
        Self::NotEntitled {
            message: format!("daily quota for '{}' is exhausted", feature),
            code: ErrorCode::EntQuotaExhausted,
            feature: Some(feature),
        }
    }

    /// Create a not entitled error for a feature the plan does not include.
    pub fn feature_absent(feature: impl Into<String>) -> Self {
        let feature = feature.into();
        Self::NotEntitled {
            message: format!("feature '{}' is not available on this plan", feature),
            code: ErrorCode::EntFeatureAbsent,
            feature: Some(feature),
        }
    }

    /// Create a not found error for a reviewable item.
    pub fn item_not_found(item_id: impl Into<String>) -> Self {
        let id = item_id.into();
        Self::NotFound {
            message: format!("Item with id '{}' has no progress state", id),
            code: ErrorCode::NfItem,
            key: Some(id),
        }
    }

    /// Create a store unavailable error.
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
            code: ErrorCode::StoRemoteUnavailable,
            source: None,
        }
    }

    /// Create a tier policy violation error.
    pub fn policy_violation(user_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PolicyViolation {
            message: message.into(),
            code: ErrorCode::StoTierPolicy,
            user_id: user_id.into(),
        }
    }

    /// Create a corrupted state error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::CorruptedState {
            message: message.into(),
            code: ErrorCode::StoCorrupted,
        }
    }

    /// Create a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            code: ErrorCode::DbOperationFailed,
            source: None,
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidInput { code, .. } => *code,
            Self::NotAuthenticated { code, .. } => *code,
            Self::NotEntitled { code, .. } => *code,
            Self::NotFound { code, .. } => *code,
            Self::StoreUnavailable { code, .. } => *code,
            Self::PolicyViolation { code, .. } => *code,
            Self::CorruptedState { code, .. } => *code,
            Self::Database { code, .. } => *code,
            _ => ErrorCode::Internal,
        }
    }

    /// Whether the failure is transient and worth retrying later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. } | Self::Database { .. })
    }

    /// Get a user-friendly suggestion for resolving this error.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::InvalidInput { code: ErrorCode::ValMissingDifficulty, .. } => {
                Some("Send a difficulty of hard, good or easy with every correct answer")
            }
            Self::NotAuthenticated { .. } => Some("Sign in before recording progress"),
            Self::NotEntitled { code: ErrorCode::EntQuotaExhausted, .. } => {
                Some("Wait for the daily reset or upgrade to premium")
            }
            Self::NotFound { code: ErrorCode::NfItem, .. } => {
                Some("Mark the outcome as a first exposure to create the item")
            }
            Self::StoreUnavailable { .. } => Some("The change is kept locally and will be synced later"),
            Self::PolicyViolation { .. } => Some("Only premium accounts store progress remotely"),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for CadenceError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database {
            message: err.to_string(),
            code: ErrorCode::DbOperationFailed,
            source: Some(Box::new(err)),
        }
    }
}
