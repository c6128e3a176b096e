// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for flowroom-core.
//!
//! Validation errors carry enough context (index, code) to be surfaced to API callers.
//! Everything else is wrapped with what was being done and for which id.

use thiserror::Error;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while advancing sessions or mutating contacts.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// A URN could not be parsed or normalized.
    #[error("URN {index} is invalid: {reason}")]
    UrnInvalid {
        /// Position of the URN in the input list.
        index: usize,
        /// Why the URN was rejected.
        reason: String,
    },

    /// A URN is already owned by another contact.
    #[error("URN {index} is in use by another contact")]
    UrnTaken {
        /// Position of the URN in the input list.
        index: usize,
    },

    /// URNs resolved to more than one contact.
    #[error("URNs belong to different contacts")]
    ContactsConflict,

    /// A contact field value could not be parsed for its field type.
    #[error("invalid value for field '{field}': {value}")]
    InvalidFieldValue {
        /// The field key.
        field: String,
        /// The rejected value.
        value: String,
    },

    /// A language code is not one of the org's languages.
    #[error("unknown language '{0}'")]
    UnknownLanguage(String),

    /// A group UUID does not belong to the org.
    #[error("unknown group '{0}'")]
    UnknownGroup(uuid::Uuid),

    /// A requested record does not exist.
    #[error("{kind} {id} not found")]
    NotFound {
        /// The kind of record (contact, flow, session...).
        kind: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// A record is in a state that doesn't allow the operation.
    #[error("{kind} {id} is in invalid state: expected '{expected}', got '{actual}'")]
    InvalidState {
        /// The kind of record.
        kind: &'static str,
        /// The record identifier.
        id: String,
        /// The expected state.
        expected: String,
        /// The actual state.
        actual: String,
    },

    /// The flow engine rejected a request.
    #[error("engine error: {0}")]
    Engine(String),

    /// Object storage operation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Redis command failed.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An internal invariant was violated, such as an unknown status code or a missing handler.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Another error wrapped with what we were doing.
    #[error("{context}: {source}")]
    Context {
        /// What was being done, and for which id.
        context: String,
        /// The underlying error.
        #[source]
        source: Box<CoreError>,
    },
}

impl CoreError {
    /// Get the machine readable code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UrnInvalid { .. } => "URN_INVALID",
            Self::UrnTaken { .. } => "URN_TAKEN",
            Self::ContactsConflict => "CONTACTS_CONFLICT",
            Self::InvalidFieldValue { .. } => "INVALID_FIELD_VALUE",
            Self::UnknownLanguage(_) => "UNKNOWN_LANGUAGE",
            Self::UnknownGroup(_) => "UNKNOWN_GROUP",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::Engine(_) => "ENGINE_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Redis(_) => "REDIS_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Invariant(_) => "INVARIANT_VIOLATED",
            Self::Context { source, .. } => source.error_code(),
        }
    }

    /// Whether this is a user-facing validation error rather than a system failure.
    pub fn is_validation(&self) -> bool {
        match self {
            Self::UrnInvalid { .. }
            | Self::UrnTaken { .. }
            | Self::ContactsConflict
            | Self::InvalidFieldValue { .. }
            | Self::UnknownLanguage(_)
            | Self::UnknownGroup(_) => true,
            Self::Context { source, .. } => source.is_validation(),
            _ => false,
        }
    }

    /// The innermost error, skipping any context wrappers.
    pub fn root(&self) -> &CoreError {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the underlying database error is a unique constraint violation.
    pub fn is_unique_violation(&self) -> bool {
        match self.root() {
            Self::Database(sqlx::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }

    /// Wrap this error with context.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Shorthand for a not found error.
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

/// Extension for attaching context to results.
pub trait ResultExt<T> {
    /// Wrap the error (if any) with a lazily built context message.
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<CoreError>,
{
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.into().context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases = vec![
            (
                CoreError::UrnInvalid {
                    index: 1,
                    reason: "bad".to_string(),
                },
                "URN_INVALID",
            ),
            (CoreError::UrnTaken { index: 0 }, "URN_TAKEN"),
            (CoreError::ContactsConflict, "CONTACTS_CONFLICT"),
            (
                CoreError::UnknownLanguage("xyz".to_string()),
                "UNKNOWN_LANGUAGE",
            ),
            (CoreError::not_found("contact", 12), "NOT_FOUND"),
            (CoreError::Engine("boom".to_string()), "ENGINE_ERROR"),
            (
                CoreError::Invariant("unknown status".to_string()),
                "INVARIANT_VIOLATED",
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.error_code(), expected, "{:?}", error);
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_display() {
        let err = CoreError::UrnTaken { index: 2 };
        assert_eq!(err.to_string(), "URN 2 is in use by another contact");

        let err = CoreError::not_found("flow", "abc");
        assert_eq!(err.to_string(), "flow abc not found");
    }

    #[test]
    fn test_context_preserves_code_and_validation() {
        let err = CoreError::UrnTaken { index: 0 }.context("error creating contact");
        assert_eq!(err.error_code(), "URN_TAKEN");
        assert!(err.is_validation());
        assert_eq!(
            err.to_string(),
            "error creating contact: URN 0 is in use by another contact"
        );
        assert!(matches!(err.root(), CoreError::UrnTaken { index: 0 }));

        let err = CoreError::Engine("x".to_string()).context("sprint for contact 4");
        assert!(!err.is_validation());
    }

    #[test]
    fn test_result_ext() {
        let res: std::result::Result<(), serde_json::Error> =
            serde_json::from_str::<()>("{").map(|_| ());
        let err = res.with_context(|| "decoding session").unwrap_err();
        assert_eq!(err.error_code(), "JSON_ERROR");
        assert!(err.to_string().starts_with("decoding session: "));
    }
}
