//! Error types and wire error mapping.
//!
//! Keel defines one error taxonomy shared by the transaction engine, the
//! domain model and the request server. Each variant maps to a stable wire
//! error code through [`ErrorCode`]; those code strings are part of the API
//! contract and must not change.

use thiserror::Error;

/// Common Keel error conditions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeelError {
    /// A transaction assertion failed because another writer committed first.
    ///
    /// The transaction runner retries on this error; callers only see it from
    /// single-shot submissions.
    #[error("transaction aborted")]
    TxnAborted,

    /// The retry bound was exhausted while other writers kept winning.
    #[error("state changing too quickly; try again soon ({attempts} attempts)")]
    ExcessiveContention { attempts: u32 },

    /// The target entity or environment does not exist.
    #[error("{what} not found")]
    NotFound { what: String },

    /// The entity being created already exists.
    #[error("{what} already exists")]
    AlreadyExists { what: String },

    /// A request other than a login arrived on an unauthenticated connection.
    #[error("not logged in")]
    Unauthenticated,

    /// Login failed.
    #[error("invalid entity name or password")]
    BadCredentials,

    /// Login attempted on an already authenticated connection.
    #[error("already logged in")]
    AlreadyLoggedIn,

    /// Authenticated principal may not touch the requested entity.
    #[error("permission denied")]
    PermissionDenied,

    /// The request's environment scope is not the one this server serves.
    #[error("unknown environment: {scope:?}")]
    UnknownScope { scope: String },

    /// The backing store cannot be reached.
    #[error("store unavailable: {message}")]
    StoreUnavailable { message: String },

    /// Frame decode/encode or socket failure on one connection.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Malformed or semantically invalid request.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// No facade or method matches the request.
    #[error("{message}")]
    NotImplemented { message: String },

    /// The server is draining and no longer serves new work.
    #[error("server is shutting down")]
    ShuttingDown,

    /// Internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl KeelError {
    /// Create a NotFound error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists { what: what.into() }
    }

    /// Create an InvalidRequest error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create an Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a Transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a StoreUnavailable error.
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    /// Prefix the error message with context, keeping the variant.
    ///
    /// Only message-carrying variants are annotated; the rest keep their
    /// stable text so clients can still match on it.
    pub fn annotate(self, context: impl std::fmt::Display) -> Self {
        match self {
            Self::InvalidRequest { message } => Self::InvalidRequest {
                message: format!("{}: {}", context, message),
            },
            Self::Internal { message } => Self::Internal {
                message: format!("{}: {}", context, message),
            },
            Self::StoreUnavailable { message } => Self::StoreUnavailable {
                message: format!("{}: {}", context, message),
            },
            other => other,
        }
    }

    /// Check if this error is an assertion conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::TxnAborted | Self::ExcessiveContention { .. })
    }

    /// Check if this error reports a missing entity.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this error is fatal to the server.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }
}

/// Result type using KeelError.
pub type KeelResult<T> = Result<T, KeelError>;

impl From<serde_json::Error> for KeelError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidRequest {
            message: err.to_string(),
        }
    }
}

// ============================================================================
// Wire error codes
// ============================================================================

/// Stable error codes reported in response envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    Unauthorized,
    NotLoggedIn,
    AlreadyLoggedIn,
    UnknownEnvironment,
    ExcessiveContention,
    TxnAborted,
    NotImplemented,
    BadRequest,
    StoreUnavailable,
    ShuttingDown,
    Internal,
}

impl ErrorCode {
    /// The string sent on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not found",
            Self::AlreadyExists => "already exists",
            Self::Unauthorized => "unauthorized access",
            Self::NotLoggedIn => "not logged in",
            Self::AlreadyLoggedIn => "already logged in",
            Self::UnknownEnvironment => "unknown environment",
            Self::ExcessiveContention => "excessive contention",
            Self::TxnAborted => "transaction aborted",
            Self::NotImplemented => "not implemented",
            Self::BadRequest => "bad request",
            Self::StoreUnavailable => "store unavailable",
            Self::ShuttingDown => "server shutting down",
            Self::Internal => "internal",
        }
    }

    /// Parse a wire code back into an ErrorCode.
    pub fn parse(code: &str) -> Option<Self> {
        let code = match code {
            "not found" => Self::NotFound,
            "already exists" => Self::AlreadyExists,
            "unauthorized access" => Self::Unauthorized,
            "not logged in" => Self::NotLoggedIn,
            "already logged in" => Self::AlreadyLoggedIn,
            "unknown environment" => Self::UnknownEnvironment,
            "excessive contention" => Self::ExcessiveContention,
            "transaction aborted" => Self::TxnAborted,
            "not implemented" => Self::NotImplemented,
            "bad request" => Self::BadRequest,
            "store unavailable" => Self::StoreUnavailable,
            "server shutting down" => Self::ShuttingDown,
            "internal" => Self::Internal,
            _ => return None,
        };
        Some(code)
    }
}

impl From<&KeelError> for ErrorCode {
    fn from(error: &KeelError) -> Self {
        match error {
            KeelError::TxnAborted => Self::TxnAborted,
            KeelError::ExcessiveContention { .. } => Self::ExcessiveContention,
            KeelError::NotFound { .. } => Self::NotFound,
            KeelError::AlreadyExists { .. } => Self::AlreadyExists,
            KeelError::Unauthenticated => Self::NotLoggedIn,
            KeelError::BadCredentials => Self::Unauthorized,
            KeelError::AlreadyLoggedIn => Self::AlreadyLoggedIn,
            KeelError::PermissionDenied => Self::Unauthorized,
            KeelError::UnknownScope { .. } => Self::UnknownEnvironment,
            KeelError::StoreUnavailable { .. } => Self::StoreUnavailable,
            KeelError::Transport { .. } => Self::BadRequest,
            KeelError::InvalidRequest { .. } => Self::BadRequest,
            KeelError::NotImplemented { .. } => Self::NotImplemented,
            KeelError::ShuttingDown => Self::ShuttingDown,
            KeelError::Internal { .. } => Self::Internal,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_and_auth_errors_are_distinct() {
        let scope = KeelError::UnknownScope {
            scope: "deadbeef".to_string(),
        };
        assert_eq!(ErrorCode::from(&scope), ErrorCode::UnknownEnvironment);
        assert_eq!(
            ErrorCode::from(&KeelError::BadCredentials),
            ErrorCode::Unauthorized
        );
        assert_ne!(
            ErrorCode::from(&scope),
            ErrorCode::from(&KeelError::BadCredentials)
        );
    }

    #[test]
    fn test_error_code_parse() {
        for code in [
            ErrorCode::NotFound,
            ErrorCode::Unauthorized,
            ErrorCode::UnknownEnvironment,
            ErrorCode::ExcessiveContention,
            ErrorCode::ShuttingDown,
        ] {
            assert_eq!(ErrorCode::parse(code.as_str()), Some(code));
        }
        assert_eq!(ErrorCode::parse("bogus"), None);
    }

    #[test]
    fn test_annotate_keeps_variant() {
        let err = KeelError::invalid("bad code").annotate("cannot set meter status");
        assert_eq!(err.to_string(), "invalid request: cannot set meter status: bad code");

        let err = KeelError::not_found("unit wordpress/0").annotate("ignored");
        assert_eq!(err.to_string(), "unit wordpress/0 not found");
    }

    #[test]
    fn test_classification() {
        assert!(KeelError::TxnAborted.is_conflict());
        assert!(KeelError::ExcessiveContention { attempts: 3 }.is_conflict());
        assert!(KeelError::not_found("x").is_not_found());
        assert!(KeelError::store_unavailable("ping").is_fatal());
        assert!(!KeelError::BadCredentials.is_fatal());
    }
}
