//! Request and server frame envelopes.
//!
//! ```text
//! client -> server  {"id","type","version","request","scope","params"}
//! server -> client  {"kind":"response","id","error"?,"result"}
//!                   {"kind":"notification","watcher_id","changes"}
//! ```

use crate::core::error::{ErrorCode, KeelError, KeelResult};
use crate::store::Change;
use crate::watch::WatchId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Client-chosen id, unique among the connection's in-flight requests.
    pub id: String,
    /// Facade name.
    #[serde(rename = "type")]
    pub facade: String,
    /// Facade version; defaults to 1.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Method name within the facade.
    pub request: String,
    /// Environment uuid, or empty for the server's own environment.
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub params: Value,
}

fn default_version() -> u32 {
    1
}

impl Request {
    pub fn new(id: impl Into<String>, facade: &str, version: u32, request: &str, params: Value) -> Self {
        Self {
            id: id.into(),
            facade: facade.to_string(),
            version,
            request: request.to_string(),
            scope: String::new(),
            params,
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// `Facade.Request`, used in logs.
    pub fn method(&self) -> String {
        format!("{}.{}", self.facade, self.request)
    }
}

/// Error carried in a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub message: String,
    pub code: String,
}

impl From<&KeelError> for WireError {
    fn from(err: &KeelError) -> Self {
        Self {
            message: err.to_string(),
            code: ErrorCode::from(err).as_str().to_string(),
        }
    }
}

impl WireError {
    /// Rebuild a [`KeelError`] on the client side.
    pub fn into_error(self) -> KeelError {
        let Some(code) = ErrorCode::parse(&self.code) else {
            return KeelError::internal(format!("{} (code {:?})", self.message, self.code));
        };
        let message = self.message;
        let strip = |prefix: &str| message.strip_prefix(prefix).unwrap_or(&message).to_string();
        match code {
            ErrorCode::NotFound => KeelError::NotFound {
                what: message
                    .strip_suffix(" not found")
                    .unwrap_or(&message)
                    .to_string(),
            },
            ErrorCode::AlreadyExists => KeelError::AlreadyExists {
                what: message
                    .strip_suffix(" already exists")
                    .unwrap_or(&message)
                    .to_string(),
            },
            ErrorCode::Unauthorized => {
                if message == KeelError::PermissionDenied.to_string() {
                    KeelError::PermissionDenied
                } else {
                    KeelError::BadCredentials
                }
            }
            ErrorCode::NotLoggedIn => KeelError::Unauthenticated,
            ErrorCode::AlreadyLoggedIn => KeelError::AlreadyLoggedIn,
            ErrorCode::UnknownEnvironment => KeelError::UnknownScope {
                scope: strip("unknown environment: ").trim_matches('"').to_string(),
            },
            ErrorCode::ExcessiveContention => KeelError::ExcessiveContention { attempts: 0 },
            ErrorCode::TxnAborted => KeelError::TxnAborted,
            ErrorCode::NotImplemented => KeelError::NotImplemented {
                message: message.clone(),
            },
            ErrorCode::BadRequest => KeelError::invalid(strip("invalid request: ")),
            ErrorCode::StoreUnavailable => KeelError::store_unavailable(strip("store unavailable: ")),
            ErrorCode::ShuttingDown => KeelError::ShuttingDown,
            ErrorCode::Internal => KeelError::internal(strip("internal error: ")),
        }
    }
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ServerFrame {
    Response {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
        #[serde(default)]
        result: Value,
    },
    Notification {
        watcher_id: WatchId,
        changes: Vec<Change>,
    },
}

impl ServerFrame {
    pub fn response(id: impl Into<String>, outcome: &KeelResult<Value>) -> Self {
        match outcome {
            Ok(result) => Self::Response {
                id: id.into(),
                error: None,
                result: result.clone(),
            },
            Err(err) => Self::Response {
                id: id.into(),
                error: Some(WireError::from(err)),
                result: Value::Null,
            },
        }
    }
}
