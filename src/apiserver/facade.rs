//! Facade dispatch.
//!
//! A [`Facade`] serves the requests of one named, versioned interface.
//! The [`Registry`] routes `(type, version)` to a facade; the facade routes
//! the request name to a method.

use super::conn::ConnWatchers;
use crate::core::error::{KeelError, KeelResult};
use crate::net::tcp::ConnectionId;
use crate::state::{Principal, State, Tag};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by facade calls.
pub type FacadeFuture<'a> = Pin<Box<dyn Future<Output = KeelResult<Value>> + Send + 'a>>;

/// Per-request context handed to facades.
pub struct CallContext {
    pub conn_id: ConnectionId,
    pub principal: Principal,
    pub state: State,
    pub watchers: Arc<ConnWatchers>,
}

impl CallContext {
    /// Users may touch any entity. Units may only touch themselves.
    pub fn can_access(&self, tag: &Tag) -> bool {
        match &self.principal.tag {
            Tag::User(_) => true,
            own @ Tag::Unit(_) => own == tag,
            _ => false,
        }
    }

    /// Fail with `PermissionDenied` unless [`can_access`](Self::can_access).
    pub fn check_access(&self, tag: &Tag) -> KeelResult<()> {
        if self.can_access(tag) {
            Ok(())
        } else {
            Err(KeelError::PermissionDenied)
        }
    }

    /// Fail with `PermissionDenied` unless the caller is a user.
    pub fn require_user(&self) -> KeelResult<()> {
        if self.principal.is_user() {
            Ok(())
        } else {
            Err(KeelError::PermissionDenied)
        }
    }
}

/// One versioned API interface.
pub trait Facade: Send + Sync {
    /// Name used in the request `type` field.
    fn name(&self) -> &'static str;

    fn version(&self) -> u32 {
        1
    }

    /// Serve one request.
    fn call<'a>(&'a self, ctx: &'a CallContext, request: &'a str, params: Value) -> FacadeFuture<'a>;
}

/// Error for a request name the facade does not serve.
pub fn no_such_request(facade: &str, request: &str) -> KeelError {
    KeelError::NotImplemented {
        message: format!(
            "no such request - method {}.{} is not implemented",
            facade, request
        ),
    }
}

/// Decode request parameters. Missing parameters decode from `{}`.
pub fn decode_params<T: DeserializeOwned>(params: Value) -> KeelResult<T> {
    let params = match params {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(params).map_err(|e| KeelError::invalid(format!("bad params: {}", e)))
}

/// Encode a facade result.
pub fn encode_result<T: serde::Serialize>(result: &T) -> KeelResult<Value> {
    serde_json::to_value(result).map_err(|e| KeelError::internal(format!("cannot encode result: {}", e)))
}

/// Routes requests to facades by name and version.
#[derive(Default, Clone)]
pub struct Registry {
    facades: HashMap<(String, u32), Arc<dyn Facade>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self
            .facades
            .keys()
            .map(|(name, version)| format!("{}({})", name, version))
            .collect();
        names.sort();
        f.debug_struct("Registry").field("facades", &names).finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a facade, replacing any with the same name and version.
    pub fn register(&mut self, facade: Arc<dyn Facade>) -> &mut Self {
        self.facades
            .insert((facade.name().to_string(), facade.version()), facade);
        self
    }

    pub fn resolve(&self, name: &str, version: u32) -> KeelResult<Arc<dyn Facade>> {
        if let Some(facade) = self.facades.get(&(name.to_string(), version)) {
            return Ok(facade.clone());
        }
        let known = self.facades.keys().any(|(n, _)| n == name);
        let message = if known {
            format!("unknown version ({}) of interface {:?}", version, name)
        } else {
            format!("unknown object type {:?}", name)
        };
        Err(KeelError::NotImplemented { message })
    }

    pub fn len(&self) -> usize {
        self.facades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facades.is_empty()
    }
}

/// Boxed future returned by [`Authenticator::authenticate`].
pub type AuthFuture<'a> = Pin<Box<dyn Future<Output = KeelResult<Principal>> + Send + 'a>>;

/// Checks login credentials.
pub trait Authenticator: Send + Sync {
    fn authenticate<'a>(&'a self, auth_tag: &'a str, password: &'a str) -> AuthFuture<'a>;
}

impl Authenticator for State {
    fn authenticate<'a>(&'a self, auth_tag: &'a str, password: &'a str) -> AuthFuture<'a> {
        Box::pin(async move { State::authenticate(self, auth_tag, password) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    struct Echo(u32);

    impl Facade for Echo {
        fn name(&self) -> &'static str {
            "Echo"
        }

        fn version(&self) -> u32 {
            self.0
        }

        fn call<'a>(&'a self, _ctx: &'a CallContext, request: &'a str, params: Value) -> FacadeFuture<'a> {
            Box::pin(async move {
                match request {
                    "Echo" => Ok(params),
                    other => Err(no_such_request(self.name(), other)),
                }
            })
        }
    }

    #[test]
    fn test_resolve() {
        let mut registry = Registry::new();
        registry.register(Arc::new(Echo(1))).register(Arc::new(Echo(2)));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.resolve("Echo", 2).unwrap().version(), 2);

        let err = registry.resolve("Echo", 3).err().unwrap();
        assert!(err.to_string().contains("unknown version (3)"));
        let err = registry.resolve("Missing", 1).err().unwrap();
        assert_eq!(err.to_string(), "unknown object type \"Missing\"");
    }

    #[test]
    fn test_decode_params() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Params {
            #[serde(default)]
            entities: Vec<String>,
        }
        let p: Params = decode_params(Value::Null).unwrap();
        assert!(p.entities.is_empty());
        let err = decode_params::<Params>(serde_json::json!({"entities": 3})).unwrap_err();
        assert!(matches!(err, KeelError::InvalidRequest { .. }));
    }
}
