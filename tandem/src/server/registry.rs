//! Typed command routing.
//!
//! Handlers are registered once at startup against a [`Method`]. Each handler
//! declares its request and response types; the registry decodes the payload
//! before the handler runs, so a malformed request never reaches handler code.

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;

use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::server::pool::Connection;
use crate::server::protocol::Method;
use crate::{Error, Result};

type ErasedHandler = Box<dyn Fn(Connection, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Method name to handler table.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<Method, ErasedHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `method`. A second registration is an error.
    pub fn register<Req, Resp, F, Fut>(&mut self, method: Method, handler: F) -> Result<()>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Connection, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        if self.handlers.contains_key(&method) {
            return Err(Error::DuplicateHandler(method.to_string()));
        }

        let erased: ErasedHandler = Box::new(move |conn, payload| {
            // Decoding happens before the handler future exists.
            let decoded = decode::<Req>(method, payload);
            let fut = decoded.map(|req| handler(conn, req));
            Box::pin(async move {
                let response = fut?.await?;
                Ok(serde_json::to_value(response)?)
            })
        });
        self.handlers.insert(method, erased);
        Ok(())
    }

    pub fn is_registered(&self, method: Method) -> bool {
        self.handlers.contains_key(&method)
    }

    pub fn methods(&self) -> Vec<Method> {
        self.handlers.keys().copied().collect()
    }

    /// Route one request. The result belongs to the requesting connection only.
    pub async fn dispatch(&self, name: &str, payload: Value, conn: Connection) -> Result<(Method, Value)> {
        let method =
            Method::from_str(name).map_err(|_| Error::UnknownCommand(name.to_string()))?;
        let handler = self
            .handlers
            .get(&method)
            .ok_or_else(|| Error::UnknownCommand(name.to_string()))?;
        let value = handler(conn, payload).await?;
        Ok((method, value))
    }
}

fn decode<Req: DeserializeOwned>(method: Method, payload: Value) -> Result<Req> {
    // Absent payloads decode like an empty object.
    let payload = if payload.is_null() {
        Value::Object(Default::default())
    } else {
        payload
    };
    serde_json::from_value(payload).map_err(|source| Error::Decode {
        method: method.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Deserialize)]
    struct Echo {
        text: String,
    }

    fn echo_registry(calls: Arc<AtomicUsize>) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry
            .register(Method::List, move |_conn, req: Echo| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(req.text.to_uppercase())
                }
            })
            .unwrap();
        registry
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = echo_registry(Arc::default());
        let err = registry
            .register(Method::List, |_conn, _req: Value| async { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateHandler(ref m) if m == "list"));
    }

    #[tokio::test]
    async fn test_dispatch_routes_typed_payload() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = echo_registry(Arc::clone(&calls));
        let (conn, _rx) = Connection::channel(4);

        let (method, value) = registry
            .dispatch("list", serde_json::json!({"text": "hi"}), conn)
            .await
            .unwrap();
        assert_eq!(method, Method::List);
        assert_eq!(value, "HI");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_and_undecodable_requests_skip_handlers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = echo_registry(Arc::clone(&calls));
        let (conn, _rx) = Connection::channel(4);

        let unknown = registry
            .dispatch("explode", Value::Null, conn.clone())
            .await
            .unwrap_err();
        assert_eq!(unknown.code(), "UNKNOWN_COMMAND");

        let unregistered = registry
            .dispatch("download", Value::Null, conn.clone())
            .await
            .unwrap_err();
        assert_eq!(unregistered.code(), "UNKNOWN_COMMAND");

        let malformed = registry
            .dispatch("list", serde_json::json!({"text": 5}), conn)
            .await
            .unwrap_err();
        assert_eq!(malformed.code(), "DECODE_ERROR");

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
