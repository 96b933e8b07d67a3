//! RPC server: an explicit method table and a codec-agnostic serve loop.
//!
//! Methods are grouped in a [`Service`] under a namespace and addressed as
//! `namespace.Method`. Handlers are typed closures: arguments are decoded
//! from the request params and the result is encoded back, so the same
//! handler serves binary, JSON and websocket callers.

use crate::codec::ServerCodec;
use crate::error::WireError;
use crate::message::{RpcRequest, RpcResponse};

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Type-erased method handler.
pub type Handler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// A namespace of methods, registered with [`RpcServer::add_function`].
pub struct Service {
    namespace: String,
    methods: HashMap<String, Handler>,
}

impl Service {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            methods: HashMap::new(),
        }
    }

    /// Add a typed method.
    pub fn method<A, R, F, Fut>(mut self, name: &str, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: Handler = Arc::new(move |params: Value| {
            let f = Arc::clone(&f);
            Box::pin(async move {
                let args: A = serde_json::from_value(params)
                    .map_err(|e| format!("rpc: invalid arguments: {e}"))?;
                let result = (*f)(args).await?;
                serde_json::to_value(result).map_err(|e| format!("rpc: invalid result: {e}"))
            })
        });
        self.methods.insert(name.to_string(), handler);
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

/// Method table plus alias map, shared by every connection.
#[derive(Default)]
pub struct RpcServer {
    handlers: DashMap<String, Handler>,
    aliases: DashMap<String, String>,
}

impl RpcServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every method of `service` as `namespace.Method`.
    pub fn add_function(&self, service: Service) {
        for (name, handler) in service.methods {
            let qualified = format!("{}.{}", service.namespace, name);
            debug!(method = %qualified, "Registered RPC method");
            self.handlers.insert(qualified, handler);
        }
    }

    /// Expose `qualified` under another name.
    pub fn add_alias(&self, alias: impl Into<String>, qualified: impl Into<String>) {
        self.aliases.insert(alias.into(), qualified.into());
    }

    /// All callable method names, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn resolve(&self, method: &str) -> Option<Handler> {
        if let Some(handler) = self.handlers.get(method) {
            return Some(Arc::clone(handler.value()));
        }
        let qualified = self.aliases.get(method)?.value().clone();
        self.handlers.get(&qualified).map(|h| Arc::clone(h.value()))
    }

    /// Run one request through the method table.
    pub async fn dispatch(&self, req: RpcRequest) -> RpcResponse {
        if let Some(caller) = &req.caller {
            debug!(
                method = %req.method,
                caller = %caller.base.kitename,
                origin = ?caller.origin,
                "RPC call"
            );
        }
        let Some(handler) = self.resolve(&req.method) else {
            return RpcResponse::err(req.id, format!("rpc: can't find method {}", req.method));
        };
        match handler(req.params).await {
            Ok(result) => RpcResponse::ok(req.id, result),
            Err(e) => RpcResponse::err(req.id, e),
        }
    }

    /// Serve a connection until the peer goes away or sends garbage.
    ///
    /// Requests are handled concurrently; responses are written in
    /// completion order and matched by id on the client.
    pub async fn serve_codec(
        self: Arc<Self>,
        codec: ServerCodec,
        peer: &str,
    ) -> Result<(), WireError> {
        let (origin, mut reader, mut writer) = codec.into_parts();
        debug!(peer, ?origin, "Serving RPC connection");

        let (tx, mut rx) = mpsc::channel::<RpcResponse>(64);
        let write_task = tokio::spawn(async move {
            while let Some(resp) = rx.recv().await {
                if let Err(e) = writer.write_response(&resp).await {
                    debug!("RPC response write failed: {}", e);
                    break;
                }
            }
        });

        let result = loop {
            match reader.read_request().await {
                Ok(Some(req)) => {
                    let server = Arc::clone(&self);
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let resp = server.dispatch(req).await;
                        let _ = tx.send(resp).await;
                    });
                }
                Ok(None) => break Ok(()),
                Err(e) => {
                    warn!(peer, "Dropping RPC connection: {}", e);
                    break Err(e);
                }
            }
        };

        drop(tx);
        if result.is_err() {
            write_task.abort();
        } else {
            let _ = write_task.await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct AddArgs {
        a: i64,
        b: i64,
    }

    fn math() -> Service {
        Service::new("devrim/math")
            .method("Square", |n: i64| async move { Ok::<_, String>(n * n) })
            .method("Add", |args: AddArgs| async move {
                Ok::<_, String>(args.a + args.b)
            })
            .method("Fail", |_: Value| async move { Err::<Value, _>("boom".to_string()) })
    }

    fn request(method: &str, params: Value) -> RpcRequest {
        RpcRequest {
            id: 1,
            method: method.to_string(),
            params,
            caller: None,
        }
    }

    #[tokio::test]
    async fn test_dispatch_typed_method() {
        let server = RpcServer::new();
        server.add_function(math());

        let resp = server.dispatch(request("devrim/math.Square", json!(4))).await;
        assert_eq!(resp.result, json!(16));
        assert!(resp.error.is_none());

        let resp = server
            .dispatch(request("devrim/math.Add", json!({"a": 2, "b": 3})))
            .await;
        assert_eq!(resp.result, json!(5));
    }

    #[tokio::test]
    async fn test_dispatch_errors() {
        let server = RpcServer::new();
        server.add_function(math());

        let resp = server.dispatch(request("devrim/math.Cube", json!(2))).await;
        assert!(resp.error.unwrap().contains("can't find method"));

        let resp = server
            .dispatch(request("devrim/math.Square", json!("four")))
            .await;
        assert!(resp.error.unwrap().contains("invalid arguments"));

        let resp = server.dispatch(request("devrim/math.Fail", Value::Null)).await;
        assert_eq!(resp.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_alias_resolution() {
        let server = RpcServer::new();
        server.add_function(math());
        server.add_alias("square", "devrim/math.Square");

        let resp = server.dispatch(request("square", json!(3))).await;
        assert_eq!(resp.result, json!(9));
        assert_eq!(
            server.methods(),
            vec!["devrim/math.Add", "devrim/math.Fail", "devrim/math.Square"]
        );
    }
}
