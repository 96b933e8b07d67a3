//! RPC client over a dialed binary connection.
//!
//! One reader task per connection demultiplexes responses by request id, so
//! any number of calls may be in flight on the same socket. When the
//! connection breaks every pending call fails with `ConnectionClosed` and
//! the client reports itself closed.

use crate::codec::{read_frame, write_frame};
use crate::error::WireError;
use crate::message::{CallerInfo, RpcRequest, RpcResponse};

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct ClientInner {
    addr: String,
    writer: tokio::sync::Mutex<BoxedWriter>,
    pending: Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    reader: Mutex<Option<AbortHandle>>,
}

impl ClientInner {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        // Dropping the senders fails every waiting call
        pending.clear();
    }

    fn forget(&self, id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }
}

/// Drops the pending entry of a call when the call ends, however it ends.
/// Covers callers that give up on the future, e.g. under a timeout.
struct PendingEntry<'a> {
    inner: &'a ClientInner,
    id: u64,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.inner.forget(self.id);
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let reader = self.reader.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = reader.take() {
            handle.abort();
        }
    }
}

/// Handle to an open RPC connection. Cheap to clone; all clones share the socket.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("addr", &self.inner.addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RpcClient {
    /// Wrap an already handshaked stream.
    pub fn new<S>(addr: impl Into<String>, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let inner = Arc::new(ClientInner {
            addr: addr.into(),
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            reader: Mutex::new(None),
        });

        let task = tokio::spawn(Self::read_loop(reader, Arc::downgrade(&inner)));
        *inner.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(task.abort_handle());

        Self { inner }
    }

    async fn read_loop<R>(mut reader: R, inner: Weak<ClientInner>)
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let result = read_frame::<_, RpcResponse>(&mut reader).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            match result {
                Ok(resp) => {
                    let waiter = inner
                        .pending
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&resp.id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(resp);
                        }
                        // Late answer to an abandoned call
                        None => debug!(
                            addr = %inner.addr,
                            id = resp.id,
                            "Discarding unmatched response"
                        ),
                    }
                }
                Err(e) => {
                    match e {
                        WireError::ConnectionClosed => {
                            debug!(addr = %inner.addr, "RPC connection closed by peer")
                        }
                        other => warn!(addr = %inner.addr, "RPC connection failed: {}", other),
                    }
                    inner.close();
                    return;
                }
            }
        }
    }

    /// Address this client is connected to.
    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Whether both handles share the same underlying connection.
    pub fn same_connection(&self, other: &RpcClient) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Invoke `method` and wait for its result.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        caller: Option<CallerInfo>,
    ) -> Result<Value, WireError> {
        if self.is_closed() {
            return Err(WireError::ConnectionClosed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        let _entry = PendingEntry {
            inner: &self.inner,
            id,
        };
        // close() may have drained the table right before our insert
        if self.is_closed() {
            return Err(WireError::ConnectionClosed);
        }

        let req = RpcRequest {
            id,
            method: method.to_string(),
            params,
            caller,
        };
        let written = {
            let mut writer = self.inner.writer.lock().await;
            write_frame(&mut *writer, &req).await
        };
        if let Err(e) = written {
            self.inner.close();
            return Err(e);
        }

        match rx.await {
            Ok(RpcResponse {
                error: Some(message),
                ..
            }) => Err(WireError::Remote(message)),
            Ok(resp) => Ok(resp.result),
            Err(_) => Err(WireError::ConnectionClosed),
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ServerCodec;
    use crate::server::{RpcServer, Service};
    use serde_json::json;
    use std::time::Duration;

    fn echo_server() -> Arc<RpcServer> {
        let server = RpcServer::new();
        server.add_function(
            Service::new("ns")
                .method("Echo", |v: Value| async move { Ok::<_, String>(v) })
                .method("Slow", |ms: u64| async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok::<_, String>(ms)
                })
                .method("Fail", |_: Value| async move { Err::<Value, _>("nope".to_string()) }),
        );
        Arc::new(server)
    }

    fn connected_pair() -> RpcClient {
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let server = echo_server();
        tokio::spawn(async move {
            let _ = server
                .serve_codec(ServerCodec::binary(server_side), "duplex")
                .await;
        });
        RpcClient::new("duplex", client_side)
    }

    #[tokio::test]
    async fn test_call_roundtrip_and_remote_error() {
        let client = connected_pair();
        let v = client.call("ns.Echo", json!({"x": 1}), None).await.unwrap();
        assert_eq!(v, json!({"x": 1}));

        match client.call("ns.Fail", Value::Null, None).await {
            Err(WireError::Remote(msg)) => assert_eq!(msg, "nope"),
            other => panic!("expected remote error, got {other:?}"),
        }
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_matched_by_id() {
        let client = connected_pair();
        let slow = {
            let c = client.clone();
            tokio::spawn(async move { c.call("ns.Slow", json!(150), None).await })
        };
        let fast = client.call("ns.Slow", json!(1), None).await.unwrap();
        assert_eq!(fast, json!(1));
        assert_eq!(slow.await.unwrap().unwrap(), json!(150));
    }

    #[tokio::test]
    async fn test_broken_connection_fails_pending_calls() {
        let (client_side, server_side) = tokio::io::duplex(1024);
        let client = RpcClient::new("duplex", client_side);
        let pending = {
            let c = client.clone();
            tokio::spawn(async move { c.call("ns.Echo", json!(1), None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(server_side);

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(WireError::ConnectionClosed)));
        assert!(client.is_closed());
        assert!(matches!(
            client.call("ns.Echo", json!(2), None).await,
            Err(WireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_abandoned_calls_leave_no_pending_entries() {
        let client = connected_pair();
        for _ in 0..100 {
            let call = client.call("ns.Slow", json!(10_000), None);
            let result = tokio::time::timeout(Duration::from_millis(5), call).await;
            assert!(result.is_err());
        }
        assert_eq!(client.pending_len(), 0);

        // The connection is still usable afterwards
        let v = client.call("ns.Echo", json!("still here"), None).await.unwrap();
        assert_eq!(v, json!("still here"));
        assert_eq!(client.pending_len(), 0);
    }
}
