//! Link to Kontrol.
//!
//! A [`Messenger`] does two things: a request/response round trip with
//! Kontrol, and a stream of broadcast payloads. The node never depends on
//! how those travel. [`LocalHub`] is an in-process implementation where the
//! Kontrol side is driven directly, used for single-host meshes and tests.

use async_trait::async_trait;
use kite_types::error::{KiteError, KiteResult};
use kite_types::protocol::{Broadcast, KontrolRequest};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Transport between a kite and Kontrol.
#[async_trait]
pub trait Messenger: Send + Sync + 'static {
    /// Send a serialized request and wait for Kontrol's reply body.
    async fn send(&self, payload: Vec<u8>) -> KiteResult<Vec<u8>>;

    /// Subscribe to broadcasts. Each call opens an independent subscription.
    fn consume(&self) -> mpsc::UnboundedReceiver<Vec<u8>>;
}

/// One request waiting for Kontrol's answer.
#[derive(Debug)]
pub struct KontrolCall {
    pub payload: Vec<u8>,
    reply: oneshot::Sender<Vec<u8>>,
}

impl KontrolCall {
    /// Decode the payload as a Kontrol request.
    pub fn request(&self) -> KiteResult<KontrolRequest> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Answer the request. Dropping the call unanswered fails the sender.
    pub fn reply(self, body: impl Into<Vec<u8>>) {
        let _ = self.reply.send(body.into());
    }
}

struct HubInner {
    calls_tx: mpsc::UnboundedSender<KontrolCall>,
    calls_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<KontrolCall>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>,
}

/// In-process Kontrol endpoint.
#[derive(Clone)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalHub {
    pub fn new() -> Self {
        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(HubInner {
                calls_tx,
                calls_rx: tokio::sync::Mutex::new(calls_rx),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A messenger for one kite attached to this hub.
    pub fn messenger(&self) -> LocalMessenger {
        LocalMessenger { hub: self.clone() }
    }

    /// Next request sent by any attached kite.
    pub async fn next_call(&self) -> Option<KontrolCall> {
        self.inner.calls_rx.lock().await.recv().await
    }

    /// Deliver `payload` to every live subscriber. Returns how many got it.
    pub fn broadcast(&self, payload: &[u8]) -> usize {
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| tx.send(payload.to_vec()).is_ok());
        subscribers.len()
    }

    /// Serialize and deliver a broadcast.
    pub fn publish(&self, broadcast: &Broadcast) -> KiteResult<usize> {
        let payload = serde_json::to_vec(broadcast)?;
        debug!(action = ?broadcast.action, kite = %broadcast.base.kitename, "Publishing broadcast");
        Ok(self.broadcast(&payload))
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

/// [`Messenger`] backed by a [`LocalHub`].
#[derive(Clone)]
pub struct LocalMessenger {
    hub: LocalHub,
}

#[async_trait]
impl Messenger for LocalMessenger {
    async fn send(&self, payload: Vec<u8>) -> KiteResult<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.hub
            .inner
            .calls_tx
            .send(KontrolCall { payload, reply })
            .map_err(|_| KiteError::Messenger("kontrol hub is gone".into()))?;
        rx.await
            .map_err(|_| KiteError::Messenger("kontrol dropped the request".into()))
    }

    fn consume(&self) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }
}
