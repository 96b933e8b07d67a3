//! Browsers connected to this kite over the websocket transport.
//!
//! Independent from the peer registry: this pool tracks who is connected
//! *to* us, not who we call.

use crate::error::WireError;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use axum::extract::ws::Message;

/// An inbound websocket connection.
#[derive(Debug, Clone)]
pub struct RegisteredClient {
    pub addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    outbound: mpsc::UnboundedSender<Message>,
}

impl RegisteredClient {
    pub fn new(addr: SocketAddr, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            addr,
            connected_at: Utc::now(),
            outbound,
        }
    }

    /// Push a text frame to the browser outside of any request.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), WireError> {
        let text: String = text.into();
        self.outbound
            .send(Message::Text(text.into()))
            .map_err(|_| WireError::ConnectionClosed)
    }
}

/// Thread-safe pool of connected browsers, keyed by remote address.
#[derive(Debug, Clone, Default)]
pub struct ClientPool {
    clients: Arc<DashMap<SocketAddr, RegisteredClient>>,
}

impl ClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, client: RegisteredClient) {
        self.clients.insert(client.addr, client);
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<RegisteredClient> {
        self.clients.get(addr).map(|c| c.value().clone())
    }

    pub fn remove(&self, addr: &SocketAddr) -> Option<RegisteredClient> {
        self.clients.remove(addr).map(|(_, c)| c)
    }

    pub fn size(&self) -> usize {
        self.clients.len()
    }

    /// Snapshot of all connected clients.
    pub fn list(&self) -> Vec<RegisteredClient> {
        self.clients.iter().map(|c| c.value().clone()).collect()
    }
}
