//! Reacting to Kontrol: heartbeats, registration and peer membership.
//!
//! Every broadcast is answered with a pong first. `updateKite` only marks
//! the node unregistered; any later broadcast registers it again before the
//! broadcast itself is applied.

use crate::kite::Kite;
use crate::registry::RemotePeer;

use kite_types::error::{KiteError, KiteResult};
use kite_types::protocol::{
    Broadcast, BroadcastAction, KiteBase, KontrolRequest, RegisterResponse, RegisterResult,
    RequestAction, UPDATE_RESPONSE,
};
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

impl Kite {
    /// Process one broadcast payload from Kontrol.
    pub async fn handle(&self, msg: &[u8]) -> KiteResult<()> {
        let broadcast: Broadcast = match serde_json::from_slice(msg) {
            Ok(b) => b,
            Err(e) => {
                warn!("Ignoring undecodable broadcast: {}", e);
                return Ok(());
            }
        };

        self.pong().await;

        match broadcast.action {
            BroadcastAction::UpdateKite => {
                info!(kite = %self.identity.kitename, "Kontrol asked for re-registration");
                self.registered.store(false, Ordering::SeqCst);
                return Ok(());
            }
            BroadcastAction::Unknown => {
                debug!("Ignoring broadcast with unknown action");
                return Ok(());
            }
            _ => {}
        }

        self.initialize_kite().await?;

        match broadcast.action {
            BroadcastAction::AddKite => self.add_kite(&broadcast.base),
            BroadcastAction::RemoveKite => self.remove_kite(&broadcast.base.uuid),
            _ => {}
        }
        Ok(())
    }

    /// Heartbeat. An `UPDATE` answer means Kontrol lost track of us.
    pub async fn pong(&self) {
        let request = KontrolRequest::new(RequestAction::Pong, self.base());
        let body = match self.send_to_kontrol(&request).await {
            Ok(body) => body,
            Err(e) => {
                warn!("Pong failed: {}", e);
                return;
            }
        };
        if body == UPDATE_RESPONSE.as_bytes() {
            info!(kite = %self.identity.kitename, "Kontrol answered pong with UPDATE");
            self.registered.store(false, Ordering::SeqCst);
        }
    }

    /// Make sure the node is serving and registered. A no-op when already
    /// registered; concurrent callers wait for a single attempt.
    pub async fn initialize_kite(&self) -> KiteResult<()> {
        let _guard = self.registration.lock().await;
        if self.is_registered() {
            return Ok(());
        }

        debug!(kite = %self.identity.kitename, "Not registered, initializing");
        // Bind first so Kontrol learns the real port
        self.serve().await?;
        self.register_to_kontrol().await?;
        self.registered.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Ask Kontrol for permission to run.
    pub async fn register_to_kontrol(&self) -> KiteResult<()> {
        let request = KontrolRequest::new(RequestAction::Register, self.base());
        let body = self.send_to_kontrol(&request).await?;
        let response: RegisterResponse = serde_json::from_slice(&body)
            .map_err(|e| KiteError::Protocol(format!("invalid register response: {e}")))?;

        match response.result {
            RegisterResult::Allow => {
                info!(
                    kite = %self.identity.kitename,
                    addr = %self.addr(),
                    version = %self.identity.version,
                    uuid = %self.identity.uuid,
                    "Registered to Kontrol"
                );
                Ok(())
            }
            RegisterResult::Deny => Err(KiteError::RegistrationDenied),
            RegisterResult::Unknown => Err(KiteError::Protocol(
                "got a nonstandard register response".into(),
            )),
        }
    }

    pub(crate) fn add_kite(&self, base: &KiteBase) {
        if !self.is_registered() {
            return;
        }
        if base.addr.is_empty() {
            warn!(kite = %base.kitename, uuid = %base.uuid, "Ignoring peer without address");
            return;
        }
        self.registry.add(RemotePeer::from_base(base));
        self.cache.set_peers(self.registry.addresses());
        info!(kite = %base.kitename, addr = %base.addr, uuid = %base.uuid, "Peer added");
    }

    pub(crate) fn remove_kite(&self, uuid: &str) {
        match self.registry.remove(uuid) {
            Some(peer) => {
                self.cache.set_peers(self.registry.addresses());
                info!(kite = %peer.kitename, addr = %peer.addr, %uuid, "Peer removed");
            }
            None => debug!(%uuid, "Remove for unknown peer"),
        }
    }

    pub(crate) async fn send_to_kontrol(&self, request: &KontrolRequest) -> KiteResult<Vec<u8>> {
        let payload = serde_json::to_vec(request)?;
        self.messenger.send(payload).await
    }
}
