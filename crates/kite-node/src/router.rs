//! Calling other kites by name.
//!
//! A call names a kite group (`owner/name`), not an instance. Resolution
//! picks an instance round-robin and dials it on first use. The synchronous
//! path fails fast when the group is empty; the asynchronous path keeps
//! asking Kontrol until an instance shows up, then races the call against
//! the call timeout.

use crate::kite::Kite;
use crate::registry::RemotePeer;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kite_types::error::{KiteError, KiteResult};
use kite_types::protocol::{KiteBase, KontrolRequest, RequestAction};
use kite_wire::{dial, CallerInfo, Origin, RpcClient, WireError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Groups with a discovery request in flight.
///
/// Set when a `getKites` request is sent. The call that sent it holds a
/// [`DiscoveryClaim`] until it stops resolving, whether it found a peer,
/// gave up, or was dropped.
#[derive(Debug, Default)]
pub struct DiscoveryGuard {
    in_flight: DashMap<String, ()>,
}

/// Exclusive right to ask Kontrol about one group. Released on drop.
#[must_use]
#[derive(Debug)]
pub struct DiscoveryClaim<'a> {
    guard: &'a DiscoveryGuard,
    group: String,
}

impl Drop for DiscoveryClaim<'_> {
    fn drop(&mut self) {
        self.guard.in_flight.remove(&self.group);
    }
}

impl DiscoveryGuard {
    /// Claim the right to ask for `group`. `None` if someone holds it.
    pub fn try_acquire(&self, group: &str) -> Option<DiscoveryClaim<'_>> {
        match self.in_flight.entry(group.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(DiscoveryClaim {
                    guard: self,
                    group: group.to_string(),
                })
            }
        }
    }

    pub fn is_pending(&self, group: &str) -> bool {
        self.in_flight.contains_key(group)
    }
}

impl Kite {
    /// Every known instance of `kite`, ordered by address.
    pub fn remote_kites(&self, kite: &str) -> Vec<RemotePeer> {
        self.registry.with_kitename(kite)
    }

    fn round_robin(&self, kite: &str) -> KiteResult<RemotePeer> {
        let mut candidates = self.remote_kites(kite);
        if candidates.is_empty() {
            return Err(KiteError::NoSuchKite(kite.to_string()));
        }
        let index = self.balancer.next_index(kite, candidates.len());
        Ok(candidates.swap_remove(index))
    }

    /// Pick the next instance of `kite` and make sure it has a connection.
    pub(crate) async fn get_remote_kite(&self, kite: &str) -> KiteResult<(RemotePeer, RpcClient)> {
        let mut peer = self.round_robin(kite)?;
        if let Some(client) = peer.live_connection() {
            return Ok((peer, client));
        }

        debug!(kite, addr = %peer.addr, "Dialing peer");
        let client = match dial(&peer.addr).await {
            Ok(client) => client,
            Err(e) => {
                if let Some(stale) = &peer.connection {
                    self.registry.clear_connection(&peer.addr, stale);
                }
                return Err(KiteError::Transport(format!(
                    "[{kite}] dial {} failed: {e}",
                    peer.addr
                )));
            }
        };
        let client = self.registry.attach_connection(&peer, client);
        peer.connection = Some(client.clone());
        Ok((peer, client))
    }

    /// Call `method` on one instance of `kite` and wait for the result.
    ///
    /// Fails immediately with [`KiteError::NoSuchKite`] when no instance is
    /// known; no discovery is attempted.
    pub async fn call_sync<A, R>(&self, kite: &str, method: &str, args: A) -> KiteResult<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(args)?;
        let (peer, client) = self.get_remote_kite(kite).await?;
        let result = self.invoke(kite, &peer, &client, method, params, None).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Call `method` on one instance of `kite` in the background.
    ///
    /// While no instance is known the task asks Kontrol for some once per
    /// discovery interval. The call itself is bounded by the call timeout.
    /// `callback` runs exactly once, with the result or the error.
    pub fn call<A, F>(
        self: &Arc<Self>,
        kite: &str,
        method: &str,
        args: A,
        callback: F,
    ) -> JoinHandle<()>
    where
        A: Serialize,
        F: FnOnce(KiteResult<Value>) + Send + 'static,
    {
        let node = Arc::clone(self);
        let kite = kite.to_string();
        let method = method.to_string();
        let params = serde_json::to_value(args);

        tokio::spawn(async move {
            let params = match params {
                Ok(params) => params,
                Err(e) => return callback(Err(e.into())),
            };
            let (peer, client) = match node.resolve_with_discovery(&kite).await {
                Ok(found) => found,
                Err(e) => return callback(Err(e)),
            };

            let caller = node.caller_info(&peer);
            let timeout = node.config.call_timeout();
            let call = node.invoke(&kite, &peer, &client, &method, params, Some(caller));
            let result = match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(%kite, %method, "Call timed out");
                    Err(KiteError::Timeout {
                        kite: kite.clone(),
                        method: method.clone(),
                        secs: timeout.as_secs(),
                    })
                }
            };
            callback(result);
        })
    }

    /// Resolve `kite`, requesting discovery on a miss unless another call
    /// already has a request in flight.
    async fn resolve_with_discovery(&self, kite: &str) -> KiteResult<(RemotePeer, RpcClient)> {
        let period = self.config.discovery_interval();
        let deadline = self.config.discovery_timeout().map(|t| Instant::now() + t);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Held until this function returns or its future is dropped
        let mut claim = None;
        loop {
            ticker.tick().await;
            match self.get_remote_kite(kite).await {
                Ok(found) => return Ok(found),
                Err(KiteError::NoSuchKite(_)) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(KiteError::NoSuchKite(kite.to_string()));
                    }
                    if claim.is_none() {
                        debug!(kite, "No instance known, requesting discovery");
                        claim = self.request_discovery(kite).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Ask Kontrol for instances of `kite`, unless a request is in flight.
    ///
    /// Returns the claim when the request went out; dropping it lets the
    /// next miss ask again.
    pub(crate) async fn request_discovery(&self, kite: &str) -> Option<DiscoveryClaim<'_>> {
        let claim = self.discovery.try_acquire(kite)?;
        let mut request = KontrolRequest::new(RequestAction::GetKites, self.base());
        request.remote_kite = kite.to_string();

        match self.send_to_kontrol(&request).await {
            Ok(body) => {
                self.apply_discovery_response(&body);
                Some(claim)
            }
            Err(e) => {
                warn!(kite, "getKites request failed: {}", e);
                None
            }
        }
    }

    /// Kontrol may answer `getKites` inline with a list of instances; any
    /// other body means they will arrive as `addKite` broadcasts.
    fn apply_discovery_response(&self, body: &[u8]) {
        if body.is_empty() {
            return;
        }
        match serde_json::from_slice::<Vec<KiteBase>>(body) {
            Ok(kites) if !kites.is_empty() => {
                info!(count = kites.len(), "Discovery returned peers");
                for base in &kites {
                    self.add_kite(base);
                }
            }
            Ok(_) => {}
            Err(e) => debug!("getKites answer is not a peer list: {}", e),
        }
    }

    /// Run `method` on a resolved peer.
    ///
    /// A transport failure drops the cached connection so the next call
    /// dials again.
    async fn invoke(
        &self,
        kite: &str,
        peer: &RemotePeer,
        client: &RpcClient,
        method: &str,
        params: Value,
        caller: Option<CallerInfo>,
    ) -> KiteResult<Value> {
        let rpc_method = format!("{kite}.{method}");
        match client.call(&rpc_method, params, caller).await {
            Ok(result) => Ok(result),
            Err(WireError::Remote(message)) => Err(KiteError::Call {
                kite: kite.to_string(),
                message,
            }),
            Err(e) => {
                if self.registry.clear_connection(&peer.addr, client) {
                    debug!(kite, addr = %peer.addr, "Dropped broken connection");
                }
                Err(KiteError::Transport(format!("[{kite}] {e}")))
            }
        }
    }

    fn caller_info(&self, peer: &RemotePeer) -> CallerInfo {
        CallerInfo {
            base: KiteBase {
                username: self.identity.username.clone(),
                kitename: self.identity.kitename.clone(),
                version: self.identity.version.clone(),
                uuid: self.identity.uuid.clone(),
                hostname: self.identity.hostname.clone(),
                token: peer.token.clone(),
                ..Default::default()
            },
            origin: Origin::Binary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    #[test]
    fn test_discovery_guard_single_claim() {
        let guard = DiscoveryGuard::default();
        let math = guard.try_acquire("devrim/math");
        assert!(math.is_some());
        assert!(guard.try_acquire("devrim/math").is_none());
        let _fs = guard.try_acquire("devrim/fs").unwrap();
        assert!(guard.is_pending("devrim/math"));

        drop(math);
        assert!(!guard.is_pending("devrim/math"));
        assert!(guard.is_pending("devrim/fs"));
        assert!(guard.try_acquire("devrim/math").is_some());
    }

    #[test]
    fn test_discovery_guard_concurrent_claims() {
        let guard = DiscoveryGuard::default();
        let barrier = Barrier::new(16);
        let winners: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    s.spawn(|| {
                        let claim = guard.try_acquire("devrim/math");
                        // Hold every claim until all threads have tried
                        barrier.wait();
                        claim.is_some() as usize
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(winners, 1);
        assert!(!guard.is_pending("devrim/math"));
    }

    #[tokio::test]
    async fn test_claim_released_when_holder_is_dropped() {
        let guard = Arc::new(DiscoveryGuard::default());
        let (held_tx, held_rx) = tokio::sync::oneshot::channel();
        let holder = {
            let guard = Arc::clone(&guard);
            tokio::spawn(async move {
                let _claim = guard.try_acquire("devrim/math");
                let _ = held_tx.send(());
                std::future::pending::<()>().await;
            })
        };
        held_rx.await.unwrap();
        assert!(guard.is_pending("devrim/math"));

        holder.abort();
        let _ = holder.await;
        assert!(!guard.is_pending("devrim/math"));
    }
}
