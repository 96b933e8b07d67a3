//! Registry of every remote kite this node knows about.
//!
//! Entries are keyed by network address and carry a lazily dialed RPC
//! connection. The registry is the only place a connection is stored, so
//! all mutations go through its methods.

use chrono::{DateTime, Utc};
use kite_types::protocol::KiteBase;
use kite_wire::RpcClient;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A remote kite instance.
#[derive(Debug, Clone)]
pub struct RemotePeer {
    /// Logical `owner/name`, shared by interchangeable instances.
    pub kitename: String,
    pub username: String,
    pub version: String,
    /// Unique instance id.
    pub uuid: String,
    pub hostname: String,
    /// RPC address in `ip:port` form.
    pub addr: String,
    /// Authorization token from Kontrol, forwarded on calls.
    pub token: String,
    /// When this node learned about the peer.
    pub discovered_at: DateTime<Utc>,
    /// Cached RPC connection, dialed on first use.
    pub connection: Option<RpcClient>,
}

impl RemotePeer {
    pub fn from_base(base: &KiteBase) -> Self {
        Self {
            kitename: base.kitename.clone(),
            username: base.username.clone(),
            version: base.version.clone(),
            uuid: base.uuid.clone(),
            hostname: base.hostname.clone(),
            addr: base.addr.clone(),
            token: base.token.clone(),
            discovered_at: Utc::now(),
            connection: None,
        }
    }

    /// The cached connection, unless it has already broken.
    pub fn live_connection(&self) -> Option<RpcClient> {
        self.connection
            .as_ref()
            .filter(|c| !c.is_closed())
            .cloned()
    }
}

/// Thread-safe registry of all known peers.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<String, RemotePeer>>>,
}

impl PeerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer, replacing whatever was known at its address.
    pub fn add(&self, peer: RemotePeer) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.insert(peer.addr.clone(), peer);
    }

    /// Snapshot of the peer at `addr`.
    pub fn get(&self, addr: &str) -> Option<RemotePeer> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(addr).cloned()
    }

    /// Remove the peer with instance id `uuid`.
    pub fn remove(&self, uuid: &str) -> Option<RemotePeer> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let addr = peers
            .values()
            .find(|p| p.uuid == uuid)
            .map(|p| p.addr.clone())?;
        peers.remove(&addr)
    }

    /// Copy of every known peer.
    pub fn list(&self) -> Vec<RemotePeer> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.values().cloned().collect()
    }

    pub fn size(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.len()
    }

    /// All instances of `kitename`, ordered by address.
    pub fn with_kitename(&self, kitename: &str) -> Vec<RemotePeer> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        let mut matching: Vec<RemotePeer> = peers
            .values()
            .filter(|p| p.kitename == kitename)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.addr.cmp(&b.addr));
        matching
    }

    /// Addresses of every known peer, sorted.
    pub fn addresses(&self) -> Vec<String> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        let mut addrs: Vec<String> = peers.keys().cloned().collect();
        addrs.sort();
        addrs
    }

    /// Cache a freshly dialed connection for `peer`.
    ///
    /// If another caller already cached a live connection in the meantime,
    /// that one wins and is returned; `client` is dropped. A peer that was
    /// removed while dialing is inserted again.
    pub fn attach_connection(&self, peer: &RemotePeer, client: RpcClient) -> RpcClient {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        match peers.get_mut(&peer.addr) {
            Some(entry) => {
                if let Some(existing) = entry.live_connection() {
                    return existing;
                }
                entry.connection = Some(client.clone());
            }
            None => {
                let mut entry = peer.clone();
                entry.connection = Some(client.clone());
                peers.insert(entry.addr.clone(), entry);
            }
        }
        client
    }

    /// Forget the connection cached for `addr`, if it is still `client`.
    pub fn clear_connection(&self, addr: &str, client: &RpcClient) -> bool {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        match peers.get_mut(addr) {
            Some(entry)
                if entry
                    .connection
                    .as_ref()
                    .is_some_and(|c| c.same_connection(client)) =>
            {
                entry.connection = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_peer(kitename: &str, uuid: &str, addr: &str) -> RemotePeer {
        RemotePeer::from_base(&KiteBase {
            username: "devrim".to_string(),
            kitename: kitename.to_string(),
            uuid: uuid.to_string(),
            addr: addr.to_string(),
            ..Default::default()
        })
    }

    fn idle_client(addr: &str) -> (RpcClient, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(1024);
        (RpcClient::new(addr, ours), theirs)
    }

    #[test]
    fn test_add_get_remove() {
        let registry = PeerRegistry::new();
        registry.add(make_peer("devrim/math", "u-1", "10.0.0.1:4000"));
        assert_eq!(registry.size(), 1);
        assert_eq!(registry.get("10.0.0.1:4000").unwrap().uuid, "u-1");

        assert!(registry.remove("unknown").is_none());
        let removed = registry.remove("u-1").unwrap();
        assert_eq!(removed.addr, "10.0.0.1:4000");
        assert_eq!(registry.size(), 0);
    }

    #[test]
    fn test_entries_unique_per_address() {
        let registry = PeerRegistry::new();
        registry.add(make_peer("devrim/math", "u-1", "10.0.0.1:4000"));
        registry.add(make_peer("devrim/math", "u-2", "10.0.0.1:4000"));
        assert_eq!(registry.size(), 1);
        assert_eq!(registry.get("10.0.0.1:4000").unwrap().uuid, "u-2");
    }

    #[test]
    fn test_with_kitename_filters_and_sorts() {
        let registry = PeerRegistry::new();
        registry.add(make_peer("devrim/math", "u-2", "10.0.0.2:4000"));
        registry.add(make_peer("devrim/fs", "u-3", "10.0.0.3:4000"));
        registry.add(make_peer("devrim/math", "u-1", "10.0.0.1:4000"));

        let math = registry.with_kitename("devrim/math");
        let addrs: Vec<&str> = math.iter().map(|p| p.addr.as_str()).collect();
        assert_eq!(addrs, vec!["10.0.0.1:4000", "10.0.0.2:4000"]);
        assert!(registry.with_kitename("devrim/none").is_empty());
        assert_eq!(registry.addresses().len(), 3);
    }

    #[test]
    fn test_list_is_a_snapshot() {
        let registry = PeerRegistry::new();
        registry.add(make_peer("devrim/math", "u-1", "10.0.0.1:4000"));
        let snapshot = registry.list();
        registry.remove("u-1");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.size(), 0);
    }

    #[test]
    fn test_concurrent_add_remove_net_set() {
        let registry = PeerRegistry::new();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let uuid = format!("u-{t}-{i}");
                        registry.add(make_peer("devrim/math", &uuid, &format!("10.{t}.0.{i}:1")));
                        // Odd peers leave again
                        if i % 2 == 1 {
                            registry.remove(&uuid);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let list = registry.list();
        assert_eq!(list.len(), 8 * 25);
        assert!(list.iter().all(|p| {
            let i: u32 = p.uuid.rsplit('-').next().unwrap().parse().unwrap();
            i % 2 == 0
        }));
    }

    #[tokio::test]
    async fn test_attach_keeps_existing_live_connection() {
        let registry = PeerRegistry::new();
        let peer = make_peer("devrim/math", "u-1", "10.0.0.1:4000");
        registry.add(peer.clone());

        let (first, _keep1) = idle_client(&peer.addr);
        let (second, _keep2) = idle_client(&peer.addr);
        let winner = registry.attach_connection(&peer, first.clone());
        assert!(winner.same_connection(&first));
        let winner = registry.attach_connection(&peer, second);
        assert!(winner.same_connection(&first));
    }

    #[tokio::test]
    async fn test_attach_reinserts_removed_peer() {
        let registry = PeerRegistry::new();
        let peer = make_peer("devrim/math", "u-1", "10.0.0.1:4000");
        let (client, _keep) = idle_client(&peer.addr);
        registry.attach_connection(&peer, client);
        assert!(registry.get(&peer.addr).unwrap().connection.is_some());
    }

    #[tokio::test]
    async fn test_clear_connection_only_clears_matching_client() {
        let registry = PeerRegistry::new();
        let peer = make_peer("devrim/math", "u-1", "10.0.0.1:4000");
        registry.add(peer.clone());
        let (cached, _keep1) = idle_client(&peer.addr);
        let (stale, _keep2) = idle_client(&peer.addr);
        registry.attach_connection(&peer, cached.clone());

        assert!(!registry.clear_connection(&peer.addr, &stale));
        assert!(registry.get(&peer.addr).unwrap().connection.is_some());
        assert!(registry.clear_connection(&peer.addr, &cached));
        assert!(registry.get(&peer.addr).unwrap().connection.is_none());
    }
}
