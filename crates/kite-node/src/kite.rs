//! The kite node: identity, shared state and the main loop.

use crate::balancer::Balancer;
use crate::cache::PeerCache;
use crate::messenger::Messenger;
use crate::registry::PeerRegistry;
use crate::router::DiscoveryGuard;

use kite_types::config::KiteConfig;
use kite_types::error::{KiteError, KiteResult};
use kite_types::protocol::KiteBase;
use kite_wire::{ClientPool, Listener, RpcServer, Service};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Who this kite is, fixed at startup.
#[derive(Debug, Clone)]
pub struct KiteIdentity {
    pub username: String,
    /// Fully qualified `owner/name`.
    pub kitename: String,
    pub version: String,
    /// Random instance id, new on every start.
    pub uuid: String,
    pub hostname: String,
    pub public_key: String,
    /// Address the RPC listener binds to.
    pub local_ip: String,
    /// Address advertised to other kites.
    pub public_ip: String,
}

impl KiteIdentity {
    fn from_config(config: &KiteConfig) -> Self {
        let hostname = if config.hostname.is_empty() {
            system_hostname()
        } else {
            config.hostname.clone()
        };
        let public_ip = if config.public_ip.is_empty() {
            config.local_ip.clone()
        } else {
            config.public_ip.clone()
        };
        Self {
            username: config.username.clone(),
            kitename: config.full_name(),
            version: config.version.clone(),
            uuid: uuid::Uuid::new_v4().to_string(),
            hostname,
            public_key: config.public_key.clone(),
            local_ip: config.local_ip.clone(),
            public_ip,
        }
    }
}

/// Name of this machine, `localhost` when the lookup yields nothing usable.
fn system_hostname() -> String {
    let name = gethostname::gethostname().to_string_lossy().into_owned();
    if name.is_empty() {
        "localhost".to_string()
    } else {
        name
    }
}

/// A peer node of the mesh.
pub struct Kite {
    pub(crate) identity: KiteIdentity,
    pub(crate) config: KiteConfig,
    /// Advertised `ip:port`; the port is only final once the listener is bound.
    addr: RwLock<String>,
    pub(crate) registered: AtomicBool,
    pub(crate) messenger: Arc<dyn Messenger>,
    server: Arc<RpcServer>,
    clients: ClientPool,
    pub(crate) registry: PeerRegistry,
    pub(crate) balancer: Balancer,
    pub(crate) discovery: DiscoveryGuard,
    pub(crate) cache: PeerCache,
    listener: OnceCell<SocketAddr>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    /// Serializes registration attempts.
    pub(crate) registration: tokio::sync::Mutex<()>,
}

impl Kite {
    /// Build a kite from its options. Nothing is bound or sent yet.
    pub fn new(config: KiteConfig, messenger: Arc<dyn Messenger>) -> KiteResult<Self> {
        config.validate().map_err(KiteError::Config)?;

        let identity = KiteIdentity::from_config(&config);
        let addr = format!("{}:{}", identity.public_ip, config.bind_port());

        let server = Arc::new(RpcServer::new());
        for (alias, method) in &config.methods {
            let qualified = if method.contains('.') {
                method.clone()
            } else {
                format!("{}.{}", identity.kitename, method)
            };
            debug!(%alias, %qualified, "Method alias");
            server.add_alias(alias.clone(), qualified);
        }

        let cache = PeerCache::new(identity.kitename.clone(), config.cache_bytes);

        Ok(Self {
            identity,
            addr: RwLock::new(addr),
            registered: AtomicBool::new(false),
            messenger,
            server,
            clients: ClientPool::new(),
            registry: PeerRegistry::new(),
            balancer: Balancer::new(),
            discovery: DiscoveryGuard::default(),
            cache,
            listener: OnceCell::new(),
            accept_task: Mutex::new(None),
            registration: tokio::sync::Mutex::new(()),
            config,
        })
    }

    /// Expose the methods of `service`.
    pub fn add_function(&self, service: Service) {
        self.server.add_function(service);
    }

    /// An empty service namespaced under this kite's name, so its methods
    /// are reachable as `owner/name.Method`.
    pub fn service(&self) -> Service {
        Service::new(self.identity.kitename.clone())
    }

    pub fn identity(&self) -> &KiteIdentity {
        &self.identity
    }

    pub fn kitename(&self) -> &str {
        &self.identity.kitename
    }

    pub fn uuid(&self) -> &str {
        &self.identity.uuid
    }

    pub fn config(&self) -> &KiteConfig {
        &self.config
    }

    /// Advertised RPC address.
    pub fn addr(&self) -> String {
        self.addr.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Bound listener address, once serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.get().copied()
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn balancer(&self) -> &Balancer {
        &self.balancer
    }

    pub fn cache(&self) -> &PeerCache {
        &self.cache
    }

    /// Browsers connected over the websocket transport.
    pub fn clients(&self) -> &ClientPool {
        &self.clients
    }

    /// Callable method names.
    pub fn methods(&self) -> Vec<String> {
        self.server.methods()
    }

    /// Identity fields sent with every Kontrol request.
    pub(crate) fn base(&self) -> KiteBase {
        let addr = self.addr();
        let port = addr
            .rsplit_once(':')
            .map(|(_, port)| port.to_string())
            .unwrap_or_default();
        KiteBase {
            username: self.identity.username.clone(),
            kitename: self.identity.kitename.clone(),
            version: self.identity.version.clone(),
            uuid: self.identity.uuid.clone(),
            public_key: self.identity.public_key.clone(),
            hostname: self.identity.hostname.clone(),
            addr,
            local_ip: self.identity.local_ip.clone(),
            public_ip: self.identity.public_ip.clone(),
            port,
            token: String::new(),
        }
    }

    /// Bind the RPC listener. Idempotent: later calls return the address
    /// bound by the first one.
    pub async fn serve(&self) -> KiteResult<SocketAddr> {
        let bound = self
            .listener
            .get_or_try_init(|| async {
                let bind_addr = format!("{}:{}", self.identity.local_ip, self.config.bind_port());
                let (local, task) =
                    Listener::start(&bind_addr, Arc::clone(&self.server), self.clients.clone())
                        .await?;
                *self.addr.write().unwrap_or_else(|e| e.into_inner()) =
                    format!("{}:{}", self.identity.public_ip, local.port());
                *self.accept_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
                info!(kite = %self.identity.kitename, addr = %local, "Serving RPC");
                Ok::<_, KiteError>(local)
            })
            .await?;
        Ok(*bound)
    }

    /// Run the node until its broadcast stream ends.
    ///
    /// With Kontrol disabled the kite marks itself registered and serves
    /// until the listener stops. Otherwise every broadcast is handed to
    /// [`handle`](Self::handle); failures are logged and the loop goes on,
    /// except for errors that leave the node unable to serve.
    pub async fn run(self: Arc<Self>) -> KiteResult<()> {
        if !self.config.kontrol_enabled {
            info!(kite = %self.identity.kitename, "Kontrol disabled, running standalone");
            self.registered.store(true, Ordering::SeqCst);
            self.serve().await?;
            let task = self
                .accept_task
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Some(task) = task {
                let _ = task.await;
            }
            return Ok(());
        }

        let mut broadcasts = self.messenger.consume();
        info!(
            kite = %self.identity.kitename,
            uuid = %self.identity.uuid,
            "Waiting for Kontrol broadcasts"
        );
        while let Some(msg) = broadcasts.recv().await {
            if let Err(e) = self.handle(&msg).await {
                if e.is_fatal() {
                    error!(kite = %self.identity.kitename, "Stopping: {}", e);
                    return Err(e);
                }
                warn!(kite = %self.identity.kitename, "Broadcast handling failed: {}", e);
            }
        }
        info!(kite = %self.identity.kitename, "Broadcast stream closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger::LocalHub;

    fn make_kite(config: KiteConfig) -> KiteResult<Kite> {
        Kite::new(config, Arc::new(LocalHub::new().messenger()))
    }

    #[test]
    fn test_identity_defaults() {
        let kite = make_kite(KiteConfig::new("devrim", "fs")).unwrap();
        assert_eq!(kite.kitename(), "devrim/fs");
        assert_eq!(kite.identity().public_ip, "127.0.0.1");
        assert!(!kite.identity().hostname.is_empty());
        assert!(uuid::Uuid::parse_str(kite.uuid()).is_ok());
        assert!(!kite.is_registered());
        assert_eq!(kite.addr(), "127.0.0.1:0");
    }

    #[test]
    fn test_hostname_comes_from_the_system_unless_configured() {
        let kite = make_kite(KiteConfig::new("devrim", "fs")).unwrap();
        let system = gethostname::gethostname().to_string_lossy().into_owned();
        if !system.is_empty() {
            assert_eq!(kite.identity().hostname, system);
        }

        let mut config = KiteConfig::new("devrim", "fs");
        config.hostname = "kite-host-1".to_string();
        let kite = make_kite(config).unwrap();
        assert_eq!(kite.identity().hostname, "kite-host-1");
    }

    #[test]
    fn test_every_start_gets_a_new_uuid() {
        let a = make_kite(KiteConfig::new("devrim", "fs")).unwrap();
        let b = make_kite(KiteConfig::new("devrim", "fs")).unwrap();
        assert_ne!(a.uuid(), b.uuid());
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            make_kite(KiteConfig::new("", "fs")),
            Err(KiteError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_serve_binds_once_and_updates_addr() {
        let kite = make_kite(KiteConfig::new("devrim", "fs")).unwrap();
        let first = kite.serve().await.unwrap();
        let second = kite.serve().await.unwrap();
        assert_eq!(first, second);
        assert_ne!(first.port(), 0);
        assert_eq!(kite.addr(), format!("127.0.0.1:{}", first.port()));
        assert_eq!(kite.base().port, first.port().to_string());
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = KiteConfig::new("devrim", "fs");
        config.port = taken.local_addr().unwrap().port().to_string();
        let kite = make_kite(config).unwrap();
        let err = kite.serve().await.unwrap_err();
        assert!(err.is_fatal(), "{err:?}");
    }

    #[tokio::test]
    async fn test_aliases_resolve_to_local_methods() {
        let mut config = KiteConfig::new("devrim", "fs");
        config.kontrol_enabled = false;
        config
            .methods
            .insert("ls".to_string(), "ReadDirectory".to_string());
        let kite = Arc::new(make_kite(config).unwrap());
        kite.add_function(kite.service().method("ReadDirectory", |path: String| async move {
            Ok::<_, String>(vec![format!("{path}/a"), format!("{path}/b")])
        }));
        let addr = kite.serve().await.unwrap();

        let client = kite_wire::dial(&addr.to_string()).await.unwrap();
        let listing = client
            .call("ls", serde_json::json!("/tmp"), None)
            .await
            .unwrap();
        assert_eq!(listing, serde_json::json!(["/tmp/a", "/tmp/b"]));
        assert_eq!(kite.methods(), vec!["devrim/fs.ReadDirectory"]);
    }
}
