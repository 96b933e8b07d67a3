//! Node options, usually read from a `manifest.toml`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default per-attempt timeout of an asynchronous call.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 10;

/// Default pause between two discovery attempts.
pub const DEFAULT_DISCOVERY_INTERVAL_SECS: u64 = 1;

/// Default size bound of the peer cache (64 MiB).
pub const DEFAULT_CACHE_BYTES: usize = 64 << 20;

/// Options a kite is started with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KiteConfig {
    /// User that runs the kite. Together with `kitename` forms `owner/name`.
    pub username: String,
    /// Short service name, without the owner prefix.
    pub kitename: String,
    pub version: String,
    /// RPC port; empty or `0` binds an automatic port.
    pub port: String,
    pub local_ip: String,
    /// Publicly reachable IP; defaults to `local_ip`.
    pub public_ip: String,
    /// Hostname reported to Kontrol; defaults to `$HOSTNAME` or `localhost`.
    pub hostname: String,
    /// Public key reported to Kontrol on registration.
    pub public_key: String,
    /// When disabled the kite serves immediately and never talks to Kontrol.
    pub kontrol_enabled: bool,
    /// Exposed method aliases: alias -> local method name.
    pub methods: HashMap<String, String>,
    pub call_timeout_secs: u64,
    pub discovery_interval_secs: u64,
    /// Give up discovery after this long. Unset means retry forever.
    pub discovery_timeout_secs: Option<u64>,
    pub cache_bytes: usize,
}

impl Default for KiteConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            kitename: String::new(),
            version: "0.0.1".to_string(),
            port: String::new(),
            local_ip: "127.0.0.1".to_string(),
            public_ip: String::new(),
            hostname: String::new(),
            public_key: String::new(),
            kontrol_enabled: true,
            methods: HashMap::new(),
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
            discovery_interval_secs: DEFAULT_DISCOVERY_INTERVAL_SECS,
            discovery_timeout_secs: None,
            cache_bytes: DEFAULT_CACHE_BYTES,
        }
    }
}

impl KiteConfig {
    /// Minimal config for a kite named `username/kitename`.
    pub fn new(username: impl Into<String>, kitename: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            kitename: kitename.into(),
            ..Default::default()
        }
    }

    /// Check the fields every kite needs.
    pub fn validate(&self) -> Result<(), String> {
        if self.username.is_empty() || self.kitename.is_empty() {
            return Err(
                "options data is not set properly: username and kitename are required".into(),
            );
        }
        if self.kitename.contains('/') {
            return Err(format!(
                "kitename '{}' must not contain '/', the owner prefix is added from username",
                self.kitename
            ));
        }
        if self.discovery_interval_secs == 0 {
            return Err("discovery_interval_secs must be at least 1".into());
        }
        Ok(())
    }

    /// Fully qualified `owner/name`.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.username, self.kitename)
    }

    /// Port to bind, `0` when unset.
    pub fn bind_port(&self) -> &str {
        if self.port.is_empty() {
            "0"
        } else {
            &self.port
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn discovery_timeout(&self) -> Option<Duration> {
        self.discovery_timeout_secs.map(Duration::from_secs)
    }
}
