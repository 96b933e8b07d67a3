//! `kite serve`: a standalone kite without Kontrol.

use kite_node::config::load_config;
use kite_node::{Kite, KiteConfig, LocalHub};
use kite_types::error::KiteResult;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// What `Info` reports about the running kite.
#[derive(Debug, Serialize)]
struct KiteInfo {
    kitename: String,
    uuid: String,
    version: String,
    hostname: String,
    addr: String,
    methods: Vec<String>,
}

pub fn cmd_serve(config_path: Option<PathBuf>, port: Option<u16>) -> KiteResult<()> {
    let config = standalone_config(load_config(config_path.as_deref())?, port);
    let rt = super::runtime()?;
    rt.block_on(async {
        let kite = Arc::new(Kite::new(config, Arc::new(LocalHub::new().messenger()))?);
        add_builtin_methods(&kite);

        tokio::select! {
            result = Arc::clone(&kite).run() => result,
            _ = tokio::signal::ctrl_c() => {
                info!(kite = %kite.kitename(), "Interrupted, shutting down");
                Ok(())
            }
        }
    })
}

fn standalone_config(mut config: KiteConfig, port: Option<u16>) -> KiteConfig {
    config.kontrol_enabled = false;
    if let Some(port) = port {
        config.port = port.to_string();
    }
    config
}

fn add_builtin_methods(kite: &Arc<Kite>) {
    let weak = Arc::downgrade(kite);
    kite.add_function(
        kite.service()
            .method("Echo", |v: Value| async move { Ok::<_, String>(v) })
            .method("Info", move |_: Value| {
                let kite = weak.upgrade();
                async move {
                    let kite = kite.ok_or_else(|| "kite is shutting down".to_string())?;
                    Ok::<_, String>(KiteInfo {
                        kitename: kite.kitename().to_string(),
                        uuid: kite.uuid().to_string(),
                        version: kite.identity().version.clone(),
                        hostname: kite.identity().hostname.clone(),
                        addr: kite.addr(),
                        methods: kite.methods(),
                    })
                }
            }),
    );
}
