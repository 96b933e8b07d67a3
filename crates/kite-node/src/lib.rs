//! Kite peer node.
//!
//! A [`Kite`] serves RPC methods and calls methods on other kites. Peers are
//! learned from Kontrol broadcasts delivered through a [`Messenger`]; calls
//! to a logical kite name are spread round-robin over every known instance.
//!
//! ## Architecture
//!
//! - **coordination**: reacts to Kontrol broadcasts, drives registration
//! - **router**: `call_sync` / `call`, peer resolution, discovery retries
//! - **PeerRegistry** / **Balancer**: shared peer state
//! - **PeerCache**: size-bounded cache told about peer addresses

pub mod balancer;
pub mod cache;
pub mod config;
pub mod coordination;
pub mod kite;
pub mod messenger;
pub mod registry;
pub mod router;

pub use balancer::Balancer;
pub use cache::PeerCache;
pub use kite::{Kite, KiteIdentity};
pub use messenger::{KontrolCall, LocalHub, LocalMessenger, Messenger};
pub use registry::{PeerRegistry, RemotePeer};

pub use kite_types::config::KiteConfig;
pub use kite_types::error::{KiteError, KiteResult};
pub use kite_wire::Service;
