//! Kite wire layer: RPC between kites, generic RPC clients and browsers.
//!
//! Every kite runs one HTTP listener whose only job is to hand each socket
//! to an RPC codec:
//!
//! - `CONNECT /_kiteRPC_` switches to the compact binary codec used between kites
//! - `CONNECT /_kiteRPC_/debug` switches to newline-delimited JSON for ad-hoc clients
//! - `GET /_kite_/ws` upgrades to a websocket carrying one JSON call per frame
//!
//! ## Architecture
//!
//! - **RpcServer**: method table of typed handlers, codec-agnostic serve loop
//! - **RpcClient**: multiplexed client over a dialed connection
//! - **Listener** / [`dial`]: accept side and connect side of the handshake
//! - **ClientPool**: browsers currently connected to this kite

pub mod client;
pub mod clients;
pub mod codec;
pub mod error;
pub mod message;
pub mod server;
pub mod transport;

pub use client::RpcClient;
pub use clients::{ClientPool, RegisteredClient};
pub use codec::ServerCodec;
pub use error::WireError;
pub use message::{CallerInfo, Origin, RpcRequest, RpcResponse};
pub use server::{RpcServer, Service};
pub use transport::{dial, Listener};
