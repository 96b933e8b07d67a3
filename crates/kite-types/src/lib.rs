//! Core types shared by every Kite crate.
//!
//! - [`protocol`]: JSON messages exchanged with the Kontrol coordinator
//! - [`config`]: node options loaded from a TOML manifest
//! - [`error`]: the top-level [`KiteError`](error::KiteError)

pub mod config;
pub mod error;
pub mod protocol;
