pub mod call;
pub mod serve;

use kite_types::error::{KiteError, KiteResult};

pub(crate) fn runtime() -> KiteResult<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new()
        .map_err(|e| KiteError::Config(format!("failed to start async runtime: {e}")))
}
