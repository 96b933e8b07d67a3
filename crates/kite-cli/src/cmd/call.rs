//! `kite call`: one request against a running kite.

use kite_types::error::{KiteError, KiteResult};
use serde_json::Value;
use tracing::debug;

pub fn cmd_call(addr: &str, method: &str, args: &str) -> KiteResult<()> {
    let params = parse_args(args)?;
    let rt = super::runtime()?;
    let result = rt.block_on(async {
        let client = kite_wire::dial(addr).await?;
        debug!(addr, method, "Calling");
        let value = client.call(method, params, None).await?;
        Ok::<_, KiteError>(value)
    })?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn parse_args(args: &str) -> KiteResult<Value> {
    serde_json::from_str(args)
        .map_err(|e| KiteError::Config(format!("--args is not valid JSON: {e}")))
}
