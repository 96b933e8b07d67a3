//! Command-line definitions.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "kite",
    version,
    about = "Kite: run a peer node or call a method on one"
)]
pub struct Cli {
    /// Path to the kite manifest (defaults to ./manifest.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a standalone kite exposing Echo and Info.
    Serve {
        /// Override the port from the manifest.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Dial a kite and call one method.
    Call {
        /// Kite RPC address, e.g. 127.0.0.1:4000.
        #[arg(long)]
        addr: String,
        /// Fully qualified method, e.g. devrim/echo.Echo.
        #[arg(long)]
        method: String,
        /// Arguments as JSON.
        #[arg(long, default_value = "null")]
        args: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_call() {
        let cli = Cli::try_parse_from([
            "kite",
            "call",
            "--addr",
            "127.0.0.1:4000",
            "--method",
            "devrim/echo.Echo",
            "--args",
            "[1,2]",
        ])
        .unwrap();
        match cli.command {
            Commands::Call { addr, method, args } => {
                assert_eq!(addr, "127.0.0.1:4000");
                assert_eq!(method, "devrim/echo.Echo");
                assert_eq!(args, "[1,2]");
            }
            _ => panic!("expected call"),
        }
    }

    #[test]
    fn test_parse_serve_with_global_config() {
        let cli = Cli::try_parse_from([
            "kite", "serve", "--port", "4000", "--config", "kite.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("kite.toml")));
        assert!(matches!(cli.command, Commands::Serve { port: Some(4000) }));
    }
}
