//! `kite` binary.

mod cli;
mod cmd;

use clap::Parser;
use cli::{Cli, Commands};

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();

    let result = match cli.command {
        Commands::Serve { port } => cmd::serve::cmd_serve(cli.config, port),
        Commands::Call { addr, method, args } => cmd::call::cmd_call(&addr, &method, &args),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
