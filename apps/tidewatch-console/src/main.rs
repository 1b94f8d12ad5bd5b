mod cli;
mod session;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;

#[tokio::main]
async fn main() {
    // Console output goes to stdout; logs stay quiet unless RUST_LOG asks.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = session::run(cli).await {
        error!("console error: {err:#}");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
