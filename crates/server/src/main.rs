use blockwright_server::{load_config, ServerOptions};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "blockwright-server", about = "Local build execution server")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:39333")]
    addr: SocketAddr,

    /// Checkpoint database. Defaults to ~/.blockwright/blockwright.db.
    #[arg(long)]
    db: Option<PathBuf>,

    /// YAML build config.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run without bulk commands; every block is placed individually.
    #[arg(long)]
    no_bulk: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let db_path = args.db.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".blockwright")
            .join("blockwright.db")
    });
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => Default::default(),
    };

    let options = ServerOptions {
        db_path,
        config,
        bulk: !args.no_bulk,
    };
    blockwright_server::serve(args.addr, options).await
}
