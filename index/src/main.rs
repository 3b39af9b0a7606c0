use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueHint};
use tracing_subscriber::EnvFilter;

use index::{IndexSession, SqliteIndexStore};

#[derive(Parser, Debug)]
#[command(version, about = "Metadata index server for the file-sharing network")]
struct Args {
    /// Port to listen on
    #[arg(default_value_t = 1337)]
    port: u16,

    /// Sqlite file backing the index (created if missing)
    #[arg(short = 'd', long = "db", value_hint = ValueHint::FilePath, default_value = "index.db")]
    db_path: PathBuf,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    tracing::debug!(?args, "parsed arguments");

    let store = Arc::new(
        SqliteIndexStore::open(&args.db_path)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?,
    );
    let handler = IndexSession::new(store);

    let server = net::Server::bind(("0.0.0.0", args.port), handler).await?;
    tracing::info!(addr = ?server.local_addr()?, "index listening");
    server.run().await;

    Ok(())
}
