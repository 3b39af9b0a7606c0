//! Peer CLI entry point (spec.md §6).
//!
//! Grounded on `tcp-server/src/client.rs` for the `clap::Parser` +
//! `tracing_subscriber` startup idiom, generalized from that binary's fixed
//! request/response exchange to this one's long-lived command loop.

use clap::Parser;
use tokio::net::lookup_host;
use tracing_subscriber::EnvFilter;

use peer::Peer;

#[derive(Parser, Debug)]
#[command(author, version, about = "Peer-to-peer file sharing client")]
struct Args {
    /// Hostname or address of the index server.
    index_host: String,

    /// Port the index server listens on.
    index_port: u16,

    /// Identity used to namespace the local share catalog and client-id file.
    #[arg(default_value = "anonymous")]
    username: String,

    /// Reserved for a future web gateway; accepted but unused.
    web_port: Option<u16>,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let index_addr = lookup_host((args.index_host.as_str(), args.index_port))
        .await?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "could not resolve index address"))?;

    tracing::info!(%index_addr, username = %args.username, "connecting to the index");

    let mut peer = Peer::connect(index_addr, args.username).await?;
    peer.run_command_loop(args.web_port).await;

    Ok(())
}
