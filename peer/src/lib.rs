//! Library crate backing the `fileshare-peer` binary: the local share
//! catalog, the concurrent download engine, the share server, and the CLI
//! built on top of them.

pub mod catalog;
pub mod cli;
pub mod download;
pub mod error;
pub mod share_server;

pub use catalog::{ShareCatalog, SqliteShareCatalog};
pub use cli::Peer;
pub use error::PeerError;
