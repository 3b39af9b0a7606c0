//! Library crate backing the `fileshare-index` binary: the sqlite-backed
//! metadata store and the per-connection session dispatch built on it.

pub mod error;
pub mod session;
pub mod store;
pub mod types;

pub use error::IndexError;
pub use session::IndexSession;
pub use store::{IndexStore, SqliteIndexStore};
pub use types::SharedFile;
