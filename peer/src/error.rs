#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("no local record for the requested file id")]
    NotFound,
    #[error("download already exists for this file id and destination")]
    Duplicate,
    #[error("no reachable origin is sharing this file")]
    NoOrigins,
    #[error(transparent)]
    Channel(#[from] net::ChannelError),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
