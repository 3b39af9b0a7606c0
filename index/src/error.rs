#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("no record for the requested file id")]
    NotFound,
    #[error("share already present")]
    Duplicate,
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Lets session dispatch use `?` on store calls without a manual `map_err`
/// at every call site; a store failure becomes an I/O-flavored channel
/// error rather than a protocol one.
impl From<IndexError> for net::ChannelError {
    fn from(e: IndexError) -> Self {
        net::ChannelError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }
}
