//! Framed message transport and event-loop server shared by the metadata
//! index and every peer-side listener (share server, RTT probe).
//!
//! See `net::message` for the wire codec, `net::channel` for the
//! length-prefixed transport, and `net::server` for the accept-loop
//! reactor used by both the index and the peer's share server.

pub mod channel;
pub mod error;
pub mod message;
pub mod server;

pub use channel::{Channel, StopFlag, DEFAULT_TIMEOUT};
pub use error::ChannelError;
pub use message::{FileRecord, Message, MessageType, SharingEntry};
pub use server::{ConnectionHandler, FinishedSignal, Server, ServerStopper};
