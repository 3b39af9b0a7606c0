//! Per-client dispatch: binds a `ConnectionHandler` (from `net::server`)
//! to the store and implements the message-level protocol of spec §4.4.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use md5::{Digest, Md5};
use net::server::{ConnectionHandler, FinishedSignal, HandlerFuture};
use net::{Channel, Message, MessageType};
use tokio::net::TcpStream;

use crate::store::IndexStore;
use crate::types::SharedFile;

/// A channel never waits this long for a command before looping back to
/// check for cancellation; in practice a client simply sits idle between
/// commands and this just re-issues the read.
const IDLE_POLL: Duration = Duration::from_secs(300);

pub struct IndexSession<S: IndexStore> {
    store: Arc<S>,
}

impl<S: IndexStore> IndexSession<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S: IndexStore + 'static> ConnectionHandler for IndexSession<S> {
    fn on_accept(
        self: Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        finished: FinishedSignal,
    ) -> HandlerFuture {
        Box::pin(async move {
            let mut channel = Channel::new(stream);
            let mut bound_client_id: Option<String> = None;

            loop {
                match channel.recv(IDLE_POLL).await {
                    Ok(msg) => {
                        if let Err(e) = self
                            .dispatch(&mut channel, msg, peer_addr, &mut bound_client_id)
                            .await
                        {
                            tracing::warn!(%peer_addr, error = %e, "failed to reply to client");
                        }
                    }
                    Err(net::ChannelError::Timeout) => continue,
                    Err(net::ChannelError::Closed) | Err(net::ChannelError::Cancelled) => break,
                    Err(net::ChannelError::Malformed(reason)) => {
                        tracing::warn!(%peer_addr, %reason, "closing channel after malformed message");
                        channel.close().await;
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(%peer_addr, error = %e, "channel error, closing");
                        channel.close().await;
                        break;
                    }
                }
            }

            if let Some(client_id) = bound_client_id {
                self.store.disconnect(&client_id);
            }
            channel.close().await;
            finished.signal();
        })
    }
}

impl<S: IndexStore> IndexSession<S> {
    async fn dispatch(
        &self,
        channel: &mut Channel,
        msg: Message,
        peer_addr: SocketAddr,
        bound_client_id: &mut Option<String>,
    ) -> Result<(), net::ChannelError> {
        // A channel without a bound id must reject every request except
        // `ClientId` itself: no reply, record and continue (spec §4.4).
        if bound_client_id.is_none() && msg.message_type() != MessageType::CLIENT_ID {
            tracing::debug!(%peer_addr, "rejecting request from an unidentified client");
            return Ok(());
        }

        match msg {
            Message::ClientId(id) => {
                let assigned = if id == net::message::NO_CLIENT_ID {
                    mint_client_id()
                } else {
                    id
                };
                self.store.add_client(&assigned)?;
                *bound_client_id = Some(assigned.clone());
                if let std::net::SocketAddr::V4(v4) = peer_addr {
                    self.store.mark_connected(&assigned, *v4.ip());
                }
                channel.send(&Message::ClientId(assigned)).await?;
            }
            Message::SharePort { port } => {
                if let Some(client_id) = bound_client_id {
                    self.store.set_port(client_id, port);
                }
            }
            Message::ShareFile(record) => {
                let client_id = bound_client_id.as_ref().unwrap();
                let file = SharedFile {
                    file_id: record.file_id,
                    name: record.name,
                    modification_time: record.modification_time,
                    size: record.size,
                };
                let reply = match self.store.add_share(&file, client_id) {
                    Ok(()) => Message::GeneralSuccess("share added".to_string()),
                    Err(_) => Message::GeneralError("share already exists".to_string()),
                };
                channel.send(&reply).await?;
            }
            Message::RemoveShare { file_id } => {
                let client_id = bound_client_id.as_ref().unwrap();
                let reply = match self.store.remove_share(&file_id, client_id) {
                    Ok(()) => Message::GeneralSuccess("share removed".to_string()),
                    Err(_) => Message::GeneralError("no such share".to_string()),
                };
                channel.send(&reply).await?;
            }
            Message::SearchFile(substr) => {
                let candidates = self.store.search_by_name(&substr)?;
                let mut matches = Vec::new();
                for file in candidates {
                    if self.has_reachable_sharer(&file.file_id)? {
                        matches.push(net::FileRecord {
                            name: file.name,
                            modification_time: file.modification_time,
                            size: file.size,
                            file_id: file.file_id,
                        });
                    }
                }
                channel.send(&Message::FileList(matches)).await?;
            }
            Message::SharingInfoRequest { file_id } => {
                let reply = match self.store.get_file(&file_id)? {
                    None => Message::GeneralError("no such file".to_string()),
                    Some(file) => {
                        let entries = self.reachable_sharers(&file_id)?;
                        Message::SharingInfoResponse {
                            file_id: file.file_id,
                            name: file.name,
                            modification_time: file.modification_time,
                            size: file.size,
                            entries,
                        }
                    }
                };
                channel.send(&reply).await?;
            }
            other => {
                tracing::debug!(%peer_addr, msg_type = ?other.message_type().0, "ignoring unexpected message");
            }
        }
        Ok(())
    }

    fn has_reachable_sharer(&self, file_id: &str) -> Result<bool, crate::error::IndexError> {
        for client_id in self.store.find_sharing_clients(file_id)? {
            if let Some((_, Some(_))) = self.store.connected_info(&client_id) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn reachable_sharers(
        &self,
        file_id: &str,
    ) -> Result<Vec<net::SharingEntry>, crate::error::IndexError> {
        let mut entries = Vec::new();
        for client_id in self.store.find_sharing_clients(file_id)? {
            if let Some((ip, Some(port))) = self.store.connected_info(&client_id) {
                entries.push(net::SharingEntry {
                    client_id,
                    ip: ip.octets(),
                    port: Some(port),
                });
            }
        }
        Ok(entries)
    }
}

/// MD5 of the current wall-clock time, per spec §4.4 ("strong uniqueness
/// is not required, collision probability is the operator's concern").
fn mint_client_id() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let mut hasher = Md5::new();
    hasher.update(now.as_nanos().to_le_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteIndexStore;

    fn sample_record() -> net::FileRecord {
        net::FileRecord {
            name: "great_movie.mkv".to_string(),
            modification_time: 1_700_000_000,
            size: 123_456,
            file_id: "a".repeat(net::message::UNIQUE_ID_LEN),
        }
    }

    /// Binds a fresh `IndexSession` on an ephemeral port and returns a
    /// stopper alongside its address, driving `ConnectionHandler::on_accept`
    /// through the real event loop (same harness shape as
    /// `net::server`'s own `EchoOnce` tests).
    async fn spawn_session() -> (net::ServerStopper, SocketAddr) {
        let store = Arc::new(SqliteIndexStore::open_in_memory().unwrap());
        let handler = IndexSession::new(store);
        let server = net::Server::bind("127.0.0.1:0", handler).await.unwrap();
        let addr = server.local_addr().unwrap();
        let stopper = server.stopper();
        tokio::spawn(server.run());
        (stopper, addr)
    }

    async fn bound_client(addr: SocketAddr) -> Channel {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut channel = Channel::new(stream);
        channel
            .send(&Message::ClientId(net::message::NO_CLIENT_ID.to_string()))
            .await
            .unwrap();
        channel
            .wait_for(MessageType::CLIENT_ID, net::DEFAULT_TIMEOUT)
            .await
            .unwrap();
        channel
    }

    async fn send_recv(channel: &mut Channel, msg: Message) -> Message {
        channel.send(&msg).await.unwrap();
        channel.recv(Duration::from_secs(1)).await.unwrap()
    }

    #[tokio::test]
    async fn requests_before_a_bound_client_id_are_silently_ignored() {
        let (_stopper, addr) = spawn_session().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut channel = Channel::new(stream);

        channel
            .send(&Message::SearchFile("anything".to_string()))
            .await
            .unwrap();
        let result = channel.recv(Duration::from_millis(200)).await;
        assert!(matches!(result, Err(net::ChannelError::Timeout)));

        channel
            .send(&Message::ClientId(net::message::NO_CLIENT_ID.to_string()))
            .await
            .unwrap();
        let reply = channel.recv(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(reply, Message::ClientId(_)));
    }

    #[tokio::test]
    async fn sharing_the_same_file_twice_reports_a_duplicate() {
        let (_stopper, addr) = spawn_session().await;
        let mut channel = bound_client(addr).await;
        let file = sample_record();

        let first = send_recv(&mut channel, Message::ShareFile(file.clone())).await;
        assert!(matches!(first, Message::GeneralSuccess(_)));

        let second = send_recv(&mut channel, Message::ShareFile(file)).await;
        assert!(matches!(second, Message::GeneralError(_)));
    }

    #[tokio::test]
    async fn removing_an_unknown_share_reports_an_error() {
        let (_stopper, addr) = spawn_session().await;
        let mut channel = bound_client(addr).await;

        let reply = send_recv(
            &mut channel,
            Message::RemoveShare {
                file_id: "b".repeat(net::message::UNIQUE_ID_LEN),
            },
        )
        .await;
        assert!(matches!(reply, Message::GeneralError(_)));
    }

    #[tokio::test]
    async fn search_only_returns_files_with_a_reachable_sharer() {
        let (_stopper, addr) = spawn_session().await;
        let mut channel = bound_client(addr).await;
        let file = sample_record();
        send_recv(&mut channel, Message::ShareFile(file)).await;

        let before = channel
            .send_and_wait(Message::SearchFile("movie".to_string()))
            .await
            .unwrap();
        match before {
            Message::FileList(files) => assert!(files.is_empty(), "sharer has no advertised port yet"),
            other => panic!("expected a file list, got {other:?}"),
        }

        channel.send(&Message::SharePort { port: 9000 }).await.unwrap();

        let after = channel
            .send_and_wait(Message::SearchFile("movie".to_string()))
            .await
            .unwrap();
        match after {
            Message::FileList(files) => assert_eq!(files.len(), 1),
            other => panic!("expected a file list, got {other:?}"),
        }
    }
}
