//! Peer Share Server (spec.md §4.6): each accepted connection answers
//! exactly one `StartFileTransfer` or `RTTCheck` then closes.
//!
//! Grounded on
//! `original_source/p2p_fileshare/client/file_share.py`'s
//! `transfer_file_chunk_to_client`, generalized from a per-connection
//! thread to a `net::ConnectionHandler` worker.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use net::server::{ConnectionHandler, FinishedSignal, HandlerFuture};
use net::{Channel, Message};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::TcpStream;

use crate::catalog::ShareCatalog;
use crate::download::CHUNK_SIZE;

/// How long a peer may take to send its single request before the worker
/// gives up and closes; this is not a download-engine timeout, just a
/// guard against a connection that never speaks.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ShareServer<C: ShareCatalog> {
    catalog: Arc<C>,
}

impl<C: ShareCatalog> ShareServer<C> {
    pub fn new(catalog: Arc<C>) -> Self {
        Self { catalog }
    }
}

impl<C: ShareCatalog + 'static> ConnectionHandler for ShareServer<C> {
    fn on_accept(
        self: Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        finished: FinishedSignal,
    ) -> HandlerFuture {
        Box::pin(async move {
            let mut channel = Channel::new(stream);
            match channel.recv(REQUEST_TIMEOUT).await {
                Ok(Message::RTTCheck { send_epoch }) => {
                    let recv_epoch = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_secs() as u32)
                        .unwrap_or(0);
                    let _ = channel
                        .send(&Message::RTTResponse { send_epoch, recv_epoch })
                        .await;
                }
                Ok(Message::StartFileTransfer { file_id, chunk_index }) => {
                    if let Err(e) = self.serve_chunk(&mut channel, &file_id, chunk_index).await {
                        tracing::warn!(%peer_addr, %file_id, error = %e, "failed to serve a chunk");
                    }
                }
                Ok(other) => {
                    tracing::debug!(%peer_addr, msg_type = ?other.message_type().0, "unexpected request on share server");
                }
                Err(e) => {
                    tracing::debug!(%peer_addr, error = %e, "share server connection closed before a request arrived");
                }
            }
            channel.close().await;
            finished.signal();
        })
    }
}

impl<C: ShareCatalog> ShareServer<C> {
    async fn serve_chunk(
        &self,
        channel: &mut Channel,
        file_id: &str,
        chunk_index: u32,
    ) -> Result<(), std::io::Error> {
        let path = match self.catalog.path_for(file_id) {
            Ok(Some(path)) => path,
            Ok(None) => {
                tracing::warn!(%file_id, "a peer requested a file we do not share");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(%file_id, error = %e, "local share catalog lookup failed");
                return Ok(());
            }
        };

        let mut file = tokio::fs::File::open(&path).await?;
        let offset = chunk_index as u64 * CHUNK_SIZE;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; CHUNK_SIZE as usize];
        let read = file.read(&mut buf).await?;
        buf.truncate(read);

        let _ = channel
            .send(&Message::ChunkDataResponse {
                file_id: file_id.to_string(),
                chunk_index,
                data: buf,
            })
            .await;
        Ok(())
    }
}
