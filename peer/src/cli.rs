//! The interactive command loop (spec.md §6).
//!
//! Grounded on
//! `original_source/p2p_fileshare/client/files_manager.py`'s `FilesManager`
//! for the command surface (`search_file`, `share_file`, `download_file`,
//! `list_downloads`, `remove_download`, `list_shares`, `remove_share`) and
//! on `tcp-server/src/client.rs` for the CLI-binary idiom this module is
//! driven from.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use md5::{Digest, Md5};
use net::{Channel, Message, MessageType, Server};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;

use crate::catalog::{self, ShareCatalog, SqliteShareCatalog};
use crate::download::{self, DownloadHandle, DownloadState};
use crate::error::PeerError;
use crate::share_server::ShareServer;

pub struct Peer {
    index_addr: SocketAddr,
    username: String,
    client_id: String,
    index_channel: Channel,
    catalog: Arc<SqliteShareCatalog>,
    share_stopper: Option<net::ServerStopper>,
    downloads: Vec<DownloadHandle>,
}

impl Peer {
    pub async fn connect(index_addr: SocketAddr, username: String) -> std::io::Result<Self> {
        let stored = catalog::load_or_create_client_id(&username)?;
        let stream = TcpStream::connect(index_addr).await?;
        let mut channel = Channel::new(stream);
        channel
            .send(&Message::ClientId(stored.clone()))
            .await
            .map_err(to_io_error)?;
        let reply = channel
            .wait_for(MessageType::CLIENT_ID, net::DEFAULT_TIMEOUT)
            .await
            .map_err(to_io_error)?;
        let client_id = match reply {
            Message::ClientId(id) => id,
            _ => stored.clone(),
        };
        if client_id != stored {
            catalog::persist_client_id(&username, &client_id)?;
        }
        tracing::info!(%client_id, "bound to the index");

        let catalog = Arc::new(SqliteShareCatalog::open(format!("{username}_shares.db")).map_err(to_io_error)?);

        let mut peer = Self {
            index_addr,
            username,
            client_id,
            index_channel: channel,
            catalog,
            share_stopper: None,
            downloads: Vec::new(),
        };

        if peer.catalog.any_shared().map_err(to_io_error)? {
            peer.ensure_share_server_running().await?;
        }

        Ok(peer)
    }

    async fn ensure_share_server_running(&mut self) -> std::io::Result<()> {
        if self.share_stopper.is_some() {
            return Ok(());
        }
        let handler = ShareServer::new(self.catalog.clone());
        let server = Server::bind("0.0.0.0:0", handler).await?;
        let port = server.local_addr()?.port();
        self.share_stopper = Some(server.stopper());
        tokio::spawn(server.run());
        self.index_channel
            .send(&Message::SharePort { port })
            .await
            .map_err(to_io_error)?;
        tracing::info!(port, "local share server listening");
        Ok(())
    }

    /// Runs the command loop until `exit`. Each line's errors are caught
    /// here and printed; the loop always continues (spec.md §7).
    pub async fn run_command_loop(&mut self, web_port: Option<u16>) {
        if let Some(port) = web_port {
            tracing::info!(port, "web_port argument accepted but the web gateway is out of scope");
        }

        let stdin = tokio::io::stdin();
        let mut lines = BufReader::new(stdin).lines();

        loop {
            print!("> ");
            let _ = std::io::Write::flush(&mut std::io::stdout());
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    println!("error reading command: {e}");
                    continue;
                }
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line == "exit" {
                break;
            }
            if let Err(e) = self.dispatch(line).await {
                println!("error: {e}");
            }
        }
    }

    async fn dispatch(&mut self, line: &str) -> Result<(), PeerError> {
        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or_default();
        match command {
            "search" => {
                let substr = parts.next().unwrap_or_default();
                self.search(substr).await
            }
            "download" => {
                let file_id = parts.next().unwrap_or_default().to_string();
                let local_path = parts.next().unwrap_or_default().to_string();
                self.download(&file_id, PathBuf::from(local_path)).await
            }
            "share" => {
                let local_path = parts.next().unwrap_or_default().to_string();
                self.share(PathBuf::from(local_path)).await
            }
            "list-downloads" => {
                self.list_downloads();
                Ok(())
            }
            "remove-download" => {
                let index: usize = parts.next().unwrap_or_default().parse().unwrap_or(usize::MAX);
                self.remove_download(index).await
            }
            "list-shares" => self.list_shares(),
            "remove-share" => {
                let file_id = parts.next().unwrap_or_default().to_string();
                self.remove_share(&file_id).await
            }
            other => {
                println!("unknown command: {other}");
                Ok(())
            }
        }
    }

    async fn search(&mut self, substring: &str) -> Result<(), PeerError> {
        let reply = self
            .index_channel
            .send_and_wait(Message::SearchFile(substring.to_string()))
            .await?;
        let Message::FileList(files) = reply else {
            return Ok(());
        };
        for file in files {
            println!(
                "Name: {}, modification time: {}, size: {}, unique_id: {}",
                file.name, file.modification_time, file.size, file.file_id
            );
        }
        Ok(())
    }

    async fn download(&mut self, file_id: &str, local_path: PathBuf) -> Result<(), PeerError> {
        if self
            .downloads
            .iter()
            .any(|d| d.file_id == file_id && d.local_path == local_path)
        {
            println!("already downloading this file to this location");
            return Ok(());
        }

        self.index_channel
            .send(&Message::SharingInfoRequest {
                file_id: file_id.to_string(),
            })
            .await?;
        let reply = self.index_channel.recv(net::DEFAULT_TIMEOUT).await?;
        let (size, entries) = match reply {
            Message::SharingInfoResponse { size, entries, .. } => (size, entries),
            Message::GeneralError(reason) => {
                println!("download failed: {reason}");
                return Ok(());
            }
            _ => return Err(PeerError::NotFound),
        };

        let origins: Vec<_> = entries.iter().filter_map(download::origin_key_from_entry).collect();
        if origins.is_empty() {
            return Err(PeerError::NoOrigins);
        }

        let handle = download::spawn(
            file_id.to_string(),
            local_path,
            size as u64,
            origins,
            self.index_addr,
            self.client_id.clone(),
        );
        self.downloads.push(handle);
        println!("download started");
        Ok(())
    }

    async fn share(&mut self, local_path: PathBuf) -> Result<(), PeerError> {
        let metadata = tokio::fs::metadata(&local_path).await?;
        let file_id = hash_file(&local_path).await?;
        let modification_time = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| local_path.to_string_lossy().to_string());

        self.catalog.add(&file_id, &local_path)?;
        self.ensure_share_server_running().await?;

        self.index_channel
            .send(&Message::ShareFile(net::FileRecord {
                name,
                modification_time,
                size: metadata.len() as u32,
                file_id,
            }))
            .await?;
        let reply = self.index_channel.recv(net::DEFAULT_TIMEOUT).await?;
        match reply {
            Message::GeneralSuccess(_) => println!("now sharing {}", local_path.display()),
            Message::GeneralError(reason) => println!("could not share: {reason}"),
            _ => {}
        }
        Ok(())
    }

    fn list_downloads(&self) {
        for (index, download) in self.downloads.iter().enumerate() {
            let status = match download.state() {
                DownloadState::InProgress => "in-progress",
                DownloadState::Done => "done",
                DownloadState::Failed => "failed",
            };
            println!("[{index}] {} -> {} ({status})", download.file_id, download.local_path.display());
        }
    }

    async fn remove_download(&mut self, index: usize) -> Result<(), PeerError> {
        if index >= self.downloads.len() {
            println!("unknown downloader");
            return Ok(());
        }
        let handle = self.downloads.remove(index);
        handle.cancel().await;
        Ok(())
    }

    fn list_shares(&self) -> Result<(), PeerError> {
        for (file_id, path) in self.catalog.list()? {
            println!("{file_id} -> {}", path.display());
        }
        Ok(())
    }

    async fn remove_share(&mut self, file_id: &str) -> Result<(), PeerError> {
        self.index_channel
            .send(&Message::RemoveShare {
                file_id: file_id.to_string(),
            })
            .await?;
        let reply = self.index_channel.recv(net::DEFAULT_TIMEOUT).await?;
        match reply {
            Message::GeneralSuccess(_) => {
                let _ = self.catalog.remove(file_id);
                println!("share removed");
            }
            Message::GeneralError(reason) => println!("could not remove share: {reason}"),
            _ => {}
        }
        Ok(())
    }
}

fn to_io_error(e: net::ChannelError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}

/// Whole-file MD5, read in 1 MiB slices (spec.md §3, matching
/// `files_manager.py`'s `_calculate_file_hash`).
async fn hash_file(path: &std::path::Path) -> std::io::Result<String> {
    use tokio::io::AsyncReadExt;
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
