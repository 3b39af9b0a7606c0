//! A length-prefixed message transport over a reliable byte stream.
//!
//! Grounded on `original_source/framework/channel.py`: `send_message` +
//! `recv_message` + `wait_for_message` + `send_msg_and_wait_for_response`
//! there become `send`/`recv`/`wait_for`/`send_and_wait` here. The
//! source's `Event`-backed stop flag becomes a `tokio::sync::Notify`, and
//! the source's manual `select()`-before-`recv()` timeout loop becomes a
//! `tokio::select!` between the read and a `tokio::time::sleep`, matching
//! the framing idiom in `tcp-server/src/service.rs` (`read_message`/
//! `write_message`) generalized from protobuf to our own tag-based codec.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::error::ChannelError;
use crate::message::{Message, MessageType};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared stop flag: setting it interrupts the next suspension inside the
/// channel it belongs to and closes the underlying stream (spec §5).
#[derive(Clone, Default)]
pub struct StopFlag {
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        if self.is_set() {
            return;
        }
        self.notify.notified().await;
    }
}

pub struct Channel {
    stream: TcpStream,
    stop: StopFlag,
    closed: bool,
}

impl Channel {
    pub fn new(stream: TcpStream) -> Self {
        Self::with_stop_flag(stream, StopFlag::new())
    }

    pub fn with_stop_flag(stream: TcpStream, stop: StopFlag) -> Self {
        Self {
            stream,
            stop,
            closed: false,
        }
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    pub fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.stream.peer_addr()
    }

    /// Fails with `Closed` if the channel is closed; otherwise writes the
    /// full frame.
    pub async fn send(&mut self, msg: &Message) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        let frame = msg.encode();
        tokio::select! {
            res = self.stream.write_all(&frame) => {
                res?;
                Ok(())
            }
            _ = self.stop.wait() => {
                self.close().await;
                Err(ChannelError::Cancelled)
            }
        }
    }

    /// Reads exactly 4 bytes of length then exactly that many body bytes.
    pub async fn recv(&mut self, deadline: Duration) -> Result<Message, ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        if self.stop.is_set() {
            return Err(ChannelError::Cancelled);
        }

        let read = async {
            let mut len_buf = [0u8; 4];
            self.stream.read_exact(&mut len_buf).await?;
            let covered_len = u32::from_le_bytes(len_buf) as usize;
            let mut body = vec![0u8; covered_len];
            self.stream.read_exact(&mut body).await?;
            Ok::<_, io::Error>(body)
        };

        tokio::select! {
            biased;
            _ = self.stop.wait() => {
                self.close().await;
                Err(ChannelError::Cancelled)
            }
            body = read => {
                match body {
                    Ok(body) => Message::decode(&body).map_err(ChannelError::from),
                    Err(e) if is_peer_closed(&e) => {
                        self.closed = true;
                        Err(ChannelError::Closed)
                    }
                    Err(e) => Err(ChannelError::Io(e)),
                }
            }
            _ = tokio::time::sleep(deadline) => Err(ChannelError::Timeout),
        }
    }

    /// Repeatedly `recv`s, discarding messages of other types, until a
    /// message of `expected` arrives or `deadline` elapses.
    pub async fn wait_for(
        &mut self,
        expected: MessageType,
        deadline: Duration,
    ) -> Result<Message, ChannelError> {
        let start = tokio::time::Instant::now();
        loop {
            let remaining = deadline
                .checked_sub(start.elapsed())
                .ok_or(ChannelError::Timeout)?;
            let msg = self.recv(remaining).await?;
            if msg.message_type() == expected {
                return Ok(msg);
            }
            tracing::trace!(?expected, got = ?msg.message_type().0, "discarding unexpected message while waiting");
        }
    }

    /// `send` then `wait_for(req.expected_response())` with the default
    /// timeout.
    pub async fn send_and_wait(&mut self, req: Message) -> Result<Message, ChannelError> {
        let expected = req
            .expected_response()
            .expect("send_and_wait requires a request with a declared response type");
        self.send(&req).await?;
        self.wait_for(expected, DEFAULT_TIMEOUT).await
    }

    /// Idempotent: sets the stop flag, closes the stream, marks closed.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.stop.set();
        let _ = self.stream.shutdown().await;
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

fn is_peer_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn connected_pair() -> (Channel, Channel) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (Channel::new(client), Channel::new(server))
    }

    #[tokio::test]
    async fn send_then_recv_preserves_order() {
        let (mut a, mut b) = connected_pair().await;
        a.send(&Message::SearchFile("one".into())).await.unwrap();
        a.send(&Message::SearchFile("two".into())).await.unwrap();

        let first = b.recv(DEFAULT_TIMEOUT).await.unwrap();
        let second = b.recv(DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(first, Message::SearchFile("one".into()));
        assert_eq!(second, Message::SearchFile("two".into()));
    }

    #[tokio::test]
    async fn recv_times_out_when_nothing_arrives() {
        let (_a, mut b) = connected_pair().await;
        let result = b.recv(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ChannelError::Timeout)));
    }

    #[tokio::test]
    async fn wait_for_discards_other_types_then_times_out() {
        let (mut a, mut b) = connected_pair().await;
        a.send(&Message::SearchFile("x".into())).await.unwrap();

        let result = b
            .wait_for(MessageType::CLIENT_ID, Duration::from_millis(200))
            .await;
        assert!(matches!(result, Err(ChannelError::Timeout)));
    }

    #[tokio::test]
    async fn recv_returns_unchanged_message_of_the_right_type() {
        let (mut a, mut b) = connected_pair().await;
        a.send(&Message::SearchFile("x".into())).await.unwrap();
        let msg = b.recv(Duration::from_secs(1)).await.unwrap();
        assert_eq!(msg, Message::SearchFile("x".into()));
    }

    #[tokio::test]
    async fn closing_is_idempotent_and_observed_by_recv() {
        let (_a, mut b) = connected_pair().await;
        b.close().await;
        b.close().await;
        let result = b.recv(DEFAULT_TIMEOUT).await;
        assert!(matches!(result, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn stop_flag_cancels_a_pending_recv() {
        let (_a, mut b) = connected_pair().await;
        let stop = b.stop_flag();
        let handle = tokio::spawn(async move { b.recv(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.set();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ChannelError::Cancelled)));
    }

    #[tokio::test]
    async fn send_fails_on_a_closed_channel() {
        let (mut a, _b) = connected_pair().await;
        a.close().await;
        let result = a.send(&Message::GeneralSuccess("hi".into())).await;
        assert!(matches!(result, Err(ChannelError::Closed)));
    }
}
