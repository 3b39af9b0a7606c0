//! The control loop driving a single file's download (spec.md §4.5).
//!
//! Grounded on `original_source/p2p_fileshare/client/file_transfer.py`'s
//! `FileDownloader`/`ChunkDownloader` pair: the reap-then-schedule shape of
//! `__start`'s loop carries over directly, generalized from raw threads to
//! tokio tasks and from ad-hoc bookkeeping to `OriginStats`/`FileSlab`. The
//! source's redundant double origin-selection call is deliberately not
//! reproduced (spec.md §9 Open Questions).

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use net::{Channel, Message, StopFlag};

use crate::download::slab::FileSlab;
use crate::download::stats::{OriginKey, OriginStats};

pub const MAX_CHUNK_DOWNLOADERS: usize = 2;
pub const MAX_ORIGIN_DOWNLOADER: u32 = 2;
pub const MAX_ORIGIN_FAILS: u32 = 5;
pub const MIN_ORIGINS_FOR_UPDATE: usize = 10;
pub const CHUNK_TIMEOUT: Duration = Duration::from_secs(5);
pub const RTT_TIMEOUT: Duration = Duration::from_secs(2);
pub const RTT_TOLERANCE: Duration = Duration::from_millis(500);
const SCHEDULER_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    InProgress,
    Done,
    Failed,
}

/// What the CLI holds onto for `list-downloads` / `remove-download`.
pub struct DownloadHandle {
    pub file_id: String,
    pub local_path: PathBuf,
    state: Arc<Mutex<DownloadState>>,
    stop: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadHandle {
    pub fn state(&self) -> DownloadState {
        *self.state.lock().unwrap()
    }

    /// Signals the engine to stop and waits briefly for a clean unwind.
    pub async fn cancel(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
        if let Some(task) = self.task.lock().unwrap().take() {
            if tokio::time::timeout(Duration::from_secs(10), task).await.is_err() {
                tracing::warn!(file_id = %self.file_id, "download task did not unwind in time");
            }
        }
    }
}

struct FetchOutcome {
    origin: OriginKey,
    chunk_index: u32,
    result: Result<Duration, ()>,
}

struct FetchHandle {
    origin: OriginKey,
    chunk_index: u32,
    start: Instant,
    stop: StopFlag,
    task: JoinHandle<FetchOutcome>,
}

/// Starts the background control loop for one download and returns a
/// handle the CLI can poll or cancel.
pub fn spawn(
    file_id: String,
    local_path: PathBuf,
    size: u64,
    initial_origins: Vec<OriginKey>,
    index_addr: SocketAddr,
    client_id: String,
) -> DownloadHandle {
    let state = Arc::new(Mutex::new(DownloadState::InProgress));
    let stop = Arc::new(AtomicBool::new(false));
    let stop_notify = Arc::new(Notify::new());

    let state_clone = state.clone();
    let stop_clone = stop.clone();
    let notify_clone = stop_notify.clone();
    let file_id_clone = file_id.clone();
    let local_path_clone = local_path.clone();

    let task = tokio::spawn(async move {
        let slab = match FileSlab::create(&local_path_clone, size).await {
            Ok(slab) => Arc::new(slab),
            Err(e) => {
                tracing::warn!(error = %e, "failed to preallocate download target");
                *state_clone.lock().unwrap() = DownloadState::Failed;
                return;
            }
        };

        let mut origins: HashMap<OriginKey, OriginStats> = HashMap::new();
        for key in initial_origins {
            if let Some(stats) = rate_origin(&key).await {
                origins.insert(key, stats);
            }
        }

        run_loop(
            file_id_clone,
            slab,
            origins,
            index_addr,
            client_id,
            state_clone,
            stop_clone,
            notify_clone,
        )
        .await;
    });

    DownloadHandle {
        file_id,
        local_path,
        state,
        stop,
        stop_notify,
        task: Mutex::new(Some(task)),
    }
}

async fn run_loop(
    file_id: String,
    slab: Arc<FileSlab>,
    mut origins: HashMap<OriginKey, OriginStats>,
    index_addr: SocketAddr,
    client_id: String,
    state: Arc<Mutex<DownloadState>>,
    stop: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
) {
    let mut in_flight: Vec<FetchHandle> = Vec::new();

    loop {
        if stop.load(Ordering::SeqCst) {
            for handle in in_flight.drain(..) {
                handle.stop.set();
                handle.task.abort();
            }
            *state.lock().unwrap() = DownloadState::Failed;
            return;
        }

        reap(&mut in_flight, &mut origins, &slab).await;

        if slab.is_complete() {
            *state.lock().unwrap() = DownloadState::Done;
            return;
        }

        if in_flight.len() < MAX_CHUNK_DOWNLOADERS {
            if let Some(chunk_index) = slab.take_pending() {
                match select_origin(&mut origins, index_addr, &client_id, &file_id).await {
                    Some(origin) => {
                        origins.get_mut(&origin).unwrap().in_flight += 1;
                        in_flight.push(spawn_fetch(
                            file_id.clone(),
                            chunk_index,
                            slab.chunk_len(chunk_index),
                            origin,
                            slab.clone(),
                        ));
                    }
                    None => {
                        slab.return_chunk(chunk_index);
                        if origins.is_empty() {
                            *state.lock().unwrap() = DownloadState::Failed;
                            return;
                        }
                    }
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(SCHEDULER_TICK) => {}
            _ = stop_notify.notified() => {}
        }
    }
}

async fn reap(in_flight: &mut Vec<FetchHandle>, origins: &mut HashMap<OriginKey, OriginStats>, slab: &Arc<FileSlab>) {
    let mut still_running = Vec::with_capacity(in_flight.len());
    for handle in in_flight.drain(..) {
        if handle.task.is_finished() {
            let origin = handle.origin.clone();
            // Already finished, so awaiting resolves immediately.
            match handle.task.await {
                Ok(outcome) => apply_outcome(origins, outcome),
                Err(_) => apply_failure(origins, &origin),
            }
        } else if handle.start.elapsed() > CHUNK_TIMEOUT {
            tracing::debug!(ip = %handle.origin.ip, port = handle.origin.port, "chunk fetch timed out");
            handle.stop.set();
            handle.task.abort();
            slab.return_chunk(handle.chunk_index);
            apply_failure(origins, &handle.origin);
        } else {
            still_running.push(handle);
        }
    }
    *in_flight = still_running;
}

fn apply_outcome(origins: &mut HashMap<OriginKey, OriginStats>, outcome: FetchOutcome) {
    tracing::trace!(chunk_index = outcome.chunk_index, ok = outcome.result.is_ok(), "reaped a chunk fetch");
    let Some(stats) = origins.get_mut(&outcome.origin) else {
        return;
    };
    stats.in_flight = stats.in_flight.saturating_sub(1);
    match outcome.result {
        Ok(elapsed) => stats.record_success(elapsed),
        Err(()) => stats.record_failure(),
    }
    if stats.consecutive_failures >= MAX_ORIGIN_FAILS {
        origins.remove(&outcome.origin);
    }
}

fn apply_failure(origins: &mut HashMap<OriginKey, OriginStats>, origin: &OriginKey) {
    if let Some(stats) = origins.get_mut(origin) {
        stats.in_flight = stats.in_flight.saturating_sub(1);
        stats.record_failure();
        if stats.consecutive_failures >= MAX_ORIGIN_FAILS {
            origins.remove(origin);
        }
    }
}

fn spawn_fetch(
    file_id: String,
    chunk_index: u32,
    chunk_len: usize,
    origin: OriginKey,
    slab: Arc<FileSlab>,
) -> FetchHandle {
    let stop = StopFlag::new();
    let stop_clone = stop.clone();
    let origin_clone = origin.clone();
    let start = Instant::now();

    let task = tokio::spawn(async move {
        let result = fetch_chunk(&file_id, chunk_index, chunk_len, &origin_clone, &slab, stop_clone).await;
        FetchOutcome {
            origin: origin_clone,
            chunk_index,
            result,
        }
    });

    FetchHandle {
        origin,
        chunk_index,
        start,
        stop,
        task,
    }
}

async fn fetch_chunk(
    file_id: &str,
    chunk_index: u32,
    chunk_len: usize,
    origin: &OriginKey,
    slab: &Arc<FileSlab>,
    stop: StopFlag,
) -> Result<Duration, ()> {
    let start = Instant::now();
    let outcome: Result<(), ()> = async {
        let stream = TcpStream::connect((origin.ip, origin.port)).await.map_err(|_| ())?;
        let mut channel = Channel::with_stop_flag(stream, stop);
        let response = channel
            .send_and_wait(Message::StartFileTransfer {
                file_id: file_id.to_string(),
                chunk_index,
            })
            .await
            .map_err(|_| ())?;
        let data = match response {
            Message::ChunkDataResponse { data, .. } => data,
            _ => return Err(()),
        };
        if data.len() != chunk_len {
            return Err(());
        }
        slab.write_chunk(chunk_index, &data).await.map_err(|_| ())?;
        channel.close().await;
        Ok(())
    }
    .await;

    match outcome {
        Ok(()) => Ok(start.elapsed()),
        Err(()) => {
            slab.return_chunk(chunk_index);
            Err(())
        }
    }
}

/// Two-tier selection (spec.md §4.5). Refreshes from the index first when
/// the known origin count is thin.
async fn select_origin(
    origins: &mut HashMap<OriginKey, OriginStats>,
    index_addr: SocketAddr,
    client_id: &str,
    file_id: &str,
) -> Option<OriginKey> {
    if let Some(key) = pick_from_map(origins) {
        return Some(key);
    }

    if origins.len() < MIN_ORIGINS_FOR_UPDATE {
        if let Some(entries) = refresh_origins(index_addr, client_id, file_id).await {
            for entry in entries {
                let Some(port) = entry.port else { continue };
                let key = OriginKey {
                    client_id: entry.client_id,
                    ip: Ipv4Addr::from(entry.ip),
                    port,
                };
                if origins.contains_key(&key) {
                    continue;
                }
                if let Some(stats) = rate_origin(&key).await {
                    origins.insert(key, stats);
                }
            }
        }
    }

    pick_from_map(origins)
}

fn pick_from_map(origins: &HashMap<OriginKey, OriginStats>) -> Option<OriginKey> {
    let mut scored: Vec<_> = origins.iter().filter(|(_, s)| s.score.is_some()).collect();
    scored.sort_by_key(|(_, s)| s.score.unwrap().0);
    for (key, stats) in scored {
        if stats.in_flight < MAX_ORIGIN_DOWNLOADER {
            return Some(key.clone());
        }
    }

    let mut unscored: Vec<_> = origins.iter().filter(|(_, s)| s.score.is_none()).collect();
    unscored.sort_by_key(|(_, s)| s.weighted_one_way_rtt());
    for (key, stats) in unscored {
        if stats.in_flight < MAX_ORIGIN_DOWNLOADER {
            return Some(key.clone());
        }
    }

    None
}

/// Opens a fresh connection to the index for one refresh; the index
/// requires every channel to bind a client id before it will answer
/// anything else, so this repeats the same handshake the CLI did at
/// startup (spec.md §4.4).
async fn refresh_origins(
    index_addr: SocketAddr,
    client_id: &str,
    file_id: &str,
) -> Option<Vec<net::SharingEntry>> {
    let stream = tokio::time::timeout(net::DEFAULT_TIMEOUT, TcpStream::connect(index_addr))
        .await
        .ok()?
        .ok()?;
    let mut channel = Channel::new(stream);
    channel
        .send(&Message::ClientId(client_id.to_string()))
        .await
        .ok()?;
    channel
        .wait_for(net::MessageType::CLIENT_ID, net::DEFAULT_TIMEOUT)
        .await
        .ok()?;
    channel
        .send(&Message::SharingInfoRequest {
            file_id: file_id.to_string(),
        })
        .await
        .ok()?;
    let response = channel.recv(net::DEFAULT_TIMEOUT).await.ok()?;
    match response {
        Message::SharingInfoResponse { entries, .. } => Some(entries),
        _ => None,
    }
}

/// Origin rating via RTT probe (spec.md §4.5).
async fn rate_origin(key: &OriginKey) -> Option<OriginStats> {
    let send_epoch = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs() as u32;
    let measure_start = Instant::now();
    let stream = tokio::time::timeout(RTT_TIMEOUT, TcpStream::connect((key.ip, key.port)))
        .await
        .ok()?
        .ok()?;
    let mut channel = Channel::new(stream);
    let response = tokio::time::timeout(
        RTT_TIMEOUT,
        channel.send_and_wait(Message::RTTCheck { send_epoch }),
    )
    .await
    .ok()?
    .ok()?;
    let measured = measure_start.elapsed();

    let (echoed_send, recv_epoch) = match response {
        Message::RTTResponse { send_epoch, recv_epoch } => (send_epoch, recv_epoch),
        _ => return None,
    };
    let now_epoch = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs() as u32;

    let forward = Duration::from_secs(recv_epoch.saturating_sub(echoed_send) as u64);
    let backward = Duration::from_secs(now_epoch.saturating_sub(recv_epoch) as u64);

    let estimated = forward + backward;
    let diff = measured.max(estimated) - measured.min(estimated);
    if diff > RTT_TOLERANCE {
        let half = measured / 2;
        Some(OriginStats::new(half, half))
    } else {
        Some(OriginStats::new(forward, backward))
    }
}

/// Exposed for the share-info lookup at the start of a download, so the
/// caller can build `initial_origins` from a `SharingInfoResponse`.
pub fn origin_key_from_entry(entry: &net::SharingEntry) -> Option<OriginKey> {
    entry.port.map(|port| OriginKey {
        client_id: entry.client_id.clone(),
        ip: Ipv4Addr::from(entry.ip),
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::slab::CHUNK_SIZE;

    fn key(n: u8) -> OriginKey {
        OriginKey {
            client_id: format!("{n:032x}"),
            ip: Ipv4Addr::new(127, 0, 0, n),
            port: 9000 + n as u16,
        }
    }

    #[test]
    fn pick_from_map_prefers_the_lowest_scored_mean_time() {
        let mut origins = HashMap::new();
        let mut slow = OriginStats::new(Duration::from_millis(5), Duration::from_millis(5));
        slow.record_success(Duration::from_millis(500));
        let mut fast = OriginStats::new(Duration::from_millis(5), Duration::from_millis(5));
        fast.record_success(Duration::from_millis(100));
        let unscored = OriginStats::new(Duration::from_millis(1), Duration::from_millis(1));

        origins.insert(key(1), slow);
        origins.insert(key(2), fast);
        origins.insert(key(3), unscored);

        assert_eq!(pick_from_map(&origins), Some(key(2)));
    }

    #[test]
    fn pick_from_map_falls_back_to_unscored_ranked_by_weighted_rtt() {
        let mut origins = HashMap::new();
        origins.insert(key(1), OriginStats::new(Duration::from_millis(100), Duration::from_millis(100)));
        origins.insert(key(2), OriginStats::new(Duration::from_millis(10), Duration::from_millis(10)));

        assert_eq!(pick_from_map(&origins), Some(key(2)));
    }

    #[test]
    fn pick_from_map_skips_origins_at_the_in_flight_cap() {
        let mut origins = HashMap::new();
        let mut saturated = OriginStats::new(Duration::from_millis(1), Duration::from_millis(1));
        saturated.record_success(Duration::from_millis(10));
        saturated.in_flight = MAX_ORIGIN_DOWNLOADER;
        let mut available = OriginStats::new(Duration::from_millis(1), Duration::from_millis(1));
        available.record_success(Duration::from_millis(20));

        origins.insert(key(1), saturated);
        origins.insert(key(2), available);

        assert_eq!(pick_from_map(&origins), Some(key(2)));
    }

    #[test]
    fn pick_from_map_is_none_when_every_origin_is_saturated() {
        let mut origins = HashMap::new();
        let mut saturated = OriginStats::new(Duration::from_millis(1), Duration::from_millis(1));
        saturated.in_flight = MAX_ORIGIN_DOWNLOADER;
        origins.insert(key(1), saturated);

        assert_eq!(pick_from_map(&origins), None);
    }

    #[tokio::test]
    async fn reap_returns_a_timed_out_chunk_to_pending_and_records_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let slab = Arc::new(FileSlab::create(dir.path().join("f.bin"), CHUNK_SIZE).await.unwrap());
        let chunk_index = slab.take_pending().unwrap();

        let origin = key(1);
        let mut origins = HashMap::new();
        origins.insert(origin.clone(), OriginStats::new(Duration::from_millis(1), Duration::from_millis(1)));

        let stuck_origin = origin.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            FetchOutcome {
                origin: stuck_origin,
                chunk_index: 0,
                result: Ok(Duration::ZERO),
            }
        });
        let mut in_flight = vec![FetchHandle {
            origin: origin.clone(),
            chunk_index,
            start: Instant::now() - CHUNK_TIMEOUT - Duration::from_secs(1),
            stop: StopFlag::new(),
            task,
        }];

        reap(&mut in_flight, &mut origins, &slab).await;

        assert!(in_flight.is_empty());
        assert_eq!(slab.take_pending(), Some(chunk_index));
        assert_eq!(origins.get(&origin).unwrap().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn reap_evicts_an_origin_once_it_hits_the_failure_cap() {
        let dir = tempfile::tempdir().unwrap();
        let slab = Arc::new(FileSlab::create(dir.path().join("f.bin"), CHUNK_SIZE).await.unwrap());

        let origin = key(1);
        let mut origins = HashMap::new();
        let mut stats = OriginStats::new(Duration::from_millis(1), Duration::from_millis(1));
        stats.consecutive_failures = MAX_ORIGIN_FAILS - 1;
        origins.insert(origin.clone(), stats);

        let chunk_index = slab.take_pending().unwrap();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            FetchOutcome {
                origin: key(1),
                chunk_index: 0,
                result: Ok(Duration::ZERO),
            }
        });
        let mut in_flight = vec![FetchHandle {
            origin: origin.clone(),
            chunk_index,
            start: Instant::now() - CHUNK_TIMEOUT - Duration::from_secs(1),
            stop: StopFlag::new(),
            task,
        }];

        reap(&mut in_flight, &mut origins, &slab).await;

        assert!(origins.get(&origin).is_none(), "origin should be evicted past the failure cap");
    }
}
