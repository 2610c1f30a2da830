//! PreviewServer (spec.md §4.10): a small HTTP/1.1 range server over a
//! `QueueItem`'s temp file, so a media player can start playing a download
//! before it finishes. Grounded on the TCP range-request video server in
//! `other_examples/...niketsu__client-player-video_server-src-lib.rs.rs`
//! (request-line parsing, `Content-Range` response, wait-for-data loop),
//! adapted here to read straight from `SharedFileStream`/`RoadMap` instead
//! of a push-fed cache.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::file_queue::FileQueue;
use crate::queue_item::QueueItem;
use crate::scheduler;
use crate::shared_file::SharedFileStream;
use crate::tigertree::choose_block_size;

const READ_CHUNK: usize = 64 * 1024;
const ACCEPT_RETRY_BACKOFF: Duration = Duration::from_secs(60);
const WAIT_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    SharedFile(#[from] crate::shared_file::SharedFileError),
    #[error("no such target: {0}")]
    UnknownTarget(String),
}

pub type Result<T> = std::result::Result<T, PreviewError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Listening,
    Running,
    ConnectivityLost,
    Stopped,
}

pub struct PreviewServer {
    file_queue: Arc<FileQueue>,
    port: u16,
    speed_cap: u64,
    state_tx: watch::Sender<State>,
}

impl PreviewServer {
    pub fn new(file_queue: Arc<FileQueue>, port: u16, speed_cap: u64) -> Self {
        let (state_tx, _) = watch::channel(State::Idle);
        Self { file_queue, port, speed_cap, state_tx }
    }

    pub fn state(&self) -> watch::Receiver<State> {
        self.state_tx.subscribe()
    }

    /// Runs the accept loop until `stop_rx` fires. Accept failures are
    /// treated as `ConnectivityLost` and retried after a backoff rather than
    /// exiting, mirroring the preview server's listed "retries rather than
    /// giving up" behavior (spec.md §4.10).
    pub async fn run(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) -> Result<()> {
        loop {
            let _ = self.state_tx.send(State::Listening);
            let listener = match TcpListener::bind(("0.0.0.0", self.port)).await {
                Ok(l) => l,
                Err(e) => {
                    tracing::warn!(error = %e, "preview server failed to bind; backing off");
                    let _ = self.state_tx.send(State::ConnectivityLost);
                    tokio::select! {
                        _ = tokio::time::sleep(ACCEPT_RETRY_BACKOFF) => continue,
                        _ = stop_rx.changed() => { if *stop_rx.borrow() { break; } }
                    }
                    continue;
                }
            };

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            let _ = self.state_tx.send(State::Stopped);
                            return Ok(());
                        }
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((socket, peer)) => {
                                let _ = self.state_tx.send(State::Running);
                                let server = self.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = server.handle_connection(socket, peer).await {
                                        tracing::debug!(%peer, error = %e, "preview connection ended");
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "preview accept failed; backing off");
                                let _ = self.state_tx.send(State::ConnectivityLost);
                                tokio::time::sleep(ACCEPT_RETRY_BACKOFF).await;
                                break;
                            }
                        }
                    }
                }
            }
        }
        let _ = self.state_tx.send(State::Stopped);
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let (method_path, range) = read_request(&mut reader).await?;
        let Some(path) = method_path else {
            return write_status(&mut write_half, 400, "Bad Request").await;
        };

        let target = path.trim_start_matches('/').to_string();
        let Some(item) = self.file_queue.find(&target).await else {
            return write_status(&mut write_half, 404, "Not Found").await;
        };

        tracing::debug!(%peer, %target, ?range, "preview request");
        self.stream_item(&item, range, &mut write_half).await
    }

    async fn stream_item(
        &self,
        item: &QueueItem,
        range: Option<(u64, Option<u64>)>,
        write: &mut (impl tokio::io::AsyncWrite + Unpin),
    ) -> Result<()> {
        let size = item.size().await;
        let (start, end) = match range {
            Some((s, Some(e))) => (s, e.min(size.saturating_sub(1))),
            Some((s, None)) => (s, size.saturating_sub(1)),
            None => (0, size.saturating_sub(1)),
        };
        if start > end || start >= size {
            return write_status(write, 416, "Range Not Satisfiable").await;
        }
        let length = end - start + 1;

        let filename = std::path::Path::new(&item.target().await)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let headers = format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: application/avi\r\n\
             Accept-Ranges: bytes\r\n\
             Content-Length: {length}\r\n\
             Content-Range: bytes {start}-{end}/{size}\r\n\
             Content-Disposition: attachment; filename={filename}\r\n\
             Connection: close\r\n\r\n"
        );
        write.write_all(headers.as_bytes()).await?;

        let path = std::path::PathBuf::from(item.tmp_target().await);
        let file = SharedFileStream::open(&path, crate::shared_file::OpenFlags { create: false, read_write: false, no_cache_hint: false })?;

        let mut cursor = start;
        let mut buf = vec![0u8; READ_CHUNK];
        let started = std::time::Instant::now();
        let mut sent = 0u64;
        let block_size = choose_block_size(size);

        while cursor <= end {
            let want = ((end - cursor + 1).min(READ_CHUNK as u64)) as usize;
            if !item.contains_range(cursor, want as u64).await {
                // Data not there yet; nudge the scheduler toward it and wait.
                scheduler::hint(item, cursor, block_size).await;
                tokio::time::sleep(WAIT_POLL).await;
                continue;
            }
            let n = file.read_at(cursor, &mut buf[..want])?;
            if n == 0 {
                break;
            }
            write.write_all(&buf[..n]).await?;
            cursor += n as u64;
            sent += n as u64;

            if self.speed_cap > 0 {
                let expected = Duration::from_secs_f64(sent as f64 / self.speed_cap as f64);
                let elapsed = started.elapsed();
                if expected > elapsed {
                    tokio::time::sleep(expected - elapsed).await;
                }
            }
        }
        write.flush().await?;
        Ok(())
    }
}

/// Reads the request line and headers up to the blank line, returning the
/// path and an optional `Range: bytes=a-b` (half-open end is `None` for an
/// open-ended range, per RFC 7233).
async fn read_request(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
) -> Result<(Option<String>, Option<(u64, Option<u64>)>)> {
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let path = request_line.split_whitespace().nth(1).map(|s| s.to_string());

    let mut range = None;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line.trim().is_empty() {
            break;
        }
        if let Some(value) = line.strip_prefix("Range:").or_else(|| line.strip_prefix("range:")) {
            range = parse_range_header(value.trim());
        }
    }
    Ok((path, range))
}

fn parse_range_header(value: &str) -> Option<(u64, Option<u64>)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start_str, end_str) = spec.split_once('-')?;
    let start: u64 = start_str.trim().parse().ok()?;
    let end = end_str.trim();
    if end.is_empty() {
        Some((start, None))
    } else {
        Some((start, end.parse().ok()))
    }
}

async fn write_status(write: &mut (impl tokio::io::AsyncWrite + Unpin), code: u16, reason: &str) -> Result<()> {
    let body = format!("HTTP/1.1 {code} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
    write.write_all(body.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_simple_byte_range() {
        assert_eq!(parse_range_header("bytes=0-499"), Some((0, Some(499))));
    }

    #[test]
    fn parses_an_open_ended_range() {
        assert_eq!(parse_range_header("bytes=1000-"), Some((1000, None)));
    }

    #[test]
    fn rejects_a_malformed_range() {
        assert_eq!(parse_range_header("chunks=0-1"), None);
    }
}
