//! Background hasher (spec.md §4.4), grounded on the pause/resume counting
//! semaphore in `examples/original_source/client/HashManager.cpp` and the
//! teacher's disk-actor shape (command channel + `spawn_blocking` for the
//! actual I/O).

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Semaphore};

use crate::catalogue::Catalogue;
use crate::ntfs_stream;
use crate::tigertree::{choose_block_size, Hash192, TigerTree};

pub const DEFAULT_BUF_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum HashPipelineError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Catalogue(#[from] crate::catalogue::CatalogueError),
    #[error("channel closed")]
    ChannelClosed,
}

impl<T> From<mpsc::error::SendError<T>> for HashPipelineError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        HashPipelineError::ChannelClosed
    }
}

pub type Result<T> = std::result::Result<T, HashPipelineError>;

#[derive(Debug, Clone)]
pub struct HashJob {
    pub path_id: u64,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct TthDone {
    pub path_id: u64,
    pub path: PathBuf,
    pub root: Hash192,
    pub tree: Arc<TigerTree>,
    pub mtime: u64,
    /// bytes/sec observed while hashing.
    pub speed: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub jobs_pending: usize,
    pub bytes_left: u64,
    pub paused: bool,
}

enum Command {
    Enqueue(HashJob),
    Pause,
    Resume,
    StopPrefix(Option<PathBuf>),
    Rebuild,
    Stats(tokio::sync::oneshot::Sender<Stats>),
    Shutdown,
}

#[derive(Clone)]
pub struct HashPipelineHandle {
    tx: mpsc::UnboundedSender<Command>,
    pub events: tokio::sync::broadcast::Sender<TthDone>,
}

impl HashPipelineHandle {
    pub fn enqueue(&self, path_id: u64, path: PathBuf, size: u64) -> Result<()> {
        self.tx.send(Command::Enqueue(HashJob { path_id, path, size }))?;
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        Ok(self.tx.send(Command::Pause)?)
    }

    pub fn resume(&self) -> Result<()> {
        Ok(self.tx.send(Command::Resume)?)
    }

    pub fn stop_prefix(&self, dir: Option<PathBuf>) -> Result<()> {
        Ok(self.tx.send(Command::StopPrefix(dir))?)
    }

    pub fn rebuild(&self) -> Result<()> {
        Ok(self.tx.send(Command::Rebuild)?)
    }

    pub async fn stats(&self) -> Result<Stats> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.tx.send(Command::Stats(tx))?;
        rx.await.map_err(|_| HashPipelineError::ChannelClosed)
    }

    pub fn shutdown(&self) -> Result<()> {
        Ok(self.tx.send(Command::Shutdown)?)
    }
}

struct Worker {
    rx: mpsc::UnboundedReceiver<Command>,
    events: tokio::sync::broadcast::Sender<TthDone>,
    queue: VecDeque<HashJob>,
    bytes_left: u64,
    /// Classic counting-semaphore pause: each `Pause` adds a permit-less
    /// hold; `Resume` releases one. Acquiring zero permits means paused.
    pause_count: u32,
    catalogue: Arc<dyn Catalogue>,
    throughput_cap_bytes_per_sec: Option<u64>,
    /// `SAVE_TTH_IN_NTFS_FILESTREAM` (spec.md §6): when set, a successful
    /// hash is also mirrored into the file's `.gltth` alternate data stream.
    save_tth_in_ntfs_filestream: bool,
    // Guards the worker against running two jobs concurrently while still
    // letting `Stats`/`Pause`/`Resume` interleave between jobs.
    busy: Arc<Semaphore>,
}

pub fn spawn(
    catalogue: Arc<dyn Catalogue>,
    throughput_cap_bytes_per_sec: Option<u64>,
    save_tth_in_ntfs_filestream: bool,
) -> (tokio::task::JoinHandle<()>, HashPipelineHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (events, _) = tokio::sync::broadcast::channel(64);
    let handle = HashPipelineHandle { tx, events: events.clone() };

    let mut worker = Worker {
        rx,
        events,
        queue: VecDeque::new(),
        bytes_left: 0,
        pause_count: 0,
        catalogue,
        throughput_cap_bytes_per_sec,
        save_tth_in_ntfs_filestream,
        busy: Arc::new(Semaphore::new(1)),
    };

    let join = tokio::spawn(async move { worker.run().await });
    (join, handle)
}

impl Worker {
    async fn run(&mut self) {
        loop {
            // Pull in every pending command without blocking before
            // deciding whether to process a job; this is the async
            // equivalent of checking the `die`/pause flags at each poll.
            while let Ok(cmd) = self.rx.try_recv() {
                if self.handle_command(cmd).await {
                    return;
                }
            }

            if self.pause_count > 0 || self.queue.is_empty() {
                match self.rx.recv().await {
                    Some(cmd) => {
                        if self.handle_command(cmd).await {
                            return;
                        }
                    }
                    None => return,
                }
                continue;
            }

            let job = self.queue.pop_front().unwrap();
            if let Err(e) = self.process_job(job).await {
                tracing::warn!(error = %e, "hash job failed; dropping");
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Enqueue(job) => {
                self.bytes_left += job.size;
                self.queue.push_back(job);
            }
            Command::Pause => self.pause_count += 1,
            Command::Resume => {
                if self.pause_count > 0 {
                    self.pause_count -= 1;
                }
            }
            Command::StopPrefix(dir) => match dir {
                Some(dir) => self.queue.retain(|j| !j.path.starts_with(&dir)),
                None => self.queue.clear(),
            },
            Command::Rebuild => {
                // Reload pending jobs from the catalogue (restart-after-stop
                // semantics, spec.md §4.4).
                if let Ok(items) = self.catalogue.load_queue() {
                    for item in items {
                        self.queue.push_back(HashJob {
                            path_id: crate::catalogue::path_id_for(&PathBuf::from(&item.target)),
                            path: PathBuf::from(item.tmp_target),
                            size: item.size,
                        });
                    }
                }
            }
            Command::Stats(reply) => {
                let _ = reply.send(Stats {
                    jobs_pending: self.queue.len(),
                    bytes_left: self.bytes_left,
                    paused: self.pause_count > 0,
                });
            }
            Command::Shutdown => return true,
        }
        false
    }

    async fn process_job(&mut self, job: HashJob) -> Result<()> {
        let _permit = self.busy.acquire().await.expect("semaphore never closed");

        let mtime = std::fs::metadata(&job.path).map(|m| mtime_secs(&m)).unwrap_or(0);

        if let Some(root) = self.catalogue.check_tth(job.path_id, job.size, mtime)? {
            if let Some((tree, _block_size)) = self.catalogue.get_tree(&root)? {
                if self.save_tth_in_ntfs_filestream {
                    if let Err(e) = ntfs_stream::stream::write(&job.path, &tree, mtime) {
                        tracing::debug!(path = %job.path.display(), error = %e, "failed to write .gltth stream");
                    }
                }
                self.bytes_left = self.bytes_left.saturating_sub(job.size);
                let _ = self.events.send(TthDone {
                    path_id: job.path_id,
                    path: job.path,
                    root,
                    tree: Arc::new(tree),
                    mtime,
                    speed: 0,
                });
                return Ok(());
            }
        }

        let path = job.path.clone();
        let cap = self.throughput_cap_bytes_per_sec;
        let size = job.size;
        let result = tokio::task::spawn_blocking(move || hash_file_blocking(&path, size, cap)).await;

        match result {
            Ok(Ok((tree, speed))) => {
                let root = tree.root().expect("finalized");
                self.catalogue.add_tree(&root, &tree)?;
                self.catalogue.add_file(job.path_id, &job.path.to_string_lossy(), mtime, &root, job.size)?;
                if self.save_tth_in_ntfs_filestream {
                    if let Err(e) = ntfs_stream::stream::write(&job.path, &tree, mtime) {
                        tracing::debug!(path = %job.path.display(), error = %e, "failed to write .gltth stream");
                    }
                }
                self.bytes_left = self.bytes_left.saturating_sub(job.size);
                let _ = self.events.send(TthDone { path_id: job.path_id, path: job.path, root, tree: Arc::new(tree), mtime, speed });
            }
            Ok(Err(e)) => {
                tracing::warn!(path = %job.path.display(), error = %e, "hash job I/O error; dropping");
            }
            Err(join_err) => {
                tracing::warn!(path = %job.path.display(), error = %join_err, "hash job panicked; dropping");
            }
        }
        Ok(())
    }
}

fn mtime_secs(meta: &std::fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Reads the file in `DEFAULT_BUF_SIZE` buffers (aligned down to the OS
/// page size), feeding a streaming `TigerTree`; sleeps proportionally
/// between reads when `cap` (bytes/sec) is set.
fn hash_file_blocking(path: &std::path::Path, size: u64, cap: Option<u64>) -> std::io::Result<(TigerTree, u64)> {
    use std::io::Read;

    let page_size = 4096u64;
    let buf_size = ((DEFAULT_BUF_SIZE as u64) / page_size * page_size).max(page_size) as usize;

    let mut file = std::fs::File::open(path)?;
    let block_size = choose_block_size(size);
    let mut tree = TigerTree::new(size, block_size).expect("power of two");
    let mut buf = vec![0u8; buf_size];
    let started = Instant::now();
    let mut total = 0u64;

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        tree.update(&buf[..n]);
        total += n as u64;

        if let Some(cap) = cap {
            let expected = Duration::from_secs_f64(total as f64 / cap as f64);
            let elapsed = started.elapsed();
            if expected > elapsed {
                std::thread::sleep(expected - elapsed);
            }
        }
    }
    tree.finalize();

    let elapsed = started.elapsed().as_secs_f64().max(0.000_001);
    let speed = (total as f64 / elapsed) as u64;
    Ok((tree, speed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::SqliteCatalogue;
    use tempfile::tempdir;

    #[tokio::test]
    async fn hashes_a_small_file_and_emits_tth_done() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, vec![5u8; 200 * 1024]).unwrap();

        let catalogue: Arc<dyn Catalogue> = Arc::new(SqliteCatalogue::open_in_memory().unwrap());
        let (_join, handle) = spawn(catalogue, None, false);
        let mut events = handle.events.subscribe();

        handle.enqueue(1, path.clone(), 200 * 1024).unwrap();

        let done = tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
        assert_eq!(done.path, path);
        assert!(done.tree.root().is_some());

        handle.shutdown().unwrap();
    }

    #[tokio::test]
    async fn pause_blocks_processing_until_resume() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("g.bin");
        std::fs::write(&path, vec![1u8; 64 * 1024]).unwrap();

        let catalogue: Arc<dyn Catalogue> = Arc::new(SqliteCatalogue::open_in_memory().unwrap());
        let (_join, handle) = spawn(catalogue, None, false);
        let mut events = handle.events.subscribe();

        handle.pause().unwrap();
        handle.enqueue(1, path.clone(), 64 * 1024).unwrap();

        let timed_out = tokio::time::timeout(Duration::from_millis(200), events.recv()).await;
        assert!(timed_out.is_err(), "job should not process while paused");

        handle.resume().unwrap();
        let done = tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
        assert_eq!(done.path, path);

        handle.shutdown().unwrap();
    }
}
