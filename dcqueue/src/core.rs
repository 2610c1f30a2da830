//! `Core`: the single value owning every subsystem, replacing the original's
//! process-wide singletons (`QueueManager`, `HashManager`, `ConnectionManager`,
//! `SettingsManager`) per the design note in spec.md §9. Subsystems publish
//! typed events on a broadcast channel rather than dispatching through
//! listener callbacks (§9, "Listener-pattern callbacks").

use std::net::SocketAddrV4;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use crate::catalogue::Catalogue;
use crate::config::Config;
use crate::file_queue::FileQueue;
use crate::hash_pipeline::{self, HashPipelineHandle, TthDone};
use crate::pfs::PfsProtocol;
use crate::preview::PreviewServer;
use crate::queue_item::{Priority, QueueItem, UserId};
use crate::tigertree::Hash192;
use crate::user_queue::UserQueue;

#[derive(Debug, Clone)]
pub enum CoreEvent {
    TthDone(Hash192),
    ItemFinished(String),
    ItemAdded(String),
    ItemRemoved(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Queue(#[from] crate::queue_item::QueueError),
    #[error(transparent)]
    Catalogue(#[from] crate::catalogue::CatalogueError),
    #[error(transparent)]
    Pfs(#[from] crate::pfs::PfsError),
}

pub type Result<T> = std::result::Result<T, CoreError>;

pub struct Core {
    pub config: Config,
    pub file_queue: Arc<FileQueue>,
    pub user_queue: Arc<UserQueue>,
    pub catalogue: Arc<dyn Catalogue>,
    hash_pipeline: HashPipelineHandle,
    events: broadcast::Sender<CoreEvent>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    tasks: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Core {
    pub fn new(config: Config, catalogue: Arc<dyn Catalogue>) -> Self {
        let (events, _) = broadcast::channel(256);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (hash_join, hash_pipeline) =
            hash_pipeline::spawn(catalogue.clone(), config.hash_throughput_cap, config.save_tth_in_ntfs_filestream);

        let core = Self {
            config,
            file_queue: Arc::new(FileQueue::new()),
            user_queue: Arc::new(UserQueue::new()),
            catalogue,
            hash_pipeline,
            events,
            stop_tx,
            stop_rx,
            tasks: tokio::sync::Mutex::new(vec![hash_join]),
        };
        core.forward_hash_events();
        core
    }

    fn forward_hash_events(&self) {
        let mut rx = self.hash_pipeline.events.subscribe();
        let events = self.events.clone();
        let file_queue = self.file_queue.clone();
        let join = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(TthDone { root, tree, .. }) => {
                        for item in file_queue.find_by_tth(&root).await {
                            item.set_tree((*tree).clone()).await;
                        }
                        let _ = events.send(CoreEvent::TthDone(root));
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        // Fire-and-forget: tracked only so `shutdown` can await a clean stop
        // on the caller's worker set, not this internal relay.
        drop(join);
    }

    pub fn events(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub fn hash_pipeline(&self) -> &HashPipelineHandle {
        &self.hash_pipeline
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn add_download(
        &self,
        target: String,
        tmp_target: String,
        size: u64,
        root: Hash192,
        flags: u16,
        added: u64,
    ) -> Result<QueueItem> {
        let priority = FileQueue::default_priority(&self.config, size);
        let item = self
            .file_queue
            .add(target.clone(), tmp_target, size, root, flags, priority, added, self.config.number_of_segments)
            .await?;
        let _ = self.events.send(CoreEvent::ItemAdded(target));
        Ok(item)
    }

    pub async fn remove_download(&self, target: &str) -> Result<()> {
        self.file_queue.remove(target).await?;
        self.catalogue.remove_queue_item(target)?;
        let _ = self.events.send(CoreEvent::ItemRemoved(target.to_string()));
        Ok(())
    }

    pub async fn add_source(&self, target: &str, user: UserId, flags: u8) -> Result<()> {
        let item = self.file_queue.find(target).await.ok_or_else(|| {
            CoreError::Queue(crate::queue_item::QueueError::TargetRemoved(target.to_string()))
        })?;
        item.add_source(user, flags).await?;
        self.user_queue.add_source(user, item).await;
        Ok(())
    }

    /// Persists every dirty item to the catalogue and clears the dirty flag
    /// (spec.md §4.5/§6: catalogue persistence is write-behind, not
    /// synchronous with every mutation).
    pub async fn flush_dirty(&self) -> Result<()> {
        for item in self.file_queue.all_items().await {
            if item.dirty().await {
                let snapshot = item.snapshot().await;
                self.catalogue.merge_queue_all_items(std::slice::from_ref(&snapshot))?;
                item.clear_dirty().await;
            } else if item.segments_dirty().await {
                let snapshot = item.snapshot().await;
                self.catalogue.merge_queue_all_segments(&snapshot.target, &snapshot.done_ranges)?;
                item.clear_segments_dirty().await;
            }
        }
        Ok(())
    }

    /// Loads persisted items from the catalogue into the in-memory queue at
    /// startup.
    pub async fn load_from_catalogue(&self) -> Result<usize> {
        let snapshots = self.catalogue.load_queue()?;
        let mut loaded = 0;
        for snap in snapshots {
            let item = self
                .file_queue
                .add(snap.target.clone(), snap.tmp_target, snap.size, snap.root, snap.flags, snap.priority, snap.added, snap.max_segments)
                .await;
            let item = match item {
                Ok(item) => item,
                Err(_) => continue,
            };
            for range in snap.done_ranges {
                let _ = item.add_done(range.start, range.end - range.start).await;
            }
            for src in snap.sources {
                let _ = item.add_source(src.user_id, src.flags).await;
            }
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Spawns the PFS UDP task; returns immediately, the task runs until
    /// `shutdown` is called.
    pub async fn start_pfs(&self, bind_addr: SocketAddrV4, my_nick: String, hub_ip_port: String) -> Result<()> {
        let pfs = Arc::new(PfsProtocol::bind(bind_addr, self.file_queue.clone(), my_nick, hub_ip_port).await?);
        let stop_rx = self.stop_rx.clone();
        let join = tokio::spawn(async move { pfs.run(stop_rx).await });
        self.tasks.lock().await.push(join);
        Ok(())
    }

    /// Spawns the preview HTTP task; no-op if `preview_server_port == 0`.
    pub async fn start_preview(&self) {
        if self.config.preview_server_port == 0 {
            return;
        }
        let server = Arc::new(PreviewServer::new(
            self.file_queue.clone(),
            self.config.preview_server_port,
            self.config.preview_server_speed,
        ));
        let stop_rx = self.stop_rx.clone();
        let join = tokio::spawn(async move {
            if let Err(e) = server.run(stop_rx).await {
                tracing::warn!(error = %e, "preview server exited");
            }
        });
        self.tasks.lock().await.push(join);
    }

    /// Picks the next runnable segment for `user` at or above `min_priority`,
    /// delegating to `UserQueue::next_for`.
    pub async fn next_segment_for(&self, user: UserId, min_priority: Priority, wanted_size: u64, last_speed: u64) -> Option<(QueueItem, crate::roadmap::Segment)> {
        self.user_queue
            .next_for(
                user,
                min_priority,
                wanted_size,
                last_speed,
                true,
                &self.file_queue,
                self.config.file_slots,
                self.config.disconnect_file_speed,
                self.config.remove_speed,
                self.config.drop_multisource_only,
                |_| None,
            )
            .await
    }

    /// Signals every spawned subsystem to stop and waits for them to finish
    /// (the "die flag checked within 250ms" translation, spec.md §5/§9).
    pub async fn shutdown(self: Arc<Self>) {
        let _ = self.flush_dirty().await;
        let _ = self.stop_tx.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        if let Err(e) = self.hash_pipeline.shutdown() {
            tracing::debug!(error = %e, "hash pipeline already stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::SqliteCatalogue;

    #[tokio::test]
    async fn add_and_remove_round_trip_through_core() {
        let catalogue: Arc<dyn Catalogue> = Arc::new(SqliteCatalogue::open_in_memory().unwrap());
        let core = Core::new(Config::default(), catalogue);
        core.add_download("T".into(), "T.tmp".into(), 10, [1; 24], 0, 0).await.unwrap();
        assert!(core.file_queue.find("T").await.is_some());
        core.remove_download("T").await.unwrap();
        assert!(core.file_queue.find("T").await.is_none());
    }

    #[tokio::test]
    async fn flush_dirty_persists_segment_only_progress_without_a_full_merge() {
        let catalogue: Arc<dyn Catalogue> = Arc::new(SqliteCatalogue::open_in_memory().unwrap());
        let core = Core::new(Config::default(), catalogue.clone());
        let item = core.add_download("T".into(), "T.tmp".into(), 100, [1; 24], 0, 0).await.unwrap();
        core.flush_dirty().await.unwrap();
        assert!(!item.dirty().await);

        item.add_done(0, 40).await.unwrap();
        assert!(!item.dirty().await);
        assert!(item.segments_dirty().await);

        core.flush_dirty().await.unwrap();
        assert!(!item.segments_dirty().await);

        let loaded = catalogue.load_queue().unwrap();
        let snap = loaded.iter().find(|s| s.target == "T").unwrap();
        assert_eq!(snap.done_ranges, vec![crate::queue_item::SegmentRecord { start: 0, end: 40 }]);
    }
}
