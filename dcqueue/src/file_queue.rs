//! Index of all `QueueItem`s, keyed by target and by TTH (spec.md §4.6).

use std::collections::HashMap;

use rand::Rng;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::queue_item::{Priority, QueueError, QueueItem, Result, UserId};
use crate::tigertree::Hash192;

struct Inner {
    by_target: HashMap<String, QueueItem>,
    by_tth: HashMap<Hash192, Vec<QueueItem>>,
}

/// Guarded by a single reader/writer lock (`g_csFQ` in spec.md §5):
/// structural mutation (add/remove/move) takes the writer; read-only scans
/// take the reader. This type always nests *outside* any per-`QueueItem`
/// lock — nothing in this module calls back into a locked `QueueItem` while
/// holding `inner` for write, and vice versa, preserving the mandated order.
pub struct FileQueue {
    inner: RwLock<Inner>,
}

impl FileQueue {
    pub fn new() -> Self {
        Self { inner: RwLock::new(Inner { by_target: HashMap::new(), by_tth: HashMap::new() }) }
    }

    /// Default priority bucketed by size, per spec.md §4.6 / §6
    /// (`PRIO_{HIGHEST,HIGH,NORMAL,LOW}_SIZE`, `PRIO_LOWEST`).
    pub fn default_priority(config: &Config, size: u64) -> Priority {
        if size >= config.prio_highest_size {
            Priority::Highest
        } else if size >= config.prio_high_size {
            Priority::High
        } else if size >= config.prio_normal_size {
            Priority::Normal
        } else if size >= config.prio_low_size {
            Priority::Low
        } else {
            config.prio_lowest
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn add(
        &self,
        target: String,
        tmp_target: String,
        size: u64,
        root: Hash192,
        flags: u16,
        priority: Priority,
        added: u64,
        max_segments: u8,
    ) -> Result<QueueItem> {
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner.by_target.get(&target) {
            if existing.size().await != size {
                return Err(QueueError::SizeMismatch { target, existing: existing.size().await, new: size });
            }
            if existing.root().await != root {
                return Err(QueueError::TthMismatch { target });
            }
            return Err(QueueError::DuplicateTarget(target));
        }

        let item = QueueItem::new(target.clone(), tmp_target, size, root, priority, true, flags, added, max_segments);
        inner.by_target.insert(target, item.clone());
        inner.by_tth.entry(root).or_default().push(item.clone());
        Ok(item)
    }

    pub async fn find(&self, target: &str) -> Option<QueueItem> {
        self.inner.read().await.by_target.get(target).cloned()
    }

    pub async fn find_by_tth(&self, root: &Hash192) -> Vec<QueueItem> {
        self.inner.read().await.by_tth.get(root).cloned().unwrap_or_default()
    }

    pub async fn move_target(&self, old_target: &str, new_target: String) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.by_target.contains_key(&new_target) {
            return Err(QueueError::DuplicateTarget(new_target));
        }
        let item = inner.by_target.remove(old_target).ok_or_else(|| QueueError::TargetRemoved(old_target.to_string()))?;
        inner.by_target.insert(new_target, item);
        Ok(())
    }

    pub async fn remove(&self, target: &str) -> Result<QueueItem> {
        let mut inner = self.inner.write().await;
        let item = inner.by_target.remove(target).ok_or_else(|| QueueError::TargetRemoved(target.to_string()))?;
        let root = item.root().await;
        if let Some(v) = inner.by_tth.get_mut(&root) {
            v.retain(|i| !i.handle_eq(&item));
            if v.is_empty() {
                inner.by_tth.remove(&root);
            }
        }
        Ok(item)
    }

    /// At most `FILE_SLOTS` items may be concurrently running (spec.md §5
    /// resource policy). `stop_at` short-circuits the scan once the caller
    /// only needs to know "have we hit the cap yet".
    pub async fn running_count(&self, stop_at: Option<usize>) -> usize {
        let inner = self.inner.read().await;
        let mut count = 0;
        for item in inner.by_target.values() {
            if item.is_running().await {
                count += 1;
                if stop_at.is_some_and(|cap| count >= cap) {
                    break;
                }
            }
        }
        count
    }

    /// Picks a candidate for periodic TTH search: not finished, not
    /// paused, not a user-list transfer, under the source cap, and not in
    /// `recent_ring`. Starts scanning at a random offset so no single item
    /// is starved, and prefers an item with a runnable missing segment,
    /// falling back to any eligible item (spec.md §4.6).
    pub async fn find_auto_search(&self, recent_ring: &[String], max_sources: usize) -> Option<QueueItem> {
        let inner = self.inner.read().await;
        let targets: Vec<&String> = inner.by_target.keys().collect();
        if targets.is_empty() {
            return None;
        }
        let offset = rand::thread_rng().gen_range(0..targets.len());

        let mut fallback: Option<QueueItem> = None;
        for i in 0..targets.len() {
            let target = targets[(offset + i) % targets.len()];
            if recent_ring.iter().any(|t| t == target) {
                continue;
            }
            let item = inner.by_target.get(target).unwrap();
            if item.is_finished().await || item.is_paused().await {
                continue;
            }
            if item.flags().await & crate::queue_item::item_flags::USER_LIST != 0 {
                continue;
            }
            if item.online_source_count().await >= max_sources {
                continue;
            }
            if fallback.is_none() {
                fallback = Some(item.clone());
            }
            if item.done_bytes().await < item.size().await {
                // Has at least one missing byte, i.e. a runnable segment exists.
                return Some(item.clone());
            }
        }
        fallback
    }

    pub async fn all_items(&self) -> Vec<QueueItem> {
        self.inner.read().await.by_target.values().cloned().collect()
    }
}

impl Default for FileQueue {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_target_is_rejected() {
        let fq = FileQueue::new();
        fq.add("T".into(), "T.tmp".into(), 10, [1; 24], 0, Priority::Normal, 0, 0).await.unwrap();
        let err = fq.add("T".into(), "T.tmp".into(), 10, [1; 24], 0, Priority::Normal, 0, 0).await;
        assert!(matches!(err, Err(QueueError::DuplicateTarget(_))));
    }

    #[tokio::test]
    async fn size_mismatch_is_rejected_without_mutating_state() {
        let fq = FileQueue::new();
        fq.add("T".into(), "T.tmp".into(), 10, [1; 24], 0, Priority::Normal, 0, 0).await.unwrap();
        let err = fq.add("T".into(), "T.tmp".into(), 20, [1; 24], 0, Priority::Normal, 0, 0).await;
        assert!(matches!(err, Err(QueueError::SizeMismatch { .. })));
        assert_eq!(fq.find("T").await.unwrap().size().await, 10);
    }

    #[tokio::test]
    async fn by_target_and_by_tth_stay_consistent_after_remove() {
        let fq = FileQueue::new();
        let root = [2; 24];
        fq.add("T".into(), "T.tmp".into(), 10, root, 0, Priority::Normal, 0, 0).await.unwrap();
        fq.remove("T").await.unwrap();
        assert!(fq.find("T").await.is_none());
        assert!(fq.find_by_tth(&root).await.is_empty());
    }
}
