//! Inverted index: for each user, the ordered list of `QueueItem`s they can
//! serve per priority, plus the single item currently running per user
//! (spec.md §4.7).

use std::collections::{HashMap, VecDeque};

use bitvec::order::Lsb0;
use bitvec::vec::BitVec;
use tokio::sync::RwLock;

use crate::file_queue::FileQueue;
use crate::queue_item::{Priority, QueueItem, SlowSourceAction, UserId};
use crate::roadmap::Segment;
use crate::scheduler::{self, SchedulingReason};
use crate::tigertree::choose_block_size;

struct Inner {
    by_priority: HashMap<Priority, HashMap<UserId, VecDeque<QueueItem>>>,
    running: HashMap<UserId, QueueItem>,
}

/// Lives under the same lock discipline as `FileQueue` (§5: "protected by
/// `g_csQI`", generalized here to "never acquired while holding a narrower
/// lock than `FileQueue`'s").
pub struct UserQueue {
    inner: RwLock<Inner>,
}

impl UserQueue {
    pub fn new() -> Self {
        Self { inner: RwLock::new(Inner { by_priority: HashMap::new(), running: HashMap::new() }) }
    }

    /// Registers that `user` is a source for `item` at its current
    /// priority. Pushed to the back by default; pushed to the front if the
    /// item already has downloaded bytes or carries a priority-delivery
    /// flag (`USER_CHECK`), so resumed files recover quickly — see
    /// DESIGN.md for why this reads `has_downloaded_bytes` rather than
    /// `calcAverageSpeedAndCalcAndGetDownloadedBytesL() > 0` directly.
    pub async fn add_source(&self, user: UserId, item: QueueItem) {
        let priority = item.priority().await;
        let push_front = item.done_bytes().await > 0
            || item.flags().await & crate::queue_item::item_flags::USER_CHECK != 0;

        let mut inner = self.inner.write().await;
        let deque = inner.by_priority.entry(priority).or_default().entry(user).or_default();
        if push_front {
            deque.push_front(item);
        } else {
            deque.push_back(item);
        }
    }

    pub async fn remove_source(&self, user: UserId, target: &str) {
        let mut inner = self.inner.write().await;
        for per_user in inner.by_priority.values_mut() {
            if let Some(deque) = per_user.get_mut(&user) {
                deque.retain(|i| {
                    // Best-effort target compare without async in retain;
                    // caller is expected to also call `QueueItem::remove_source`.
                    !matches!(i.try_target(), Some(t) if t == target)
                });
            }
        }
        if matches!(inner.running.get(&user).and_then(|i| i.try_target()), Some(t) if t == target) {
            inner.running.remove(&user);
        }
    }

    pub async fn running_for(&self, user: &UserId) -> Option<QueueItem> {
        self.inner.read().await.running.get(user).cloned()
    }

    /// `next_for(user, min_priority, wanted_size, last_speed, allow_remove)`:
    /// scans priorities high→low down to `min_priority`, skips items whose
    /// scheduler call returns a zero-sized segment (recording the reason on
    /// the item's `last_error`), evicts partial sources with no overlapping
    /// blocks left when `allow_remove`, enforces `FILE_SLOTS` via
    /// `FileQueue::running_count`, and — also gated on `allow_remove` — runs
    /// `dropSource` against the user's currently running item before
    /// scheduling anything new (spec.md §9 third Open Question).
    #[allow(clippy::too_many_arguments)]
    pub async fn next_for(
        &self,
        user: UserId,
        min_priority: Priority,
        wanted_size: u64,
        last_speed: u64,
        allow_remove: bool,
        file_queue: &FileQueue,
        file_slots: usize,
        disconnect_file_speed: u64,
        remove_speed: u64,
        drop_multisource_only: bool,
        partial_bits_of: impl Fn(&QueueItem) -> Option<BitVec<u8, Lsb0>>,
    ) -> Option<(QueueItem, Segment)> {
        if file_queue.running_count(Some(file_slots)).await >= file_slots {
            return None;
        }

        if allow_remove {
            let running_item = self.inner.read().await.running.get(&user).cloned();
            if let Some(item) = running_item {
                match item.evaluate_slow_source(last_speed, disconnect_file_speed, remove_speed, drop_multisource_only).await {
                    SlowSourceAction::Remove => {
                        let _ = item.remove_source(user).await;
                        self.remove_source(user, &item.target().await).await;
                    }
                    SlowSourceAction::Disconnect => {
                        self.clear_running(&user).await;
                    }
                    SlowSourceAction::Keep => {}
                }
            }
        }

        let mut priorities = Priority::ALL_DESCENDING.to_vec();
        priorities.retain(|p| *p >= min_priority);

        for priority in priorities {
            let candidates: Vec<QueueItem> = {
                let inner = self.inner.read().await;
                match inner.by_priority.get(&priority).and_then(|m| m.get(&user)) {
                    Some(deque) => deque.iter().cloned().collect(),
                    None => continue,
                }
            };

            for item in candidates {
                let bits = partial_bits_of(&item);
                let block_size = choose_block_size(item.size().await);

                match scheduler::next_segment(&item, block_size, wanted_size, last_speed, bits.as_ref()).await {
                    Ok(seg) => {
                        item.set_last_error(None).await;
                        self.inner.write().await.running.insert(user, item.clone());
                        return Some((item, seg));
                    }
                    Err(SchedulingReason::NoNeededPart) if allow_remove => {
                        let _ = item.remove_source(user).await;
                        self.remove_source(user, &item.target().await).await;
                        item.set_last_error(Some(SchedulingReason::NoNeededPart)).await;
                    }
                    Err(reason) => {
                        item.set_last_error(Some(reason)).await;
                    }
                }
            }
        }
        None
    }

    pub async fn clear_running(&self, user: &UserId) {
        self.inner.write().await.running.remove(user);
    }
}

impl Default for UserQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue_item::QueueItem;

    #[tokio::test]
    async fn resumed_item_with_downloaded_bytes_jumps_the_queue() {
        let uq = UserQueue::new();
        let user = UserId::from_bytes(b"u1");

        let fresh = QueueItem::new("A".into(), "A.tmp".into(), 100, [1; 24], Priority::Normal, true, 0, 0, 1);
        let resumed = QueueItem::new("B".into(), "B.tmp".into(), 100, [2; 24], Priority::Normal, true, 0, 0, 1);
        resumed.add_done(0, 10).await.unwrap();

        uq.add_source(user, fresh.clone()).await;
        uq.add_source(user, resumed.clone()).await;

        let inner = uq.inner.read().await;
        let deque = inner.by_priority[&Priority::Normal].get(&user).unwrap();
        assert_eq!(deque.front().unwrap().target().await, "B");
    }
}
