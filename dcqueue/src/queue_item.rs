//! The unit of queued work (spec.md §3/§4.5): target path, size, TTH root,
//! priority, flags, segment set, and source set.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Instant;

use bitvec::order::Lsb0;
use bitvec::vec::BitVec;
use tokio::sync::RwLock;

use crate::roadmap::{RoadMap, Segment};
use crate::scheduler::SchedulingReason;
use crate::tigertree::{Hash192, TigerTree};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    Paused = 0,
    Lowest = 1,
    Low = 2,
    Normal = 3,
    High = 4,
    Highest = 5,
}

impl Priority {
    pub const ALL_DESCENDING: [Priority; 6] =
        [Priority::Highest, Priority::High, Priority::Normal, Priority::Low, Priority::Lowest, Priority::Paused];

    pub fn from_i64(v: i64) -> Self {
        match v {
            0 => Priority::Paused,
            1 => Priority::Lowest,
            2 => Priority::Low,
            3 => Priority::Normal,
            4 => Priority::High,
            _ => Priority::Highest,
        }
    }
}

/// `QueueItem` flag bits. Plain associated constants rather than a
/// `bitflags`-derived type, matching the teacher's preference for hand
/// rolled small bitsets over pulling in a new crate for them.
pub mod item_flags {
    pub const USER_LIST: u16 = 1 << 0;
    pub const PARTIAL_LIST: u16 = 1 << 1;
    pub const USER_CHECK: u16 = 1 << 2;
    pub const TEXT: u16 = 1 << 3;
    pub const DCLST: u16 = 1 << 4;
    pub const MATCH_QUEUE: u16 = 1 << 5;
}

pub mod source_flags {
    pub const PARTIAL: u8 = 1 << 0;
    pub const NO_TREE: u8 = 1 << 1;
    pub const FILE_NOT_AVAILABLE: u8 = 1 << 2;
    pub const TTH_INCONSISTENCY: u8 = 1 << 3;
}

/// CID-shaped durable user identity. Copy + cheap to hold without
/// extending any connection's lifetime (design note, spec.md §9: the
/// connection layer holds only an id + target string, never a back-pointer
/// into the queue).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserId(pub [u8; 24]);

impl UserId {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut id = [0u8; 24];
        let n = bytes.len().min(24);
        id[..n].copy_from_slice(&bytes[..n]);
        UserId(id)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct PartialSource {
    pub my_nick: String,
    pub hub_ip_port: String,
    pub ip: Ipv4Addr,
    pub udp_port: u16,
    pub parts: BitVec<u8, Lsb0>,
    pub pending_query_count: u32,
    pub next_query_time: Instant,
}

#[derive(Debug, Clone)]
pub struct SourceRec {
    pub flags: u8,
    pub partial: Option<PartialSource>,
}

impl SourceRec {
    pub fn is_partial(&self) -> bool {
        self.flags & source_flags::PARTIAL != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    File,
    Tree,
    FullList,
    PartialList,
}

#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub user: UserId,
    pub segment: Segment,
    pub transfer_type: TransferType,
    pub overlap: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("target already queued: {0}")]
    DuplicateTarget(String),
    #[error("size mismatch for {target}: existing {existing}, new {new}")]
    SizeMismatch { target: String, existing: u64, new: u64 },
    #[error("TTH mismatch for {target}")]
    TthMismatch { target: String },
    #[error("item already finished: {0}")]
    AlreadyFinished(String),
    #[error("source already present for {0:?}")]
    DuplicateSource(UserId),
    #[error("no such source {0:?} for item")]
    NoSourceForUser(UserId),
    #[error("target removed: {0}")]
    TargetRemoved(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug)]
struct Inner {
    target: String,
    tmp_target: String,
    size: u64,
    root: Hash192,
    priority: Priority,
    auto_priority: bool,
    flags: u16,
    added: u64,
    done: RoadMap,
    running: Vec<Segment>,
    /// Last observed bytes/sec per running segment, keyed by `Segment::start`;
    /// feeds overlap-displacement (`is_slow`) and `evaluate_slow_source`.
    running_speeds: HashMap<u64, u64>,
    sources: HashMap<UserId, SourceRec>,
    bad_sources: HashMap<UserId, SourceRec>,
    max_segments: u8,
    tree: Option<TigerTree>,
    dirty: bool,
    segments_dirty: bool,
    last_error: Option<SchedulingReason>,
    /// Byte position the scheduler should prefer on its next call, set by
    /// `QueueItem::set_hint` (the preview server's read-ahead nudge) and
    /// consumed once by `scheduler::next_segment`.
    hint: Option<u64>,
}

/// Outcome of `QueueItem::evaluate_slow_source` (spec.md §9's third Open
/// Question, resolved against `QueueManager::dropSource`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlowSourceAction {
    Keep,
    Disconnect,
    Remove,
}

/// Shared handle to a queue item. Cloning shares the same underlying
/// state (`Arc`); this is the idiomatic replacement for the original's
/// intrusive reference counting (spec.md §9).
#[derive(Debug, Clone)]
pub struct QueueItem {
    inner: std::sync::Arc<RwLock<Inner>>,
}

impl QueueItem {
    pub fn new(
        target: String,
        tmp_target: String,
        size: u64,
        root: Hash192,
        priority: Priority,
        auto_priority: bool,
        flags: u16,
        added: u64,
        max_segments: u8,
    ) -> Self {
        Self {
            inner: std::sync::Arc::new(RwLock::new(Inner {
                target,
                tmp_target,
                size,
                root,
                priority,
                auto_priority,
                flags,
                added,
                done: RoadMap::new(size),
                running: Vec::new(),
                running_speeds: HashMap::new(),
                sources: HashMap::new(),
                bad_sources: HashMap::new(),
                max_segments,
                tree: None,
                dirty: false,
                segments_dirty: false,
                last_error: None,
                hint: None,
            })),
        }
    }

    pub fn handle_eq(&self, other: &QueueItem) -> bool {
        std::sync::Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub async fn target(&self) -> String {
        self.inner.read().await.target.clone()
    }

    /// Non-blocking best-effort read, for contexts (e.g. `VecDeque::retain`)
    /// that cannot await. Returns `None` if the item is write-locked.
    pub fn try_target(&self) -> Option<String> {
        self.inner.try_read().ok().map(|g| g.target.clone())
    }

    pub async fn root(&self) -> Hash192 {
        self.inner.read().await.root
    }

    pub async fn size(&self) -> u64 {
        self.inner.read().await.size
    }

    pub async fn priority(&self) -> Priority {
        self.inner.read().await.priority
    }

    pub async fn set_priority(&self, priority: Priority) {
        let mut inner = self.inner.write().await;
        inner.priority = priority;
        inner.dirty = true;
    }

    pub async fn flags(&self) -> u16 {
        self.inner.read().await.flags
    }

    pub async fn max_segments(&self) -> u8 {
        self.inner.read().await.max_segments
    }

    pub async fn set_max_segments(&self, n: u8) {
        self.inner.write().await.max_segments = n;
    }

    pub async fn set_tree(&self, tree: TigerTree) {
        let mut inner = self.inner.write().await;
        inner.tree = Some(tree);
        inner.dirty = true;
    }

    pub async fn done_bytes(&self) -> u64 {
        self.inner.read().await.done.bytes_done()
    }

    pub async fn tmp_target(&self) -> String {
        self.inner.read().await.tmp_target.clone()
    }

    /// True iff `[start, start+len)` is already on disk, for the preview
    /// server's read-ahead check before streaming a range.
    pub async fn contains_range(&self, start: u64, len: u64) -> bool {
        self.inner.read().await.done.contains(start, len)
    }

    /// First gap at or after `start`, for the preview server to know how
    /// long to wait before the next byte it needs arrives.
    pub async fn next_missing_from(&self, start: u64) -> Option<Segment> {
        self.inner.read().await.done.next_missing(start, 0)
    }

    /// Forwards to `RoadMap::add`; marks the item's segments dirty (a
    /// cheaper persistence tier than the structural `dirty` flag — see
    /// `Core::flush_dirty`).
    pub async fn add_done(&self, start: u64, size: u64) -> std::result::Result<(), crate::roadmap::RoadMapError> {
        let mut inner = self.inner.write().await;
        inner.done.add(start, size)?;
        inner.running.retain(|s| !(s.start == start && s.size == size));
        inner.running_speeds.remove(&start);
        inner.segments_dirty = true;
        Ok(())
    }

    /// Nudges the scheduler toward `pos` on its next call, for the preview
    /// server's read-ahead (spec.md §4.10 step 4 / scenario S6). Consumed
    /// (and cleared) the next time `scheduler::next_segment` runs.
    pub async fn set_hint(&self, pos: u64) {
        self.inner.write().await.hint = Some(pos);
    }

    /// Records a transfer worker's currently observed throughput for the
    /// running segment starting at `start`, for overlap-displacement
    /// (`is_slow`) and slow-source dropping (`evaluate_slow_source`).
    pub async fn report_speed(&self, start: u64, speed: u64) {
        self.inner.write().await.running_speeds.insert(start, speed);
    }

    /// Checked by a transfer worker before writing more bytes for `seg`:
    /// once another racer in an overlap-displacement pair has already
    /// completed this range, the loser gets `DownloadFinishedIdle` instead
    /// of continuing to write (spec.md §8 boundary behaviour / scenario S5).
    pub async fn check_still_wanted(&self, seg: Segment) -> std::result::Result<(), SchedulingReason> {
        if self.inner.read().await.done.contains(seg.start, seg.size) {
            Err(SchedulingReason::DownloadFinishedIdle)
        } else {
            Ok(())
        }
    }

    /// `dropSource` (spec.md §9's third Open Question): `disconnect_file_speed`
    /// gates whether the whole check runs at all — the item's *overall*
    /// speed (summed across its running segments) must exceed it, `0`
    /// disables the gate; once past the gate, `remove_speed` decides
    /// whether this particular source is removed outright or merely has its
    /// connection dropped. Grounded on `QueueManager::dropSource`.
    pub async fn evaluate_slow_source(
        &self,
        last_speed: u64,
        disconnect_file_speed: u64,
        remove_speed: u64,
        drop_multisource_only: bool,
    ) -> SlowSourceAction {
        let inner = self.inner.read().await;
        if inner.sources.len() < 2 {
            return SlowSourceAction::Keep;
        }
        if drop_multisource_only && inner.running.len() <= 1 {
            return SlowSourceAction::Keep;
        }
        let overall_speed: u64 = inner.running_speeds.values().sum();
        if disconnect_file_speed != 0 && overall_speed <= disconnect_file_speed {
            return SlowSourceAction::Keep;
        }
        if last_speed < remove_speed {
            SlowSourceAction::Remove
        } else {
            SlowSourceAction::Disconnect
        }
    }

    pub async fn is_finished(&self) -> bool {
        self.inner.read().await.done.is_finished()
    }

    pub async fn is_running(&self) -> bool {
        !self.inner.read().await.running.is_empty()
    }

    pub async fn is_paused(&self) -> bool {
        self.inner.read().await.priority == Priority::Paused
    }

    pub async fn add_source(&self, user: UserId, flags: u8) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.sources.contains_key(&user) {
            return Err(QueueError::DuplicateSource(user));
        }
        inner.bad_sources.remove(&user);
        inner.sources.insert(user, SourceRec { flags, partial: None });
        inner.dirty = true;
        Ok(())
    }

    pub async fn remove_source(&self, user: UserId) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.sources.remove(&user).is_none() && inner.bad_sources.remove(&user).is_none() {
            return Err(QueueError::NoSourceForUser(user));
        }
        inner.dirty = true;
        Ok(())
    }

    pub async fn mark_bad(&self, user: UserId) -> Result<()> {
        let mut inner = self.inner.write().await;
        let rec = inner.sources.remove(&user).ok_or(QueueError::NoSourceForUser(user))?;
        inner.bad_sources.insert(user, rec);
        inner.dirty = true;
        Ok(())
    }

    pub async fn is_bad(&self, user: &UserId) -> bool {
        self.inner.read().await.bad_sources.contains_key(user)
    }

    pub async fn online_source_count(&self) -> usize {
        self.inner.read().await.sources.len()
    }

    pub async fn update_partial(&self, user: UserId, parts: BitVec<u8, Lsb0>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let rec = inner.sources.get_mut(&user).ok_or(QueueError::NoSourceForUser(user))?;
        rec.flags |= source_flags::PARTIAL;
        match &mut rec.partial {
            Some(p) => p.parts = parts,
            None => {
                rec.partial = Some(PartialSource {
                    my_nick: String::new(),
                    hub_ip_port: String::new(),
                    ip: Ipv4Addr::UNSPECIFIED,
                    udp_port: 0,
                    parts,
                    pending_query_count: 0,
                    next_query_time: Instant::now(),
                })
            }
        }
        Ok(())
    }

    pub async fn has_source(&self, user: UserId) -> bool {
        self.inner.read().await.sources.contains_key(&user)
    }

    /// Partial sources whose `next_query_time` has elapsed, for the PFS
    /// periodic task.
    pub async fn partial_sources_due(&self) -> Vec<(UserId, Instant)> {
        let inner = self.inner.read().await;
        let now = Instant::now();
        inner
            .sources
            .iter()
            .filter_map(|(user, rec)| {
                let partial = rec.partial.as_ref()?;
                if partial.next_query_time <= now && partial.pending_query_count < crate::pfs::MAX_PENDING_QUERIES {
                    Some((*user, partial.next_query_time))
                } else {
                    None
                }
            })
            .collect()
    }

    pub async fn partial_source_addr(&self, user: UserId) -> Option<std::net::SocketAddrV4> {
        let inner = self.inner.read().await;
        let partial = inner.sources.get(&user)?.partial.as_ref()?;
        Some(std::net::SocketAddrV4::new(partial.ip, partial.udp_port))
    }

    pub async fn mark_query_sent(&self, user: UserId, backoff: std::time::Duration) {
        let mut inner = self.inner.write().await;
        if let Some(rec) = inner.sources.get_mut(&user) {
            if let Some(partial) = &mut rec.partial {
                partial.next_query_time = Instant::now() + backoff;
                partial.pending_query_count += 1;
            }
        }
    }

    /// Our own bitmap of owned blocks, one bit per `block_size` block
    /// (LSB-first within each byte per the PFS wire format), derived from
    /// `done` rather than stored separately.
    pub async fn current_bitmap(&self) -> BitVec<u8, Lsb0> {
        let inner = self.inner.read().await;
        let block_size = crate::tigertree::choose_block_size(inner.size);
        let num_blocks = ((inner.size + block_size - 1) / block_size).max(1) as usize;
        let mut bits = BitVec::<u8, Lsb0>::repeat(false, num_blocks);
        let mut cursor = 0u64;
        while let Some(gap) = inner.done.next_missing(cursor, 0) {
            let start_block = (cursor / block_size) as usize;
            let end_block = (gap.start / block_size) as usize;
            for b in start_block..end_block {
                bits.set(b, true);
            }
            cursor = gap.end();
        }
        let start_block = (cursor / block_size) as usize;
        for b in start_block..num_blocks {
            bits.set(b, true);
        }
        bits
    }

    pub async fn last_error(&self) -> Option<SchedulingReason> {
        self.inner.read().await.last_error
    }

    pub(crate) async fn set_last_error(&self, reason: Option<SchedulingReason>) {
        self.inner.write().await.last_error = reason;
    }

    pub async fn dirty(&self) -> bool {
        self.inner.read().await.dirty
    }

    pub async fn clear_dirty(&self) {
        self.inner.write().await.dirty = false;
    }

    /// True once `done` grew since the last `clear_segments_dirty` without
    /// any structural field changing (see `Core::flush_dirty`'s cheaper
    /// `merge_queue_all_segments` tier).
    pub async fn segments_dirty(&self) -> bool {
        self.inner.read().await.segments_dirty
    }

    pub async fn clear_segments_dirty(&self) {
        self.inner.write().await.segments_dirty = false;
    }

    pub async fn snapshot(&self) -> QueueItemSnapshot {
        let inner = self.inner.read().await;
        let mut done_ranges: Vec<SegmentRecord> = Vec::new();
        let mut cursor = 0u64;
        while let Some(seg) = inner.done.next_missing(cursor, 0) {
            if seg.start > cursor {
                done_ranges.push(SegmentRecord { start: cursor, end: seg.start });
            }
            cursor = seg.end();
        }
        if cursor < inner.size {
            done_ranges.push(SegmentRecord { start: cursor, end: inner.size });
        }
        QueueItemSnapshot {
            target: inner.target.clone(),
            tmp_target: inner.tmp_target.clone(),
            size: inner.size,
            root: inner.root,
            priority: inner.priority,
            auto_priority: inner.auto_priority,
            flags: inner.flags,
            added: inner.added,
            done_ranges,
            max_segments: inner.max_segments,
            sources: inner
                .sources
                .keys()
                .map(|u| SourceRecord { user_id: *u, bad: false, flags: inner.sources[u].flags })
                .chain(inner.bad_sources.keys().map(|u| SourceRecord { user_id: *u, bad: true, flags: inner.bad_sources[u].flags }))
                .collect(),
        }
    }

    // --- accessors used by the scheduler (crate-internal) ---

    pub(crate) async fn with_inner_mut<R>(&self, f: impl FnOnce(&mut InnerView) -> R) -> R {
        let mut inner = self.inner.write().await;
        let mut view = InnerView {
            size: inner.size,
            done: &inner.done,
            running: &mut inner.running,
            running_speeds: &inner.running_speeds,
            max_segments: inner.max_segments,
            priority: inner.priority,
            hint: &mut inner.hint,
        };
        f(&mut view)
    }
}

/// Narrow mutable view into a locked `QueueItem`, exposed only to the
/// scheduler module so it never needs to know the rest of `Inner`'s shape.
pub struct InnerView<'a> {
    pub size: u64,
    pub done: &'a RoadMap,
    pub running: &'a mut Vec<Segment>,
    pub running_speeds: &'a HashMap<u64, u64>,
    pub max_segments: u8,
    pub priority: Priority,
    pub hint: &'a mut Option<u64>,
}

/// Flattened persistence shape for §6's catalogue/XML interfaces.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItemSnapshot {
    pub target: String,
    pub tmp_target: String,
    pub size: u64,
    pub root: Hash192,
    pub priority: Priority,
    pub auto_priority: bool,
    pub flags: u16,
    pub added: u64,
    pub done_ranges: Vec<SegmentRecord>,
    pub max_segments: u8,
    pub sources: Vec<SourceRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRecord {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub user_id: UserId,
    pub bad: bool,
    pub flags: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn source_lifecycle_never_leaves_a_user_in_both_maps() {
        let item = QueueItem::new("T".into(), "T.tmp".into(), 100, [0u8; 24], Priority::Normal, true, 0, 0, 3);
        let user = UserId::from_bytes(b"abc");
        item.add_source(user, 0).await.unwrap();
        assert_eq!(item.online_source_count().await, 1);
        item.mark_bad(user).await.unwrap();
        assert!(item.is_bad(&user).await);
        assert_eq!(item.online_source_count().await, 0);
    }

    #[tokio::test]
    async fn evaluate_slow_source_requires_multiple_sources() {
        let item = QueueItem::new("T".into(), "T.tmp".into(), 100, [0u8; 24], Priority::Normal, true, 0, 0, 3);
        let user = UserId::from_bytes(b"u1");
        item.add_source(user, 0).await.unwrap();
        assert_eq!(item.evaluate_slow_source(10, 0, 1000, false).await, SlowSourceAction::Keep);
    }

    #[tokio::test]
    async fn evaluate_slow_source_keeps_below_disconnect_file_speed() {
        let item = QueueItem::new("T".into(), "T.tmp".into(), 100, [0u8; 24], Priority::Normal, true, 0, 0, 3);
        item.add_source(UserId::from_bytes(b"u1"), 0).await.unwrap();
        item.add_source(UserId::from_bytes(b"u2"), 0).await.unwrap();
        item.with_inner_mut(|v| v.running.push(Segment::new(0, 10))).await;
        item.report_speed(0, 50).await;
        // overall speed (50) does not exceed disconnect_file_speed (1000): gate doesn't open.
        assert_eq!(item.evaluate_slow_source(10, 1000, 500, false).await, SlowSourceAction::Keep);
    }

    #[tokio::test]
    async fn evaluate_slow_source_removes_below_remove_speed_once_gated() {
        let item = QueueItem::new("T".into(), "T.tmp".into(), 100, [0u8; 24], Priority::Normal, true, 0, 0, 3);
        item.add_source(UserId::from_bytes(b"u1"), 0).await.unwrap();
        item.add_source(UserId::from_bytes(b"u2"), 0).await.unwrap();
        item.with_inner_mut(|v| v.running.push(Segment::new(0, 10))).await;
        item.report_speed(0, 2000).await;
        assert_eq!(item.evaluate_slow_source(10, 1000, 500, false).await, SlowSourceAction::Remove);
    }

    #[tokio::test]
    async fn evaluate_slow_source_merely_disconnects_above_remove_speed() {
        let item = QueueItem::new("T".into(), "T.tmp".into(), 100, [0u8; 24], Priority::Normal, true, 0, 0, 3);
        item.add_source(UserId::from_bytes(b"u1"), 0).await.unwrap();
        item.add_source(UserId::from_bytes(b"u2"), 0).await.unwrap();
        item.with_inner_mut(|v| v.running.push(Segment::new(0, 10))).await;
        item.report_speed(0, 2000).await;
        assert_eq!(item.evaluate_slow_source(800, 1000, 500, false).await, SlowSourceAction::Disconnect);
    }

    #[tokio::test]
    async fn done_and_running_stay_disjoint() {
        let item = QueueItem::new("T".into(), "T.tmp".into(), 100, [0u8; 24], Priority::Normal, true, 0, 0, 3);
        item.with_inner_mut(|v| v.running.push(Segment::new(0, 10))).await;
        item.add_done(0, 10).await.unwrap();
        let still_running = item.with_inner_mut(|v| v.running.clone()).await;
        assert!(still_running.is_empty());
    }
}
