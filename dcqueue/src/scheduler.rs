//! Chooses the next byte-range segment to hand a requesting peer
//! (spec.md §4.8), given a `QueueItem`, block size, wanted chunk size, the
//! peer's last observed speed, and (for partial sources) their bitmap of
//! owned blocks.

use std::collections::HashMap;
use std::time::Duration;

use bitvec::order::Lsb0;
use bitvec::vec::BitVec;

use crate::queue_item::{Priority, QueueItem};
use crate::roadmap::Segment;

pub const TARGET_SECONDS: u64 = 4;
pub const MIN_CHUNK: u64 = 64 * 1024;
pub const MAX_CHUNK: u64 = 8 * 1024 * 1024;

/// A running segment averaging below this (bytes/sec) is a candidate for
/// overlap displacement.
pub const SLOW_SPEED_THRESHOLD: u64 = 8 * 1024;
/// ... but only if its remaining bytes would still take longer than this to
/// finish at that speed.
pub const SLOW_ETA_THRESHOLD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingReason {
    AllSlotsTaken,
    NoFreeBlock,
    NoNeededPart,
    DownloadFinishedIdle,
}

pub type Result<T> = std::result::Result<T, SchedulingReason>;

/// `chunk(wanted, speed) := clamp(speed * TARGET_SECONDS, MIN_CHUNK,
/// MAX_CHUNK)`; falls back to `block_size` if `wanted == 0`.
pub fn chunk_size(block_size: u64, wanted: u64, speed: u64) -> u64 {
    if wanted == 0 {
        return block_size;
    }
    (speed * TARGET_SECONDS).clamp(MIN_CHUNK, MAX_CHUNK)
}

/// Converts a per-block bitmap (one bit per `block_size` block, as used by
/// PFS partial sources) into the set of byte ranges the bits cover.
pub fn bits_to_ranges(bits: &BitVec<u8, Lsb0>, block_size: u64, file_size: u64) -> Vec<Segment> {
    let mut out = Vec::new();
    let mut run_start: Option<usize> = None;
    for i in 0..bits.len() {
        if bits[i] {
            run_start.get_or_insert(i);
        } else if let Some(start) = run_start.take() {
            out.push(block_range(start, i, block_size, file_size));
        }
    }
    if let Some(start) = run_start {
        out.push(block_range(start, bits.len(), block_size, file_size));
    }
    out
}

fn block_range(start_block: usize, end_block_exclusive: usize, block_size: u64, file_size: u64) -> Segment {
    let start = start_block as u64 * block_size;
    let end = ((end_block_exclusive as u64) * block_size).min(file_size);
    Segment::new(start, end - start)
}

/// Subtracts `subtract` (assumed sorted, arbitrary overlap) from `from`
/// (a single range), returning the remaining sub-ranges.
fn subtract_ranges(from: Segment, subtract: &[Segment]) -> Vec<(u64, u64)> {
    let mut cursor = from.start;
    let end = from.end();
    let mut out = Vec::new();
    let mut sorted: Vec<Segment> = subtract.to_vec();
    sorted.sort_by_key(|s| s.start);
    for s in sorted {
        if s.end() <= cursor || s.start >= end {
            continue;
        }
        if s.start > cursor {
            out.push((cursor, s.start.min(end)));
        }
        cursor = cursor.max(s.end());
        if cursor >= end {
            break;
        }
    }
    if cursor < end {
        out.push((cursor, end));
    }
    out
}

/// Intersects a set of ranges against another set of ranges.
fn intersect_ranges(a: &[(u64, u64)], b: &[Segment]) -> Vec<(u64, u64)> {
    let mut out = Vec::new();
    for &(a_start, a_end) in a {
        for seg in b {
            let start = a_start.max(seg.start);
            let end = a_end.min(seg.end());
            if start < end {
                out.push((start, end));
            }
        }
    }
    out
}

fn align_down(x: u64, block_size: u64) -> u64 {
    (x / block_size) * block_size
}

fn align_up(x: u64, block_size: u64, file_size: u64) -> u64 {
    (((x + block_size - 1) / block_size) * block_size).min(file_size)
}

/// Picks the next segment for `item`. `last_speed` is the requesting peer's
/// recent throughput in bytes/sec, used both for chunk sizing and for
/// judging whether an already-running segment is slow enough to overlap.
pub async fn next_segment(
    item: &QueueItem,
    block_size: u64,
    wanted_size: u64,
    last_speed: u64,
    partial_bits: Option<&BitVec<u8, Lsb0>>,
) -> Result<Segment> {
    if item.is_paused().await {
        return Err(SchedulingReason::NoFreeBlock);
    }
    if item.is_finished().await {
        return Err(SchedulingReason::NoFreeBlock);
    }

    let max_chunk = block_size.max(chunk_size(block_size, wanted_size, last_speed));

    let outcome = item
        .with_inner_mut(|view| {
            if view.running.len() as u8 >= view.max_segments.max(1) && view.max_segments != 0 {
                // Slot cap reached: look for an overlap-displacement candidate
                // among the running segments before giving up.
                return match find_overlap_candidate(view.running, view.running_speeds) {
                    Some(seg) => {
                        let overlapped = overlap_same_range(seg);
                        view.running.push(overlapped);
                        Ok(overlapped)
                    }
                    None => Err(SchedulingReason::AllSlotsTaken),
                };
            }

            let Some(first_missing) = view.done.next_missing(0, 0) else {
                return Err(SchedulingReason::NoFreeBlock);
            };

            // A read-ahead hint (`QueueItem::set_hint`, consumed here) wins
            // over the earliest-gap order if it still points at a free
            // range (spec.md §4.10 step 4 / scenario S6).
            let hinted = view.hint.take().and_then(|pos| {
                let aligned = align_down(pos, block_size);
                let mut cursor = 0u64;
                while let Some(gap) = view.done.next_missing(cursor, 0) {
                    if aligned >= gap.start && aligned < gap.end() {
                        let free = subtract_ranges(gap, view.running);
                        return free.into_iter().find(|&(s, e)| s <= aligned && aligned < e).map(|(s, e)| (aligned.max(s), e));
                    }
                    cursor = gap.end();
                }
                None
            });

            // Walk all missing gaps, picking the earliest one not already
            // claimed by a running segment.
            let mut candidate: Option<(u64, u64)> = hinted;
            if candidate.is_none() {
                let mut cursor = first_missing.start;
                while let Some(gap) = view.done.next_missing(cursor, 0) {
                    let free = subtract_ranges(gap, view.running);
                    if let Some(&(s, e)) = free.first() {
                        candidate = Some((s, e));
                        break;
                    }
                    cursor = gap.end();
                }
            }

            let Some((mut start, mut end)) = candidate else {
                return match find_overlap_candidate(view.running, view.running_speeds) {
                    Some(seg) => {
                        let overlapped = overlap_same_range(seg);
                        view.running.push(overlapped);
                        Ok(overlapped)
                    }
                    None => Err(SchedulingReason::NoFreeBlock),
                };
            };

            if let Some(bits) = partial_bits {
                let wanted = vec![Segment::new(start, end - start)];
                let owned = bits_to_ranges(bits, block_size, view.size);
                let restricted = intersect_ranges(&[(start, end)], &owned);
                let _ = wanted;
                match restricted.first() {
                    Some(&(s, e)) => {
                        start = s;
                        end = e;
                    }
                    None => return Err(SchedulingReason::NoNeededPart),
                }
            }

            end = end.min(start + max_chunk);
            let aligned_start = align_down(start, block_size);
            let aligned_end = if end >= view.size { view.size } else { align_up(end, block_size, view.size) };

            let seg = Segment::new(aligned_start, aligned_end - aligned_start);
            view.running.push(seg);
            Ok(seg)
        })
        .await;

    outcome
}

/// §4.10 step 4: called by a consumer (the preview server's streaming loop)
/// to nudge the scheduler toward `pos` before it next picks a segment for
/// this item, instead of waiting for the earliest-missing-gap order to
/// reach it on its own (scenario S6).
pub async fn hint(item: &QueueItem, pos: u64, block_size: u64) {
    item.set_hint(align_down(pos, block_size)).await;
}

/// §4.8 step 4: among segments already running (and not yet themselves
/// overlapped), finds one whose last reported speed (`running_speeds`,
/// populated by `QueueItem::report_speed`) is slow enough to race a second
/// worker against. A segment with no reported speed yet is left alone —
/// there's nothing to judge it slow against.
fn find_overlap_candidate(running: &[Segment], running_speeds: &HashMap<u64, u64>) -> Option<Segment> {
    running.iter().find_map(|seg| {
        if seg.overlapped {
            return None;
        }
        let speed = *running_speeds.get(&seg.start)?;
        is_slow(*seg, speed).then_some(*seg)
    })
}

/// Given a candidate running segment's observed throughput and remaining
/// bytes, decides whether it should be displaced by a second, racing
/// worker on the same range (§4.8 step 4 / §5 "overlap displacement").
pub fn is_slow(seg: Segment, running_avg_speed: u64) -> bool {
    if running_avg_speed >= SLOW_SPEED_THRESHOLD {
        return false;
    }
    let eta = if running_avg_speed == 0 {
        Duration::from_secs(u64::MAX / 2)
    } else {
        Duration::from_secs(seg.size / running_avg_speed.max(1))
    };
    eta > SLOW_ETA_THRESHOLD
}

/// Returns the same range as `seg` with `overlapped` set, for racing a
/// second peer against a slow in-flight segment.
pub fn overlap_same_range(seg: Segment) -> Segment {
    Segment { start: seg.start, size: seg.size, overlapped: true }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue_item::QueueItem;

    fn mb(n: u64) -> u64 {
        n * 1024 * 1024
    }

    #[tokio::test]
    async fn s1_segment_allocation() {
        let item = QueueItem::new("T".into(), "T.tmp".into(), mb(10), [0; 24], Priority::Normal, false, 0, 0, 2);
        let first = next_segment(&item, 64 * 1024, mb(1), 0, None).await.unwrap();
        assert_eq!(first.start, 0);
        assert!(first.size >= 64 * 1024);
        assert!(!first.overlapped);

        let second = next_segment(&item, 64 * 1024, mb(1), 0, None).await.unwrap();
        assert!(second.start >= first.end());

        let third = next_segment(&item, 64 * 1024, mb(1), 0, None).await;
        assert_eq!(third, Err(SchedulingReason::AllSlotsTaken));
    }

    #[tokio::test]
    async fn s2_pfs_bitmap_restricts_and_then_excludes() {
        let block = 64 * 1024;
        let item = QueueItem::new("T".into(), "T.tmp".into(), block * 8, [0; 24], Priority::Normal, false, 0, 0, 4);
        item.add_done(0, block * 2).await.unwrap();

        let mut bits = BitVec::<u8, Lsb0>::repeat(false, 8);
        bits.set(0, true);
        bits.set(1, true);
        bits.set(2, true);
        bits.set(3, true);
        let seg = next_segment(&item, block, mb(1), 0, Some(&bits)).await.unwrap();
        assert_eq!(seg.start, block * 2);

        let mut narrow = BitVec::<u8, Lsb0>::repeat(false, 8);
        narrow.set(0, true);
        narrow.set(1, true);
        let result = next_segment(&item, block, mb(1), 0, Some(&narrow)).await;
        assert_eq!(result, Err(SchedulingReason::NoNeededPart));
    }

    #[tokio::test]
    async fn fully_done_item_returns_no_free_block() {
        let item = QueueItem::new("T".into(), "T.tmp".into(), 100, [0; 24], Priority::Normal, false, 0, 0, 2);
        item.add_done(0, 100).await.unwrap();
        let result = next_segment(&item, 64, mb(1), 0, None).await;
        assert_eq!(result, Err(SchedulingReason::NoFreeBlock));
    }

    #[tokio::test]
    async fn paused_item_returns_zero_size() {
        let item = QueueItem::new("T".into(), "T.tmp".into(), 100, [0; 24], Priority::Paused, false, 0, 0, 2);
        let result = next_segment(&item, 64, mb(1), 0, None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn s5_overlap_displacement_and_finished_idle() {
        let item = QueueItem::new("T".into(), "T.tmp".into(), mb(10), [0; 24], Priority::Normal, false, 0, 0, 1);
        let first = next_segment(&item, 64 * 1024, mb(1), 0, None).await.unwrap();
        assert!(!first.overlapped);

        // No reported speed yet: slot is full, no candidate looks slow.
        let still_full = next_segment(&item, 64 * 1024, mb(1), 0, None).await;
        assert_eq!(still_full, Err(SchedulingReason::AllSlotsTaken));

        // Report a slow speed with a long ETA: a second peer should now be
        // handed the same range, marked `overlapped`.
        item.report_speed(first.start, 1000).await;
        let racer = next_segment(&item, 64 * 1024, mb(1), 0, None).await.unwrap();
        assert_eq!(racer.start, first.start);
        assert_eq!(racer.size, first.size);
        assert!(racer.overlapped);

        // The fast racer wins and completes the range first.
        item.add_done(first.start, first.size).await.unwrap();
        assert_eq!(item.check_still_wanted(first).await, Err(SchedulingReason::DownloadFinishedIdle));
    }

    #[tokio::test]
    async fn hint_reroutes_the_next_segment_to_the_hinted_block() {
        let block = 64 * 1024;
        let item = QueueItem::new("T".into(), "T.tmp".into(), block * 8, [0; 24], Priority::Normal, false, 0, 0, 4);
        hint(&item, block * 5, block).await;
        let seg = next_segment(&item, block, mb(1), 0, None).await.unwrap();
        assert_eq!(seg.start, block * 5);
    }

    #[test]
    fn chunk_size_falls_back_to_block_size_when_wanted_is_zero() {
        assert_eq!(chunk_size(64 * 1024, 0, 999_999), 64 * 1024);
    }

    #[test]
    fn chunk_size_clamps_to_min_and_max() {
        assert_eq!(chunk_size(64 * 1024, mb(1), 1), MIN_CHUNK);
        assert_eq!(chunk_size(64 * 1024, mb(1), mb(100)), MAX_CHUNK);
    }

    #[test]
    fn is_slow_requires_both_low_speed_and_high_eta() {
        let seg = Segment::new(0, 1_000_000);
        assert!(is_slow(seg, 1000));
        assert!(!is_slow(seg, 1_000_000));
    }
}
