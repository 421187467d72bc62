//! Inclusive block intervals and the cache of completed ranges.
use std::sync::Arc;

use error_stack::Result;

use crate::store::{CacheStore, CachedInterval, StoreError};

/// An inclusive block range `[start, end]`.
pub type Interval = (u64, u64);

/// Sorts and merges overlapping or adjacent intervals.
pub fn merge_intervals(intervals: &[Interval]) -> Vec<Interval> {
    let mut sorted = intervals
        .iter()
        .copied()
        .filter(|(start, end)| start <= end)
        .collect::<Vec<_>>();
    sorted.sort_unstable();

    let mut merged: Vec<Interval> = Vec::with_capacity(sorted.len());
    for (start, end) in sorted {
        match merged.last_mut() {
            Some(last) if start <= last.1.saturating_add(1) => {
                last.1 = last.1.max(end);
            }
            _ => merged.push((start, end)),
        }
    }

    merged
}

/// Returns the parts of `target` not covered by `covered`.
pub fn interval_difference(target: Interval, covered: &[Interval]) -> Vec<Interval> {
    let (start, end) = target;
    if start > end {
        return Vec::new();
    }

    let mut gaps = Vec::new();
    let mut cursor = start;

    for (covered_start, covered_end) in merge_intervals(covered) {
        if covered_end < cursor {
            continue;
        }
        if covered_start > end {
            break;
        }
        if covered_start > cursor {
            gaps.push((cursor, covered_start - 1));
        }
        if covered_end >= end {
            return gaps;
        }
        cursor = covered_end + 1;
    }

    gaps.push((cursor, end));
    gaps
}

/// Number of blocks covered by the intervals.
pub fn interval_sum(intervals: &[Interval]) -> u64 {
    merge_intervals(intervals)
        .iter()
        .map(|(start, end)| end - start + 1)
        .sum()
}

/// Splits `[start, end]` into chunks ending at most `max_size` blocks after they start.
pub fn split_interval(interval: Interval, max_size: u64) -> Vec<Interval> {
    let (start, end) = interval;
    let max_size = max_size.max(1);

    let mut chunks = Vec::new();
    let mut from = start;
    while from <= end {
        let to = from.saturating_add(max_size).min(end);
        chunks.push((from, to));
        match to.checked_add(1) {
            Some(next) => from = next,
            None => break,
        }
    }
    chunks
}

/// Tracks which block ranges are fully synced, per source key.
#[derive(Clone)]
pub struct IntervalCache {
    store: Arc<dyn CacheStore>,
}

impl IntervalCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    /// Completed intervals for `key` overlapping `range`.
    pub async fn intervals_for(
        &self,
        key: &str,
        range: Interval,
    ) -> Result<Vec<Interval>, StoreError> {
        let intervals = self.store.get_cached_intervals(key).await?;
        let intervals = intervals
            .iter()
            .map(|interval| (interval.start_block, interval.end_block))
            .filter(|(start, end)| *start <= range.1 && *end >= range.0)
            .collect::<Vec<_>>();
        Ok(merge_intervals(&intervals))
    }

    /// Ranges in `range` still missing for at least one of the keys.
    pub async fn gaps(&self, keys: &[String], range: Interval) -> Result<Vec<Interval>, StoreError> {
        let mut gaps = Vec::new();
        for key in keys {
            let covered = self.intervals_for(key, range).await?;
            gaps.extend(interval_difference(range, &covered));
        }
        Ok(merge_intervals(&gaps))
    }

    pub async fn record_complete(
        &self,
        key: &str,
        interval: Interval,
        end_block_timestamp: u64,
    ) -> Result<(), StoreError> {
        self.store
            .insert_cached_interval(CachedInterval {
                key: key.to_string(),
                start_block: interval.0,
                end_block: interval.1,
                end_block_timestamp,
            })
            .await
    }
}
