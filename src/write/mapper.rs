//! Point-to-shard mapping
//!
//! A write request is resolved into a [`ShardMapping`] before any fan-out
//! happens: every point is assigned to the shard that owns its series within
//! the shard group covering its timestamp, and points older than the
//! retention window are set aside as dropped.

use super::Point;
use crate::meta::{sort_shard_groups, ShardGroupInfo, ShardInfo, Timestamp};
use std::collections::HashMap;

/// A mapping of shards to points.
#[derive(Debug, Default)]
pub struct ShardMapping {
    n: usize,
    /// The points associated with each shard id.
    pub points: HashMap<u64, Vec<Point>>,
    /// The mapped shards, keyed by shard id.
    pub shards: HashMap<u64, ShardInfo>,
    /// Points that fell outside the retention window.
    pub dropped: Vec<Point>,
}

impl ShardMapping {
    /// Creates an empty mapping sized for `n` points.
    pub fn new(n: usize) -> Self {
        Self {
            n,
            ..Default::default()
        }
    }

    /// Adds the point to the mapping, associated with the given shard.
    pub fn map_point(&mut self, shard_info: &ShardInfo, p: Point) {
        self.points
            .entry(shard_info.id)
            .or_insert_with(|| Vec::with_capacity(self.n))
            .push(p);
        self.shards
            .entry(shard_info.id)
            .or_insert_with(|| shard_info.clone());
    }
}

/// A list of shard groups that can answer "which group covers time t".
///
/// Groups are kept sorted by `(effective_end, start_time)` so a lookup is a
/// binary search. Groups that overlap in time (a consequence of truncation)
/// defeat a binary search over one axis, so a miss inside the list's overall
/// span falls back to a linear scan instead of dropping the write.
#[derive(Debug, Default)]
pub struct SgList {
    items: Vec<ShardGroupInfo>,
    /// Set when `items` changed since the last sort.
    needs_sort: bool,
    /// Smallest start time of any item.
    earliest: Option<Timestamp>,
    /// Largest end time of any item.
    latest: Option<Timestamp>,
}

impl SgList {
    /// Reports whether some group in the list could contain a point at `t`.
    pub fn covers(&mut self, t: Timestamp) -> bool {
        !self.items.is_empty() && self.shard_group_at(t).is_some()
    }

    /// Finds a shard group that could contain a point at the given time.
    ///
    /// If several groups match, the one with the earliest effective end time
    /// wins, then the earliest start time.
    pub fn shard_group_at(&mut self, t: Timestamp) -> Option<&ShardGroupInfo> {
        if self.items.is_empty() {
            return None;
        }
        if self.needs_sort {
            sort_shard_groups(&mut self.items);
            self.needs_sort = false;
        }

        // Earliest group whose effective end lies beyond t.
        let mut idx = self.items.partition_point(|sg| sg.effective_end() <= t);

        if idx == self.items.len() || t < self.items[idx].start_time {
            // Either t isn't in the list at all, or overlapping groups broke
            // the binary search. If t falls inside the overall span a linear
            // scan finds the right group; outside it there is nothing.
            let (earliest, latest) = (self.earliest?, self.latest?);
            if t < earliest || t > latest {
                return None;
            }
            idx = self.items.iter().position(|sg| sg.contains(t))?;
        }

        Some(&self.items[idx])
    }

    /// Appends a shard group, widening the list's span if needed.
    pub fn add(&mut self, sgi: ShardGroupInfo) {
        if self.earliest.map_or(true, |e| sgi.start_time < e) {
            self.earliest = Some(sgi.start_time);
        }
        if self.latest.map_or(true, |l| sgi.end_time > l) {
            self.latest = Some(sgi.end_time);
        }
        self.items.push(sgi);
        self.needs_sort = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(id: u64, start: Timestamp, end: Timestamp) -> ShardGroupInfo {
        ShardGroupInfo {
            id,
            start_time: start,
            end_time: end,
            ..Default::default()
        }
    }

    #[test]
    fn lookup_in_sorted_disjoint_groups() {
        let mut list = SgList::default();
        list.add(group(2, 100, 200));
        list.add(group(1, 0, 100));
        list.add(group(3, 200, 300));

        assert_eq!(list.shard_group_at(0).map(|g| g.id), Some(1));
        assert_eq!(list.shard_group_at(99).map(|g| g.id), Some(1));
        assert_eq!(list.shard_group_at(100).map(|g| g.id), Some(2));
        assert_eq!(list.shard_group_at(250).map(|g| g.id), Some(3));
        assert!(list.covers(150));
    }

    #[test]
    fn lookup_outside_span_returns_none() {
        let mut list = SgList::default();
        list.add(group(1, 100, 200));
        assert!(list.shard_group_at(99).is_none());
        assert!(list.shard_group_at(200).is_none());
        assert!(!list.covers(500));
    }

    #[test]
    fn empty_list_covers_nothing() {
        let mut list = SgList::default();
        assert!(!list.covers(0));
        assert!(list.shard_group_at(0).is_none());
    }

    #[test]
    fn overlapping_groups_fall_back_to_linear_scan() {
        let mut list = SgList::default();
        // A truncated group sorts by its truncation point, leaving its real
        // interval overlapping its successor.
        let mut truncated = group(1, 0, 1000);
        truncated.truncated_at = Some(50);
        list.add(truncated);
        list.add(group(2, 100, 200));
        list.add(group(3, 200, 300));

        // Binary search over effective ends lands on a group that doesn't
        // contain t; the scan should still find the covering group.
        assert_eq!(list.shard_group_at(60).map(|g| g.id), Some(1));
        assert_eq!(list.shard_group_at(150).map(|g| g.id), Some(2));
    }

    #[test]
    fn mapping_groups_points_by_shard() {
        let shard_a = ShardInfo {
            id: 7,
            ..Default::default()
        };
        let shard_b = ShardInfo {
            id: 8,
            ..Default::default()
        };

        let mut mapping = ShardMapping::new(3);
        let p = |t| Point::new("cpu", Default::default(), Default::default(), t);
        mapping.map_point(&shard_a, p(1));
        mapping.map_point(&shard_b, p(2));
        mapping.map_point(&shard_a, p(3));

        assert_eq!(mapping.points[&7].len(), 2);
        assert_eq!(mapping.points[&8].len(), 1);
        assert_eq!(mapping.shards.len(), 2);
        // Per-shard point order follows request order.
        assert_eq!(mapping.points[&7][0].time, 1);
        assert_eq!(mapping.points[&7][1].time, 3);
    }
}
