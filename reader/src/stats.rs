//! Per-(descriptor, scope) call statistics, accumulated while the tree is
//! built.

use std::collections::HashMap;

/// Aggregation scope of one statistics entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsScope {
    /// Among siblings under one parent node.
    Parent = 0,
    /// Within the nearest top-level ancestor.
    Frame = 1,
    /// Across the whole thread.
    Thread = 2,
}

/// What a statistics entry is anchored to, together with the descriptor id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Anchor {
    /// Child statistics under one parent node.
    Parent(u32),
    /// Top-level statistics of one thread (roots have no parent node).
    Root(u64),
    /// Statistics within one frame (top-level subtree).
    Frame(u32),
    /// Whole-thread statistics.
    Thread(u64),
}

#[derive(Debug, Clone, Copy)]
pub struct BlockStatistics {
    pub total_duration: u64,
    pub calls_number: u64,
    pub min_duration: u64,
    pub max_duration: u64,
    /// Record index achieving the minimum; ties keep the first seen.
    pub min_record: u32,
    /// Record index achieving the maximum; ties keep the first seen.
    pub max_record: u32,
}

impl BlockStatistics {
    fn seed(record: u32, duration: u64) -> Self {
        BlockStatistics {
            total_duration: duration,
            calls_number: 1,
            min_duration: duration,
            max_duration: duration,
            min_record: record,
            max_record: record,
        }
    }

    /// Truncating integer mean.
    pub fn average_duration(&self) -> u64 {
        self.total_duration / self.calls_number
    }
}

/// Statistics entries live in one vector and are shared by index among all
/// tree nodes that map to the same `(descriptor, anchor)` key.
#[derive(Debug, Default)]
pub struct StatisticsAggregator {
    entries: Vec<BlockStatistics>,
    index: HashMap<(u32, Anchor), u32>,
}

impl StatisticsAggregator {
    pub fn new() -> Self {
        StatisticsAggregator::default()
    }

    /// Account one attached record under the given anchor; returns the
    /// entry id the node should reference.
    pub fn record(&mut self, descriptor_id: u32, anchor: Anchor, record: u32, duration: u64) -> u32 {
        match self.index.get(&(descriptor_id, anchor)) {
            Some(&id) => {
                let entry = &mut self.entries[id as usize];
                entry.calls_number += 1;
                entry.total_duration += duration;
                // Strict comparisons keep the first-seen extremum on ties.
                if duration < entry.min_duration {
                    entry.min_duration = duration;
                    entry.min_record = record;
                }
                if duration > entry.max_duration {
                    entry.max_duration = duration;
                    entry.max_record = record;
                }
                id
            }
            None => {
                let id = self.entries.len() as u32;
                self.entries.push(BlockStatistics::seed(record, duration));
                self.index.insert((descriptor_id, anchor), id);
                id
            }
        }
    }

    pub fn get(&self, id: u32) -> &BlockStatistics {
        &self.entries[id as usize]
    }

    pub fn lookup(&self, descriptor_id: u32, anchor: Anchor) -> Option<&BlockStatistics> {
        self.index
            .get(&(descriptor_id, anchor))
            .map(|&id| &self.entries[id as usize])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn test_first_occurrence_seeds() {
        let mut aggregator = StatisticsAggregator::new();
        let id = aggregator.record(1, Anchor::Thread(7), 0, 40);

        let s = aggregator.get(id);
        assert_eq!(s.calls_number, 1);
        assert_eq!(s.total_duration, 40);
        assert_eq!(s.min_duration, 40);
        assert_eq!(s.max_duration, 40);
    }

    #[rstest]
    fn test_accumulation_and_extrema() {
        let mut aggregator = StatisticsAggregator::new();
        let a = aggregator.record(1, Anchor::Thread(7), 0, 40);
        let b = aggregator.record(1, Anchor::Thread(7), 1, 10);
        let c = aggregator.record(1, Anchor::Thread(7), 2, 90);
        assert_eq!(a, b);
        assert_eq!(b, c);

        let s = aggregator.get(a);
        assert_eq!(s.calls_number, 3);
        assert_eq!(s.total_duration, 140);
        assert_eq!((s.min_duration, s.min_record), (10, 1));
        assert_eq!((s.max_duration, s.max_record), (90, 2));
        assert_eq!(s.average_duration(), 46); // truncating
    }

    #[rstest]
    fn test_ties_keep_first_seen_record() {
        let mut aggregator = StatisticsAggregator::new();
        let id = aggregator.record(1, Anchor::Frame(0), 5, 30);
        aggregator.record(1, Anchor::Frame(0), 6, 30);

        let s = aggregator.get(id);
        assert_eq!(s.min_record, 5);
        assert_eq!(s.max_record, 5);
    }

    #[rstest]
    fn test_distinct_anchors_do_not_share_entries() {
        let mut aggregator = StatisticsAggregator::new();
        let a = aggregator.record(1, Anchor::Parent(0), 0, 10);
        let b = aggregator.record(1, Anchor::Parent(1), 1, 10);
        let c = aggregator.record(2, Anchor::Parent(0), 2, 10);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(aggregator.len(), 3);
    }
}
