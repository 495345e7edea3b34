//! Per-thread call-tree reconstruction.
//!
//! Records arrive as a flat begin-ordered stream per thread. An ancestor
//! stack turns containment into nesting; a block that outlives the top of
//! the stack adopts the overlapped ancestors' trailing children and takes
//! their place. The result is deterministic for a given input.

use std::collections::{BTreeMap, HashMap};

use profile_format::types::parse_context_switch;
use profile_format::{BlockKind, BlockRecord, CaptureDump, ContextSwitchEvent};
use tracing::{debug, warn};

use crate::stats::{Anchor, StatisticsAggregator};
use crate::{ReaderError, Result};

/// One node of a thread's call tree. Indices refer into
/// [`ProfileReport::nodes`] and [`CaptureDump::records`].
#[derive(Debug)]
pub struct TreeNode {
    /// Index of the backing record in the dump.
    pub record: u32,
    pub parent: Option<u32>,
    /// Child node ids, ordered by begin time.
    pub children: Vec<u32>,
    /// Height of the subtree below this node; leaves are 0. Saturates at
    /// `u16::MAX` for degenerate nesting deeper than that.
    pub subtree_depth: u16,
    /// Statistics entry ids, indexed by [`StatsScope`].
    ///
    /// [`StatsScope`]: crate::stats::StatsScope
    pub stats: [u32; 3],
}

/// Everything reconstructed for one thread.
#[derive(Debug)]
pub struct ThreadContext {
    pub thread_id: u64,
    /// Empty when no thread-name record was captured.
    pub name: String,
    /// Top-level node ids, ordered by begin time.
    pub roots: Vec<u32>,
    /// Record indices of event-kind marks, kept out of the tree.
    pub events: Vec<u32>,
    /// Record indices of value samples.
    pub values: Vec<u32>,
    pub context_switches: Vec<ContextSwitchEvent>,
    /// Total time covered by top-level blocks, overlaps counted once.
    pub active_time: u64,
    /// Deepest nesting level; a lone root counts as 1.
    pub max_depth: u16,
}

/// A decoded dump together with its reconstructed trees and statistics.
#[derive(Debug)]
pub struct ProfileReport {
    pub dump: CaptureDump,
    pub nodes: Vec<TreeNode>,
    /// One context per thread, ordered by thread id.
    pub threads: Vec<ThreadContext>,
    pub stats: StatisticsAggregator,
}

impl ProfileReport {
    pub fn node(&self, id: u32) -> &TreeNode {
        &self.nodes[id as usize]
    }

    pub fn record_of(&self, node: &TreeNode) -> &BlockRecord {
        &self.dump.records[node.record as usize]
    }

    pub fn thread(&self, thread_id: u64) -> Option<&ThreadContext> {
        self.threads.iter().find(|t| t.thread_id == thread_id)
    }
}

/// Build the full report in one shot.
pub fn build_report(dump: CaptureDump) -> ProfileReport {
    match build_report_with(dump, &mut |_| true) {
        Ok(report) => report,
        Err(_) => unreachable!("checkpoint never cancels"),
    }
}

/// Build the report with a progress checkpoint called between per-thread
/// units. The argument is the percentage of threads finished; returning
/// false abandons the build with [`ReaderError::Interrupted`].
pub fn build_report_with(
    dump: CaptureDump,
    checkpoint: &mut dyn FnMut(u8) -> bool,
) -> Result<ProfileReport> {
    let mut sorter = ThreadSorter::default();
    for (index, record) in dump.records.iter().enumerate() {
        sorter.classify(&dump, index as u32, record);
    }

    let names: HashMap<u64, String> = dump
        .thread_names()
        .into_iter()
        .map(|(id, name)| (id, name.to_owned()))
        .collect();

    let mut nodes = Vec::new();
    let mut stats = StatisticsAggregator::new();
    let mut threads = Vec::with_capacity(sorter.threads.len());
    let total = sorter.threads.len();

    for (done, (thread_id, pending)) in sorter.threads.into_iter().enumerate() {
        let context = build_thread(
            &dump,
            thread_id,
            names.get(&thread_id).cloned().unwrap_or_default(),
            pending,
            &mut nodes,
            &mut stats,
        );
        debug!(
            thread_id,
            roots = context.roots.len(),
            max_depth = context.max_depth,
            "thread tree built"
        );
        threads.push(context);
        let percent = ((done + 1) * 100 / total.max(1)) as u8;
        if !checkpoint(percent) {
            return Err(ReaderError::Interrupted);
        }
    }

    Ok(ProfileReport {
        dump,
        nodes,
        threads,
        stats,
    })
}

/// Per-thread record lists accumulated during the classification pass.
#[derive(Debug, Default)]
struct PendingThread {
    blocks: Vec<u32>,
    events: Vec<u32>,
    values: Vec<u32>,
    context_switches: Vec<ContextSwitchEvent>,
}

#[derive(Debug, Default)]
struct ThreadSorter {
    threads: BTreeMap<u64, PendingThread>,
}

impl ThreadSorter {
    fn classify(&mut self, dump: &CaptureDump, index: u32, record: &BlockRecord) {
        if record.is_thread_name() {
            // Names are gathered separately; still registers the thread.
            self.threads.entry(record.thread_id).or_default();
            return;
        }
        if record.is_context_switch() {
            match parse_context_switch(record, &dump.arena) {
                Some(cs) => self
                    .threads
                    .entry(record.thread_id)
                    .or_default()
                    .context_switches
                    .push(cs),
                None => warn!(index, "malformed context switch dropped"),
            }
            return;
        }
        if record.end < record.begin {
            warn!(
                index,
                begin = record.begin,
                end = record.end,
                "inverted interval dropped"
            );
            return;
        }
        let descriptor = match dump.descriptor(record.descriptor_id) {
            Some(d) => d,
            None => {
                warn!(
                    index,
                    descriptor_id = record.descriptor_id,
                    "record references unknown descriptor, dropped"
                );
                return;
            }
        };
        let pending = self.threads.entry(record.thread_id).or_default();
        match descriptor.kind {
            BlockKind::Block => pending.blocks.push(index),
            BlockKind::Event => pending.events.push(index),
            BlockKind::Value => pending.values.push(index),
        }
    }
}

fn build_thread(
    dump: &CaptureDump,
    thread_id: u64,
    name: String,
    mut pending: PendingThread,
    nodes: &mut Vec<TreeNode>,
    stats: &mut StatisticsAggregator,
) -> ThreadContext {
    let rec = |index: u32| &dump.records[index as usize];

    // The stream is begin-ordered per thread; a violated order would break
    // the stack invariant, so re-sort (stably) when it happens.
    if pending.blocks.windows(2).any(|w| rec(w[1]).begin < rec(w[0]).begin) {
        warn!(thread_id, "records out of begin order, re-sorting");
        pending.blocks.sort_by_key(|&i| rec(i).begin);
    }

    let mut roots: Vec<u32> = Vec::new();
    let mut stack: Vec<u32> = Vec::new();

    for &index in &pending.blocks {
        let record = rec(index);

        // Ancestors that ended before this block begins are complete.
        while let Some(&top) = stack.last() {
            if rec(nodes[top as usize].record).end <= record.begin {
                stack.pop();
            } else {
                break;
            }
        }

        let node_id = nodes.len() as u32;
        let mut adopted: Vec<u32> = Vec::new();

        // Overlap repair: a block outliving the top of the stack cannot
        // nest inside it. The overlapped ancestor keeps the children that
        // began before this block and cedes the rest, then this block
        // takes its place on the stack.
        while let Some(&top) = stack.last() {
            if record.end <= rec(nodes[top as usize].record).end {
                break;
            }
            let cut = nodes[top as usize]
                .children
                .partition_point(|&c| rec(nodes[c as usize].record).begin < record.begin);
            let ceded = nodes[top as usize].children.split_off(cut);
            for &child in &ceded {
                nodes[child as usize].parent = Some(node_id);
            }
            adopted.extend(ceded);
            stack.pop();
        }

        let parent = stack.last().copied();
        let frame = stack.first().copied().unwrap_or(node_id);
        match parent {
            Some(p) => nodes[p as usize].children.push(node_id),
            None => roots.push(node_id),
        }

        let duration = record.duration();
        let parent_anchor = match parent {
            Some(p) => Anchor::Parent(p),
            None => Anchor::Root(thread_id),
        };
        let stat_ids = [
            stats.record(record.descriptor_id, parent_anchor, index, duration),
            stats.record(record.descriptor_id, Anchor::Frame(frame), index, duration),
            stats.record(record.descriptor_id, Anchor::Thread(thread_id), index, duration),
        ];

        nodes.push(TreeNode {
            record: index,
            parent,
            children: adopted,
            subtree_depth: 0,
            stats: stat_ids,
        });
        stack.push(node_id);
    }

    compute_depths(nodes, &roots);
    let max_depth = roots
        .iter()
        .map(|&r| nodes[r as usize].subtree_depth.saturating_add(1))
        .max()
        .unwrap_or(0);
    let active_time = merged_span(dump, nodes, &roots);

    ThreadContext {
        thread_id,
        name,
        roots,
        events: pending.events,
        values: pending.values,
        context_switches: pending.context_switches,
        active_time,
        max_depth,
    }
}

/// Iterative post-order depth computation; the node vector is shared
/// across threads so recursion depth must not follow the tree.
fn compute_depths(nodes: &mut [TreeNode], roots: &[u32]) {
    let mut walk: Vec<(u32, usize)> = Vec::new();
    for &root in roots {
        walk.push((root, 0));
        while let Some(frame) = walk.last_mut() {
            let (id, cursor) = (frame.0, frame.1);
            frame.1 += 1;
            if cursor < nodes[id as usize].children.len() {
                let child = nodes[id as usize].children[cursor];
                walk.push((child, 0));
            } else {
                let depth = nodes[id as usize]
                    .children
                    .iter()
                    .map(|&c| nodes[c as usize].subtree_depth.saturating_add(1))
                    .max()
                    .unwrap_or(0);
                nodes[id as usize].subtree_depth = depth;
                walk.pop();
            }
        }
    }
}

/// Sum of top-level intervals with overlaps counted once. Roots are
/// begin-ordered, so a single merge pass suffices.
fn merged_span(dump: &CaptureDump, nodes: &[TreeNode], roots: &[u32]) -> u64 {
    let mut total = 0u64;
    let mut span: Option<(u64, u64)> = None;
    for &root in roots {
        let record = &dump.records[nodes[root as usize].record as usize];
        match span {
            Some((begin, end)) if record.begin <= end => {
                span = Some((begin, end.max(record.end)));
            }
            Some((begin, end)) => {
                total += end - begin;
                span = Some((record.begin, record.end));
            }
            None => span = Some((record.begin, record.end)),
        }
    }
    if let Some((begin, end)) = span {
        total += end - begin;
    }
    total
}
