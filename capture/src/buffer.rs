//! Per-thread capture buffers and the flush coordinator.
//!
//! Each instrumented thread appends serialized records into its own
//! append-only arena without synchronizing with other threads. The only
//! cross-thread synchronization point is [`CaptureController::snapshot`],
//! which swaps every arena out under a short per-buffer lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use profile_format::codec::push_block_record;
use profile_format::{
    ByteArena, BlockKind, DescriptorRegistry, Value, CONTEXT_SWITCH_ID, THREAD_NAME_ID,
};
use tracing::debug;

use crate::{timestamp_ns, Result};

/// Frozen output of one snapshot cut.
#[derive(Debug)]
pub struct Snapshot {
    /// Serialized descriptor table in file framing.
    pub descriptors: Vec<u8>,
    /// Serialized block-table chunk per thread, ordered by thread id.
    pub thread_chunks: Vec<(u64, Vec<u8>)>,
    pub begin_time: u64,
    pub end_time: u64,
    pub process_id: u64,
}

/// Owns the descriptor registry and the per-thread record buffers for one
/// profiled process.
pub struct CaptureController {
    registry: Mutex<DescriptorRegistry>,
    /// Enabled flag per descriptor id, swapped wholesale on every registry
    /// change so the hot path reads it lock-free.
    enabled_flags: ArcSwap<Vec<bool>>,
    buffers: Mutex<HashMap<u64, Arc<Mutex<ByteArena>>>>,
    thread_names: Mutex<HashMap<u64, String>>,
    capturing: AtomicBool,
    capture_begin: AtomicU64,
    event_tracing: AtomicBool,
    event_tracing_low_priority: AtomicBool,
    process_id: u64,
}

impl CaptureController {
    pub fn new() -> Arc<Self> {
        Arc::new(CaptureController {
            registry: Mutex::new(DescriptorRegistry::new()),
            enabled_flags: ArcSwap::from_pointee(Vec::new()),
            buffers: Mutex::new(HashMap::new()),
            thread_names: Mutex::new(HashMap::new()),
            capturing: AtomicBool::new(false),
            capture_begin: AtomicU64::new(0),
            event_tracing: AtomicBool::new(false),
            event_tracing_low_priority: AtomicBool::new(false),
            process_id: std::process::id() as u64,
        })
    }

    pub fn process_id(&self) -> u64 {
        self.process_id
    }

    /// One-time call-site registration, memoized by identity.
    pub fn register_block(
        &self,
        name: &str,
        file: &str,
        line: u32,
        color: u32,
        kind: BlockKind,
    ) -> u32 {
        let mut registry = self.registry.lock();
        let id = registry.register(name, file, line, color, kind);
        self.publish_flags(&registry);
        id
    }

    pub fn set_enabled(&self, descriptor_id: u32, enabled: bool) -> bool {
        let mut registry = self.registry.lock();
        let found = registry.set_enabled(descriptor_id, enabled);
        if found {
            self.publish_flags(&registry);
        }
        found
    }

    fn publish_flags(&self, registry: &DescriptorRegistry) {
        self.enabled_flags
            .store(Arc::new(registry.iter().map(|d| d.enabled).collect()));
    }

    fn is_enabled(&self, descriptor_id: u32) -> bool {
        self.enabled_flags
            .load()
            .get(descriptor_id as usize)
            .copied()
            .unwrap_or(false)
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::Relaxed)
    }

    pub fn start_capture(&self) {
        self.capture_begin.store(timestamp_ns(), Ordering::Relaxed);
        self.capturing.store(true, Ordering::Release);
        debug!("capture started");
    }

    pub fn stop_capture(&self) {
        self.capturing.store(false, Ordering::Release);
        debug!("capture stopped");
    }

    pub fn set_event_tracing(&self, enabled: bool) {
        self.event_tracing.store(enabled, Ordering::Relaxed);
    }

    pub fn event_tracing(&self) -> bool {
        self.event_tracing.load(Ordering::Relaxed)
    }

    pub fn set_event_tracing_low_priority(&self, low: bool) {
        self.event_tracing_low_priority.store(low, Ordering::Relaxed);
    }

    pub fn set_thread_name(&self, thread_id: u64, name: &str) {
        self.thread_names.lock().insert(thread_id, name.to_string());
    }

    /// Record one finished block on the calling thread's buffer.
    ///
    /// Dropped silently while no capture is running or when the descriptor
    /// is disabled.
    pub fn store_block(
        &self,
        thread_id: u64,
        descriptor_id: u32,
        begin: u64,
        end: u64,
        runtime_name: Option<&str>,
    ) -> Result<()> {
        if !self.is_capturing() || !self.is_enabled(descriptor_id) {
            return Ok(());
        }
        let trailing = runtime_name.map(str::as_bytes).unwrap_or(b"");
        self.append_record(thread_id, begin, end, descriptor_id, trailing)
    }

    /// Record a value sample (a zero-length interval carrying a payload).
    pub fn store_value(
        &self,
        thread_id: u64,
        descriptor_id: u32,
        timestamp: u64,
        value: &Value<'_>,
    ) -> Result<()> {
        if !self.is_capturing() || !self.is_enabled(descriptor_id) {
            return Ok(());
        }
        let mut payload = Vec::new();
        value.emit(&mut payload);
        self.append_record(thread_id, timestamp, timestamp, descriptor_id, &payload)
    }

    /// Record an OS context switch, if event tracing is enabled.
    pub fn store_context_switch(
        &self,
        thread_id: u64,
        begin: u64,
        end: u64,
        target_thread: u64,
        label: &str,
    ) -> Result<()> {
        if !self.is_capturing() || !self.event_tracing() {
            return Ok(());
        }
        let mut payload = target_thread.to_le_bytes().to_vec();
        payload.extend_from_slice(label.as_bytes());
        self.append_record(thread_id, begin, end, CONTEXT_SWITCH_ID, &payload)
    }

    fn append_record(
        &self,
        thread_id: u64,
        begin: u64,
        end: u64,
        descriptor_id: u32,
        trailing: &[u8],
    ) -> Result<()> {
        let buffer = self.buffer_for(thread_id);
        let mut record = Vec::with_capacity(64);
        push_block_record(&mut record, begin, end, descriptor_id, thread_id, trailing)?;
        buffer.lock().append(&record)?;
        Ok(())
    }

    fn buffer_for(&self, thread_id: u64) -> Arc<Mutex<ByteArena>> {
        let mut buffers = self.buffers.lock();
        buffers
            .entry(thread_id)
            .or_insert_with(|| Arc::new(Mutex::new(ByteArena::new())))
            .clone()
    }

    /// Consistent snapshot cut: swap every thread arena out so appends made
    /// after this point belong to the next capture. Each buffer is locked
    /// only for the swap.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let descriptors = self.registry.lock().serialize_table()?;
        let names = self.thread_names.lock().clone();

        let handles: Vec<(u64, Arc<Mutex<ByteArena>>)> = {
            let buffers = self.buffers.lock();
            buffers.iter().map(|(&id, b)| (id, b.clone())).collect()
        };

        let mut thread_chunks = Vec::with_capacity(handles.len());
        for (thread_id, buffer) in handles {
            let arena = buffer.lock().take();
            let mut chunk = Vec::with_capacity(arena.len() + 64);
            if let Some(name) = names.get(&thread_id) {
                push_block_record(&mut chunk, 0, 0, THREAD_NAME_ID, thread_id, name.as_bytes())?;
            }
            chunk.extend_from_slice(arena.as_slice());
            if !chunk.is_empty() {
                thread_chunks.push((thread_id, chunk));
            }
        }
        thread_chunks.sort_by_key(|&(id, _)| id);

        Ok(Snapshot {
            descriptors,
            thread_chunks,
            begin_time: self.capture_begin.load(Ordering::Relaxed),
            end_time: timestamp_ns(),
            process_id: self.process_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use profile_format::{CaptureDump, FileHeader};
    use rstest::{fixture, rstest};

    #[fixture]
    fn controller() -> Arc<CaptureController> {
        CaptureController::new()
    }

    #[rstest]
    fn test_store_outside_capture_is_dropped(controller: Arc<CaptureController>) {
        let id = controller.register_block("work", "lib.rs", 1, 0, BlockKind::Block);
        controller.store_block(1, id, 0, 10, None).unwrap();

        controller.start_capture();
        let snapshot = controller.snapshot().unwrap();
        assert!(snapshot.thread_chunks.is_empty());
    }

    #[rstest]
    fn test_capture_and_snapshot(controller: Arc<CaptureController>) {
        let work = controller.register_block("work", "lib.rs", 1, 0, BlockKind::Block);
        let tick = controller.register_block("tick", "lib.rs", 9, 0, BlockKind::Event);
        controller.set_thread_name(7, "worker");

        controller.start_capture();
        controller.store_block(7, work, 0, 100, None).unwrap();
        controller.store_block(7, work, 10, 50, Some("inner")).unwrap();
        controller.store_block(7, tick, 60, 60, None).unwrap();
        controller.stop_capture();

        let snapshot = controller.snapshot().unwrap();
        assert_eq!(snapshot.thread_chunks.len(), 1);

        let mut dump = CaptureDump::new(FileHeader::default());
        dump.extend_descriptors(&snapshot.descriptors).unwrap();
        for (_, chunk) in &snapshot.thread_chunks {
            dump.extend_records(chunk).unwrap();
        }
        // Thread-name record plus the three stored ones.
        assert_eq!(dump.records.len(), 4);
        assert_eq!(dump.thread_names().get(&7).copied(), Some("worker"));
        assert_eq!(dump.block_name(&dump.records[2]), "inner");
    }

    #[rstest]
    fn test_disabled_descriptor_not_recorded(controller: Arc<CaptureController>) {
        let id = controller.register_block("hidden", "lib.rs", 2, 0, BlockKind::Block);
        controller.set_enabled(id, false);

        controller.start_capture();
        controller.store_block(1, id, 0, 5, None).unwrap();
        let snapshot = controller.snapshot().unwrap();
        assert!(snapshot.thread_chunks.is_empty());
    }

    #[rstest]
    fn test_snapshot_cut_excludes_later_appends(controller: Arc<CaptureController>) {
        let id = controller.register_block("work", "lib.rs", 1, 0, BlockKind::Block);
        controller.start_capture();
        controller.store_block(1, id, 0, 10, None).unwrap();

        let first = controller.snapshot().unwrap();
        controller.store_block(1, id, 20, 30, None).unwrap();
        let second = controller.snapshot().unwrap();

        assert_eq!(first.thread_chunks.len(), 1);
        assert_eq!(second.thread_chunks.len(), 1);
        assert_ne!(first.thread_chunks[0].1, second.thread_chunks[0].1);
    }

    #[rstest]
    fn test_context_switch_requires_event_tracing(controller: Arc<CaptureController>) {
        controller.start_capture();
        controller
            .store_context_switch(1, 0, 5, 99, "ksoftirqd")
            .unwrap();
        assert!(controller.snapshot().unwrap().thread_chunks.is_empty());

        controller.set_event_tracing(true);
        controller
            .store_context_switch(1, 0, 5, 99, "ksoftirqd")
            .unwrap();
        let snapshot = controller.snapshot().unwrap();
        assert_eq!(snapshot.thread_chunks.len(), 1);
    }
}
