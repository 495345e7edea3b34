//! Profiled-process side of the live capture protocol.
//!
//! One connection at a time: `Idle -> Capturing -> Flushing -> Idle`.
//! Flushing happens on the listener thread, never on instrumented threads,
//! so socket latency cannot stall the hot recording path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use protocol::{read_message, write_message, Message, ProtocolError};
use tracing::{debug, warn};

use crate::buffer::CaptureController;
use crate::transport::{Acceptor, Transport};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Idle,
    Capturing,
}

pub struct ProfilerServer {
    controller: Arc<CaptureController>,
}

impl ProfilerServer {
    pub fn new(controller: Arc<CaptureController>) -> Self {
        ProfilerServer { controller }
    }

    /// Accept loop; serves one connection at a time until `shutdown` is
    /// set. Intended to run on a dedicated listener thread.
    pub fn serve<A: Acceptor>(&self, acceptor: A, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::Relaxed) {
            match acceptor.accept() {
                Ok(mut transport) => {
                    debug!("listener connected");
                    match self.serve_connection(&mut transport) {
                        Ok(()) => debug!("listener disconnected"),
                        Err(e) => warn!(error = %e, "capture connection failed"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            }
        }
    }

    /// Drive one connection to completion.
    ///
    /// Any connection-level failure (IO, bad magic, out-of-state message)
    /// stops a running capture and resets to Idle before returning.
    pub fn serve_connection<T: Transport>(&self, transport: &mut T) -> Result<()> {
        write_message(
            transport,
            &Message::Status {
                version: protocol::VERSION,
                process_id: self.controller.process_id(),
                profiling_enabled: self.controller.is_capturing(),
                event_tracing_enabled: self.controller.event_tracing(),
            },
        )?;

        let mut state = ServerState::Idle;
        loop {
            let message = match read_message(transport) {
                Ok(message) => message,
                Err(ProtocolError::Io(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof && state == ServerState::Idle =>
                {
                    return Ok(());
                }
                Err(e) => {
                    self.controller.stop_capture();
                    return Err(e.into());
                }
            };

            match message {
                Message::StartCapture => {
                    if state == ServerState::Capturing {
                        debug!("start while capturing ignored");
                    } else {
                        self.controller.start_capture();
                        state = ServerState::Capturing;
                    }
                }
                Message::StopCapture => match state {
                    ServerState::Capturing => {
                        self.flush(transport)?;
                        state = ServerState::Idle;
                    }
                    // Not an error by contract.
                    ServerState::Idle => debug!("stop while idle ignored"),
                },
                Message::EditBlockStatus {
                    descriptor_id,
                    enabled,
                } => {
                    if !self.controller.set_enabled(descriptor_id, enabled) {
                        warn!(descriptor_id, "edit status for unknown descriptor");
                    }
                }
                Message::EventTracingStatus { enabled } => {
                    self.controller.set_event_tracing(enabled);
                }
                Message::EventTracingPriority { low } => {
                    self.controller.set_event_tracing_low_priority(low);
                }
                Message::Ping => write_message(transport, &Message::Pong)?,
                other => {
                    self.controller.stop_capture();
                    return Err(ProtocolError::UnexpectedMessage(other.kind()).into());
                }
            }
        }
    }

    /// Flushing phase: descriptor chunks first, then per-thread block
    /// chunks, each stream closed by its END marker. Tables larger than
    /// the protocol's payload cap are split across several data messages.
    fn flush<T: Transport>(&self, transport: &mut T) -> Result<()> {
        self.controller.stop_capture();
        let snapshot = self.controller.snapshot()?;
        debug!(
            threads = snapshot.thread_chunks.len(),
            descriptor_bytes = snapshot.descriptors.len(),
            "flushing capture"
        );

        for part in record_chunks(&snapshot.descriptors, protocol::MAX_PAYLOAD as usize) {
            write_message(transport, &Message::BlocksDescription(part.to_vec()))?;
        }
        write_message(transport, &Message::BlocksDescriptionEnd)?;

        for (thread_id, chunk) in snapshot.thread_chunks {
            debug!(thread_id, bytes = chunk.len(), "flushing thread chunk");
            for part in record_chunks(&chunk, protocol::MAX_PAYLOAD as usize) {
                write_message(transport, &Message::Blocks(part.to_vec()))?;
            }
        }
        write_message(transport, &Message::BlocksEnd)?;
        Ok(())
    }
}

/// Split a length-prefixed record table into slices of at most `max`
/// bytes, cutting only between records so the receiver can concatenate
/// payloads and still parse. Empty tables yield no chunks.
fn record_chunks(table: &[u8], max: usize) -> Vec<&[u8]> {
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut pos = 0usize;
    while pos + 2 <= table.len() {
        let len = u16::from_le_bytes([table[pos], table[pos + 1]]) as usize;
        let record_end = pos + 2 + len;
        if record_end - start > max && pos > start {
            chunks.push(&table[start..pos]);
            start = pos;
        }
        pos = record_end;
    }
    if start < table.len() {
        chunks.push(&table[start..]);
    }
    chunks
}
