//! Capture side of the profiler.
//!
//! Instrumented threads append serialized block records into per-thread
//! buffers owned by a [`CaptureController`]; a [`ProfilerServer`] exposes
//! the live capture protocol over an abstract [`Transport`], and a
//! [`CaptureClient`] drives it from the listening side.

use thiserror::Error;

pub mod buffer;
pub mod client;
pub mod server;
pub mod transport;

pub use buffer::CaptureController;
pub use client::{CaptureClient, CaptureStream, ClientState};
pub use server::ProfilerServer;
pub use transport::{pair_transport, Acceptor, PairTransport, TcpAcceptor, TcpTransport, Transport};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),
    #[error("format error: {0}")]
    Format(#[from] profile_format::FormatError),
    #[error("not connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, CaptureError>;

/// Monotonic timestamp in nanoseconds.
pub fn timestamp_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Kernel thread id of the calling thread.
pub fn current_thread_id() -> u64 {
    unsafe { libc::gettid() as u64 }
}
