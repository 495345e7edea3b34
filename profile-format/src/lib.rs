//! Binary container format for block capture dumps.
//!
//! A dump is a fixed 64-byte header followed by two length-prefixed record
//! tables: the descriptor table (static per-call-site metadata) and the block
//! table (one record per begin/end occurrence, interleaved across threads in
//! chronological order). All integers are little-endian, records carry a
//! `u16` length prefix and variable-length payloads live in a [`ByteArena`]
//! owned by the decoded [`CaptureDump`].

use thiserror::Error;

pub mod arena;
pub mod codec;
pub mod registry;
pub mod types;

pub use arena::{ByteArena, ByteRef};
pub use codec::{decode, decode_reader, encode, encode_writer, CaptureDump, FileHeader};
pub use registry::DescriptorRegistry;
pub use types::{
    BlockDescriptor, BlockKind, BlockRecord, ContextSwitchEvent, DataKind, Value,
    CONTEXT_SWITCH_ID, THREAD_NAME_ID,
};

/// File signature, first four bytes of every dump.
pub const SIGNATURE: u32 = 0xB10C_CA97;

/// Only supported container version.
pub const VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("bad file signature {0:#010x}")]
    BadSignature(u32),
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u32),
    #[error("truncated stream: needed {needed} more bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("allocation of {0} bytes failed")]
    Allocation(usize),
    #[error("record too large for u16 framing: {0} bytes")]
    RecordTooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FormatError>;
