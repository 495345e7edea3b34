use crate::arena::{ByteArena, ByteRef};

/// Reserved descriptor id marking an OS context-switch record.
pub const CONTEXT_SWITCH_ID: u32 = u32::MAX;

/// Reserved descriptor id marking a thread-name record.
pub const THREAD_NAME_ID: u32 = u32::MAX - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockKind {
    Block = 0,
    Event = 1,
    Value = 2,
}

impl BlockKind {
    pub fn from_u8(v: u8) -> Option<BlockKind> {
        match v {
            0 => Some(BlockKind::Block),
            1 => Some(BlockKind::Event),
            2 => Some(BlockKind::Value),
            _ => None,
        }
    }
}

/// Static per-call-site metadata. One descriptor is shared by every
/// occurrence of the call site; the table is append-only once a capture or
/// decode completes.
#[derive(Debug, Clone, Copy)]
pub struct BlockDescriptor {
    pub id: u32,
    pub line: u32,
    /// ARGB.
    pub color: u32,
    pub kind: BlockKind,
    pub enabled: bool,
    pub name: ByteRef,
    pub file: ByteRef,
}

/// One recorded occurrence: a begin/end interval on one thread.
///
/// `trailing` points at the type-specific bytes that followed the fixed
/// prefix on the wire: a runtime name override for plain blocks, the typed
/// payload for value records, target info for context switches.
#[derive(Debug, Clone, Copy)]
pub struct BlockRecord {
    pub begin: u64,
    pub end: u64,
    pub descriptor_id: u32,
    pub thread_id: u64,
    pub trailing: ByteRef,
}

impl BlockRecord {
    pub fn duration(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }

    pub fn is_context_switch(&self) -> bool {
        self.descriptor_id == CONTEXT_SWITCH_ID
    }

    pub fn is_thread_name(&self) -> bool {
        self.descriptor_id == THREAD_NAME_ID
    }
}

/// OS scheduler event, kept out of the nested call tree.
#[derive(Debug, Clone, Copy)]
pub struct ContextSwitchEvent {
    pub begin: u64,
    pub end: u64,
    pub thread_id: u64,
    pub target_thread: u64,
    pub label: ByteRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataKind {
    Bool = 0,
    Int = 1,
    Uint = 2,
    Float = 3,
    Str = 4,
}

impl DataKind {
    pub fn from_u8(v: u8) -> Option<DataKind> {
        match v {
            0 => Some(DataKind::Bool),
            1 => Some(DataKind::Int),
            2 => Some(DataKind::Uint),
            3 => Some(DataKind::Float),
            4 => Some(DataKind::Str),
            _ => None,
        }
    }
}

/// Payload of a value record: an explicit data-kind tag plus an is-array
/// flag on the wire, surfaced as a sum type so callers pattern-match
/// instead of reinterpreting raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Value<'a> {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Str(&'a str),
    BoolArray(Vec<bool>),
    IntArray(Vec<i64>),
    UintArray(Vec<u64>),
    FloatArray(Vec<f64>),
}

impl<'a> Value<'a> {
    /// Parse a value payload: `{kind:u8, is_array:u8}` then raw data.
    pub fn parse(payload: &'a [u8]) -> Option<Value<'a>> {
        if payload.len() < 2 {
            return None;
        }
        let kind = DataKind::from_u8(payload[0])?;
        let is_array = payload[1] != 0;
        let data = &payload[2..];
        match (kind, is_array) {
            (DataKind::Bool, false) => Some(Value::Bool(*data.first()? != 0)),
            (DataKind::Int, false) => Some(Value::Int(i64::from_le_bytes(
                data.get(..8)?.try_into().ok()?,
            ))),
            (DataKind::Uint, false) => Some(Value::Uint(u64::from_le_bytes(
                data.get(..8)?.try_into().ok()?,
            ))),
            (DataKind::Float, false) => Some(Value::Float(f64::from_le_bytes(
                data.get(..8)?.try_into().ok()?,
            ))),
            (DataKind::Str, _) => Some(Value::Str(std::str::from_utf8(data).ok()?)),
            (DataKind::Bool, true) => Some(Value::BoolArray(data.iter().map(|&b| b != 0).collect())),
            (DataKind::Int, true) => Some(Value::IntArray(parse_array(data, i64::from_le_bytes)?)),
            (DataKind::Uint, true) => Some(Value::UintArray(parse_array(data, u64::from_le_bytes)?)),
            (DataKind::Float, true) => {
                Some(Value::FloatArray(parse_array(data, f64::from_le_bytes)?))
            }
        }
    }

    /// Serialize into the wire payload layout accepted by [`Value::parse`].
    pub fn emit(&self, out: &mut Vec<u8>) {
        match self {
            Value::Bool(v) => {
                out.extend_from_slice(&[DataKind::Bool as u8, 0, *v as u8]);
            }
            Value::Int(v) => {
                out.extend_from_slice(&[DataKind::Int as u8, 0]);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::Uint(v) => {
                out.extend_from_slice(&[DataKind::Uint as u8, 0]);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::Float(v) => {
                out.extend_from_slice(&[DataKind::Float as u8, 0]);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::Str(v) => {
                out.extend_from_slice(&[DataKind::Str as u8, 0]);
                out.extend_from_slice(v.as_bytes());
            }
            Value::BoolArray(vs) => {
                out.extend_from_slice(&[DataKind::Bool as u8, 1]);
                out.extend(vs.iter().map(|&b| b as u8));
            }
            Value::IntArray(vs) => {
                out.extend_from_slice(&[DataKind::Int as u8, 1]);
                for v in vs {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
            Value::UintArray(vs) => {
                out.extend_from_slice(&[DataKind::Uint as u8, 1]);
                for v in vs {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
            Value::FloatArray(vs) => {
                out.extend_from_slice(&[DataKind::Float as u8, 1]);
                for v in vs {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
        }
    }
}

fn parse_array<T>(data: &[u8], convert: fn([u8; 8]) -> T) -> Option<Vec<T>> {
    if data.len() % 8 != 0 {
        return None;
    }
    Some(
        data.chunks_exact(8)
            .map(|c| convert(c.try_into().expect("chunks_exact(8)")))
            .collect(),
    )
}

/// Parse the trailing payload of a context-switch record:
/// `{target_thread:u64}` followed by a UTF-8 label.
pub fn parse_context_switch(record: &BlockRecord, arena: &ByteArena) -> Option<ContextSwitchEvent> {
    let payload = arena.view(record.trailing);
    if payload.len() < 8 {
        return None;
    }
    let target_thread = u64::from_le_bytes(payload[..8].try_into().ok()?);
    Some(ContextSwitchEvent {
        begin: record.begin,
        end: record.end,
        thread_id: record.thread_id,
        target_thread,
        label: ByteRef {
            offset: record.trailing.offset + 8,
            len: record.trailing.len - 8,
        },
    })
}
