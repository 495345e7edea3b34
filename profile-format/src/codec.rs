//! Container decode/encode.
//!
//! Layout: 64-byte packed header, descriptor table, block table. Both
//! tables are sequences of `u16`-length-prefixed records; a zero length is
//! a skip marker, not an error. Signature, version and truncation failures
//! abort the whole decode; individually malformed records are logged and
//! skipped so a damaged capture still yields a best-effort dump.

use std::collections::HashMap;
use std::io::{Read, Write};

use tracing::warn;

use crate::arena::{ByteArena, ByteRef};
use crate::types::{BlockDescriptor, BlockKind, BlockRecord, Value, THREAD_NAME_ID};
use crate::{FormatError, Result, SIGNATURE, VERSION};

/// Total size of the packed container header.
pub const HEADER_BYTES: usize = 64;

/// Fixed prefix of every block record: begin, end, descriptor id, thread id.
pub const BASE_BLOCK_BYTES: usize = 28;

/// Fixed prefix of every descriptor record, up to and including `name_len`.
pub const BASE_DESCRIPTOR_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileHeader {
    pub process_id: u64,
    /// Clock ticks per second; 0 means timestamps are nanoseconds already.
    pub cpu_frequency: i64,
    pub begin_time: u64,
    pub end_time: u64,
}

/// A fully decoded (or incrementally assembled) capture.
///
/// Variable-length bytes live in the owned arena; descriptors and records
/// hold [`ByteRef`]s into it. Record order matches the wire, so an
/// unmodified dump re-encodes byte-for-byte.
#[derive(Debug, Default)]
pub struct CaptureDump {
    pub header: FileHeader,
    pub descriptors: Vec<BlockDescriptor>,
    pub records: Vec<BlockRecord>,
    pub arena: ByteArena,
    index: HashMap<u32, usize>,
}

enum Table {
    Descriptors,
    Blocks,
}

impl CaptureDump {
    pub fn new(header: FileHeader) -> Self {
        CaptureDump {
            header,
            ..CaptureDump::default()
        }
    }

    pub fn descriptor(&self, id: u32) -> Option<&BlockDescriptor> {
        self.index.get(&id).map(|&i| &self.descriptors[i])
    }

    pub fn descriptor_name(&self, id: u32) -> &str {
        self.descriptor(id)
            .map(|d| self.arena.str_view(d.name))
            .unwrap_or("")
    }

    /// Display name of a record: runtime override when the call site
    /// supplied one, otherwise the descriptor's compile-time name.
    pub fn block_name(&self, record: &BlockRecord) -> &str {
        if !record.trailing.is_empty() && !record.is_context_switch() {
            if let Some(d) = self.descriptor(record.descriptor_id) {
                if d.kind != BlockKind::Value {
                    return self.arena.str_view(record.trailing);
                }
            }
            if record.is_thread_name() {
                return self.arena.str_view(record.trailing);
            }
        }
        self.descriptor_name(record.descriptor_id)
    }

    /// Decode the typed payload of a value record.
    pub fn value(&self, record: &BlockRecord) -> Option<Value<'_>> {
        let d = self.descriptor(record.descriptor_id)?;
        if d.kind != BlockKind::Value {
            return None;
        }
        Value::parse(self.arena.view(record.trailing))
    }

    /// Thread names gathered from thread-name records.
    pub fn thread_names(&self) -> HashMap<u64, &str> {
        self.records
            .iter()
            .filter(|r| r.descriptor_id == THREAD_NAME_ID)
            .map(|r| (r.thread_id, self.arena.str_view(r.trailing)))
            .collect()
    }

    /// Parse a descriptor-table chunk, appending to this dump.
    /// Truncation mid-record is a hard error.
    pub fn extend_descriptors(&mut self, bytes: &[u8]) -> Result<usize> {
        self.parse_table(bytes, Table::Descriptors, true)
    }

    /// Parse a block-table chunk, appending to this dump.
    pub fn extend_records(&mut self, bytes: &[u8]) -> Result<usize> {
        self.parse_table(bytes, Table::Blocks, true)
    }

    /// Best-effort variants for partially received network streams: a
    /// truncated tail is logged and everything parsed so far is kept.
    /// Only allocation failure aborts.
    pub fn extend_descriptors_lossy(&mut self, bytes: &[u8]) -> Result<usize> {
        self.parse_table(bytes, Table::Descriptors, false)
    }

    pub fn extend_records_lossy(&mut self, bytes: &[u8]) -> Result<usize> {
        self.parse_table(bytes, Table::Blocks, false)
    }

    fn parse_table(&mut self, bytes: &[u8], table: Table, strict: bool) -> Result<usize> {
        let mut pos = 0usize;
        let mut parsed = 0usize;
        loop {
            let remaining = bytes.len() - pos;
            if remaining == 0 {
                break;
            }
            if remaining < 2 {
                if strict {
                    return Err(FormatError::Truncated {
                        needed: 2,
                        remaining,
                    });
                }
                warn!(remaining, "dropping truncated table tail");
                break;
            }
            let len = u16::from_le_bytes([bytes[pos], bytes[pos + 1]]) as usize;
            pos += 2;
            if len == 0 {
                // Skip/alignment marker.
                continue;
            }
            let remaining = bytes.len() - pos;
            if remaining < len {
                if strict {
                    return Err(FormatError::Truncated {
                        needed: len,
                        remaining,
                    });
                }
                warn!(needed = len, remaining, "dropping truncated record tail");
                break;
            }
            let payload = &bytes[pos..pos + len];
            pos += len;
            let ok = match table {
                Table::Descriptors => self.parse_descriptor(payload)?,
                Table::Blocks => self.parse_block(payload)?,
            };
            if ok {
                parsed += 1;
            }
        }
        Ok(parsed)
    }

    fn parse_descriptor(&mut self, payload: &[u8]) -> Result<bool> {
        if payload.len() < BASE_DESCRIPTOR_BYTES {
            warn!(len = payload.len(), "descriptor record too short, skipped");
            return Ok(false);
        }
        let id = u32::from_le_bytes(payload[0..4].try_into().expect("sized"));
        let line = u32::from_le_bytes(payload[4..8].try_into().expect("sized"));
        let color = u32::from_le_bytes(payload[8..12].try_into().expect("sized"));
        let kind = match BlockKind::from_u8(payload[12]) {
            Some(kind) => kind,
            None => {
                warn!(id, kind = payload[12], "unknown block kind, skipped");
                return Ok(false);
            }
        };
        let enabled = payload[13] != 0;
        let name_len = u16::from_le_bytes(payload[14..16].try_into().expect("sized")) as usize;
        let strings = &payload[BASE_DESCRIPTOR_BYTES..];
        if name_len > strings.len() {
            warn!(id, name_len, "descriptor name overruns record, skipped");
            return Ok(false);
        }
        let (name_bytes, file_bytes) = strings.split_at(name_len);
        if std::str::from_utf8(name_bytes).is_err() || std::str::from_utf8(file_bytes).is_err() {
            warn!(id, "descriptor strings are not UTF-8, skipped");
            return Ok(false);
        }
        let name = self.arena.append(name_bytes)?;
        let file = self.arena.append(file_bytes)?;
        if self.index.contains_key(&id) {
            warn!(id, "duplicate descriptor id, first one kept");
            return Ok(false);
        }
        self.index.insert(id, self.descriptors.len());
        self.descriptors.push(BlockDescriptor {
            id,
            line,
            color,
            kind,
            enabled,
            name,
            file,
        });
        Ok(true)
    }

    fn parse_block(&mut self, payload: &[u8]) -> Result<bool> {
        if payload.len() < BASE_BLOCK_BYTES {
            warn!(len = payload.len(), "block record too short, skipped");
            return Ok(false);
        }
        let begin = u64::from_le_bytes(payload[0..8].try_into().expect("sized"));
        let end = u64::from_le_bytes(payload[8..16].try_into().expect("sized"));
        let descriptor_id = u32::from_le_bytes(payload[16..20].try_into().expect("sized"));
        let thread_id = u64::from_le_bytes(payload[20..28].try_into().expect("sized"));
        let trailing = self.arena.append(&payload[BASE_BLOCK_BYTES..])?;
        self.records.push(BlockRecord {
            begin,
            end,
            descriptor_id,
            thread_id,
            trailing,
        });
        Ok(true)
    }

    fn descriptor_table_bytes(&self) -> u64 {
        self.descriptors
            .iter()
            .map(|d| 2 + BASE_DESCRIPTOR_BYTES as u64 + d.name.len as u64 + d.file.len as u64)
            .sum()
    }

    fn block_table_bytes(&self) -> u64 {
        self.records
            .iter()
            .map(|r| 2 + BASE_BLOCK_BYTES as u64 + r.trailing.len as u64)
            .sum()
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let remaining = self.buf.len() - self.pos;
        if remaining < n {
            return Err(FormatError::Truncated {
                needed: n,
                remaining,
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().expect("sized")))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().expect("sized")))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.bytes(8)?.try_into().expect("sized")))
    }
}

/// Decode a full container from memory.
pub fn decode(bytes: &[u8]) -> Result<CaptureDump> {
    let mut cursor = Cursor::new(bytes);

    let signature = cursor.u32()?;
    if signature != SIGNATURE {
        return Err(FormatError::BadSignature(signature));
    }
    let version = cursor.u32()?;
    if version != VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }

    let header = FileHeader {
        process_id: cursor.u64()?,
        cpu_frequency: cursor.i64()?,
        begin_time: cursor.u64()?,
        end_time: cursor.u64()?,
    };
    let block_count = cursor.u32()?;
    let block_table_bytes = cursor.u64()? as usize;
    let descriptor_count = cursor.u32()?;
    let descriptor_table_bytes = cursor.u64()? as usize;

    let mut dump = CaptureDump::new(header);
    let descriptor_table = cursor.bytes(descriptor_table_bytes)?;
    let block_table = cursor.bytes(block_table_bytes)?;

    let descriptors = dump.extend_descriptors(descriptor_table)?;
    let blocks = dump.extend_records(block_table)?;

    if descriptors != descriptor_count as usize {
        warn!(
            expected = descriptor_count,
            parsed = descriptors,
            "descriptor count mismatch"
        );
    }
    if blocks != block_count as usize {
        warn!(expected = block_count, parsed = blocks, "block count mismatch");
    }
    if cursor.pos != bytes.len() {
        warn!(extra = bytes.len() - cursor.pos, "trailing bytes after tables ignored");
    }

    Ok(dump)
}

pub fn decode_reader(mut reader: impl Read) -> Result<CaptureDump> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    decode(&bytes)
}

/// Encode a dump; the exact inverse of [`decode`] for structurally valid
/// input (skip markers are never emitted).
pub fn encode(dump: &CaptureDump) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(
        HEADER_BYTES + (dump.descriptor_table_bytes() + dump.block_table_bytes()) as usize,
    );
    out.extend_from_slice(&SIGNATURE.to_le_bytes());
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&dump.header.process_id.to_le_bytes());
    out.extend_from_slice(&dump.header.cpu_frequency.to_le_bytes());
    out.extend_from_slice(&dump.header.begin_time.to_le_bytes());
    out.extend_from_slice(&dump.header.end_time.to_le_bytes());
    out.extend_from_slice(&(dump.records.len() as u32).to_le_bytes());
    out.extend_from_slice(&dump.block_table_bytes().to_le_bytes());
    out.extend_from_slice(&(dump.descriptors.len() as u32).to_le_bytes());
    out.extend_from_slice(&dump.descriptor_table_bytes().to_le_bytes());

    for d in &dump.descriptors {
        push_descriptor_record(
            &mut out,
            d.id,
            d.line,
            d.color,
            d.kind,
            d.enabled,
            dump.arena.str_view(d.name),
            dump.arena.str_view(d.file),
        )?;
    }
    for r in &dump.records {
        push_block_record(
            &mut out,
            r.begin,
            r.end,
            r.descriptor_id,
            r.thread_id,
            dump.arena.view(r.trailing),
        )?;
    }
    Ok(out)
}

pub fn encode_writer(dump: &CaptureDump, mut writer: impl Write) -> Result<()> {
    let bytes = encode(dump)?;
    writer.write_all(&bytes)?;
    Ok(())
}

/// Append one length-prefixed descriptor record in wire framing.
#[allow(clippy::too_many_arguments)]
pub fn push_descriptor_record(
    out: &mut Vec<u8>,
    id: u32,
    line: u32,
    color: u32,
    kind: BlockKind,
    enabled: bool,
    name: &str,
    file: &str,
) -> Result<()> {
    let len = BASE_DESCRIPTOR_BYTES + name.len() + file.len();
    if len > u16::MAX as usize || name.len() > u16::MAX as usize {
        return Err(FormatError::RecordTooLarge(len));
    }
    out.extend_from_slice(&(len as u16).to_le_bytes());
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&line.to_le_bytes());
    out.extend_from_slice(&color.to_le_bytes());
    out.push(kind as u8);
    out.push(enabled as u8);
    out.extend_from_slice(&(name.len() as u16).to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(file.as_bytes());
    Ok(())
}

/// Append one length-prefixed block record in wire framing.
pub fn push_block_record(
    out: &mut Vec<u8>,
    begin: u64,
    end: u64,
    descriptor_id: u32,
    thread_id: u64,
    trailing: &[u8],
) -> Result<()> {
    let len = BASE_BLOCK_BYTES + trailing.len();
    if len > u16::MAX as usize {
        return Err(FormatError::RecordTooLarge(len));
    }
    out.extend_from_slice(&(len as u16).to_le_bytes());
    out.extend_from_slice(&begin.to_le_bytes());
    out.extend_from_slice(&end.to_le_bytes());
    out.extend_from_slice(&descriptor_id.to_le_bytes());
    out.extend_from_slice(&thread_id.to_le_bytes());
    out.extend_from_slice(trailing);
    Ok(())
}
