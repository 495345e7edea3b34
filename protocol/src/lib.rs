//! Message-framed duplex protocol for live capture streaming.
//!
//! Every message starts with `{magic:u32, kind:u8}`. Data messages add a
//! `size:u32` before their payload; status-style messages carry fixed
//! fields directly. A receiver that sees a wrong magic number must treat
//! the stream as desynchronized and disconnect; that condition is not
//! locally recoverable.

use std::io::{Read, Write};

use thiserror::Error;

/// Fixed constant prefacing every message.
pub const MAGIC: u32 = 0xE1A5_D001;

/// Protocol revision, carried in the status handshake.
pub const VERSION: u32 = 1;

/// Upper bound on a single data payload, to keep a desynchronized peer
/// from forcing an unbounded allocation.
pub const MAX_PAYLOAD: u32 = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("bad magic number {0:#010x}, stream desynchronized")]
    BadMagic(u32),
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    #[error("payload of {0} bytes exceeds limit")]
    PayloadTooLarge(u32),
    #[error("unexpected {0:?} message for current state")]
    UnexpectedMessage(MessageKind),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Status = 0,
    StartCapture = 1,
    StopCapture = 2,
    BlocksDescription = 3,
    BlocksDescriptionEnd = 4,
    Blocks = 5,
    BlocksEnd = 6,
    EditBlockStatus = 7,
    EventTracingStatus = 8,
    EventTracingPriority = 9,
    Ping = 10,
    Pong = 11,
}

impl MessageKind {
    fn from_u8(v: u8) -> Option<MessageKind> {
        match v {
            0 => Some(MessageKind::Status),
            1 => Some(MessageKind::StartCapture),
            2 => Some(MessageKind::StopCapture),
            3 => Some(MessageKind::BlocksDescription),
            4 => Some(MessageKind::BlocksDescriptionEnd),
            5 => Some(MessageKind::Blocks),
            6 => Some(MessageKind::BlocksEnd),
            7 => Some(MessageKind::EditBlockStatus),
            8 => Some(MessageKind::EventTracingStatus),
            9 => Some(MessageKind::EventTracingPriority),
            10 => Some(MessageKind::Ping),
            11 => Some(MessageKind::Pong),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Handshake sent by the profiled process right after accept.
    Status {
        version: u32,
        process_id: u64,
        profiling_enabled: bool,
        event_tracing_enabled: bool,
    },
    StartCapture,
    StopCapture,
    /// Chunk of the serialized descriptor table.
    BlocksDescription(Vec<u8>),
    BlocksDescriptionEnd,
    /// Chunk of the serialized block table.
    Blocks(Vec<u8>),
    BlocksEnd,
    /// Toggle one descriptor's enabled flag live.
    EditBlockStatus { descriptor_id: u32, enabled: bool },
    EventTracingStatus { enabled: bool },
    EventTracingPriority { low: bool },
    Ping,
    Pong,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Status { .. } => MessageKind::Status,
            Message::StartCapture => MessageKind::StartCapture,
            Message::StopCapture => MessageKind::StopCapture,
            Message::BlocksDescription(_) => MessageKind::BlocksDescription,
            Message::BlocksDescriptionEnd => MessageKind::BlocksDescriptionEnd,
            Message::Blocks(_) => MessageKind::Blocks,
            Message::BlocksEnd => MessageKind::BlocksEnd,
            Message::EditBlockStatus { .. } => MessageKind::EditBlockStatus,
            Message::EventTracingStatus { .. } => MessageKind::EventTracingStatus,
            Message::EventTracingPriority { .. } => MessageKind::EventTracingPriority,
            Message::Ping => MessageKind::Ping,
            Message::Pong => MessageKind::Pong,
        }
    }
}

/// Write one framed message.
pub fn write_message(writer: &mut impl Write, message: &Message) -> Result<()> {
    let mut buf = Vec::with_capacity(16);
    buf.extend_from_slice(&MAGIC.to_le_bytes());
    buf.push(message.kind() as u8);
    match message {
        Message::Status {
            version,
            process_id,
            profiling_enabled,
            event_tracing_enabled,
        } => {
            buf.extend_from_slice(&version.to_le_bytes());
            buf.extend_from_slice(&process_id.to_le_bytes());
            buf.push(*profiling_enabled as u8);
            buf.push(*event_tracing_enabled as u8);
        }
        Message::BlocksDescription(payload) | Message::Blocks(payload) => {
            if payload.len() > MAX_PAYLOAD as usize {
                return Err(ProtocolError::PayloadTooLarge(payload.len() as u32));
            }
            buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            writer.write_all(&buf)?;
            writer.write_all(payload)?;
            return Ok(());
        }
        Message::EditBlockStatus {
            descriptor_id,
            enabled,
        } => {
            buf.extend_from_slice(&descriptor_id.to_le_bytes());
            buf.push(*enabled as u8);
        }
        Message::EventTracingStatus { enabled } => buf.push(*enabled as u8),
        Message::EventTracingPriority { low } => buf.push(*low as u8),
        Message::StartCapture
        | Message::StopCapture
        | Message::BlocksDescriptionEnd
        | Message::BlocksEnd
        | Message::Ping
        | Message::Pong => {}
    }
    writer.write_all(&buf)?;
    Ok(())
}

/// Read one framed message, blocking until it is complete.
pub fn read_message(reader: &mut impl Read) -> Result<Message> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header)?;
    let magic = u32::from_le_bytes(header[0..4].try_into().expect("sized"));
    if magic != MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }
    let kind = MessageKind::from_u8(header[4]).ok_or(ProtocolError::UnknownKind(header[4]))?;

    let message = match kind {
        MessageKind::Status => {
            let mut fields = [0u8; 14];
            reader.read_exact(&mut fields)?;
            Message::Status {
                version: u32::from_le_bytes(fields[0..4].try_into().expect("sized")),
                process_id: u64::from_le_bytes(fields[4..12].try_into().expect("sized")),
                profiling_enabled: fields[12] != 0,
                event_tracing_enabled: fields[13] != 0,
            }
        }
        MessageKind::StartCapture => Message::StartCapture,
        MessageKind::StopCapture => Message::StopCapture,
        MessageKind::BlocksDescription | MessageKind::Blocks => {
            let mut size = [0u8; 4];
            reader.read_exact(&mut size)?;
            let size = u32::from_le_bytes(size);
            if size > MAX_PAYLOAD {
                return Err(ProtocolError::PayloadTooLarge(size));
            }
            let mut payload = vec![0u8; size as usize];
            reader.read_exact(&mut payload)?;
            match kind {
                MessageKind::BlocksDescription => Message::BlocksDescription(payload),
                _ => Message::Blocks(payload),
            }
        }
        MessageKind::BlocksDescriptionEnd => Message::BlocksDescriptionEnd,
        MessageKind::BlocksEnd => Message::BlocksEnd,
        MessageKind::EditBlockStatus => {
            let mut fields = [0u8; 5];
            reader.read_exact(&mut fields)?;
            Message::EditBlockStatus {
                descriptor_id: u32::from_le_bytes(fields[0..4].try_into().expect("sized")),
                enabled: fields[4] != 0,
            }
        }
        MessageKind::EventTracingStatus => {
            let mut flag = [0u8; 1];
            reader.read_exact(&mut flag)?;
            Message::EventTracingStatus {
                enabled: flag[0] != 0,
            }
        }
        MessageKind::EventTracingPriority => {
            let mut flag = [0u8; 1];
            reader.read_exact(&mut flag)?;
            Message::EventTracingPriority { low: flag[0] != 0 }
        }
        MessageKind::Ping => Message::Ping,
        MessageKind::Pong => Message::Pong,
    };
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Message::Status {
        version: VERSION,
        process_id: 1234,
        profiling_enabled: true,
        event_tracing_enabled: false,
    })]
    #[case(Message::StartCapture)]
    #[case(Message::StopCapture)]
    #[case(Message::BlocksDescription(vec![1, 2, 3]))]
    #[case(Message::BlocksDescriptionEnd)]
    #[case(Message::Blocks(vec![]))]
    #[case(Message::BlocksEnd)]
    #[case(Message::EditBlockStatus { descriptor_id: 9, enabled: false })]
    #[case(Message::EventTracingStatus { enabled: true })]
    #[case(Message::EventTracingPriority { low: true })]
    #[case(Message::Ping)]
    #[case(Message::Pong)]
    fn test_message_round_trip(#[case] message: Message) {
        let mut buf = Vec::new();
        write_message(&mut buf, &message).unwrap();
        let decoded = read_message(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, message);
    }

    #[rstest]
    fn test_consecutive_messages() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Message::StartCapture).unwrap();
        write_message(&mut buf, &Message::Blocks(vec![0xAB; 10])).unwrap();
        write_message(&mut buf, &Message::BlocksEnd).unwrap();

        let mut reader = buf.as_slice();
        assert_eq!(read_message(&mut reader).unwrap(), Message::StartCapture);
        assert_eq!(
            read_message(&mut reader).unwrap(),
            Message::Blocks(vec![0xAB; 10])
        );
        assert_eq!(read_message(&mut reader).unwrap(), Message::BlocksEnd);
    }

    #[rstest]
    fn test_bad_magic_is_fatal() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Message::Ping).unwrap();
        buf[0] ^= 0x01;
        assert!(matches!(
            read_message(&mut buf.as_slice()),
            Err(ProtocolError::BadMagic(_))
        ));
    }

    #[rstest]
    fn test_unknown_kind_rejected() {
        let mut buf = MAGIC.to_le_bytes().to_vec();
        buf.push(0xEE);
        assert!(matches!(
            read_message(&mut buf.as_slice()),
            Err(ProtocolError::UnknownKind(0xEE))
        ));
    }

    #[rstest]
    fn test_oversized_payload_rejected() {
        let mut buf = MAGIC.to_le_bytes().to_vec();
        buf.push(MessageKind::Blocks as u8);
        buf.extend_from_slice(&(MAX_PAYLOAD + 1).to_le_bytes());
        assert!(matches!(
            read_message(&mut buf.as_slice()),
            Err(ProtocolError::PayloadTooLarge(_))
        ));
    }

    #[rstest]
    fn test_truncated_message_is_io_error() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Message::Blocks(vec![1, 2, 3, 4])).unwrap();
        buf.truncate(buf.len() - 2);
        assert!(matches!(
            read_message(&mut buf.as_slice()),
            Err(ProtocolError::Io(_))
        ));
    }
}
