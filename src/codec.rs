//! Wire codec (spec §4.G): framed, versioned message and intent records.
//!
//! Grounded in the teacher's `RootHeader` (`src/lib.rs`): a fixed-size,
//! `bytemuck`-friendly header struct, an xxHash-style validate-then-trust
//! decode, explicit big-endian multi-byte fields via `byteorder`. Unlike
//! the root header, these frames are variable-length (trailing message-id/
//! trace-id/payload), so the header is hand-encoded/decoded with
//! `byteorder` rather than `bytemuck::Pod`.

use byteorder::{BigEndian, ByteOrder};

use crate::error::CodecError;

pub const MESSAGE_MAGIC: [u8; 4] = *b"LMSG";
pub const INTENT_MAGIC: [u8; 4] = *b"LINT";

pub const MESSAGE_HEADER_LEN: usize = 60;
pub const INTENT_HEADER_LEN: usize = 28;

const VERSION_MAJOR: u16 = 0;
const VERSION_MINOR: u16 = 0;

const NO_TRACE_ID: u32 = 0xFFFF_FFFF;

/// Message frame kind (spec §4.G).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Command = 0,
    Event = 1,
    Timer = 2,
}

impl MessageKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(MessageKind::Command),
            1 => Some(MessageKind::Event),
            2 => Some(MessageKind::Timer),
            _ => None,
        }
    }
}

/// Message flags (spec §4.G): only this exact set is valid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageFlags(u8);

impl MessageFlags {
    pub const DURABLE: MessageFlags = MessageFlags(0b0000_0001);
    pub const HIGH_PRIORITY: MessageFlags = MessageFlags(0b0000_0010);
    pub const DEDUPE_REQUIRED: MessageFlags = MessageFlags(0b0000_0100);
    pub const REQUIRES_ACK: MessageFlags = MessageFlags(0b0000_1000);
    pub const HAS_FROM_WORKER: MessageFlags = MessageFlags(0b0001_0000);
    pub const HAS_TRACE_ID: MessageFlags = MessageFlags(0b0010_0000);

    const ALL: u8 = 0b0011_1111;

    pub const fn empty() -> Self {
        MessageFlags(0)
    }

    pub fn contains(self, flag: MessageFlags) -> bool {
        self.0 & flag.0 == flag.0
    }

    fn is_valid(self) -> bool {
        self.0 & !Self::ALL == 0
    }
}

impl std::ops::BitOr for MessageFlags {
    type Output = MessageFlags;
    fn bitor(self, rhs: MessageFlags) -> MessageFlags {
        MessageFlags(self.0 | rhs.0)
    }
}

/// A decoded message frame (spec §4.G). String/byte fields borrow from
/// the source buffer on decode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message<'a> {
    pub kind: MessageKind,
    pub flags: MessageFlags,
    pub to_worker: i64,
    pub route_worker: i64,
    pub route_timestamp: i64,
    pub from_worker: i64,
    pub message_id: &'a [u8],
    pub trace_id: Option<&'a [u8]>,
    pub payload: &'a [u8],
}

impl<'a> Message<'a> {
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        if !self.flags.is_valid() {
            return Err(CodecError::Einval);
        }
        if self.message_id.is_empty() {
            return Err(CodecError::Einval);
        }
        if self.from_worker != 0 && !self.flags.contains(MessageFlags::HAS_FROM_WORKER) {
            return Err(CodecError::Einval);
        }
        if self.trace_id.is_some() != self.flags.contains(MessageFlags::HAS_TRACE_ID) {
            return Err(CodecError::Einval);
        }

        let trace_len = self.trace_id.map(|t| t.len() as u32).unwrap_or(NO_TRACE_ID);
        let frame_len = MESSAGE_HEADER_LEN
            + self.message_id.len()
            + self.trace_id.map(|t| t.len()).unwrap_or(0)
            + self.payload.len();
        let frame_len: u32 = frame_len.try_into().map_err(|_| CodecError::E2big)?;

        out.clear();
        out.extend_from_slice(&MESSAGE_MAGIC);
        let mut buf = [0u8; 2];
        BigEndian::write_u16(&mut buf, VERSION_MAJOR);
        out.extend_from_slice(&buf);
        BigEndian::write_u16(&mut buf, VERSION_MINOR);
        out.extend_from_slice(&buf);
        let mut len_buf = [0u8; 4];
        BigEndian::write_u32(&mut len_buf, frame_len);
        out.extend_from_slice(&len_buf);
        out.push(self.kind as u8);
        out.push(self.flags.0);
        out.extend_from_slice(&[0u8; 2]); // reserved
        let mut i64buf = [0u8; 8];
        for v in [
            self.to_worker,
            self.route_worker,
            self.route_timestamp,
            self.from_worker,
        ] {
            BigEndian::write_i64(&mut i64buf, v);
            out.extend_from_slice(&i64buf);
        }
        let mut u32buf = [0u8; 4];
        BigEndian::write_u32(&mut u32buf, self.message_id.len() as u32);
        out.extend_from_slice(&u32buf);
        BigEndian::write_u32(&mut u32buf, trace_len);
        out.extend_from_slice(&u32buf);
        BigEndian::write_u32(&mut u32buf, self.payload.len() as u32);
        out.extend_from_slice(&u32buf);

        debug_assert_eq!(out.len(), MESSAGE_HEADER_LEN);
        out.extend_from_slice(self.message_id);
        if let Some(trace_id) = self.trace_id {
            out.extend_from_slice(trace_id);
        }
        out.extend_from_slice(self.payload);
        Ok(())
    }

    pub fn decode(buf: &'a [u8]) -> Result<Self, CodecError> {
        if buf.len() < MESSAGE_HEADER_LEN {
            return Err(CodecError::Etrunc);
        }
        if buf[0..4] != MESSAGE_MAGIC {
            return Err(CodecError::Eformat);
        }
        let major = BigEndian::read_u16(&buf[4..6]);
        let minor = BigEndian::read_u16(&buf[6..8]);
        if major != VERSION_MAJOR || minor != VERSION_MINOR {
            return Err(CodecError::Eversion);
        }
        let frame_len = BigEndian::read_u32(&buf[8..12]) as usize;
        if frame_len > buf.len() {
            return Err(CodecError::Etrunc);
        }
        if frame_len < MESSAGE_HEADER_LEN {
            return Err(CodecError::Eformat);
        }
        let kind = MessageKind::from_u8(buf[12]).ok_or(CodecError::Eformat)?;
        let flags = MessageFlags(buf[13]);
        if !flags.is_valid() {
            return Err(CodecError::Eformat);
        }
        // buf[14..16] reserved, ignored.
        let to_worker = BigEndian::read_i64(&buf[16..24]);
        let route_worker = BigEndian::read_i64(&buf[24..32]);
        let route_timestamp = BigEndian::read_i64(&buf[32..40]);
        let from_worker = BigEndian::read_i64(&buf[40..48]);
        if from_worker != 0 && !flags.contains(MessageFlags::HAS_FROM_WORKER) {
            return Err(CodecError::Eformat);
        }
        let message_id_len = BigEndian::read_u32(&buf[48..52]) as usize;
        let trace_id_len_field = BigEndian::read_u32(&buf[52..56]);
        let has_trace = flags.contains(MessageFlags::HAS_TRACE_ID);
        if (trace_id_len_field == NO_TRACE_ID) == has_trace {
            return Err(CodecError::Eformat);
        }
        let payload_len = BigEndian::read_u32(&buf[56..60]) as usize;
        if message_id_len == 0 {
            return Err(CodecError::Eformat);
        }

        let mut pos = MESSAGE_HEADER_LEN;
        let message_id = buf.get(pos..pos + message_id_len).ok_or(CodecError::Etrunc)?;
        pos += message_id_len;
        let trace_id = if has_trace {
            let len = trace_id_len_field as usize;
            let t = buf.get(pos..pos + len).ok_or(CodecError::Etrunc)?;
            pos += len;
            Some(t)
        } else {
            None
        };
        let payload = buf.get(pos..pos + payload_len).ok_or(CodecError::Etrunc)?;
        pos += payload_len;
        if pos != frame_len {
            return Err(CodecError::Eformat);
        }

        Ok(Message {
            kind,
            flags,
            to_worker,
            route_worker,
            route_timestamp,
            from_worker,
            message_id,
            trace_id,
            payload,
        })
    }
}

/// Intent frame kind (spec §4.G).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntentKind {
    OutboxEmit = 0,
    TimerArm = 1,
}

impl IntentKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(IntentKind::OutboxEmit),
            1 => Some(IntentKind::TimerArm),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IntentFlags(u8);

impl IntentFlags {
    pub const HAS_DUE_TS: IntentFlags = IntentFlags(0b01);

    const ALL: u8 = 0b01;

    pub const fn empty() -> Self {
        IntentFlags(0)
    }

    pub fn contains(self, flag: IntentFlags) -> bool {
        self.0 & flag.0 == flag.0
    }

    fn is_valid(self) -> bool {
        self.0 & !Self::ALL == 0
    }
}

/// A decoded intent frame (spec §4.G).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Intent<'a> {
    pub kind: IntentKind,
    pub flags: IntentFlags,
    pub due_ts: i64,
    pub message: &'a [u8],
}

impl<'a> Intent<'a> {
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        if !self.flags.is_valid() {
            return Err(CodecError::Einval);
        }
        if self.message.is_empty() {
            return Err(CodecError::Einval);
        }
        let has_due = self.flags.contains(IntentFlags::HAS_DUE_TS);
        match self.kind {
            IntentKind::OutboxEmit if has_due => return Err(CodecError::Einval),
            IntentKind::TimerArm if !has_due => return Err(CodecError::Einval),
            _ => {}
        }

        let frame_len = INTENT_HEADER_LEN + self.message.len();
        let frame_len: u32 = frame_len.try_into().map_err(|_| CodecError::E2big)?;

        out.clear();
        out.extend_from_slice(&INTENT_MAGIC);
        let mut buf = [0u8; 2];
        BigEndian::write_u16(&mut buf, VERSION_MAJOR);
        out.extend_from_slice(&buf);
        BigEndian::write_u16(&mut buf, VERSION_MINOR);
        out.extend_from_slice(&buf);
        let mut len_buf = [0u8; 4];
        BigEndian::write_u32(&mut len_buf, frame_len);
        out.extend_from_slice(&len_buf);
        out.push(self.kind as u8);
        out.push(self.flags.0);
        out.extend_from_slice(&[0u8; 2]); // reserved
        let mut i64buf = [0u8; 8];
        BigEndian::write_i64(&mut i64buf, self.due_ts);
        out.extend_from_slice(&i64buf);
        let mut u32buf = [0u8; 4];
        BigEndian::write_u32(&mut u32buf, self.message.len() as u32);
        out.extend_from_slice(&u32buf);

        debug_assert_eq!(out.len(), INTENT_HEADER_LEN);
        out.extend_from_slice(self.message);
        Ok(())
    }

    pub fn decode(buf: &'a [u8]) -> Result<Self, CodecError> {
        if buf.len() < INTENT_HEADER_LEN {
            return Err(CodecError::Etrunc);
        }
        if buf[0..4] != INTENT_MAGIC {
            return Err(CodecError::Eformat);
        }
        let major = BigEndian::read_u16(&buf[4..6]);
        let minor = BigEndian::read_u16(&buf[6..8]);
        if major != VERSION_MAJOR || minor != VERSION_MINOR {
            return Err(CodecError::Eversion);
        }
        let frame_len = BigEndian::read_u32(&buf[8..12]) as usize;
        if frame_len > buf.len() {
            return Err(CodecError::Etrunc);
        }
        if frame_len < INTENT_HEADER_LEN {
            return Err(CodecError::Eformat);
        }
        let kind = IntentKind::from_u8(buf[12]).ok_or(CodecError::Eformat)?;
        let flags = IntentFlags(buf[13]);
        if !flags.is_valid() {
            return Err(CodecError::Eformat);
        }
        let has_due = flags.contains(IntentFlags::HAS_DUE_TS);
        match kind {
            IntentKind::OutboxEmit if has_due => return Err(CodecError::Eformat),
            IntentKind::TimerArm if !has_due => return Err(CodecError::Eformat),
            _ => {}
        }
        let due_ts = BigEndian::read_i64(&buf[16..24]);
        let message_len = BigEndian::read_u32(&buf[24..28]) as usize;
        if message_len == 0 {
            return Err(CodecError::Eformat);
        }
        let message = buf
            .get(INTENT_HEADER_LEN..INTENT_HEADER_LEN + message_len)
            .ok_or(CodecError::Etrunc)?;
        if INTENT_HEADER_LEN + message_len != frame_len {
            return Err(CodecError::Eformat);
        }

        Ok(Intent {
            kind,
            flags,
            due_ts,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trip() {
        let msg = Message {
            kind: MessageKind::Command,
            flags: MessageFlags::empty(),
            to_worker: 42,
            route_worker: 0,
            route_timestamp: 0,
            from_worker: 0,
            message_id: b"ex-1",
            trace_id: None,
            payload: b"native-v0",
        };
        let mut buf = Vec::new();
        msg.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), 73);
        assert_eq!(&buf[0..4], b"LMSG");
        let decoded = Message::decode(&buf).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn message_truncated_is_etrunc() {
        let msg = Message {
            kind: MessageKind::Command,
            flags: MessageFlags::empty(),
            to_worker: 42,
            route_worker: 0,
            route_timestamp: 0,
            from_worker: 0,
            message_id: b"ex-1",
            trace_id: None,
            payload: b"native-v0",
        };
        let mut buf = Vec::new();
        msg.encode(&mut buf).unwrap();
        buf.pop();
        assert!(matches!(Message::decode(&buf), Err(CodecError::Etrunc)));
    }

    #[test]
    fn message_bad_magic_is_eformat() {
        let msg = Message {
            kind: MessageKind::Command,
            flags: MessageFlags::empty(),
            to_worker: 42,
            route_worker: 0,
            route_timestamp: 0,
            from_worker: 0,
            message_id: b"ex-1",
            trace_id: None,
            payload: b"native-v0",
        };
        let mut buf = Vec::new();
        msg.encode(&mut buf).unwrap();
        buf[0] = b'X';
        assert!(matches!(Message::decode(&buf), Err(CodecError::Eformat)));
    }

    #[test]
    fn message_bumped_minor_version_is_eversion() {
        let msg = Message {
            kind: MessageKind::Command,
            flags: MessageFlags::empty(),
            to_worker: 42,
            route_worker: 0,
            route_timestamp: 0,
            from_worker: 0,
            message_id: b"ex-1",
            trace_id: None,
            payload: b"native-v0",
        };
        let mut buf = Vec::new();
        msg.encode(&mut buf).unwrap();
        buf[7] = 1;
        assert!(matches!(Message::decode(&buf), Err(CodecError::Eversion)));
    }

    #[test]
    fn intent_outbox_emit_rejects_due_ts() {
        let intent = Intent {
            kind: IntentKind::OutboxEmit,
            flags: IntentFlags::HAS_DUE_TS,
            due_ts: 0,
            message: b"evt",
        };
        let mut buf = Vec::new();
        assert!(matches!(intent.encode(&mut buf), Err(CodecError::Einval)));
    }

    #[test]
    fn intent_timer_arm_round_trip() {
        let intent = Intent {
            kind: IntentKind::TimerArm,
            flags: IntentFlags::HAS_DUE_TS,
            due_ts: 1234,
            message: b"evt",
        };
        let mut buf = Vec::new();
        intent.encode(&mut buf).unwrap();
        let decoded = Intent::decode(&buf).unwrap();
        assert_eq!(decoded, intent);
    }
}
