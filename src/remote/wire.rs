//! Binary frames exchanged between [`RemoteSystem`](super::RemoteSystem)
//! and the gateway.
//!
//! Every frame is a 16 byte little-endian header followed by the payload:
//!
//! ```text
//!   0..4    magic "ETB1"
//!   4..8    payload length
//!   8..12   crc32 of the payload
//!   12..14  opcode
//!   14..16  status (responses; 0 = ok, otherwise an error code)
//! ```

use std::io::{Read, Write};
use std::time::Duration;

use crate::config::SELECT_INTS;
use crate::event::{ByteOrder, DataStatus, EventId, Priority};
use crate::list::WaitMode;
use crate::station::{StationId, StationStatus};
use crate::{Error, Result};

pub(crate) const MAGIC: [u8; 4] = *b"ETB1";
pub(crate) const HEADER_LEN: usize = 16;
/// Frames above this size are refused rather than allocated.
pub(crate) const MAX_FRAME: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub(crate) length: u32,
    pub(crate) checksum: u32,
    pub(crate) opcode: u16,
    pub(crate) status: u16,
}

impl FrameHeader {
    pub(crate) fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12..14].copy_from_slice(&self.opcode.to_le_bytes());
        buf[14..16].copy_from_slice(&self.status.to_le_bytes());
        buf
    }

    pub(crate) fn from_bytes(bytes: &[u8; HEADER_LEN]) -> Result<Self> {
        if bytes[0..4] != MAGIC {
            return Err(Error::Protocol("bad frame magic"));
        }
        let mut decoder = Decoder::new(&bytes[4..]);
        Ok(Self {
            length: decoder.u32()?,
            checksum: decoder.u32()?,
            opcode: decoder.u16()?,
            status: decoder.u16()?,
        })
    }
}

pub(crate) fn crc32(payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// A decoded frame: opcode, status and checked payload.
#[derive(Debug)]
pub(crate) struct Frame {
    pub(crate) opcode: u16,
    pub(crate) status: u16,
    pub(crate) payload: Vec<u8>,
}

pub(crate) fn write_frame<W: Write>(out: &mut W, opcode: u16, status: u16, payload: &[u8]) -> std::io::Result<()> {
    let header = FrameHeader {
        length: payload.len() as u32,
        checksum: crc32(payload),
        opcode,
        status,
    };
    out.write_all(&header.to_bytes())?;
    out.write_all(payload)?;
    out.flush()
}

/// Reads one frame. I/O failures come back as `Io`; malformed frames as
/// `Protocol`.
pub(crate) fn read_frame<R: Read>(input: &mut R) -> Result<Frame> {
    let mut head = [0u8; HEADER_LEN];
    input.read_exact(&mut head)?;
    let header = FrameHeader::from_bytes(&head)?;
    let len = header.length as usize;
    if len > MAX_FRAME {
        return Err(Error::Protocol("frame too large"));
    }
    let mut payload = vec![0u8; len];
    input.read_exact(&mut payload)?;
    if crc32(&payload) != header.checksum {
        return Err(Error::Protocol("crc mismatch"));
    }
    Ok(Frame {
        opcode: header.opcode,
        status: header.status,
        payload,
    })
}

pub(crate) mod op {
    pub(crate) const HELLO: u16 = 1;
    pub(crate) const CLOSE: u16 = 2;
    pub(crate) const CREATE_STATION: u16 = 3;
    pub(crate) const REMOVE_STATION: u16 = 4;
    pub(crate) const STATION_ID: u16 = 5;
    pub(crate) const SET_SELECT_WORDS: u16 = 6;
    pub(crate) const ATTACH: u16 = 7;
    pub(crate) const DETACH: u16 = 8;
    pub(crate) const NEW_EVENTS: u16 = 9;
    pub(crate) const GET_EVENTS: u16 = 10;
    pub(crate) const PUT_EVENTS: u16 = 11;
    pub(crate) const DUMP_EVENTS: u16 = 12;
    pub(crate) const WAKEUP: u16 = 13;
    pub(crate) const WAKEUP_ALL: u16 = 14;
    pub(crate) const SYSTEM_STATS: u16 = 15;
    pub(crate) const STATIONS: u16 = 16;
}

/// Error code carried in a response's status field.
pub(crate) fn error_code(err: &Error) -> u16 {
    match err {
        Error::Io(_) => 1,
        Error::InvalidArgument(_) => 2,
        Error::InvalidConfig(_) => 3,
        Error::InvalidOperation(_) => 4,
        Error::DuplicateName(_) => 5,
        Error::TooMany(_) => 6,
        Error::Closed => 7,
        Error::Dead => 8,
        Error::Wakeup => 9,
        Error::Timeout => 10,
        Error::Busy => 11,
        Error::Empty => 12,
        Error::NotOwner => 13,
        Error::LengthTooLarge { .. } => 14,
        Error::ReadError(_) => 15,
        Error::WriteError(_) => 16,
        Error::Protocol(_) => 17,
    }
}

/// Text sent alongside an error code. Variants that carry owned data send
/// that data so the client can rebuild them exactly.
pub(crate) fn error_detail(err: &Error) -> String {
    match err {
        Error::InvalidConfig(detail)
        | Error::DuplicateName(detail)
        | Error::ReadError(detail)
        | Error::WriteError(detail) => detail.clone(),
        Error::LengthTooLarge { len, capacity } => format!("{len}/{capacity}"),
        other => other.to_string(),
    }
}

/// Rebuilds the error a gateway reported. Static context is lost on the
/// way; `message` keeps the gateway's rendering.
pub(crate) fn error_from_code(code: u16, message: String) -> Error {
    match code {
        1 => Error::Io(std::io::Error::new(std::io::ErrorKind::Other, message)),
        2 => Error::InvalidArgument("rejected by remote system"),
        3 => Error::InvalidConfig(message),
        4 => Error::InvalidOperation("refused by remote system"),
        5 => Error::DuplicateName(message),
        6 => Error::TooMany("resources on remote system"),
        7 => Error::Closed,
        8 => Error::Dead,
        9 => Error::Wakeup,
        10 => Error::Timeout,
        11 => Error::Busy,
        12 => Error::Empty,
        13 => Error::NotOwner,
        14 => {
            let mut parts = message.split('/').map(|part| part.parse::<usize>().unwrap_or(0));
            Error::LengthTooLarge {
                len: parts.next().unwrap_or(0),
                capacity: parts.next().unwrap_or(0),
            }
        }
        15 => Error::ReadError(message),
        16 => Error::WriteError(message),
        _ => Error::Protocol("unknown error code"),
    }
}

#[derive(Default)]
pub(crate) struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        self.buf
    }

    pub(crate) fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub(crate) fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub(crate) fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub(crate) fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub(crate) fn i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub(crate) fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.u32(v.len() as u32);
        self.buf.extend_from_slice(v);
        self
    }

    pub(crate) fn str(&mut self, v: &str) -> &mut Self {
        self.bytes(v.as_bytes())
    }

    pub(crate) fn words(&mut self, words: &[i32; SELECT_INTS]) -> &mut Self {
        for &word in words {
            self.i32(word);
        }
        self
    }

    pub(crate) fn wait_mode(&mut self, mode: WaitMode) -> &mut Self {
        match mode {
            WaitMode::Sleep => self.u8(0).u64(0),
            WaitMode::Timed(timeout) => self.u8(1).u64(timeout.as_micros() as u64),
            WaitMode::Async => self.u8(2).u64(0),
        }
    }

    pub(crate) fn ids(&mut self, ids: &[EventId]) -> &mut Self {
        self.u32(ids.len() as u32);
        for id in ids {
            self.u32(id.raw());
        }
        self
    }
}

pub(crate) struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or(Error::Protocol("truncated frame"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub(crate) fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub(crate) fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    pub(crate) fn string(&mut self) -> Result<String> {
        String::from_utf8(self.bytes()?.to_vec()).map_err(|_| Error::Protocol("invalid utf-8"))
    }

    pub(crate) fn words(&mut self) -> Result<[i32; SELECT_INTS]> {
        let mut words = [0; SELECT_INTS];
        for word in &mut words {
            *word = self.i32()?;
        }
        Ok(words)
    }

    pub(crate) fn wait_mode(&mut self) -> Result<WaitMode> {
        let kind = self.u8()?;
        let micros = self.u64()?;
        match kind {
            0 => Ok(WaitMode::Sleep),
            1 => Ok(WaitMode::Timed(Duration::from_micros(micros))),
            2 => Ok(WaitMode::Async),
            _ => Err(Error::Protocol("unknown wait mode")),
        }
    }

    pub(crate) fn ids(&mut self) -> Result<Vec<EventId>> {
        let count = self.u32()? as usize;
        if count > self.buf.len() {
            return Err(Error::Protocol("id count exceeds frame"));
        }
        (0..count).map(|_| Ok(EventId::from_index(self.u32()?))).collect()
    }

    pub(crate) fn finish(&self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(Error::Protocol("trailing bytes in frame"));
        }
        Ok(())
    }
}

/// Copy of an event as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEvent {
    pub id: EventId,
    pub group: u32,
    /// Largest payload the event accepts.
    pub capacity: usize,
    pub priority: Priority,
    pub control: [i32; SELECT_INTS],
    pub status: DataStatus,
    pub byte_order: ByteOrder,
    pub data: Vec<u8>,
}

impl RemoteEvent {
    pub fn needs_swap(&self) -> bool {
        self.byte_order != ByteOrder::native()
    }

    pub(crate) fn encode(&self, enc: &mut Encoder) {
        enc.u32(self.id.raw())
            .u32(self.group)
            .u64(self.capacity as u64)
            .u8(match self.priority {
                Priority::Low => 0,
                Priority::High => 1,
            })
            .words(&self.control)
            .u8(match self.status {
                DataStatus::Ok => 0,
                DataStatus::Corrupt => 1,
                DataStatus::PossiblyCorrupt => 2,
            })
            .u8(match self.byte_order {
                ByteOrder::Big => 0,
                ByteOrder::Little => 1,
            })
            .bytes(&self.data);
    }

    pub(crate) fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let id = EventId::from_index(dec.u32()?);
        let group = dec.u32()?;
        let capacity = dec.u64()? as usize;
        let priority = match dec.u8()? {
            0 => Priority::Low,
            1 => Priority::High,
            _ => return Err(Error::Protocol("unknown priority")),
        };
        let control = dec.words()?;
        let status = match dec.u8()? {
            0 => DataStatus::Ok,
            1 => DataStatus::Corrupt,
            2 => DataStatus::PossiblyCorrupt,
            _ => return Err(Error::Protocol("unknown data status")),
        };
        let byte_order = match dec.u8()? {
            0 => ByteOrder::Big,
            1 => ByteOrder::Little,
            _ => return Err(Error::Protocol("unknown byte order")),
        };
        let data = dec.bytes()?.to_vec();
        Ok(Self {
            id,
            group,
            capacity,
            priority,
            control,
            status,
            byte_order,
            data,
        })
    }
}

pub(crate) fn encode_events(enc: &mut Encoder, events: &[RemoteEvent]) {
    enc.u32(events.len() as u32);
    for event in events {
        event.encode(enc);
    }
}

pub(crate) fn decode_events(dec: &mut Decoder<'_>) -> Result<Vec<RemoteEvent>> {
    let count = dec.u32()? as usize;
    let mut events = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        events.push(RemoteEvent::decode(dec)?);
    }
    Ok(events)
}

/// Per-station summary returned to remote monitors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStationStats {
    pub id: StationId,
    pub name: String,
    pub status: StationStatus,
    pub attachments: usize,
    pub input: usize,
    pub output: usize,
}

pub(crate) fn encode_status(status: StationStatus) -> u8 {
    match status {
        StationStatus::Unused => 0,
        StationStatus::Creating => 1,
        StationStatus::Idle => 2,
        StationStatus::Active => 3,
    }
}

pub(crate) fn decode_status(raw: u8) -> Result<StationStatus> {
    match raw {
        0 => Ok(StationStatus::Unused),
        1 => Ok(StationStatus::Creating),
        2 => Ok(StationStatus::Idle),
        3 => Ok(StationStatus::Active),
        _ => Err(Error::Protocol("unknown station status")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_survives_round_trip() -> Result<()> {
        let mut buf = Vec::new();
        write_frame(&mut buf, op::ATTACH, 0, b"payload")?;
        assert_eq!(buf.len(), HEADER_LEN + 7);
        let frame = read_frame(&mut buf.as_slice())?;
        assert_eq!(frame.opcode, op::ATTACH);
        assert_eq!(frame.payload, b"payload");
        Ok(())
    }

    #[test]
    fn corrupted_payload_is_rejected() -> Result<()> {
        let mut buf = Vec::new();
        write_frame(&mut buf, op::GET_EVENTS, 0, b"abc")?;
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        assert!(matches!(read_frame(&mut buf.as_slice()), Err(Error::Protocol("crc mismatch"))));
        Ok(())
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(b"NOPE");
        assert!(FrameHeader::from_bytes(&buf).is_err());
    }

    #[test]
    fn truncated_payload_fails_to_decode() {
        let mut enc = Encoder::new();
        enc.u32(3).u8(1);
        let bytes = enc.finish();
        let mut dec = Decoder::new(&bytes);
        assert!(dec.ids().is_err());
    }

    #[test]
    fn event_copy_keeps_header_fields() -> Result<()> {
        let event = RemoteEvent {
            id: EventId::from_index(9),
            group: 2,
            capacity: 128,
            priority: Priority::High,
            control: [7, 0, -1, 3, 0, 0],
            status: DataStatus::PossiblyCorrupt,
            byte_order: ByteOrder::Big,
            data: b"abc".to_vec(),
        };
        let mut enc = Encoder::new();
        encode_events(&mut enc, std::slice::from_ref(&event));
        let bytes = enc.finish();
        let mut dec = Decoder::new(&bytes);
        let decoded = decode_events(&mut dec)?;
        dec.finish()?;
        assert_eq!(decoded, vec![event]);
        Ok(())
    }

    #[test]
    fn error_codes_map_back() {
        let err = error_from_code(error_code(&Error::Timeout), String::new());
        assert!(matches!(err, Error::Timeout));
        let original = Error::DuplicateName("f".into());
        let err = error_from_code(error_code(&original), error_detail(&original));
        assert!(matches!(err, Error::DuplicateName(name) if name == "f"));
        let original = Error::LengthTooLarge { len: 40, capacity: 32 };
        let err = error_from_code(error_code(&original), error_detail(&original));
        assert!(matches!(err, Error::LengthTooLarge { len: 40, capacity: 32 }));
    }
}
