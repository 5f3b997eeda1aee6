use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::config::{StationConfig, SELECT_INTS};
use crate::event::EventId;
use crate::list::WaitMode;
use crate::registry::{AttachmentId, ProcessId};
use crate::remote::discovery::{locate, DiscoveryConfig};
use crate::remote::wire::{
    decode_events, decode_status, encode_events, error_from_code, op, read_frame, write_frame, Decoder, Encoder,
    RemoteEvent, RemoteStationStats,
};
use crate::station::StationId;
use crate::system::SystemStats;
use crate::topology::{ParallelPosition, Position};
use crate::{Error, Result};

/// What the gateway reported when the connection was opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteInfo {
    pub process: ProcessId,
    pub system: String,
    pub events: usize,
    pub event_size: usize,
    pub groups: usize,
}

/// A process connected to a system through its TCP gateway.
///
/// Events travel as copies: [`Self::get_events`] returns their payloads and
/// [`Self::put_events`] writes the (possibly modified) copies back. Any I/O
/// failure closes the handle; later calls return `Closed`.
pub struct RemoteSystem {
    stream: Mutex<TcpStream>,
    closed: AtomicBool,
    info: RemoteInfo,
}

impl RemoteSystem {
    pub fn connect<A: ToSocketAddrs>(addr: A, process_name: &str) -> Result<Self> {
        let mut stream = TcpStream::connect(addr).map_err(|err| Error::WriteError(err.to_string()))?;
        stream.set_nodelay(true)?;
        let mut enc = Encoder::new();
        enc.str(process_name);
        write_frame(&mut stream, op::HELLO, 0, &enc.finish()).map_err(|err| Error::WriteError(err.to_string()))?;
        let frame = read_frame(&mut stream).map_err(read_error)?;
        if frame.opcode != op::HELLO {
            return Err(Error::Protocol("expected hello"));
        }
        let payload = check_status(frame.status, frame.payload)?;
        let mut dec = Decoder::new(&payload);
        let info = RemoteInfo {
            process: ProcessId::from_index(dec.u32()?),
            system: dec.string()?,
            events: dec.u64()? as usize,
            event_size: dec.u64()? as usize,
            groups: dec.u32()? as usize,
        };
        dec.finish()?;
        log::info!("connected to system {} as process {}", info.system, info.process.raw());
        Ok(Self {
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
            info,
        })
    }

    /// Finds the system through UDP discovery and connects to it.
    pub fn locate(system: &str, process_name: &str, discovery: &DiscoveryConfig) -> Result<Self> {
        let located = locate(system, discovery)?;
        Self::connect(located.addr, process_name)
    }

    pub fn info(&self) -> &RemoteInfo {
        &self.info
    }

    fn call(&self, opcode: u16, payload: Vec<u8>) -> Result<Vec<u8>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let mut stream = self.stream.lock()?;
        if let Err(err) = write_frame(&mut *stream, opcode, 0, &payload) {
            self.closed.store(true, Ordering::Release);
            return Err(Error::WriteError(err.to_string()));
        }
        let frame = match read_frame(&mut *stream) {
            Ok(frame) => frame,
            Err(err) => {
                self.closed.store(true, Ordering::Release);
                return Err(read_error(err));
            }
        };
        if frame.opcode != opcode {
            self.closed.store(true, Ordering::Release);
            return Err(Error::Protocol("response to a different request"));
        }
        check_status(frame.status, frame.payload)
    }

    fn call_unit(&self, opcode: u16, enc: Encoder) -> Result<()> {
        let payload = self.call(opcode, enc.finish())?;
        Decoder::new(&payload).finish()
    }

    fn call_u32(&self, opcode: u16, enc: Encoder) -> Result<u32> {
        let payload = self.call(opcode, enc.finish())?;
        let mut dec = Decoder::new(&payload);
        let value = dec.u32()?;
        dec.finish()?;
        Ok(value)
    }

    fn call_events(&self, opcode: u16, enc: Encoder) -> Result<Vec<RemoteEvent>> {
        let payload = self.call(opcode, enc.finish())?;
        let mut dec = Decoder::new(&payload);
        let events = decode_events(&mut dec)?;
        dec.finish()?;
        Ok(events)
    }

    pub fn create_station(&self, name: &str, config: &StationConfig) -> Result<StationId> {
        self.create_station_at(name, config, Position::End, ParallelPosition::End)
    }

    /// The selector callback of a `User` station cannot cross the wire;
    /// such stations must be created locally.
    pub fn create_station_at(
        &self,
        name: &str,
        config: &StationConfig,
        position: Position,
        parallel: ParallelPosition,
    ) -> Result<StationId> {
        let json = serde_json::to_vec(config).map_err(|err| Error::InvalidConfig(err.to_string()))?;
        let mut enc = Encoder::new();
        enc.str(name).bytes(&json);
        match position {
            Position::End => enc.u8(0).u32(0),
            Position::At(n) => enc.u8(1).u32(n as u32),
        };
        match parallel {
            ParallelPosition::End => enc.u8(0).u32(0),
            ParallelPosition::At(n) => enc.u8(1).u32(n as u32),
            ParallelPosition::NewHead => enc.u8(2).u32(0),
        };
        Ok(StationId::from_index(self.call_u32(op::CREATE_STATION, enc)?))
    }

    pub fn remove_station(&self, id: StationId) -> Result<()> {
        let mut enc = Encoder::new();
        enc.u32(id.raw());
        self.call_unit(op::REMOVE_STATION, enc)
    }

    pub fn station_id(&self, name: &str) -> Result<StationId> {
        let mut enc = Encoder::new();
        enc.str(name);
        Ok(StationId::from_index(self.call_u32(op::STATION_ID, enc)?))
    }

    pub fn set_select_words(&self, id: StationId, words: [i32; SELECT_INTS]) -> Result<()> {
        let mut enc = Encoder::new();
        enc.u32(id.raw()).words(&words);
        self.call_unit(op::SET_SELECT_WORDS, enc)
    }

    pub fn attach(&self, station: StationId) -> Result<AttachmentId> {
        let mut enc = Encoder::new();
        enc.u32(station.raw());
        Ok(AttachmentId::from_index(self.call_u32(op::ATTACH, enc)?))
    }

    pub fn detach(&self, att: AttachmentId) -> Result<()> {
        let mut enc = Encoder::new();
        enc.u32(att.raw());
        self.call_unit(op::DETACH, enc)
    }

    /// Fresh events come back with empty data and their capacity set.
    pub fn new_events(&self, att: AttachmentId, mode: WaitMode, size: usize, count: usize) -> Result<Vec<RemoteEvent>> {
        self.new_events_in_group(att, mode, size, count, 0)
    }

    /// `group` 0 means any group.
    pub fn new_events_in_group(
        &self,
        att: AttachmentId,
        mode: WaitMode,
        size: usize,
        count: usize,
        group: u32,
    ) -> Result<Vec<RemoteEvent>> {
        let mut enc = Encoder::new();
        enc.u32(att.raw())
            .wait_mode(mode)
            .u64(size as u64)
            .u32(count as u32)
            .u32(group);
        self.call_events(op::NEW_EVENTS, enc)
    }

    pub fn get_events(&self, att: AttachmentId, mode: WaitMode, count: usize) -> Result<Vec<RemoteEvent>> {
        let mut enc = Encoder::new();
        enc.u32(att.raw()).wait_mode(mode).u32(count as u32);
        self.call_events(op::GET_EVENTS, enc)
    }

    pub fn put_events(&self, att: AttachmentId, events: &[RemoteEvent]) -> Result<()> {
        for event in events {
            if event.data.len() > event.capacity {
                return Err(Error::LengthTooLarge {
                    len: event.data.len(),
                    capacity: event.capacity,
                });
            }
        }
        let mut enc = Encoder::new();
        enc.u32(att.raw());
        encode_events(&mut enc, events);
        self.call_unit(op::PUT_EVENTS, enc)
    }

    pub fn dump_events(&self, att: AttachmentId, events: &[RemoteEvent]) -> Result<()> {
        let ids: Vec<EventId> = events.iter().map(|e| e.id).collect();
        let mut enc = Encoder::new();
        enc.u32(att.raw()).ids(&ids);
        self.call_unit(op::DUMP_EVENTS, enc)
    }

    pub fn wakeup(&self, att: AttachmentId) -> Result<()> {
        let mut enc = Encoder::new();
        enc.u32(att.raw());
        self.call_unit(op::WAKEUP, enc)
    }

    pub fn wakeup_all(&self, station: StationId) -> Result<()> {
        let mut enc = Encoder::new();
        enc.u32(station.raw());
        self.call_unit(op::WAKEUP_ALL, enc)
    }

    pub fn system_stats(&self) -> Result<SystemStats> {
        let payload = self.call(op::SYSTEM_STATS, Vec::new())?;
        let mut dec = Decoder::new(&payload);
        let stats = SystemStats {
            heartbeat: dec.u64()?,
            processes: dec.u32()? as usize,
            attachments: dec.u32()? as usize,
            stations: dec.u32()? as usize,
            events: dec.u64()? as usize,
            event_size: dec.u64()? as usize,
            groups: dec.u32()? as usize,
            temps: dec.u64()? as usize,
            max_temps: dec.u64()? as usize,
        };
        dec.finish()?;
        Ok(stats)
    }

    pub fn stations(&self) -> Result<Vec<RemoteStationStats>> {
        let payload = self.call(op::STATIONS, Vec::new())?;
        let mut dec = Decoder::new(&payload);
        let count = dec.u32()?;
        let mut stations = Vec::new();
        for _ in 0..count {
            stations.push(RemoteStationStats {
                id: StationId::from_index(dec.u32()?),
                name: dec.string()?,
                status: decode_status(dec.u8()?)?,
                attachments: dec.u32()? as usize,
                input: dec.u64()? as usize,
                output: dec.u64()? as usize,
            });
        }
        dec.finish()?;
        Ok(stations)
    }

    /// Tells the gateway to detach everything and drops the connection.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut stream = self.stream.lock()?;
        write_frame(&mut *stream, op::CLOSE, 0, &[]).map_err(|err| Error::WriteError(err.to_string()))?;
        read_frame(&mut *stream).map_err(read_error)?;
        Ok(())
    }
}

impl Drop for RemoteSystem {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn read_error(err: Error) -> Error {
    match err {
        Error::Io(err) => Error::ReadError(err.to_string()),
        other => other,
    }
}

fn check_status(status: u16, payload: Vec<u8>) -> Result<Vec<u8>> {
    if status == 0 {
        return Ok(payload);
    }
    let message = Decoder::new(&payload).string().unwrap_or_default();
    log::debug!("remote call failed: {message}");
    Err(error_from_code(status, message))
}
