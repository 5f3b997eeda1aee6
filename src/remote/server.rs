use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::{GatewayConfig, StationConfig};
use crate::event::{Event, EventId};
use crate::list::WaitMode;
use crate::process::ProcessHandle;
use crate::registry::AttachmentId;
use crate::remote::discovery::Responder;
use crate::remote::wire::{
    decode_events, encode_events, encode_status, error_code, error_detail, op, read_frame, write_frame, Decoder, Encoder,
    RemoteEvent,
};
use crate::station::StationId;
use crate::system::Shared;
use crate::topology::{ParallelPosition, Position};
use crate::{Error, Result};

const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// TCP listener serving remote clients, plus the optional discovery
/// responder. Each connection runs on its own thread with its own process.
pub(crate) struct Gateway {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
    connections: Arc<Mutex<Vec<(TcpStream, JoinHandle<()>)>>>,
    discovery: Option<Responder>,
}

impl Gateway {
    pub(crate) fn start(shared: Arc<Shared>, config: GatewayConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.tcp_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let discovery = match config.udp_port {
            Some(port) => Some(Responder::start(
                shared.config.name.clone(),
                port,
                local_addr.port(),
                &config.multicast,
            )?),
            None => None,
        };
        let stop = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(Mutex::new(Vec::new()));

        let thread_stop = Arc::clone(&stop);
        let thread_connections = Arc::clone(&connections);
        let handle = thread::Builder::new()
            .name("et-gateway".to_string())
            .spawn(move || accept_loop(shared, config, listener, thread_stop, thread_connections))?;
        log::info!("gateway listening on {local_addr}");
        Ok(Self {
            local_addr,
            stop,
            listener: Some(handle),
            connections,
            discovery,
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn discovery_port(&self) -> Option<u16> {
        self.discovery.as_ref().map(Responder::port)
    }

    pub(crate) fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.listener.take() {
            let _ = handle.join();
        }
        let connections = match self.connections.lock() {
            Ok(mut connections) => std::mem::take(&mut *connections),
            Err(_) => Vec::new(),
        };
        for (stream, _) in &connections {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        for (_, handle) in connections {
            let _ = handle.join();
        }
        if let Some(discovery) = self.discovery.take() {
            discovery.stop();
        }
    }
}

fn accept_loop(
    shared: Arc<Shared>,
    config: GatewayConfig,
    listener: TcpListener,
    stop: Arc<AtomicBool>,
    connections: Arc<Mutex<Vec<(TcpStream, JoinHandle<()>)>>>,
) {
    while !stop.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let control = match stream.try_clone() {
                    Ok(control) => control,
                    Err(err) => {
                        log::warn!("dropping connection from {peer}: {err}");
                        continue;
                    }
                };
                let shared = Arc::clone(&shared);
                let config = config.clone();
                let spawned = thread::Builder::new()
                    .name(format!("et-remote-{peer}"))
                    .spawn(move || serve(shared, config, stream, peer));
                match spawned {
                    Ok(handle) => {
                        if let Ok(mut connections) = connections.lock() {
                            connections.retain(|(_, handle)| !handle.is_finished());
                            connections.push((control, handle));
                        }
                    }
                    Err(err) => log::error!("could not start connection thread for {peer}: {err}"),
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(err) => {
                log::error!("gateway accept failed: {err}");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn serve(shared: Arc<Shared>, config: GatewayConfig, mut stream: TcpStream, peer: SocketAddr) {
    let session = match Session::open(&shared, &config, &mut stream) {
        Ok(session) => session,
        Err(err) => {
            log::warn!("handshake with {peer} failed: {err}");
            return;
        }
    };
    log::info!("remote process {} connected from {peer}", session.process.id().raw());
    loop {
        let frame = match read_frame(&mut stream) {
            Ok(frame) => frame,
            Err(err) => {
                log::info!("connection from {peer} closed: {err}");
                break;
            }
        };
        if frame.opcode == op::CLOSE {
            let _ = write_frame(&mut stream, op::CLOSE, 0, &[]);
            break;
        }
        let (status, payload) = match session.dispatch(&shared, frame.opcode, &frame.payload) {
            Ok(payload) => (0, payload),
            Err(err) => {
                let mut enc = Encoder::new();
                enc.str(&error_detail(&err));
                (error_code(&err), enc.finish())
            }
        };
        if let Err(err) = write_frame(&mut stream, frame.opcode, status, &payload) {
            log::warn!("write to {peer} failed: {err}");
            break;
        }
    }
    if let Err(err) = session.process.close() {
        log::warn!("closing remote process for {peer} failed: {err}");
    }
}

struct Session {
    process: ProcessHandle,
    /// Used to notice a vanished peer while a wait is in progress.
    probe: TcpStream,
    poll_interval: Duration,
}

impl Session {
    fn open(shared: &Arc<Shared>, config: &GatewayConfig, stream: &mut TcpStream) -> Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let hello = read_frame(stream)?;
        if hello.opcode != op::HELLO {
            return Err(Error::Protocol("expected hello"));
        }
        let mut dec = Decoder::new(&hello.payload);
        let name = dec.string()?;
        dec.finish()?;
        let process = match ProcessHandle::open(Arc::clone(shared), &name, config.remote_privileged) {
            Ok(process) => process,
            Err(err) => {
                let mut enc = Encoder::new();
                enc.str(&error_detail(&err));
                let _ = write_frame(stream, op::HELLO, error_code(&err), &enc.finish());
                return Err(err);
            }
        };
        let mut enc = Encoder::new();
        enc.u32(process.id().raw())
            .str(&shared.config.name)
            .u64(shared.pool.len() as u64)
            .u64(shared.pool.event_size() as u64)
            .u32(shared.pool.group_count() as u32);
        write_frame(stream, op::HELLO, 0, &enc.finish())?;
        Ok(Self {
            process,
            probe: stream.try_clone()?,
            poll_interval: config.poll_interval,
        })
    }

    fn dispatch(&self, shared: &Shared, opcode: u16, payload: &[u8]) -> Result<Vec<u8>> {
        let mut dec = Decoder::new(payload);
        let mut enc = Encoder::new();
        match opcode {
            op::CREATE_STATION => {
                let name = dec.string()?;
                let config: StationConfig = serde_json::from_slice(dec.bytes()?)
                    .map_err(|err| Error::InvalidConfig(err.to_string()))?;
                let position = match (dec.u8()?, dec.u32()?) {
                    (0, _) => Position::End,
                    (_, n) => Position::At(n as usize),
                };
                let parallel = match (dec.u8()?, dec.u32()?) {
                    (0, _) => ParallelPosition::End,
                    (1, n) => ParallelPosition::At(n as usize),
                    _ => ParallelPosition::NewHead,
                };
                dec.finish()?;
                let id = self.process.create_station_at(&name, &config, position, parallel)?;
                enc.u32(id.raw());
            }
            op::REMOVE_STATION => {
                let id = StationId::from_index(dec.u32()?);
                dec.finish()?;
                self.process.remove_station(id)?;
            }
            op::STATION_ID => {
                let name = dec.string()?;
                dec.finish()?;
                enc.u32(self.process.station_id(&name)?.raw());
            }
            op::SET_SELECT_WORDS => {
                let id = StationId::from_index(dec.u32()?);
                let words = dec.words()?;
                dec.finish()?;
                self.process.set_select_words(id, words)?;
            }
            op::ATTACH => {
                let id = StationId::from_index(dec.u32()?);
                dec.finish()?;
                enc.u32(self.process.attach(id)?.raw());
            }
            op::DETACH => {
                let att = AttachmentId::from_index(dec.u32()?);
                dec.finish()?;
                self.process.detach(att)?;
            }
            op::NEW_EVENTS => {
                let att = AttachmentId::from_index(dec.u32()?);
                let mode = dec.wait_mode()?;
                let size = dec.u64()? as usize;
                let count = dec.u32()? as usize;
                let group = dec.u32()?;
                dec.finish()?;
                let ids = self.wait_sliced(mode, |mode| match group {
                    0 => self.process.new_events(att, mode, size, count),
                    group => self.process.new_events_in_group(att, mode, size, count, group),
                })?;
                let events = self.snapshot(att, &ids, false)?;
                encode_events(&mut enc, &events);
            }
            op::GET_EVENTS => {
                let att = AttachmentId::from_index(dec.u32()?);
                let mode = dec.wait_mode()?;
                let count = dec.u32()? as usize;
                dec.finish()?;
                let ids = self.wait_sliced(mode, |mode| self.process.get_events(att, mode, count))?;
                let events = self.snapshot(att, &ids, true)?;
                encode_events(&mut enc, &events);
            }
            op::PUT_EVENTS => {
                let att = AttachmentId::from_index(dec.u32()?);
                let events = decode_events(&mut dec)?;
                dec.finish()?;
                self.check_put(att, &events)?;
                for remote in &events {
                    let mut event = self.process.event(att, remote.id)?;
                    write_back(&mut event, remote)?;
                }
                let ids: Vec<EventId> = events.iter().map(|e| e.id).collect();
                self.process.put_events(att, &ids)?;
            }
            op::DUMP_EVENTS => {
                let att = AttachmentId::from_index(dec.u32()?);
                let ids = dec.ids()?;
                dec.finish()?;
                self.process.dump_events(att, &ids)?;
            }
            op::WAKEUP => {
                let att = AttachmentId::from_index(dec.u32()?);
                dec.finish()?;
                self.process.wakeup(att)?;
            }
            op::WAKEUP_ALL => {
                let id = StationId::from_index(dec.u32()?);
                dec.finish()?;
                self.process.wakeup_all(id)?;
            }
            op::SYSTEM_STATS => {
                dec.finish()?;
                let stats = shared.system_stats()?;
                enc.u64(stats.heartbeat)
                    .u32(stats.processes as u32)
                    .u32(stats.attachments as u32)
                    .u32(stats.stations as u32)
                    .u64(stats.events as u64)
                    .u64(stats.event_size as u64)
                    .u32(stats.groups as u32)
                    .u64(stats.temps as u64)
                    .u64(stats.max_temps as u64);
            }
            op::STATIONS => {
                dec.finish()?;
                let ids = shared.topology.lock()?.in_use();
                enc.u32(ids.len() as u32);
                for id in ids {
                    let stats = shared.station_stats(id)?;
                    enc.u32(stats.id.raw())
                        .str(&stats.name)
                        .u8(encode_status(stats.status))
                        .u32(stats.attachments as u32)
                        .u64(stats.input.count as u64)
                        .u64(stats.output.count as u64);
                }
            }
            _ => return Err(Error::Protocol("unknown opcode")),
        }
        Ok(enc.finish())
    }

    /// Runs an untimed wait as a series of short timed waits, giving up
    /// when the peer has gone away.
    fn wait_sliced<F>(&self, mode: WaitMode, mut wait: F) -> Result<Vec<EventId>>
    where
        F: FnMut(WaitMode) -> Result<Vec<EventId>>,
    {
        if mode != WaitMode::Sleep {
            return wait(mode);
        }
        loop {
            match wait(WaitMode::Timed(self.poll_interval)) {
                Err(Error::Timeout) => {
                    if !self.peer_connected() {
                        return Err(Error::ReadError("peer closed the connection".to_string()));
                    }
                }
                other => return other,
            }
        }
    }

    fn peer_connected(&self) -> bool {
        if self.probe.set_nonblocking(true).is_err() {
            return false;
        }
        let mut byte = [0u8; 1];
        let connected = match self.probe.peek(&mut byte) {
            Ok(0) => false,
            Ok(_) => true,
            Err(err) => err.kind() == ErrorKind::WouldBlock,
        };
        connected && self.probe.set_nonblocking(false).is_ok()
    }

    /// Checks a remote put batch before any event is written back, so a
    /// rejected batch leaves every event untouched.
    fn check_put(&self, att: AttachmentId, events: &[RemoteEvent]) -> Result<()> {
        let mut seen = BTreeSet::new();
        for remote in events {
            if !seen.insert(remote.id) {
                return Err(Error::InvalidArgument("event listed twice"));
            }
            let event = self.process.event(att, remote.id)?;
            if remote.data.len() > event.capacity() {
                return Err(Error::LengthTooLarge {
                    len: remote.data.len(),
                    capacity: event.capacity(),
                });
            }
        }
        Ok(())
    }

    fn snapshot(&self, att: AttachmentId, ids: &[EventId], with_data: bool) -> Result<Vec<RemoteEvent>> {
        ids.iter()
            .map(|&id| Ok(copy_out(&self.process.event(att, id)?, with_data)))
            .collect()
    }
}

fn copy_out(event: &Event<'_>, with_data: bool) -> RemoteEvent {
    RemoteEvent {
        id: event.id(),
        group: event.group(),
        capacity: event.capacity(),
        priority: event.priority(),
        control: event.control(),
        status: event.data_status(),
        byte_order: event.byte_order(),
        data: if with_data { event.payload().to_vec() } else { Vec::new() },
    }
}

fn write_back(event: &mut Event<'_>, remote: &RemoteEvent) -> Result<()> {
    event.write_payload(&remote.data)?;
    event.set_control(&remote.control)?;
    event.set_priority(remote.priority);
    event.set_data_status(remote.status);
    event.set_byte_order(remote.byte_order);
    Ok(())
}
