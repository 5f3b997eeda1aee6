//! UDP discovery: a client asks for a system by name, by broadcast,
//! multicast or direct address, and the responder answers with its host
//! name and gateway port.

use std::ffi::CStr;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::{DEFAULT_MULTICAST, DEFAULT_PORT};
use crate::remote::wire::{Decoder, Encoder};
use crate::{Error, Result};

const QUERY: &[u8; 4] = b"ETDQ";
const REPLY: &[u8; 4] = b"ETDR";
const RECV_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryMethod {
    Broadcast,
    Multicast(Ipv4Addr),
    Direct(IpAddr),
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// UDP port the responders listen on.
    pub port: u16,
    pub method: DiscoveryMethod,
    pub timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            method: DiscoveryMethod::Multicast(DEFAULT_MULTICAST),
            timeout: Duration::from_secs(2),
        }
    }
}

/// A responder that answered a discovery query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    pub host: String,
    /// Gateway address: the responder's source address with the TCP port
    /// it announced.
    pub addr: SocketAddr,
}

fn encode_query(name: &str) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.u32(u32::from_le_bytes(*QUERY)).str(name);
    enc.finish()
}

fn decode_query(packet: &[u8]) -> Result<String> {
    let mut dec = Decoder::new(packet);
    if dec.u32()?.to_le_bytes() != *QUERY {
        return Err(Error::Protocol("not a discovery query"));
    }
    let name = dec.string()?;
    dec.finish()?;
    Ok(name)
}

fn encode_reply(name: &str, host: &str, port: u16) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.u32(u32::from_le_bytes(*REPLY)).str(name).str(host).u16(port);
    enc.finish()
}

fn decode_reply(packet: &[u8]) -> Result<(String, String, u16)> {
    let mut dec = Decoder::new(packet);
    if dec.u32()?.to_le_bytes() != *REPLY {
        return Err(Error::Protocol("not a discovery reply"));
    }
    let name = dec.string()?;
    let host = dec.string()?;
    let port = dec.u16()?;
    dec.finish()?;
    Ok((name, host, port))
}

fn host_name() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    match CStr::from_bytes_until_nul(&buf) {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(_) => "localhost".to_string(),
    }
}

/// Answers discovery queries naming this system.
pub(crate) struct Responder {
    port: u16,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Responder {
    pub(crate) fn start(name: String, udp_port: u16, tcp_port: u16, multicast: &[Ipv4Addr]) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], udp_port)))?;
        socket.set_read_timeout(Some(RECV_POLL))?;
        for group in multicast {
            if let Err(err) = socket.join_multicast_v4(group, &Ipv4Addr::UNSPECIFIED) {
                log::warn!("could not join multicast group {group}: {err}");
            }
        }
        let port = socket.local_addr()?.port();
        let host = host_name();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("et-discovery".to_string())
            .spawn(move || respond(socket, name, host, tcp_port, thread_stop))?;
        log::info!("discovery responder on udp port {port}");
        Ok(Self { port, stop, handle })
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn stop(self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.handle.join();
    }
}

fn respond(socket: UdpSocket, name: String, host: String, tcp_port: u16, stop: Arc<AtomicBool>) {
    let mut buf = [0u8; 512];
    let reply = encode_reply(&name, &host, tcp_port);
    while !stop.load(Ordering::Acquire) {
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(err) => {
                log::error!("discovery receive failed: {err}");
                thread::sleep(RECV_POLL);
                continue;
            }
        };
        match decode_query(&buf[..len]) {
            Ok(wanted) if wanted == name => {
                if let Err(err) = socket.send_to(&reply, from) {
                    log::warn!("discovery reply to {from} failed: {err}");
                }
            }
            Ok(_) => {}
            Err(err) => log::debug!("ignoring packet from {from}: {err}"),
        }
    }
}

/// Finds the gateway of the system called `name`; the first responder wins.
pub fn locate(name: &str, config: &DiscoveryConfig) -> Result<Located> {
    let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0)))?;
    let target = match config.method {
        DiscoveryMethod::Broadcast => {
            socket.set_broadcast(true)?;
            SocketAddr::from((Ipv4Addr::BROADCAST, config.port))
        }
        DiscoveryMethod::Multicast(group) => {
            socket.set_multicast_loop_v4(true)?;
            SocketAddr::from((group, config.port))
        }
        DiscoveryMethod::Direct(ip) => SocketAddr::new(ip, config.port),
    };
    socket.send_to(&encode_query(name), target)?;

    let deadline = Instant::now() + config.timeout;
    let mut buf = [0u8; 512];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::Timeout);
        }
        socket.set_read_timeout(Some(remaining))?;
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(Error::Timeout)
            }
            Err(err) => return Err(err.into()),
        };
        match decode_reply(&buf[..len]) {
            Ok((answered, host, port)) if answered == name => {
                log::debug!("system {name} found on {host} via {from}");
                return Ok(Located {
                    host,
                    addr: SocketAddr::new(from.ip(), port),
                });
            }
            _ => continue,
        }
    }
}
