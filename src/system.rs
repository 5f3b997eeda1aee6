use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::conductor::Conductor;
use crate::config::SystemConfig;
use crate::event::{EventId, EventInfo, Owner};
use crate::heartbeat::{MonitorState, Worker};
use crate::lock::OwnedLock;
use crate::pool::EventPool;
use crate::process::ProcessHandle;
use crate::registry::{AttachmentId, AttachmentStats, ProcessId, Registry};
use crate::remote::server::Gateway;
use crate::station::{StationId, StationSlot, StationStats};
use crate::topology::Topology;
use crate::{Error, Result};

/// State shared by the system handle, process handles, conductors and
/// the background workers.
pub(crate) struct Shared {
    pub(crate) config: SystemConfig,
    pub(crate) pool: EventPool,
    pub(crate) stations: Vec<StationSlot>,
    pub(crate) topology: Mutex<Topology>,
    pub(crate) registry: Mutex<Registry>,
    /// Serializes station create/remove/attach/detach.
    pub(crate) station_lock: OwnedLock,
    /// Held while a new conductor is being started.
    pub(crate) add_station_lock: OwnedLock,
    pub(crate) alive: AtomicBool,
    pub(crate) heartbeat: AtomicU64,
    pub(crate) monitor: Mutex<MonitorState>,
}

impl Shared {
    pub(crate) fn ensure_alive(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(Error::Dead)
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemStats {
    pub heartbeat: u64,
    pub processes: usize,
    pub attachments: usize,
    pub stations: usize,
    pub events: usize,
    pub event_size: usize,
    pub groups: usize,
    pub temps: usize,
    pub max_temps: usize,
}

/// Where every pool event currently is. At quiescence `listed + owned`
/// equals the pool size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventCensus {
    pub listed: usize,
    pub owned: usize,
    pub temps: usize,
}

#[derive(Default)]
struct Workers {
    heartbeat: Option<Worker>,
    monitor: Option<Worker>,
    gateway: Option<Gateway>,
}

/// A running event transfer system: the event pool, GrandCentral and
/// every station created since, plus its heartbeat, monitor and optional
/// remote gateway.
///
/// Clients interact through [`ProcessHandle`]s opened on the system.
pub struct EtSystem {
    shared: Arc<Shared>,
    workers: Mutex<Workers>,
}

impl EtSystem {
    pub fn create(config: SystemConfig) -> Result<Self> {
        config.validate()?;
        let pool = EventPool::new(&config)?;
        let stations: Vec<StationSlot> = (0..config.max_stations).map(|_| StationSlot::new()).collect();
        stations[0].input.state()?.push_low(&pool.all_queued());
        let shared = Arc::new(Shared {
            topology: Mutex::new(Topology::new(config.max_stations)),
            registry: Mutex::new(Registry::new(config.max_processes, config.max_attachments)),
            station_lock: OwnedLock::new("station"),
            add_station_lock: OwnedLock::new("add-station"),
            alive: AtomicBool::new(true),
            heartbeat: AtomicU64::new(0),
            monitor: Mutex::new(MonitorState::default()),
            pool,
            stations,
            config,
        });
        // Counters start from zero; the initial fill is not traffic.
        shared.stations[0].input.reset()?;

        let gc = Conductor::spawn(Arc::clone(&shared), StationId::GRAND_CENTRAL)?;
        *shared.stations[0].conductor.lock()? = Some(gc);

        let system = Self {
            shared: Arc::clone(&shared),
            workers: Mutex::new(Workers::default()),
        };
        {
            let mut workers = system.workers.lock()?;
            workers.heartbeat = Some(Worker::system_heartbeat(Arc::clone(&shared))?);
            workers.monitor = Some(Worker::monitor(Arc::clone(&shared))?);
            if let Some(gateway) = &shared.config.gateway {
                workers.gateway = Some(Gateway::start(Arc::clone(&shared), gateway.clone())?);
            }
        }
        log::info!(
            "system {} up: {} events of {} bytes in {} groups",
            shared.config.name,
            shared.config.events,
            shared.config.event_size,
            shared.pool.group_count()
        );
        Ok(system)
    }

    pub fn config(&self) -> &SystemConfig {
        &self.shared.config
    }

    pub fn is_alive(&self) -> bool {
        self.shared.is_alive()
    }

    /// Registers a client process without GrandCentral privilege.
    pub fn open_process(&self, name: &str) -> Result<ProcessHandle> {
        ProcessHandle::open(Arc::clone(&self.shared), name, false)
    }

    /// Registers a client process that may attach to GrandCentral.
    pub fn open_privileged_process(&self, name: &str) -> Result<ProcessHandle> {
        ProcessHandle::open(Arc::clone(&self.shared), name, true)
    }

    pub fn gateway_addr(&self) -> Option<SocketAddr> {
        self.workers
            .lock()
            .ok()
            .and_then(|workers| workers.gateway.as_ref().map(Gateway::local_addr))
    }

    /// UDP port of the discovery responder, when one is running.
    pub fn discovery_port(&self) -> Option<u16> {
        self.workers
            .lock()
            .ok()
            .and_then(|workers| workers.gateway.as_ref().and_then(Gateway::discovery_port))
    }

    pub fn station_id(&self, name: &str) -> Result<StationId> {
        self.shared.station_id(name)
    }

    pub fn station_stats(&self, id: StationId) -> Result<StationStats> {
        self.shared.station_stats(id)
    }

    /// Statistics of every station in use, in slot order.
    pub fn stations(&self) -> Result<Vec<StationStats>> {
        let ids = self.shared.topology.lock()?.in_use();
        ids.into_iter().map(|id| self.shared.station_stats(id)).collect()
    }

    pub fn attachment_stats(&self, id: AttachmentId) -> Result<AttachmentStats> {
        Ok(self.shared.registry.lock()?.attachment(id)?.stats())
    }

    pub fn system_stats(&self) -> Result<SystemStats> {
        self.shared.system_stats()
    }

    /// Header snapshot of any event, whoever owns it.
    pub fn event_info(&self, id: EventId) -> Result<EventInfo> {
        Ok(self.shared.pool.lock(id)?.info())
    }

    pub fn census(&self) -> Result<EventCensus> {
        self.shared.census()
    }

    /// One monitor pass: records every process's heartbeat and recovers the
    /// ones whose heartbeat did not move since the previous pass.
    pub fn check_heartbeats(&self) -> Result<Vec<ProcessId>> {
        self.shared.check_heartbeats()
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Repairs shared state after `pid` died and detaches its attachments.
    /// Safe to repeat; a process already cleaned up is skipped.
    pub fn recover_process(&self, pid: ProcessId) -> Result<()> {
        self.shared.recover_process(pid)
    }

    /// Stops every conductor and worker. Waiting clients return `Dead`.
    pub fn close(&self) -> Result<()> {
        if !self.shared.alive.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        log::info!("closing system {}", self.shared.config.name);
        let workers = std::mem::take(&mut *self.workers.lock()?);
        if let Some(gateway) = workers.gateway {
            gateway.stop();
        }
        for worker in [workers.heartbeat, workers.monitor].into_iter().flatten() {
            worker.stop();
        }
        for slot in &self.shared.stations {
            slot.input.notify();
            slot.output.notify();
        }
        for slot in &self.shared.stations {
            let conductor = slot.conductor.lock()?.take();
            if let Some(conductor) = conductor {
                conductor.stop(slot);
                conductor.join();
            }
        }
        Ok(())
    }
}

impl Drop for EtSystem {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl Shared {
    pub(crate) fn system_stats(&self) -> Result<SystemStats> {
        let stations = self.topology.lock()?.station_count();
        let registry = self.registry.lock()?;
        Ok(SystemStats {
            heartbeat: self.heartbeat.load(Ordering::Relaxed),
            processes: registry.process_count(),
            attachments: registry.attachment_count(),
            stations,
            events: self.pool.len(),
            event_size: self.pool.event_size(),
            groups: self.pool.group_count(),
            temps: self.pool.temps(),
            max_temps: self.pool.max_temps(),
        })
    }

    pub(crate) fn census(&self) -> Result<EventCensus> {
        let mut listed = 0;
        for slot in &self.stations {
            listed += slot.input.len()? + slot.output.len()?;
        }
        let mut owned = 0;
        for index in 0..self.pool.len() {
            if let Owner::Attachment(_) = self.pool.lock(EventId::from_index(index as u32))?.owner() {
                owned += 1;
            }
        }
        Ok(EventCensus {
            listed,
            owned,
            temps: self.pool.temps(),
        })
    }
}
