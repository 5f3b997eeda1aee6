//! Liveness and crash repair.
//!
//! The system bumps its own heartbeat on a fixed interval and every
//! process handle does the same for its process. The monitor samples all
//! process heartbeats each pass; a process whose counter did not move
//! since the previous pass is treated as dead and its share of the shared
//! state is repaired.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::attachment::Departure;
use crate::conductor::Conductor;
use crate::event::Owner;
use crate::list::Queued;
use crate::lock::LockOwner;
use crate::registry::{AttachmentId, ProcessId};
use crate::station::{StationId, StationStatus};
use crate::system::Shared;
use crate::Result;

/// Last heartbeat seen per process. The counter's `Arc` identifies the
/// registration, so a reused process slot starts a fresh baseline.
#[derive(Default)]
pub(crate) struct MonitorState {
    last: HashMap<ProcessId, (Arc<AtomicU64>, u64)>,
}

/// Background thread that runs `tick` every `interval` until stopped.
pub(crate) struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Worker {
    pub(crate) fn spawn<F>(name: String, interval: Duration, mut tick: F) -> Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new().name(name).spawn(move || {
            while !thread_stop.load(Ordering::Acquire) {
                if !tick() {
                    break;
                }
                // park_timeout may return early; sleep out the whole interval.
                let due = Instant::now() + interval;
                loop {
                    let now = Instant::now();
                    if now >= due || thread_stop.load(Ordering::Acquire) {
                        break;
                    }
                    thread::park_timeout(due - now);
                }
            }
        })?;
        Ok(Self { stop, handle })
    }

    pub(crate) fn system_heartbeat(shared: Arc<Shared>) -> Result<Self> {
        let interval = shared.config.heartbeat_interval;
        Self::spawn("et-heartbeat".to_string(), interval, move || {
            shared.heartbeat.fetch_add(1, Ordering::Relaxed);
            shared.is_alive()
        })
    }

    pub(crate) fn monitor(shared: Arc<Shared>) -> Result<Self> {
        let interval = shared.config.monitor_interval;
        Self::spawn("et-monitor".to_string(), interval, move || {
            // A process seen for the first time only records its baseline.
            if let Err(err) = shared.check_heartbeats() {
                if shared.is_alive() {
                    log::error!("heartbeat scan failed: {err}");
                }
            }
            shared.is_alive()
        })
    }

    /// Heartbeat emitter for one client process.
    pub(crate) fn process_heartbeat(shared: &Shared, pid: ProcessId, beat: Arc<AtomicU64>) -> Result<Self> {
        Self::spawn(
            format!("et-process-{}", pid.raw()),
            shared.config.heartbeat_interval,
            move || {
                beat.fetch_add(1, Ordering::Relaxed);
                true
            },
        )
    }

    pub(crate) fn stop(self) {
        self.stop.store(true, Ordering::Release);
        self.handle.thread().unpark();
        let _ = self.handle.join();
    }
}

impl Shared {
    pub(crate) fn check_heartbeats(&self) -> Result<Vec<ProcessId>> {
        self.ensure_alive()?;
        let beats: Vec<(ProcessId, Arc<AtomicU64>)> = self
            .registry
            .lock()?
            .processes()
            .map(|record| (record.id, Arc::clone(&record.heartbeat)))
            .collect();
        let mut dead = Vec::new();
        {
            let mut monitor = self.monitor.lock()?;
            let mut next = HashMap::with_capacity(beats.len());
            for (pid, beat) in beats {
                let value = beat.load(Ordering::Relaxed);
                if let Some((seen, last)) = monitor.last.get(&pid) {
                    if Arc::ptr_eq(seen, &beat) && *last == value {
                        dead.push(pid);
                    }
                }
                next.insert(pid, (beat, value));
            }
            monitor.last = next;
        }
        for &pid in &dead {
            log::warn!("process {} stopped its heartbeat", pid.raw());
            self.recover_process(pid)?;
        }
        Ok(dead)
    }

    pub(crate) fn recover_process(&self, pid: ProcessId) -> Result<()> {
        let name = match self.registry.lock()?.process(pid) {
            Ok(record) => record.name.clone(),
            Err(_) => return Ok(()),
        };
        log::warn!("recovering state left by dead process {name} ({})", pid.raw());

        let owner = LockOwner::Process(pid);
        self.station_lock.revoke(owner)?;
        self.add_station_lock.revoke(owner)?;
        for slot in &self.stations {
            slot.transfer.revoke(owner)?;
        }

        let mut stopped = Vec::new();
        {
            let _station_lock = self.station_lock.acquire(LockOwner::System)?;
            let _transfers = self.lock_all_transfers(LockOwner::System)?;
            stopped.extend(self.remove_broken_stations()?);
            self.remove_orphan_attachments()?;

            let attachments: Vec<AttachmentId> = self
                .registry
                .lock()?
                .process(pid)?
                .attachments
                .iter()
                .copied()
                .collect();
            for att in attachments {
                self.detach_locked(att, LockOwner::System, Departure::Crashed)?;
            }
            self.registry.lock()?.remove_process(pid);
            self.recount_attachments()?;
        }

        for (id, conductor) in stopped {
            conductor.stop(self.station(id)?);
            conductor.join();
        }
        self.monitor.lock()?.last.remove(&pid);
        log::info!("process {name} cleaned up");
        Ok(())
    }

    /// Rebuilds back links from the forward chain and drops every station
    /// still `Creating` or no longer reachable from GrandCentral. Returns
    /// the conductors of dropped stations, to be stopped once the locks
    /// are released.
    fn remove_broken_stations(&self) -> Result<Vec<(StationId, Conductor)>> {
        let broken: Vec<StationId> = {
            let mut topology = self.topology.lock()?;
            topology.repair();
            let reachable = topology.reachable();
            let mut broken = Vec::new();
            for id in topology.in_use() {
                let entry = topology.entry(id)?;
                if entry.status == StationStatus::Creating || !reachable.contains(&id) {
                    broken.push(id);
                }
            }
            for &id in &broken {
                log::warn!("dropping broken station {}", topology.entry(id)?.name);
                topology.unlink(id);
                topology.release(id);
            }
            broken
        };

        let mut conductors = Vec::new();
        for id in broken {
            let slot = self.station(id)?;
            let mut leftover = slot.input.drain()?;
            leftover.extend(slot.output.drain()?);
            self.absorb(&leftover)?;
            if let Some(conductor) = slot.conductor.lock()?.take() {
                conductors.push((id, conductor));
            }
        }
        Ok(conductors)
    }

    /// Drops attachments whose station no longer exists, returning their
    /// events to GrandCentral.
    fn remove_orphan_attachments(&self) -> Result<()> {
        let orphans: Vec<AttachmentId> = {
            let topology = self.topology.lock()?;
            let registry = self.registry.lock()?;
            registry
                .attachments()
                .filter(|record| match topology.entry(record.station) {
                    Ok(entry) => !entry.attachments.contains(&record.id),
                    Err(_) => true,
                })
                .map(|record| record.id)
                .collect()
        };
        for att in orphans {
            let owned = self.pool.owned_by(Owner::Attachment(att))?;
            let mut events = Vec::with_capacity(owned.len());
            for id in owned {
                let mut event = self.pool.lock(id)?;
                let group = event.group();
                event.slot_mut().owner = Owner::System;
                events.push(Queued::low(id, group));
            }
            self.absorb(&events)?;
            if let Some(record) = self.registry.lock()?.remove_attachment(att) {
                record.signal.request_quit();
            }
            log::warn!("dropped orphan {att}, returning {} events", events.len());
        }
        Ok(())
    }

    /// Makes every station's attachment set agree with the registry and
    /// idles stations left without attachments.
    fn recount_attachments(&self) -> Result<()> {
        let mut topology = self.topology.lock()?;
        let registry = self.registry.lock()?;
        for id in topology.in_use() {
            let entry = topology.entry_mut(id)?;
            entry.attachments.retain(|&att| registry.attachment(att).is_ok());
            if id != StationId::GRAND_CENTRAL
                && entry.attachments.is_empty()
                && entry.status == StationStatus::Active
            {
                entry.status = StationStatus::Idle;
            }
        }
        Ok(())
    }
}
