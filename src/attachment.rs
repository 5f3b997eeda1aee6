use std::sync::Arc;

use crate::config::{BlockMode, FlowMode, RestoreMode};
use crate::event::{Age, DataStatus, Owner, Priority};
use crate::list::Queued;
use crate::lock::LockOwner;
use crate::registry::{AttachmentId, ProcessId};
use crate::station::{StationId, StationStatus};
use crate::system::Shared;
use crate::{Error, Result};

/// Why an attachment is being detached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Departure {
    Graceful,
    /// Its process died; the caller already holds every transfer lock.
    Crashed,
}

impl Shared {
    pub(crate) fn attach(&self, pid: ProcessId, station: StationId) -> Result<AttachmentId> {
        self.ensure_alive()?;
        let owner = LockOwner::Process(pid);
        let _station_lock = self.station_lock.acquire(owner)?;
        let (flow, was_idle) = {
            let topology = self.topology.lock()?;
            let entry = topology.entry(station)?;
            if !matches!(entry.status, StationStatus::Idle | StationStatus::Active) {
                return Err(Error::InvalidOperation("station is not ready for attachments"));
            }
            if station == StationId::GRAND_CENTRAL && !self.registry.lock()?.process(pid)?.privileged {
                return Err(Error::InvalidOperation(
                    "attaching to GrandCentral requires system privilege",
                ));
            }
            if let Some(cap) = entry.config.user.cap() {
                if entry.attachments.len() >= cap {
                    return Err(Error::TooMany("attachments on station"));
                }
            }
            (entry.config.flow, entry.status == StationStatus::Idle)
        };

        let _transfers = if flow == FlowMode::Parallel && was_idle {
            Some(self.lock_all_transfers(owner)?)
        } else {
            None
        };
        let mut topology = self.topology.lock()?;
        let id = self.registry.lock()?.add_attachment(pid, station)?;
        let entry = topology.entry_mut(station)?;
        entry.attachments.insert(id);
        entry.status = StationStatus::Active;
        log::info!("{id} attached to {} ({station})", entry.name);
        Ok(id)
    }

    pub(crate) fn detach(&self, pid: ProcessId, att: AttachmentId) -> Result<()> {
        self.ensure_alive()?;
        {
            let registry = self.registry.lock()?;
            if registry.attachment(att)?.process != pid {
                return Err(Error::InvalidArgument("attachment belongs to another process"));
            }
        }
        let _station_lock = self.station_lock.acquire(LockOwner::Process(pid))?;
        self.detach_locked(att, LockOwner::Process(pid), Departure::Graceful)
    }

    /// Detaches with the station lock already held by `owner`.
    pub(crate) fn detach_locked(&self, att: AttachmentId, owner: LockOwner, departure: Departure) -> Result<()> {
        let (station, signal) = {
            let registry = self.registry.lock()?;
            let record = registry.attachment(att)?;
            (record.station, Arc::clone(&record.signal))
        };
        let (config, last) = {
            let topology = self.topology.lock()?;
            let entry = topology.entry(station)?;
            (entry.config.clone(), entry.attachments.len() <= 1)
        };

        if last && station != StationId::GRAND_CENTRAL {
            let _transfers = match departure {
                Departure::Graceful => Some(self.lock_all_transfers(owner)?),
                Departure::Crashed => None,
            };
            let previous = {
                let mut topology = self.topology.lock()?;
                topology.entry_mut(station)?.status = StationStatus::Idle;
                topology.previous_of(station)
            };
            let slot = self.station(station)?;
            let flushed = slot.input.drain()?;
            if !flushed.is_empty() {
                log::debug!("{station} idle; flushing {} queued events downstream", flushed.len());
                match config.restore {
                    RestoreMode::Redistribute => self.station(previous)?.output.push(&flushed)?,
                    _ => slot.output.push(&flushed)?,
                }
            }
        }

        let remaining = {
            let mut topology = self.topology.lock()?;
            let entry = topology.entry_mut(station)?;
            entry.attachments.remove(&att);
            entry.attachments.len()
        };
        self.restore_events(att, station, remaining, departure)?;
        self.registry.lock()?.remove_attachment(att);

        if signal.request_quit() {
            self.station(station)?.input.notify();
            self.station(StationId::GRAND_CENTRAL)?.input.notify();
        }
        log::info!("{att} detached from {station}");
        Ok(())
    }

    /// Resolves every event `att` still owns: fresh ones go back to
    /// GrandCentral, used ones follow the station's restore mode.
    fn restore_events(&self, att: AttachmentId, station: StationId, remaining: usize, departure: Departure) -> Result<()> {
        let owned = self.pool.owned_by(Owner::Attachment(att))?;
        if owned.is_empty() {
            return Ok(());
        }
        let (config, previous) = {
            let topology = self.topology.lock()?;
            (topology.entry(station)?.config.clone(), topology.previous_of(station))
        };

        let mut fresh = Vec::new();
        let mut high = Vec::new();
        let mut low = Vec::new();
        for id in owned {
            let mut event = self.pool.lock(id)?;
            let group = event.group();
            let slot = event.slot_mut();
            slot.owner = Owner::System;
            if slot.age == Age::New {
                self.pool.release_temp(slot);
                fresh.push(Queued::low(id, group));
                continue;
            }
            if departure == Departure::Crashed {
                slot.status = DataStatus::PossiblyCorrupt;
            }
            let queued = Queued {
                id,
                priority: slot.priority,
                group,
            };
            match slot.priority {
                Priority::High => high.push(queued),
                Priority::Low => low.push(queued),
            }
        }
        high.extend(low);
        let used = high;
        log::debug!(
            "{att} left {} fresh and {} used events behind",
            fresh.len(),
            used.len()
        );
        self.absorb(&fresh)?;

        let slot = self.station(station)?;
        if config.restore == RestoreMode::Gc || station == StationId::GRAND_CENTRAL {
            return self.absorb(&used);
        }
        match config.restore {
            RestoreMode::In if remaining > 0 && config.block == BlockMode::Blocking => {
                slot.input.push_front(&used)
            }
            RestoreMode::In if remaining > 0 => self.station(previous)?.output.push(&used),
            RestoreMode::Redistribute => self.station(previous)?.output.push(&used),
            _ => slot.output.push(&used),
        }
    }
}
