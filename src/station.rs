use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{SelectMode, StationConfig, SELECT_INTS};
use crate::conductor::Conductor;
use crate::list::{EventList, ListStats};
use crate::lock::{LockOwner, OwnedGuard, OwnedLock};
use crate::registry::ProcessId;
use crate::select::Selector;
use crate::system::Shared;
use crate::topology::{ParallelPosition, Position};
use crate::{Error, Result};

/// Longest accepted station name, in bytes.
pub const MAX_NAME_LEN: usize = 47;
pub const GRAND_CENTRAL_NAME: &str = "GRAND_CENTRAL";

/// Slot of a station. Id 0 is always GrandCentral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StationId(u32);

impl StationId {
    pub const GRAND_CENTRAL: StationId = StationId(0);

    pub fn from_index(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "station#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationStatus {
    Unused,
    Creating,
    /// Configured and linked, but nobody is attached.
    Idle,
    Active,
}

#[derive(Debug, Clone)]
pub struct StationStats {
    pub id: StationId,
    pub name: String,
    pub status: StationStatus,
    pub attachments: usize,
    /// (position, parallel position) in the chain.
    pub position: Option<(usize, usize)>,
    pub input: ListStats,
    pub output: ListStats,
    pub config: StationConfig,
}

/// Runtime half of a station slot: lists, transfer lock and conductor.
/// Topology and configuration live in the [`Topology`](crate::topology).
pub(crate) struct StationSlot {
    pub(crate) input: EventList,
    pub(crate) output: EventList,
    pub(crate) transfer: OwnedLock,
    pub(crate) conductor: Mutex<Option<Conductor>>,
}

impl StationSlot {
    pub(crate) fn new() -> Self {
        Self {
            input: EventList::new(),
            output: EventList::new(),
            transfer: OwnedLock::new("transfer"),
            conductor: Mutex::new(None),
        }
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("station name is empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidArgument("station name is too long"));
    }
    Ok(())
}

impl Shared {
    pub(crate) fn station(&self, id: StationId) -> Result<&StationSlot> {
        self.stations
            .get(id.index())
            .ok_or(Error::InvalidArgument("unknown station"))
    }

    /// Holds every transfer lock, stopping all conductors between batches.
    pub(crate) fn lock_all_transfers(&self, owner: LockOwner) -> Result<Vec<OwnedGuard<'_>>> {
        self.stations
            .iter()
            .map(|slot| slot.transfer.acquire(owner))
            .collect()
    }

    pub(crate) fn create_station(
        self: &Arc<Self>,
        pid: ProcessId,
        name: &str,
        config: &StationConfig,
        position: Position,
        parallel: ParallelPosition,
    ) -> Result<StationId> {
        self.ensure_alive()?;
        check_name(name)?;
        if let Position::At(0) = position {
            return Err(Error::InvalidArgument("position 0 is reserved for GrandCentral"));
        }
        let config = config.check(&self.config)?;
        let owner = LockOwner::Process(pid);
        let _station_lock = self.station_lock.acquire(owner)?;

        let id = {
            let mut topology = self.topology.lock()?;
            if let Some(existing) = topology.find(name) {
                let entry = topology.entry(existing)?;
                if entry.config.same_definition(&config) {
                    log::debug!("station {name} already exists as {existing}");
                    return Ok(existing);
                }
                return Err(Error::DuplicateName(name.to_string()));
            }
            topology.allocate(name, config, pid)?
        };

        {
            let _transfers = self.lock_all_transfers(owner)?;
            let mut topology = self.topology.lock()?;
            if let Err(err) = topology.insert(id, position, parallel) {
                topology.release(id);
                return Err(err);
            }
        }

        let started = {
            let _adding = self.add_station_lock.acquire(owner)?;
            let slot = self.station(id)?;
            slot.input.reset()?;
            slot.output.reset()?;
            Conductor::spawn(Arc::clone(self), id)
        };
        let conductor = match started {
            Ok(conductor) => conductor,
            Err(err) => {
                let _transfers = self.lock_all_transfers(owner)?;
                let mut topology = self.topology.lock()?;
                topology.unlink(id);
                topology.release(id);
                return Err(err);
            }
        };
        *self.station(id)?.conductor.lock()? = Some(conductor);
        self.topology.lock()?.entry_mut(id)?.status = StationStatus::Idle;
        log::info!("created station {name} as {id}");
        Ok(id)
    }

    pub(crate) fn remove_station(&self, pid: ProcessId, id: StationId) -> Result<()> {
        self.ensure_alive()?;
        if id == StationId::GRAND_CENTRAL {
            return Err(Error::InvalidOperation("GrandCentral cannot be removed"));
        }
        let owner = LockOwner::Process(pid);
        let _station_lock = self.station_lock.acquire(owner)?;
        let name = {
            let topology = self.topology.lock()?;
            let entry = topology.entry(id)?;
            if !entry.attachments.is_empty() {
                return Err(Error::InvalidOperation("station still has attachments"));
            }
            entry.name.clone()
        };

        let slot = self.station(id)?;
        let deadline = Instant::now() + self.config.remove_drain_timeout;
        while slot.output.len()? > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        let conductor = {
            let _transfers = self.lock_all_transfers(owner)?;
            let mut topology = self.topology.lock()?;
            topology.unlink(id);
            topology.release(id);
            let leftover: Vec<_> = slot
                .output
                .drain()?
                .into_iter()
                .chain(slot.input.drain()?)
                .collect();
            if !leftover.is_empty() {
                log::warn!(
                    "station {name} removed with {} undelivered events; returning them to GrandCentral",
                    leftover.len()
                );
                self.absorb(&leftover)?;
            }
            slot.conductor.lock()?.take()
        };
        if let Some(conductor) = conductor {
            conductor.stop(slot);
            conductor.join();
        }
        log::info!("removed station {name} ({id})");
        Ok(())
    }

    /// Applies `update` to a station's configuration, re-validating it and
    /// its parallel group.
    pub(crate) fn update_station<F>(&self, pid: ProcessId, id: StationId, update: F) -> Result<()>
    where
        F: FnOnce(&mut StationConfig),
    {
        self.ensure_alive()?;
        if id == StationId::GRAND_CENTRAL {
            return Err(Error::InvalidOperation("GrandCentral cannot be reconfigured"));
        }
        let owner = LockOwner::Process(pid);
        let _station_lock = self.station_lock.acquire(owner)?;
        let _transfers = self.lock_all_transfers(owner)?;
        let mut topology = self.topology.lock()?;
        let mut config = topology.entry(id)?.config.clone();
        let before = config.flow;
        update(&mut config);
        if config.flow != before {
            return Err(Error::InvalidOperation("flow mode of a linked station cannot change"));
        }
        let config = config.check(&self.config)?;
        let head = topology.group_head(id);
        let members = topology.group(head);
        if members.len() > 1 {
            let head_config = if head == id {
                config.clone()
            } else {
                topology.entry(head)?.config.clone()
            };
            for member in members.into_iter().filter(|&m| m != head) {
                let member_config = if member == id {
                    &config
                } else {
                    &topology.entry(member)?.config
                };
                head_config.admits_parallel(member_config)?;
            }
        }
        topology.entry_mut(id)?.config = config;
        Ok(())
    }

    pub(crate) fn set_select_words(&self, pid: ProcessId, id: StationId, words: [i32; SELECT_INTS]) -> Result<()> {
        self.update_station(pid, id, |config| config.select = words)
    }

    pub(crate) fn set_selector(&self, pid: ProcessId, id: StationId, selector: Selector) -> Result<()> {
        self.update_station(pid, id, |config| {
            config.select_mode = SelectMode::User;
            config.selector = Some(selector);
        })
    }

    pub(crate) fn set_station_position(
        &self,
        pid: ProcessId,
        id: StationId,
        position: Position,
        parallel: ParallelPosition,
    ) -> Result<()> {
        self.ensure_alive()?;
        if id == StationId::GRAND_CENTRAL {
            return match position {
                Position::At(0) => Ok(()),
                _ => Err(Error::InvalidOperation("GrandCentral cannot be moved")),
            };
        }
        if let Position::At(0) = position {
            return Err(Error::InvalidArgument("position 0 is reserved for GrandCentral"));
        }
        let owner = LockOwner::Process(pid);
        let _station_lock = self.station_lock.acquire(owner)?;
        let _transfers = self.lock_all_transfers(owner)?;
        let mut topology = self.topology.lock()?;
        let (current, current_parallel) = topology
            .position_of(id)
            .ok_or(Error::InvalidOperation("station is not linked"))?;
        topology.unlink(id);
        if let Err(err) = topology.insert(id, position, parallel) {
            let parallel_back = if current_parallel == 0 {
                ParallelPosition::NewHead
            } else {
                ParallelPosition::At(current_parallel)
            };
            topology.insert(id, Position::At(current), parallel_back)?;
            return Err(err);
        }
        Ok(())
    }

    pub(crate) fn station_id(&self, name: &str) -> Result<StationId> {
        self.topology
            .lock()?
            .find(name)
            .ok_or(Error::InvalidArgument("no station with that name"))
    }

    pub(crate) fn station_stats(&self, id: StationId) -> Result<StationStats> {
        let (name, status, attachments, position, config) = {
            let topology = self.topology.lock()?;
            let entry = topology.entry(id)?;
            (
                entry.name.clone(),
                entry.status,
                entry.attachments.len(),
                topology.position_of(id),
                entry.config.clone(),
            )
        };
        let slot = self.station(id)?;
        Ok(StationStats {
            id,
            name,
            status,
            attachments,
            position,
            input: slot.input.stats()?,
            output: slot.output.stats()?,
            config,
        })
    }
}
