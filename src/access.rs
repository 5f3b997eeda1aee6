use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::event::{Age, Event, EventId, Owner};
use crate::list::{Queued, WaitMode, Waiter};
use crate::mmap::TempBuffer;
use crate::registry::{AttachmentCounters, AttachmentId, AttachmentSignal, ProcessId};
use crate::station::StationId;
use crate::system::Shared;
use crate::{Error, Result};

/// What an operation needs to know about the calling attachment.
struct Caller {
    station: StationId,
    signal: Arc<AttachmentSignal>,
    counters: Arc<AttachmentCounters>,
}

impl Shared {
    fn caller(&self, pid: ProcessId, att: AttachmentId) -> Result<Caller> {
        self.ensure_alive()?;
        let registry = self.registry.lock()?;
        let record = registry.attachment(att)?;
        if record.process != pid {
            return Err(Error::InvalidArgument("attachment belongs to another process"));
        }
        Ok(Caller {
            station: record.station,
            signal: Arc::clone(&record.signal),
            counters: Arc::clone(&record.counters),
        })
    }

    /// Takes fresh events from GrandCentral, giving each a temp buffer when
    /// `size` exceeds the pool's event size.
    pub(crate) fn new_events(
        &self,
        pid: ProcessId,
        att: AttachmentId,
        mode: WaitMode,
        size: usize,
        count: usize,
        group: Option<u32>,
    ) -> Result<Vec<EventId>> {
        if count == 0 {
            return Err(Error::InvalidArgument("count must be non-zero"));
        }
        if let Some(group) = group {
            if group == 0 || group as usize > self.pool.group_count() {
                return Err(Error::InvalidArgument("no such event group"));
            }
        }
        let caller = self.caller(pid, att)?;
        let waiter = Waiter {
            signal: &caller.signal,
            alive: &self.alive,
        };
        let gc = &self.station(StationId::GRAND_CENTRAL)?.input;
        let taken = gc.take(count, mode, group, &waiter)?;

        let mut temps = Vec::new();
        if size > self.pool.event_size() {
            for _ in &taken {
                match self.allocate_temp(size) {
                    Ok(buffer) => temps.push(buffer),
                    Err(err) => {
                        for buffer in temps {
                            self.pool.discard_temp(buffer);
                        }
                        self.absorb(&taken)?;
                        return Err(err);
                    }
                }
            }
        }

        let mut temps = temps.into_iter();
        let mut ids = Vec::with_capacity(taken.len());
        for queued in &taken {
            let mut event = self.pool.lock(queued.id)?;
            let slot = event.slot_mut();
            self.pool.release_temp(slot);
            slot.init_fresh(size);
            self.pool.hand_over(slot, Owner::Attachment(att));
            slot.temp = temps.next();
            ids.push(queued.id);
        }
        AttachmentCounters::add(&caller.counters.made, ids.len());
        Ok(ids)
    }

    /// Temp buffer for an oversize event, retrying while the quota is
    /// exhausted until the retry budget runs out.
    fn allocate_temp(&self, size: usize) -> Result<TempBuffer> {
        let started = Instant::now();
        let mut warned = false;
        loop {
            if let Some(buffer) = self.pool.try_allocate_temp(size)? {
                return Ok(buffer);
            }
            if !warned {
                log::warn!(
                    "temp event quota of {} exhausted; waiting for one to be released",
                    self.pool.max_temps()
                );
                warned = true;
            }
            if started.elapsed() >= self.config.temp_retry_budget {
                return Err(Error::TooMany("temp events"));
            }
            self.ensure_alive()?;
            thread::sleep(self.config.temp_retry_interval);
        }
    }

    pub(crate) fn get_events(
        &self,
        pid: ProcessId,
        att: AttachmentId,
        mode: WaitMode,
        count: usize,
    ) -> Result<Vec<EventId>> {
        if count == 0 {
            return Err(Error::InvalidArgument("count must be non-zero"));
        }
        let caller = self.caller(pid, att)?;
        if caller.station == StationId::GRAND_CENTRAL {
            return Err(Error::InvalidOperation("GrandCentral attachments cannot get events"));
        }
        let waiter = Waiter {
            signal: &caller.signal,
            alive: &self.alive,
        };
        let taken = self.station(caller.station)?.input.take(count, mode, None, &waiter)?;
        for queued in &taken {
            self.pool.hand_over(self.pool.lock(queued.id)?.slot_mut(), Owner::Attachment(att));
        }
        AttachmentCounters::add(&caller.counters.got, taken.len());
        Ok(taken.into_iter().map(|q| q.id).collect())
    }

    /// Checks that `att` owns every event exactly once; nothing changes
    /// unless all pass.
    fn check_owned(&self, att: AttachmentId, ids: &[EventId]) -> Result<()> {
        let mut seen = BTreeSet::new();
        for &id in ids {
            if !seen.insert(id) {
                return Err(Error::InvalidArgument("event listed twice"));
            }
            let event = self.pool.lock(id)?;
            if event.owner() != Owner::Attachment(att) {
                return Err(Error::NotOwner);
            }
            if event.length() > event.capacity() {
                return Err(Error::LengthTooLarge {
                    len: event.length(),
                    capacity: event.capacity(),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn put_events(&self, pid: ProcessId, att: AttachmentId, ids: &[EventId]) -> Result<()> {
        let caller = self.caller(pid, att)?;
        self.check_owned(att, ids)?;
        let mut batch = Vec::with_capacity(ids.len());
        for &id in ids {
            let mut event = self.pool.lock(id)?;
            let group = event.group();
            let slot = event.slot_mut();
            slot.age = Age::Used;
            slot.owner = Owner::System;
            batch.push(Queued {
                id,
                priority: slot.priority,
                group,
            });
        }
        self.station(caller.station)?.output.push(&batch)?;
        AttachmentCounters::add(&caller.counters.put, batch.len());
        Ok(())
    }

    pub(crate) fn dump_events(&self, pid: ProcessId, att: AttachmentId, ids: &[EventId]) -> Result<()> {
        let caller = self.caller(pid, att)?;
        self.check_owned(att, ids)?;
        let mut batch = Vec::with_capacity(ids.len());
        for &id in ids {
            let mut event = self.pool.lock(id)?;
            let group = event.group();
            let slot = event.slot_mut();
            self.pool.release_temp(slot);
            slot.owner = Owner::System;
            batch.push(Queued::low(id, group));
        }
        self.station(StationId::GRAND_CENTRAL)?.input.push_low(&batch)?;
        AttachmentCounters::add(&caller.counters.dumped, batch.len());
        Ok(())
    }

    /// Locks one event owned by `att` for reading or writing.
    pub(crate) fn event(&self, pid: ProcessId, att: AttachmentId, id: EventId) -> Result<Event<'_>> {
        self.caller(pid, att)?;
        let event = self.pool.lock(id)?;
        if event.owner() != Owner::Attachment(att) {
            return Err(Error::NotOwner);
        }
        Ok(event)
    }

    pub(crate) fn wakeup(&self, pid: ProcessId, att: AttachmentId) -> Result<()> {
        let caller = self.caller(pid, att)?;
        if caller.signal.request_quit() {
            self.station(caller.station)?.input.notify();
            self.station(StationId::GRAND_CENTRAL)?.input.notify();
        }
        Ok(())
    }

    pub(crate) fn wakeup_all(&self, station: StationId) -> Result<()> {
        self.ensure_alive()?;
        self.topology.lock()?.entry(station)?;
        let signals: Vec<Arc<AttachmentSignal>> = self
            .registry
            .lock()?
            .attachments()
            .filter(|record| record.station == station)
            .map(|record| Arc::clone(&record.signal))
            .collect();
        let woken = signals.iter().filter(|signal| signal.request_quit()).count();
        if woken > 0 {
            self.station(station)?.input.notify();
            self.station(StationId::GRAND_CENTRAL)?.input.notify();
        }
        log::debug!("woke {woken} attachments of {station}");
        Ok(())
    }
}
