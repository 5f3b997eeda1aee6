use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::config::SystemConfig;
use crate::event::{Event, EventId, EventSlot, Owner};
use crate::list::Queued;
use crate::mmap::{Segment, TempBuffer};
use crate::{Error, Result};

/// Fixed set of event slots sharing one mapped segment, plus the quota
/// of oversize temp buffers.
pub(crate) struct EventPool {
    segment: Segment,
    event_size: usize,
    slots: Vec<Mutex<EventSlot>>,
    groups: Vec<u32>,
    group_count: usize,
    temps: AtomicUsize,
    max_temps: usize,
    handovers: AtomicU64,
}

impl EventPool {
    pub(crate) fn new(config: &SystemConfig) -> Result<Self> {
        let len = config
            .events
            .checked_mul(config.event_size)
            .ok_or(Error::InvalidArgument("segment size overflow"))?;
        let segment = match &config.segment_path {
            Some(path) => Segment::create(path, len)?,
            None => Segment::anonymous(len)?,
        };
        log::debug!(
            "mapped {} byte segment for {} events of {} bytes",
            segment.len(),
            config.events,
            config.event_size
        );
        let sizes = config.group_sizes();
        let mut groups = Vec::with_capacity(config.events);
        for (index, &count) in sizes.iter().enumerate() {
            groups.extend(std::iter::repeat(index as u32 + 1).take(count));
        }
        let slots = (0..config.events).map(|_| Mutex::new(EventSlot::new())).collect();
        Ok(Self {
            segment,
            event_size: config.event_size,
            slots,
            groups,
            group_count: sizes.len(),
            temps: AtomicUsize::new(0),
            max_temps: config.max_temps,
            handovers: AtomicU64::new(0),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn event_size(&self) -> usize {
        self.event_size
    }

    pub(crate) fn group_count(&self) -> usize {
        self.group_count
    }

    pub(crate) fn group_of(&self, id: EventId) -> Result<u32> {
        self.groups
            .get(id.index())
            .copied()
            .ok_or(Error::InvalidArgument("event id out of range"))
    }

    pub(crate) fn lock(&self, id: EventId) -> Result<Event<'_>> {
        let index = id.index();
        let slot = self
            .slots
            .get(index)
            .ok_or(Error::InvalidArgument("event id out of range"))?;
        let base = self.segment.range_ptr(index * self.event_size, self.event_size)?;
        Ok(Event::new(id, self.groups[index], slot.lock()?, base, self.event_size))
    }

    /// Every event in pool order, as initially queued in GrandCentral.
    pub(crate) fn all_queued(&self) -> Vec<Queued> {
        self.groups
            .iter()
            .enumerate()
            .map(|(index, &group)| Queued::low(EventId::from_index(index as u32), group))
            .collect()
    }

    pub(crate) fn temps(&self) -> usize {
        self.temps.load(Ordering::Acquire)
    }

    pub(crate) fn max_temps(&self) -> usize {
        self.max_temps
    }

    /// Allocates a temp buffer of `len` bytes if the quota allows.
    pub(crate) fn try_allocate_temp(&self, len: usize) -> Result<Option<TempBuffer>> {
        let mut current = self.temps.load(Ordering::Acquire);
        loop {
            if current >= self.max_temps {
                return Ok(None);
            }
            match self.temps.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        match TempBuffer::allocate(len) {
            Ok(buffer) => Ok(Some(buffer)),
            Err(err) => {
                self.temps.fetch_sub(1, Ordering::AcqRel);
                Err(err)
            }
        }
    }

    /// Frees the event's temp buffer, if any.
    pub(crate) fn release_temp(&self, slot: &mut EventSlot) {
        if slot.temp.take().is_some() {
            self.temps.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Returns an allocated buffer that was never handed to an event.
    pub(crate) fn discard_temp(&self, buffer: TempBuffer) {
        drop(buffer);
        self.temps.fetch_sub(1, Ordering::AcqRel);
    }

    /// Gives the event to `owner`, remembering when it was handed over.
    pub(crate) fn hand_over(&self, slot: &mut EventSlot, owner: Owner) {
        slot.owner = owner;
        slot.handed = self.handovers.fetch_add(1, Ordering::Relaxed);
    }

    /// Events currently owned by `owner`, in the order they were handed over.
    pub(crate) fn owned_by(&self, owner: Owner) -> Result<Vec<EventId>> {
        let mut owned = Vec::new();
        for (index, slot) in self.slots.iter().enumerate() {
            let slot = slot.lock()?;
            if slot.owner == owner {
                owned.push((slot.handed, EventId::from_index(index as u32)));
            }
        }
        owned.sort_unstable_by_key(|&(handed, _)| handed);
        Ok(owned.into_iter().map(|(_, id)| id).collect())
    }
}
