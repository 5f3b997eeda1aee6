use std::fmt;
use std::sync::MutexGuard;

use crate::config::SELECT_INTS;
use crate::mmap::TempBuffer;
use crate::registry::AttachmentId;
use crate::{Error, Result};

/// Index of an event slot in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u32);

impl EventId {
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

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    System,
    Attachment(AttachmentId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Low,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Age {
    New,
    Used,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataStatus {
    #[default]
    Ok,
    Corrupt,
    /// Recovered from a process that died while owning the event.
    PossiblyCorrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
}

impl ByteOrder {
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }
}

impl Default for ByteOrder {
    fn default() -> Self {
        Self::native()
    }
}

/// Mutable header of one pool slot.
pub(crate) struct EventSlot {
    pub(crate) owner: Owner,
    pub(crate) length: usize,
    pub(crate) priority: Priority,
    pub(crate) age: Age,
    pub(crate) status: DataStatus,
    pub(crate) byte_order: ByteOrder,
    pub(crate) control: [i32; SELECT_INTS],
    pub(crate) temp: Option<TempBuffer>,
    /// Handover stamp of the last time an attachment took the event.
    pub(crate) handed: u64,
}

impl EventSlot {
    pub(crate) fn new() -> Self {
        Self {
            owner: Owner::System,
            length: 0,
            priority: Priority::Low,
            age: Age::New,
            status: DataStatus::Ok,
            byte_order: ByteOrder::native(),
            control: [0; SELECT_INTS],
            temp: None,
            handed: 0,
        }
    }

    /// Resets the header for a fresh `new`.
    pub(crate) fn init_fresh(&mut self, length: usize) {
        self.length = length;
        self.priority = Priority::Low;
        self.age = Age::New;
        self.status = DataStatus::Ok;
        self.byte_order = ByteOrder::native();
        self.control = [0; SELECT_INTS];
    }
}

/// Snapshot of an event's header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventInfo {
    pub id: EventId,
    pub group: u32,
    pub owner: Owner,
    pub length: usize,
    pub capacity: usize,
    pub priority: Priority,
    pub age: Age,
    pub status: DataStatus,
    pub byte_order: ByteOrder,
    pub control: [i32; SELECT_INTS],
    pub temp: bool,
}

/// Locked view of one event: its header plus its payload buffer, either
/// the pool slot or the event's temp buffer.
pub struct Event<'a> {
    id: EventId,
    group: u32,
    slot: MutexGuard<'a, EventSlot>,
    base: *mut u8,
    size: usize,
}

impl<'a> Event<'a> {
    pub(crate) fn new(id: EventId, group: u32, slot: MutexGuard<'a, EventSlot>, base: *mut u8, size: usize) -> Self {
        Self {
            id,
            group,
            slot,
            base,
            size,
        }
    }

    pub(crate) fn slot_mut(&mut self) -> &mut EventSlot {
        &mut self.slot
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn group(&self) -> u32 {
        self.group
    }

    pub fn owner(&self) -> Owner {
        self.slot.owner
    }

    pub fn age(&self) -> Age {
        self.slot.age
    }

    pub fn is_temp(&self) -> bool {
        self.slot.temp.is_some()
    }

    pub fn capacity(&self) -> usize {
        match &self.slot.temp {
            Some(temp) => temp.len(),
            None => self.size,
        }
    }

    pub fn length(&self) -> usize {
        self.slot.length
    }

    pub fn set_length(&mut self, len: usize) -> Result<()> {
        let capacity = self.capacity();
        if len > capacity {
            return Err(Error::LengthTooLarge { len, capacity });
        }
        self.slot.length = len;
        Ok(())
    }

    /// The first `length()` bytes of the buffer.
    pub fn payload(&self) -> &[u8] {
        let len = self.slot.length;
        &self.buffer()[..len]
    }

    /// The whole buffer, `capacity()` bytes.
    pub fn buffer(&self) -> &[u8] {
        match &self.slot.temp {
            Some(temp) => temp.as_slice(),
            None => unsafe { std::slice::from_raw_parts(self.base, self.size) },
        }
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        let size = self.size;
        let base = self.base;
        match &mut self.slot.temp {
            Some(temp) => temp.as_mut_slice(),
            None => unsafe { std::slice::from_raw_parts_mut(base, size) },
        }
    }

    /// Copies `bytes` into the buffer and sets the length.
    pub fn write_payload(&mut self, bytes: &[u8]) -> Result<()> {
        self.set_length(bytes.len())?;
        self.buffer_mut()[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn control(&self) -> [i32; SELECT_INTS] {
        self.slot.control
    }

    /// Sets the leading control words; the rest keep their value.
    pub fn set_control(&mut self, words: &[i32]) -> Result<()> {
        if words.len() > SELECT_INTS {
            return Err(Error::InvalidArgument("too many control words"));
        }
        self.slot.control[..words.len()].copy_from_slice(words);
        Ok(())
    }

    pub fn priority(&self) -> Priority {
        self.slot.priority
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.slot.priority = priority;
    }

    pub fn data_status(&self) -> DataStatus {
        self.slot.status
    }

    pub fn set_data_status(&mut self, status: DataStatus) {
        self.slot.status = status;
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.slot.byte_order
    }

    pub fn set_byte_order(&mut self, order: ByteOrder) {
        self.slot.byte_order = order;
    }

    /// Whether the payload was written with the other byte order.
    pub fn needs_swap(&self) -> bool {
        self.slot.byte_order != ByteOrder::native()
    }

    pub fn info(&self) -> EventInfo {
        EventInfo {
            id: self.id,
            group: self.group,
            owner: self.slot.owner,
            length: self.slot.length,
            capacity: self.capacity(),
            priority: self.slot.priority,
            age: self.slot.age,
            status: self.slot.status,
            byte_order: self.slot.byte_order,
            control: self.slot.control,
            temp: self.slot.temp.is_some(),
        }
    }
}

impl fmt::Debug for Event<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.info(), f)
    }
}
