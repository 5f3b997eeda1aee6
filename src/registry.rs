use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::station::StationId;
use crate::{Error, Result};

/// Slot of a connected client process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(u32);

impl ProcessId {
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

/// Slot of an attachment; the identity that owns events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttachmentId(u32);

impl AttachmentId {
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

impl fmt::Display for AttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "att#{}", self.0)
    }
}

/// Wait flags of one attachment, shared with whoever wakes it.
#[derive(Debug, Default)]
pub(crate) struct AttachmentSignal {
    blocked: AtomicBool,
    sleeping: AtomicBool,
    quit: AtomicBool,
}

impl AttachmentSignal {
    pub(crate) fn enter_wait(&self, sleeping: bool) {
        self.sleeping.store(sleeping, Ordering::Release);
        self.blocked.store(true, Ordering::Release);
    }

    pub(crate) fn leave_wait(&self) {
        self.blocked.store(false, Ordering::Release);
        self.sleeping.store(false, Ordering::Release);
    }

    pub(crate) fn take_quit(&self) -> bool {
        self.quit.swap(false, Ordering::AcqRel)
    }

    /// Flags a blocked attachment to return `Wakeup`. Returns false if the
    /// attachment was not waiting.
    pub(crate) fn request_quit(&self) -> bool {
        if !self.blocked.load(Ordering::Acquire) {
            return false;
        }
        self.quit.store(true, Ordering::Release);
        true
    }

    pub(crate) fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    pub(crate) fn is_sleeping(&self) -> bool {
        self.sleeping.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
pub(crate) struct AttachmentCounters {
    pub(crate) made: AtomicU64,
    pub(crate) got: AtomicU64,
    pub(crate) put: AtomicU64,
    pub(crate) dumped: AtomicU64,
}

impl AttachmentCounters {
    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentStats {
    pub id: AttachmentId,
    pub process: ProcessId,
    pub station: StationId,
    pub made: u64,
    pub got: u64,
    pub put: u64,
    pub dumped: u64,
    pub blocked: bool,
    pub sleeping: bool,
}

pub(crate) struct AttachmentRecord {
    pub(crate) id: AttachmentId,
    pub(crate) process: ProcessId,
    pub(crate) station: StationId,
    pub(crate) signal: Arc<AttachmentSignal>,
    pub(crate) counters: Arc<AttachmentCounters>,
}

impl AttachmentRecord {
    pub(crate) fn stats(&self) -> AttachmentStats {
        AttachmentStats {
            id: self.id,
            process: self.process,
            station: self.station,
            made: self.counters.made.load(Ordering::Relaxed),
            got: self.counters.got.load(Ordering::Relaxed),
            put: self.counters.put.load(Ordering::Relaxed),
            dumped: self.counters.dumped.load(Ordering::Relaxed),
            blocked: self.signal.is_blocked(),
            sleeping: self.signal.is_sleeping(),
        }
    }
}

pub(crate) struct ProcessRecord {
    pub(crate) id: ProcessId,
    pub(crate) name: String,
    pub(crate) privileged: bool,
    pub(crate) heartbeat: Arc<AtomicU64>,
    pub(crate) attachments: BTreeSet<AttachmentId>,
}

/// Process and attachment tables, guarded by the system lock.
pub(crate) struct Registry {
    processes: Vec<Option<ProcessRecord>>,
    attachments: Vec<Option<AttachmentRecord>>,
}

impl Registry {
    pub(crate) fn new(max_processes: usize, max_attachments: usize) -> Self {
        Self {
            processes: (0..max_processes).map(|_| None).collect(),
            attachments: (0..max_attachments).map(|_| None).collect(),
        }
    }

    pub(crate) fn add_process(&mut self, name: &str, privileged: bool) -> Result<ProcessId> {
        let index = self
            .processes
            .iter()
            .position(Option::is_none)
            .ok_or(Error::TooMany("processes"))?;
        let id = ProcessId::from_index(index as u32);
        self.processes[index] = Some(ProcessRecord {
            id,
            name: name.to_string(),
            privileged,
            heartbeat: Arc::new(AtomicU64::new(0)),
            attachments: BTreeSet::new(),
        });
        Ok(id)
    }

    pub(crate) fn remove_process(&mut self, id: ProcessId) -> Option<ProcessRecord> {
        self.processes.get_mut(id.index()).and_then(Option::take)
    }

    pub(crate) fn process(&self, id: ProcessId) -> Result<&ProcessRecord> {
        self.processes
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or(Error::InvalidArgument("unknown process"))
    }

    pub(crate) fn processes(&self) -> impl Iterator<Item = &ProcessRecord> {
        self.processes.iter().flatten()
    }

    pub(crate) fn add_attachment(&mut self, process: ProcessId, station: StationId) -> Result<AttachmentId> {
        let index = self
            .attachments
            .iter()
            .position(Option::is_none)
            .ok_or(Error::TooMany("attachments"))?;
        let id = AttachmentId::from_index(index as u32);
        let record = self
            .processes
            .get_mut(process.index())
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidArgument("unknown process"))?;
        record.attachments.insert(id);
        self.attachments[index] = Some(AttachmentRecord {
            id,
            process,
            station,
            signal: Arc::new(AttachmentSignal::default()),
            counters: Arc::new(AttachmentCounters::default()),
        });
        Ok(id)
    }

    pub(crate) fn remove_attachment(&mut self, id: AttachmentId) -> Option<AttachmentRecord> {
        let record = self.attachments.get_mut(id.index()).and_then(Option::take)?;
        if let Some(process) = self
            .processes
            .get_mut(record.process.index())
            .and_then(Option::as_mut)
        {
            process.attachments.remove(&id);
        }
        Some(record)
    }

    pub(crate) fn attachment(&self, id: AttachmentId) -> Result<&AttachmentRecord> {
        self.attachments
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or(Error::InvalidArgument("unknown attachment"))
    }

    pub(crate) fn attachments(&self) -> impl Iterator<Item = &AttachmentRecord> {
        self.attachments.iter().flatten()
    }

    pub(crate) fn process_count(&self) -> usize {
        self.processes().count()
    }

    pub(crate) fn attachment_count(&self) -> usize {
        self.attachments().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_reused_after_removal() -> Result<()> {
        let mut registry = Registry::new(2, 2);
        let a = registry.add_process("a", false)?;
        let b = registry.add_process("b", false)?;
        assert!(matches!(registry.add_process("c", false), Err(Error::TooMany(_))));
        registry.remove_process(a);
        let c = registry.add_process("c", true)?;
        assert_eq!(c, a);
        assert_ne!(c, b);
        assert_eq!(registry.process_count(), 2);
        Ok(())
    }

    #[test]
    fn attachments_track_their_process() -> Result<()> {
        let mut registry = Registry::new(1, 3);
        let p = registry.add_process("p", false)?;
        let a1 = registry.add_attachment(p, StationId::GRAND_CENTRAL)?;
        let a2 = registry.add_attachment(p, StationId::GRAND_CENTRAL)?;
        assert_eq!(registry.process(p)?.attachments.len(), 2);
        registry.remove_attachment(a1);
        let remaining: Vec<_> = registry.process(p)?.attachments.iter().copied().collect();
        assert_eq!(remaining, vec![a2]);
        assert!(registry.attachment(a1).is_err());
        assert!(registry
            .add_attachment(ProcessId::from_index(5), StationId::GRAND_CENTRAL)
            .is_err());
        Ok(())
    }

    #[test]
    fn quit_only_lands_on_blocked_attachment() {
        let signal = AttachmentSignal::default();
        assert!(!signal.request_quit());
        assert!(!signal.take_quit());
        signal.enter_wait(true);
        assert!(signal.is_sleeping());
        assert!(signal.request_quit());
        signal.leave_wait();
        assert!(signal.take_quit());
        assert!(!signal.take_quit());
    }
}
