use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::{StationConfig, SELECT_INTS};
use crate::event::{Event, EventId};
use crate::heartbeat::Worker;
use crate::list::WaitMode;
use crate::registry::{AttachmentId, ProcessId};
use crate::select::Selector;
use crate::station::StationId;
use crate::system::Shared;
use crate::topology::{ParallelPosition, Position};
use crate::{Error, Result};

/// A client's connection to a running system.
///
/// Each handle registers one process with its own heartbeat. Dropping the
/// handle detaches every attachment it still holds.
///
/// ```no_run
/// use etbroker::{EtSystem, StationConfig, SystemConfig, WaitMode};
///
/// let system = EtSystem::create(SystemConfig::new(100, 1024))?;
/// let producer = system.open_process("producer")?;
/// let station = producer.create_station("filter", &StationConfig::default())?;
/// let att = producer.attach(station)?;
/// let ids = producer.new_events(att, WaitMode::Sleep, 64, 4)?;
/// for &id in &ids {
///     producer.event(att, id)?.write_payload(b"hello")?;
/// }
/// producer.put_events(att, &ids)?;
/// # Ok::<(), etbroker::Error>(())
/// ```
pub struct ProcessHandle {
    shared: Arc<Shared>,
    pid: ProcessId,
    heartbeat: Mutex<Option<Worker>>,
    closed: AtomicBool,
}

impl ProcessHandle {
    pub(crate) fn open(shared: Arc<Shared>, name: &str, privileged: bool) -> Result<Self> {
        shared.ensure_alive()?;
        let (pid, beat) = {
            let mut registry = shared.registry.lock()?;
            let pid = registry.add_process(name, privileged)?;
            (pid, Arc::clone(&registry.process(pid)?.heartbeat))
        };
        let heartbeat = match Worker::process_heartbeat(&shared, pid, beat) {
            Ok(worker) => worker,
            Err(err) => {
                shared.registry.lock()?.remove_process(pid);
                return Err(err);
            }
        };
        log::info!("process {name} opened as {}", pid.raw());
        Ok(Self {
            shared,
            pid,
            heartbeat: Mutex::new(Some(heartbeat)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ProcessId {
        self.pid
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// True while the system is up and its heartbeat is being emitted.
    pub fn system_alive(&self) -> bool {
        self.shared.is_alive()
    }

    /// Creates a serial or parallel station at the end of the chain.
    pub fn create_station(&self, name: &str, config: &StationConfig) -> Result<StationId> {
        self.create_station_at(name, config, Position::End, ParallelPosition::End)
    }

    pub fn create_station_at(
        &self,
        name: &str,
        config: &StationConfig,
        position: Position,
        parallel: ParallelPosition,
    ) -> Result<StationId> {
        self.ensure_open()?;
        self.shared.create_station(self.pid, name, config, position, parallel)
    }

    pub fn remove_station(&self, id: StationId) -> Result<()> {
        self.ensure_open()?;
        self.shared.remove_station(self.pid, id)
    }

    pub fn station_id(&self, name: &str) -> Result<StationId> {
        self.shared.station_id(name)
    }

    /// (position, parallel position) of a station in the chain.
    pub fn station_position(&self, id: StationId) -> Result<(usize, usize)> {
        self.shared
            .topology
            .lock()?
            .position_of(id)
            .ok_or(Error::InvalidOperation("station is not linked"))
    }

    pub fn set_station_position(&self, id: StationId, position: Position, parallel: ParallelPosition) -> Result<()> {
        self.ensure_open()?;
        self.shared.set_station_position(self.pid, id, position, parallel)
    }

    pub fn set_select_words(&self, id: StationId, words: [i32; SELECT_INTS]) -> Result<()> {
        self.ensure_open()?;
        self.shared.set_select_words(self.pid, id, words)
    }

    /// Installs a filter callback and switches the station to user
    /// selection.
    pub fn set_selector(&self, id: StationId, selector: Selector) -> Result<()> {
        self.ensure_open()?;
        self.shared.set_selector(self.pid, id, selector)
    }

    pub fn attach(&self, station: StationId) -> Result<AttachmentId> {
        self.ensure_open()?;
        self.shared.attach(self.pid, station)
    }

    pub fn detach(&self, att: AttachmentId) -> Result<()> {
        self.ensure_open()?;
        self.shared.detach(self.pid, att)
    }

    /// Takes `count` fresh events of at least `size` bytes from
    /// GrandCentral. Fewer may be returned if fewer are available.
    pub fn new_events(&self, att: AttachmentId, mode: WaitMode, size: usize, count: usize) -> Result<Vec<EventId>> {
        self.ensure_open()?;
        self.shared.new_events(self.pid, att, mode, size, count, None)
    }

    /// Like [`Self::new_events`], restricted to one event group (1-based).
    pub fn new_events_in_group(
        &self,
        att: AttachmentId,
        mode: WaitMode,
        size: usize,
        count: usize,
        group: u32,
    ) -> Result<Vec<EventId>> {
        self.ensure_open()?;
        self.shared.new_events(self.pid, att, mode, size, count, Some(group))
    }

    pub fn get_events(&self, att: AttachmentId, mode: WaitMode, count: usize) -> Result<Vec<EventId>> {
        self.ensure_open()?;
        self.shared.get_events(self.pid, att, mode, count)
    }

    /// Hands events to the station's conductor. Any [`Event`] guard for
    /// these ids must be dropped first.
    pub fn put_events(&self, att: AttachmentId, ids: &[EventId]) -> Result<()> {
        self.ensure_open()?;
        self.shared.put_events(self.pid, att, ids)
    }

    /// Returns events straight to GrandCentral, unprocessed.
    pub fn dump_events(&self, att: AttachmentId, ids: &[EventId]) -> Result<()> {
        self.ensure_open()?;
        self.shared.dump_events(self.pid, att, ids)
    }

    /// Locks an event owned by `att` for access to its header and data.
    pub fn event(&self, att: AttachmentId, id: EventId) -> Result<Event<'_>> {
        self.ensure_open()?;
        self.shared.event(self.pid, att, id)
    }

    /// Interrupts a sleeping `new` or `get` on one of this process's
    /// attachments. Has no effect if the attachment is not waiting.
    pub fn wakeup(&self, att: AttachmentId) -> Result<()> {
        self.ensure_open()?;
        self.shared.wakeup(self.pid, att)
    }

    pub fn wakeup_all(&self, station: StationId) -> Result<()> {
        self.ensure_open()?;
        self.shared.wakeup_all(station)
    }

    /// Detaches everything and unregisters the process.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(worker) = self.heartbeat.lock()?.take() {
            worker.stop();
        }
        if !self.shared.is_alive() {
            return Ok(());
        }
        let attachments: Vec<AttachmentId> = match self.shared.registry.lock()?.process(self.pid) {
            Ok(record) => record.attachments.iter().copied().collect(),
            Err(_) => return Ok(()),
        };
        for att in attachments {
            if let Err(err) = self.shared.detach(self.pid, att) {
                log::warn!("detaching {att} on close failed: {err}");
            }
        }
        self.shared.registry.lock()?.remove_process(self.pid);
        log::info!("process {} closed", self.pid.raw());
        Ok(())
    }

    /// Stops the heartbeat and abandons every attachment and event as if
    /// the process had crashed. The monitor repairs what is left.
    pub fn abort(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(worker) = self.heartbeat.lock()?.take() {
            worker.stop();
        }
        log::warn!("process {} aborted", self.pid.raw());
        Ok(())
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("closing process {} failed: {err}", self.pid.raw());
        }
    }
}
