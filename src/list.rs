use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use crate::event::{EventId, Priority};
use crate::registry::AttachmentSignal;
use crate::{Error, Result};

/// How `new` and `get` behave when the list has nothing to hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Wait until events arrive or the attachment is woken.
    Sleep,
    /// Wait at most this long, then fail with `Timeout`.
    Timed(Duration),
    /// Never wait: `Empty` if nothing is queued, `Busy` if the list is
    /// momentarily locked.
    Async,
}

/// One queued event. Priority and group are carried with the id so list
/// operations never touch the event slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Queued {
    pub(crate) id: EventId,
    pub(crate) priority: Priority,
    pub(crate) group: u32,
}

impl Queued {
    pub(crate) fn low(id: EventId, group: u32) -> Self {
        Self {
            id,
            priority: Priority::Low,
            group,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListStats {
    pub count: usize,
    /// Events offered to the list, consulted for prescaling.
    pub tried: u64,
    pub entered: u64,
    pub exited: u64,
}

pub(crate) struct ListState {
    events: VecDeque<Queued>,
    high: usize,
    pub(crate) tried: u64,
    pub(crate) entered: u64,
    pub(crate) exited: u64,
}

impl ListState {
    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }

    /// High priority events queue behind earlier high priority events and
    /// ahead of every low priority one.
    pub(crate) fn push(&mut self, batch: &[Queued]) {
        for queued in batch {
            match queued.priority {
                Priority::High => {
                    self.events.insert(self.high, *queued);
                    self.high += 1;
                }
                Priority::Low => self.events.push_back(*queued),
            }
        }
        self.entered += batch.len() as u64;
    }

    /// Queue ignoring priority; used for GrandCentral's input.
    pub(crate) fn push_low(&mut self, batch: &[Queued]) {
        for queued in batch {
            self.events.push_back(Queued::low(queued.id, queued.group));
        }
        self.entered += batch.len() as u64;
    }

    /// Put events back at the head of the list: high priority events go to
    /// the very front, low priority ones right after the high block. The
    /// batch keeps its own order within each priority.
    pub(crate) fn push_front(&mut self, batch: &[Queued]) {
        let mut front = 0;
        for queued in batch.iter().filter(|q| q.priority == Priority::High) {
            self.events.insert(front, *queued);
            front += 1;
        }
        self.high += front;
        let mut at = self.high;
        for queued in batch.iter().filter(|q| q.priority == Priority::Low) {
            self.events.insert(at, *queued);
            at += 1;
        }
        self.entered += batch.len() as u64;
    }

    fn available(&self, group: Option<u32>) -> bool {
        match group {
            None => !self.events.is_empty(),
            Some(group) => self.events.iter().any(|q| q.group == group),
        }
    }

    fn take(&mut self, count: usize, group: Option<u32>) -> Vec<Queued> {
        let taken: Vec<Queued> = match group {
            None => {
                let n = count.min(self.events.len());
                self.events.drain(..n).collect()
            }
            Some(group) => {
                let mut taken = Vec::new();
                let mut kept = VecDeque::with_capacity(self.events.len());
                for queued in self.events.drain(..) {
                    if taken.len() < count && queued.group == group {
                        taken.push(queued);
                    } else {
                        kept.push_back(queued);
                    }
                }
                self.events = kept;
                taken
            }
        };
        let high = taken.iter().filter(|q| q.priority == Priority::High).count();
        self.high -= high.min(self.high);
        self.exited += taken.len() as u64;
        taken
    }

    pub(crate) fn drain(&mut self) -> Vec<Queued> {
        let len = self.events.len();
        self.take(len, None)
    }
}

/// Who is waiting on a list, and how to tell they should stop.
pub(crate) struct Waiter<'a> {
    pub(crate) signal: &'a AttachmentSignal,
    pub(crate) alive: &'a AtomicBool,
}

/// Ordered event list with its own lock and condition variable.
pub(crate) struct EventList {
    state: Mutex<ListState>,
    ready: Condvar,
}

impl EventList {
    pub(crate) fn new() -> Self {
        Self::with_events(Vec::new())
    }

    pub(crate) fn with_events(events: Vec<Queued>) -> Self {
        let high = events.iter().take_while(|q| q.priority == Priority::High).count();
        Self {
            state: Mutex::new(ListState {
                events: events.into(),
                high,
                tried: 0,
                entered: 0,
                exited: 0,
            }),
            ready: Condvar::new(),
        }
    }

    pub(crate) fn state(&self) -> Result<MutexGuard<'_, ListState>> {
        Ok(self.state.lock()?)
    }

    /// Wakes every waiter. Takes the lock first so a waiter between its
    /// check and its wait cannot miss the notification.
    pub(crate) fn notify(&self) {
        drop(self.state.lock());
        self.ready.notify_all();
    }

    pub(crate) fn push(&self, batch: &[Queued]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.state()?.push(batch);
        self.ready.notify_all();
        Ok(())
    }

    pub(crate) fn push_low(&self, batch: &[Queued]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.state()?.push_low(batch);
        self.ready.notify_all();
        Ok(())
    }

    pub(crate) fn push_front(&self, batch: &[Queued]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.state()?.push_front(batch);
        self.ready.notify_all();
        Ok(())
    }

    pub(crate) fn drain(&self) -> Result<Vec<Queued>> {
        Ok(self.state()?.drain())
    }

    /// Zeroes the counters of a list being reused for a new station.
    pub(crate) fn reset(&self) -> Result<()> {
        let mut state = self.state()?;
        state.tried = 0;
        state.entered = 0;
        state.exited = 0;
        Ok(())
    }

    /// Notifies waiters after events were queued through [`Self::state`].
    pub(crate) fn signal(&self) {
        self.ready.notify_all();
    }

    pub(crate) fn len(&self) -> Result<usize> {
        Ok(self.state()?.len())
    }

    pub(crate) fn stats(&self) -> Result<ListStats> {
        let state = self.state()?;
        Ok(ListStats {
            count: state.events.len(),
            tried: state.tried,
            entered: state.entered,
            exited: state.exited,
        })
    }

    /// Takes up to `count` events for an attachment, waiting per `mode`.
    pub(crate) fn take(
        &self,
        count: usize,
        mode: WaitMode,
        group: Option<u32>,
        waiter: &Waiter<'_>,
    ) -> Result<Vec<Queued>> {
        let mut state = match mode {
            WaitMode::Async => match self.state.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::WouldBlock) => return Err(Error::Busy),
                Err(TryLockError::Poisoned(_)) => return Err(Error::Dead),
            },
            _ => self.state.lock()?,
        };
        let deadline = match mode {
            WaitMode::Timed(timeout) => Some(Instant::now() + timeout),
            _ => None,
        };
        loop {
            if !waiter.alive.load(Ordering::Acquire) {
                return Err(Error::Dead);
            }
            if state.available(group) {
                return Ok(state.take(count, group));
            }
            let signal = waiter.signal;
            match mode {
                WaitMode::Async => return Err(Error::Empty),
                WaitMode::Sleep => {
                    signal.enter_wait(true);
                    let result = self.ready.wait(state);
                    signal.leave_wait();
                    state = result?;
                }
                WaitMode::Timed(_) => {
                    let now = Instant::now();
                    let remaining = deadline.map_or(Duration::ZERO, |d| d.saturating_duration_since(now));
                    if remaining.is_zero() {
                        return Err(Error::Timeout);
                    }
                    signal.enter_wait(false);
                    let result = self.ready.wait_timeout(state, remaining);
                    signal.leave_wait();
                    state = result?.0;
                }
            }
            if signal.take_quit() {
                return Err(Error::Wakeup);
            }
        }
    }

    /// Conductor side: waits until the list has events and takes them all.
    /// Returns `None` once `stop` is raised.
    pub(crate) fn wait_drain(&self, stop: &AtomicBool) -> Result<Option<Vec<Queued>>> {
        let mut state = self.state()?;
        loop {
            if stop.load(Ordering::Acquire) {
                return Ok(None);
            }
            if !state.events.is_empty() {
                return Ok(Some(state.drain()));
            }
            state = self.ready.wait(state)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn q(index: u32, priority: Priority) -> Queued {
        Queued {
            id: EventId::from_index(index),
            priority,
            group: 1,
        }
    }

    fn ids(events: &[Queued]) -> Vec<u32> {
        events.iter().map(|q| q.id.raw()).collect()
    }

    #[test]
    fn high_priority_queues_ahead_of_low() -> Result<()> {
        let list = EventList::new();
        list.push(&[q(0, Priority::Low), q(1, Priority::High), q(2, Priority::Low)])?;
        list.push(&[q(3, Priority::High)])?;
        assert_eq!(ids(&list.drain()?), vec![1, 3, 0, 2]);
        Ok(())
    }

    #[test]
    fn push_front_restores_ahead_of_queue() -> Result<()> {
        let list = EventList::new();
        list.push(&[q(0, Priority::High), q(1, Priority::Low)])?;
        list.push_front(&[q(5, Priority::Low), q(6, Priority::High)])?;
        assert_eq!(ids(&list.drain()?), vec![6, 0, 5, 1]);
        Ok(())
    }

    #[test]
    fn push_front_keeps_batch_order() -> Result<()> {
        let list = EventList::new();
        list.push(&[q(9, Priority::High), q(10, Priority::Low)])?;
        list.push_front(&[
            q(0, Priority::Low),
            q(1, Priority::High),
            q(2, Priority::Low),
            q(3, Priority::High),
            q(4, Priority::Low),
        ])?;
        assert_eq!(ids(&list.drain()?), vec![1, 3, 9, 0, 2, 4, 10]);
        Ok(())
    }

    #[test]
    fn group_take_skips_other_groups() -> Result<()> {
        let list = EventList::with_events(vec![
            Queued::low(EventId::from_index(0), 1),
            Queued::low(EventId::from_index(1), 2),
            Queued::low(EventId::from_index(2), 2),
            Queued::low(EventId::from_index(3), 1),
        ]);
        let signal = AttachmentSignal::default();
        let alive = AtomicBool::new(true);
        let waiter = Waiter {
            signal: &signal,
            alive: &alive,
        };
        let taken = list.take(5, WaitMode::Async, Some(2), &waiter)?;
        assert_eq!(ids(&taken), vec![1, 2]);
        let err = list.take(1, WaitMode::Async, Some(2), &waiter);
        assert!(matches!(err, Err(Error::Empty)));
        assert_eq!(list.stats()?.count, 2);
        assert_eq!(list.stats()?.exited, 2);
        Ok(())
    }

    #[test]
    fn timed_take_times_out() {
        let list = EventList::new();
        let signal = AttachmentSignal::default();
        let alive = AtomicBool::new(true);
        let waiter = Waiter {
            signal: &signal,
            alive: &alive,
        };
        let start = Instant::now();
        let err = list.take(1, WaitMode::Timed(Duration::from_millis(30)), None, &waiter);
        assert!(matches!(err, Err(Error::Timeout)));
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(!signal.is_blocked());
    }

    #[test]
    fn sleeping_take_wakes_on_push() -> Result<()> {
        let list = Arc::new(EventList::new());
        let signal = Arc::new(AttachmentSignal::default());
        let alive = Arc::new(AtomicBool::new(true));

        let handle = {
            let list = Arc::clone(&list);
            let signal = Arc::clone(&signal);
            let alive = Arc::clone(&alive);
            thread::spawn(move || {
                let waiter = Waiter {
                    signal: &signal,
                    alive: &alive,
                };
                list.take(4, WaitMode::Sleep, None, &waiter)
            })
        };
        while !signal.is_blocked() {
            thread::yield_now();
        }
        list.push(&[q(7, Priority::Low)])?;
        let taken = handle.join().expect("join")?;
        assert_eq!(ids(&taken), vec![7]);
        Ok(())
    }

    #[test]
    fn quit_flag_interrupts_sleep() {
        let list = Arc::new(EventList::new());
        let signal = Arc::new(AttachmentSignal::default());
        let alive = Arc::new(AtomicBool::new(true));

        let handle = {
            let list = Arc::clone(&list);
            let signal = Arc::clone(&signal);
            let alive = Arc::clone(&alive);
            thread::spawn(move || {
                let waiter = Waiter {
                    signal: &signal,
                    alive: &alive,
                };
                list.take(1, WaitMode::Sleep, None, &waiter)
            })
        };
        while !signal.is_blocked() {
            thread::yield_now();
        }
        assert!(signal.request_quit());
        list.notify();
        let result = handle.join().expect("join");
        assert!(matches!(result, Err(Error::Wakeup)));
    }

    #[test]
    fn wait_drain_stops_on_flag() -> Result<()> {
        let list = Arc::new(EventList::new());
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let list = Arc::clone(&list);
            let stop = Arc::clone(&stop);
            thread::spawn(move || list.wait_drain(&stop))
        };
        thread::sleep(Duration::from_millis(20));
        stop.store(true, Ordering::Release);
        list.notify();
        assert!(handle.join().expect("join")?.is_none());
        Ok(())
    }
}
