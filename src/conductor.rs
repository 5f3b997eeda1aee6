//! Per-station transport thread.
//!
//! Each station owns one conductor. It sleeps on the station's output
//! list, takes everything queued there and walks the chain downstream,
//! offering the batch to each position in turn:
//!
//! ```text
//!   output(S) ──► next position ──► next position ──► ... ──► GrandCentral
//!                 │ serial: one station filters
//!                 │ parallel: each active member filters in turn,
//!                 │           or the group shares the batch (rr / equal-cue)
//!                 ▼
//!               input(T)
//! ```
//!
//! Whatever no station takes is absorbed by GrandCentral. The conductor
//! holds its station's transfer lock for the whole walk, so the topology
//! cannot change under it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::config::{BlockMode, FlowMode, SelectMode};
use crate::distribute::{equal_cue, round_robin, round_robin_start};
use crate::list::Queued;
use crate::lock::LockOwner;
use crate::select;
use crate::station::{StationId, StationSlot};
use crate::system::Shared;
use crate::topology::{Hop, HopMember};
use crate::Result;

pub(crate) struct Conductor {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Conductor {
    pub(crate) fn spawn(shared: Arc<Shared>, station: StationId) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(format!("et-conductor-{}", station.raw()))
            .spawn(move || run(shared, station, thread_stop))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub(crate) fn stop(&self, slot: &StationSlot) {
        self.stop.store(true, Ordering::Release);
        slot.output.notify();
    }

    pub(crate) fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(shared: Arc<Shared>, station: StationId, stop: Arc<AtomicBool>) {
    let Ok(slot) = shared.station(station) else {
        return;
    };
    log::debug!("conductor for {station} started");
    loop {
        let batch = match slot.output.wait_drain(&stop) {
            Ok(Some(batch)) => batch,
            Ok(None) => break,
            Err(err) => {
                log::error!("conductor for {station} lost its output list: {err}");
                break;
            }
        };
        let mut pending = batch;
        if let Err(err) = shared.distribute(station, &mut pending) {
            log::error!(
                "conductor for {station} failed to distribute: {err}; returning {} events to GrandCentral",
                pending.len()
            );
            if let Err(err) = shared.absorb(&pending) {
                log::error!("conductor for {station} lost {} events: {err}", pending.len());
            }
            if !shared.is_alive() {
                break;
            }
        }
    }
    log::debug!("conductor for {station} exiting");
}

impl Shared {
    /// Routes one batch taken from `from`'s output list. Events are removed
    /// from `pending` as they are placed; on error it holds those still
    /// unplaced.
    pub(crate) fn distribute(&self, from: StationId, pending: &mut Vec<Queued>) -> Result<()> {
        let _transfer = self
            .station(from)?
            .transfer
            .acquire(LockOwner::Conductor(from))?;
        log::trace!("{from} distributing {} events", pending.len());
        let mut target = self.topology.lock()?.next_after(from);
        let mut first_pass = true;
        loop {
            if target == StationId::GRAND_CENTRAL {
                self.absorb(pending)?;
                pending.clear();
                return Ok(());
            }
            let hop = self.topology.lock()?.hop(target);
            let head = &hop.members[0].config;
            if hop.members.iter().any(|m| m.active) {
                if head.flow == FlowMode::Parallel && head.select_mode.distributes() {
                    self.share(&hop, pending)?;
                } else {
                    for member in hop.members.iter().filter(|m| m.active) {
                        if pending.is_empty() {
                            break;
                        }
                        self.offer(member, pending, first_pass)?;
                    }
                }
            }
            if pending.is_empty() {
                return Ok(());
            }
            target = hop.next;
            first_pass = false;
        }
    }

    /// Offers events to one station, leaving in `pending` those it did not
    /// take.
    fn offer(&self, member: &HopMember, pending: &mut Vec<Queued>, first_pass: bool) -> Result<()> {
        let config = &member.config;
        let events = pending.as_slice();
        let selected: Vec<bool> = match config.select_mode {
            SelectMode::Match => events
                .iter()
                .map(|q| -> Result<bool> {
                    Ok(select::matches(&config.select, &self.pool.lock(q.id)?.control()))
                })
                .collect::<Result<_>>()?,
            SelectMode::User => match &config.selector {
                Some(selector) => events
                    .iter()
                    .map(|q| selector.call(member.id, &self.pool.lock(q.id)?))
                    .collect::<Result<_>>()?,
                None => vec![false; events.len()],
            },
            _ => vec![true; events.len()],
        };

        let list = &self.station(member.id)?.input;
        let mut state = list.state()?;
        let events = std::mem::take(pending);
        let mut taken = Vec::new();
        let mut left = Vec::new();
        match config.block {
            BlockMode::Blocking
                if first_pass && config.select_mode == SelectMode::All && config.prescale == 1 =>
            {
                state.tried += events.len() as u64;
                taken = events;
            }
            BlockMode::Blocking => {
                let prescale = u64::from(config.prescale.max(1));
                for (queued, wanted) in events.into_iter().zip(selected) {
                    if wanted {
                        let admit = state.tried % prescale == 0;
                        state.tried += 1;
                        if admit {
                            taken.push(queued);
                            continue;
                        }
                    }
                    left.push(queued);
                }
            }
            BlockMode::NonBlocking => {
                let mut room = config.cue.saturating_sub(state.len());
                for (queued, wanted) in events.into_iter().zip(selected) {
                    if wanted && room > 0 {
                        taken.push(queued);
                        room -= 1;
                    } else {
                        left.push(queued);
                    }
                }
            }
        }
        if !taken.is_empty() {
            state.push(&taken);
            drop(state);
            list.signal();
            log::trace!("{} took {} events", member.id, taken.len());
        }
        *pending = left;
        Ok(())
    }

    /// Splits the whole batch among the active members of a round-robin
    /// or equal-cue group. Delivered events leave `pending`.
    fn share(&self, hop: &Hop, pending: &mut Vec<Queued>) -> Result<()> {
        let mut placed = vec![false; pending.len()];
        let result = self.share_planned(hop, pending, &mut placed);
        let mut placed = placed.into_iter();
        pending.retain(|_| !placed.next().unwrap_or(false));
        result
    }

    fn share_planned(&self, hop: &Hop, events: &[Queued], placed: &mut [bool]) -> Result<()> {
        let active: Vec<&HopMember> = hop.members.iter().filter(|m| m.active).collect();
        let mode = hop.members[0].config.select_mode;
        match mode {
            SelectMode::RoundRobin => {
                let flags: Vec<bool> = hop.members.iter().map(|m| m.active).collect();
                let marks: Vec<bool> = hop.members.iter().map(|m| m.was_last).collect();
                let start = round_robin_start(&flags, &marks)
                    .and_then(|index| active.iter().position(|m| m.id == hop.members[index].id))
                    .unwrap_or(0);
                let plan = round_robin(events.len(), active.len(), start);
                for (member, positions) in active.iter().zip(&plan.shares) {
                    let share: Vec<Queued> = positions.iter().map(|&p| events[p]).collect();
                    self.deliver(member.id, &share)?;
                    for &p in positions {
                        placed[p] = true;
                    }
                }
                if !events.is_empty() {
                    self.topology
                        .lock()?
                        .mark_last(hop.head, active[plan.last].id);
                }
            }
            _ => {
                let depths = active
                    .iter()
                    .map(|m| self.station(m.id)?.input.len())
                    .collect::<Result<Vec<_>>>()?;
                let counts = equal_cue(&depths, events.len());
                let mut offset = 0;
                for (member, count) in active.iter().zip(counts) {
                    self.deliver(member.id, &events[offset..offset + count])?;
                    placed[offset..offset + count].fill(true);
                    offset += count;
                }
            }
        }
        Ok(())
    }

    fn deliver(&self, station: StationId, events: &[Queued]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let list = &self.station(station)?.input;
        let mut state = list.state()?;
        state.tried += events.len() as u64;
        state.push(events);
        drop(state);
        list.signal();
        Ok(())
    }

    /// GrandCentral takes back events, dropping their temp buffers.
    pub(crate) fn absorb(&self, events: &[Queued]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        for queued in events {
            let mut event = self.pool.lock(queued.id)?;
            self.pool.release_temp(event.slot_mut());
        }
        self.station(StationId::GRAND_CENTRAL)?.input.push_low(events)
    }
}
