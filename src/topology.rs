use std::collections::BTreeSet;

use crate::config::{FlowMode, StationConfig};
use crate::registry::{AttachmentId, ProcessId};
use crate::station::{StationId, StationStatus, GRAND_CENTRAL_NAME};
use crate::{Error, Result};

/// Place in the main chain. Position 0 always belongs to GrandCentral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    End,
    At(usize),
}

/// Place inside a parallel group. Position 0 is the group head, which is
/// only ever taken by a station starting a new group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelPosition {
    End,
    At(usize),
    NewHead,
}

pub(crate) struct StationEntry {
    pub(crate) name: String,
    pub(crate) config: StationConfig,
    pub(crate) status: StationStatus,
    pub(crate) prev: Option<StationId>,
    pub(crate) next: Option<StationId>,
    pub(crate) prev_parallel: Option<StationId>,
    pub(crate) next_parallel: Option<StationId>,
    /// Received the final event of the last round-robin batch.
    pub(crate) was_last: bool,
    pub(crate) attachments: BTreeSet<AttachmentId>,
    pub(crate) creator: Option<ProcessId>,
}

impl StationEntry {
    fn unused() -> Self {
        Self {
            name: String::new(),
            config: StationConfig::default(),
            status: StationStatus::Unused,
            prev: None,
            next: None,
            prev_parallel: None,
            next_parallel: None,
            was_last: false,
            attachments: BTreeSet::new(),
            creator: None,
        }
    }

    fn clear_links(&mut self) {
        self.prev = None;
        self.next = None;
        self.prev_parallel = None;
        self.next_parallel = None;
        self.was_last = false;
    }
}

/// Snapshot of one downstream position: a single station, or a parallel
/// group in member order.
#[derive(Debug, Clone)]
pub(crate) struct Hop {
    pub(crate) head: StationId,
    pub(crate) members: Vec<HopMember>,
    pub(crate) next: StationId,
}

#[derive(Debug, Clone)]
pub(crate) struct HopMember {
    pub(crate) id: StationId,
    pub(crate) active: bool,
    pub(crate) was_last: bool,
    pub(crate) config: StationConfig,
}

/// The main chain of stations starting at GrandCentral, with each
/// parallel group hanging off its head through the parallel links.
pub(crate) struct Topology {
    entries: Vec<StationEntry>,
    tail: StationId,
}

impl Topology {
    pub(crate) fn new(max_stations: usize) -> Self {
        let mut entries: Vec<StationEntry> = (0..max_stations.max(1)).map(|_| StationEntry::unused()).collect();
        let gc = &mut entries[0];
        gc.name = GRAND_CENTRAL_NAME.to_string();
        gc.status = StationStatus::Active;
        Self {
            entries,
            tail: StationId::GRAND_CENTRAL,
        }
    }

    pub(crate) fn entry(&self, id: StationId) -> Result<&StationEntry> {
        match self.entries.get(id.index()) {
            Some(entry) if entry.status != StationStatus::Unused => Ok(entry),
            _ => Err(Error::InvalidArgument("unknown station")),
        }
    }

    pub(crate) fn entry_mut(&mut self, id: StationId) -> Result<&mut StationEntry> {
        match self.entries.get_mut(id.index()) {
            Some(entry) if entry.status != StationStatus::Unused => Ok(entry),
            _ => Err(Error::InvalidArgument("unknown station")),
        }
    }

    pub(crate) fn find(&self, name: &str) -> Option<StationId> {
        self.entries
            .iter()
            .position(|e| e.status != StationStatus::Unused && e.name == name)
            .map(|index| StationId::from_index(index as u32))
    }

    /// Ids of every station in use, GrandCentral included.
    pub(crate) fn in_use(&self) -> Vec<StationId> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.status != StationStatus::Unused)
            .map(|(index, _)| StationId::from_index(index as u32))
            .collect()
    }

    pub(crate) fn station_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.status != StationStatus::Unused)
            .count()
    }

    /// Reserves a slot for a station being created.
    pub(crate) fn allocate(&mut self, name: &str, config: StationConfig, creator: ProcessId) -> Result<StationId> {
        let index = self
            .entries
            .iter()
            .skip(1)
            .position(|e| e.status == StationStatus::Unused)
            .map(|i| i + 1)
            .ok_or(Error::TooMany("stations"))?;
        let entry = &mut self.entries[index];
        entry.name = name.to_string();
        entry.config = config;
        entry.status = StationStatus::Creating;
        entry.clear_links();
        entry.attachments.clear();
        entry.creator = Some(creator);
        Ok(StationId::from_index(index as u32))
    }

    /// Returns a slot to the unused pool. The station must be unlinked.
    pub(crate) fn release(&mut self, id: StationId) {
        if id == StationId::GRAND_CENTRAL {
            return;
        }
        if let Some(entry) = self.entries.get_mut(id.index()) {
            *entry = StationEntry::unused();
        }
    }

    pub(crate) fn insert(&mut self, id: StationId, position: Position, parallel: ParallelPosition) -> Result<()> {
        if id == StationId::GRAND_CENTRAL {
            return Err(Error::InvalidOperation("GrandCentral cannot be moved"));
        }
        let target = match position {
            Position::End => usize::MAX,
            Position::At(0) => {
                return Err(Error::InvalidArgument("position 0 is reserved for GrandCentral"))
            }
            Position::At(n) => n,
        };
        let flow = self.entry(id)?.config.flow;
        let mut previous = StationId::GRAND_CENTRAL;
        let mut counter = 1;
        loop {
            let Some(next) = self.entries[previous.index()].next else {
                self.entries[id.index()].prev = Some(previous);
                self.entries[id.index()].next = None;
                self.entries[previous.index()].next = Some(id);
                self.tail = id;
                return Ok(());
            };
            if counter == target {
                let next_flow = self.entries[next.index()].config.flow;
                if flow == FlowMode::Parallel
                    && next_flow == FlowMode::Parallel
                    && parallel != ParallelPosition::NewHead
                {
                    return self.join_group(id, next, parallel);
                }
                self.entries[id.index()].prev = Some(previous);
                self.entries[id.index()].next = Some(next);
                self.entries[next.index()].prev = Some(id);
                self.entries[previous.index()].next = Some(id);
                return Ok(());
            }
            counter += 1;
            previous = next;
        }
    }

    fn join_group(&mut self, id: StationId, head: StationId, parallel: ParallelPosition) -> Result<()> {
        self.entries[head.index()]
            .config
            .admits_parallel(&self.entries[id.index()].config)?;
        let target = match parallel {
            ParallelPosition::At(0) => {
                return Err(Error::InvalidArgument(
                    "parallel position 0 belongs to the group head",
                ))
            }
            ParallelPosition::At(n) => n,
            _ => usize::MAX,
        };
        let mut member = head;
        let mut counter = 1;
        loop {
            let after = self.entries[member.index()].next_parallel;
            if counter == target || after.is_none() {
                let entry = &mut self.entries[id.index()];
                entry.prev = None;
                entry.next = None;
                entry.prev_parallel = Some(member);
                entry.next_parallel = after;
                if let Some(after) = after {
                    self.entries[after.index()].prev_parallel = Some(id);
                }
                self.entries[member.index()].next_parallel = Some(id);
                return Ok(());
            }
            counter += 1;
            if let Some(after) = after {
                member = after;
            }
        }
    }

    /// Takes a station out of the chain. Removing a group head promotes
    /// the next member; a removed round-robin last receiver hands that
    /// mark to its predecessor.
    pub(crate) fn unlink(&mut self, id: StationId) {
        if id == StationId::GRAND_CENTRAL {
            return;
        }
        let (prev, next, prev_parallel, next_parallel, was_last) = {
            let e = &self.entries[id.index()];
            (e.prev, e.next, e.prev_parallel, e.next_parallel, e.was_last)
        };
        match (prev, prev_parallel) {
            (Some(prev), _) => {
                let replacement = next_parallel;
                if let Some(promoted) = replacement {
                    let entry = &mut self.entries[promoted.index()];
                    entry.prev = Some(prev);
                    entry.next = next;
                    entry.prev_parallel = None;
                }
                let successor = replacement.unwrap_or(prev);
                match next {
                    Some(next) => self.entries[next.index()].prev = replacement.or(Some(prev)),
                    None => {
                        if self.tail == id {
                            self.tail = successor;
                        }
                    }
                }
                self.entries[prev.index()].next = replacement.or(next);
            }
            (None, Some(prev_parallel)) => {
                if let Some(after) = next_parallel {
                    self.entries[after.index()].prev_parallel = Some(prev_parallel);
                }
                let before = &mut self.entries[prev_parallel.index()];
                before.next_parallel = next_parallel;
                if was_last {
                    before.was_last = true;
                }
            }
            (None, None) => {}
        }
        self.entries[id.index()].clear_links();
    }

    /// Head of the group `id` belongs to; `id` itself when it is in the
    /// main chain.
    pub(crate) fn group_head(&self, id: StationId) -> StationId {
        let mut current = id;
        let mut steps = 0;
        while let Some(prev) = self.entries[current.index()].prev_parallel {
            current = prev;
            steps += 1;
            if steps > self.entries.len() {
                break;
            }
        }
        current
    }

    /// First downstream position after the one `id` occupies.
    pub(crate) fn next_after(&self, id: StationId) -> StationId {
        let head = self.group_head(id);
        self.entries[head.index()]
            .next
            .unwrap_or(StationId::GRAND_CENTRAL)
    }

    /// The main-chain station upstream of the position `id` occupies.
    pub(crate) fn previous_of(&self, id: StationId) -> StationId {
        let head = self.group_head(id);
        self.entries[head.index()]
            .prev
            .unwrap_or(StationId::GRAND_CENTRAL)
    }

    /// Member ids of the group headed by `head`, head first.
    pub(crate) fn group(&self, head: StationId) -> Vec<StationId> {
        let mut members = vec![head];
        let mut current = self.entries[head.index()].next_parallel;
        while let Some(member) = current {
            if members.len() > self.entries.len() {
                break;
            }
            members.push(member);
            current = self.entries[member.index()].next_parallel;
        }
        members
    }

    pub(crate) fn hop(&self, head: StationId) -> Hop {
        let members = self
            .group(head)
            .into_iter()
            .map(|id| {
                let entry = &self.entries[id.index()];
                HopMember {
                    id,
                    active: entry.status == StationStatus::Active,
                    was_last: entry.was_last,
                    config: entry.config.clone(),
                }
            })
            .collect();
        Hop {
            head,
            members,
            next: self.entries[head.index()]
                .next
                .unwrap_or(StationId::GRAND_CENTRAL),
        }
    }

    /// Moves the round-robin last-receiver mark within a group.
    pub(crate) fn mark_last(&mut self, head: StationId, last: StationId) {
        for member in self.group(head) {
            self.entries[member.index()].was_last = member == last;
        }
    }

    /// (position, parallel position) of a linked station.
    pub(crate) fn position_of(&self, id: StationId) -> Option<(usize, usize)> {
        if id == StationId::GRAND_CENTRAL {
            return Some((0, 0));
        }
        let mut position = 1;
        let mut current = self.entries[0].next;
        while let Some(head) = current {
            if let Some(offset) = self.group(head).iter().position(|&m| m == id) {
                return Some((position, offset));
            }
            position += 1;
            if position > self.entries.len() {
                return None;
            }
            current = self.entries[head.index()].next;
        }
        None
    }

    /// Stations in the main chain, GrandCentral first.
    pub(crate) fn main_chain(&self) -> Vec<StationId> {
        let mut chain = vec![StationId::GRAND_CENTRAL];
        let mut current = self.entries[0].next;
        while let Some(head) = current {
            if chain.contains(&head) {
                break;
            }
            chain.push(head);
            current = self.entries[head.index()].next;
        }
        chain
    }

    /// Every station reachable from GrandCentral through forward links.
    pub(crate) fn reachable(&self) -> BTreeSet<StationId> {
        self.main_chain()
            .into_iter()
            .flat_map(|head| self.group(head))
            .collect()
    }

    /// Rebuilds every back link and the tail from the forward links, cutting
    /// any forward link that loops back into the chain.
    pub(crate) fn repair(&mut self) {
        let mut seen = BTreeSet::new();
        seen.insert(StationId::GRAND_CENTRAL);
        self.entries[0].prev = None;
        let mut previous = StationId::GRAND_CENTRAL;
        while let Some(head) = self.entries[previous.index()].next {
            if !seen.insert(head) || self.entries[head.index()].status == StationStatus::Unused {
                self.entries[previous.index()].next = None;
                break;
            }
            let entry = &mut self.entries[head.index()];
            entry.prev = Some(previous);
            entry.prev_parallel = None;
            let mut before = head;
            while let Some(member) = self.entries[before.index()].next_parallel {
                if !seen.insert(member) || self.entries[member.index()].status == StationStatus::Unused {
                    self.entries[before.index()].next_parallel = None;
                    break;
                }
                let entry = &mut self.entries[member.index()];
                entry.prev_parallel = Some(before);
                entry.prev = None;
                entry.next = None;
                before = member;
            }
            previous = head;
        }
        self.tail = previous;
    }

    #[cfg(test)]
    pub(crate) fn tail(&self) -> StationId {
        self.tail
    }
}
