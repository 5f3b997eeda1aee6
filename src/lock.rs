use std::fmt;
use std::sync::{Condvar, Mutex};

use crate::registry::ProcessId;
use crate::station::StationId;
use crate::Result;

/// Identity recorded by an [`OwnedLock`] while it is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum LockOwner {
    System,
    Process(ProcessId),
    Conductor(StationId),
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockOwner::System => f.write_str("system"),
            LockOwner::Process(id) => write!(f, "process {}", id.raw()),
            LockOwner::Conductor(id) => write!(f, "conductor {}", id.raw()),
        }
    }
}

struct Token {
    holder: Option<LockOwner>,
    generation: u64,
}

/// Lock that records who holds it, so the heartbeat monitor can release
/// a lock left behind by a dead process.
pub(crate) struct OwnedLock {
    name: &'static str,
    token: Mutex<Token>,
    released: Condvar,
}

impl OwnedLock {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            token: Mutex::new(Token {
                holder: None,
                generation: 0,
            }),
            released: Condvar::new(),
        }
    }

    pub(crate) fn acquire(&self, owner: LockOwner) -> Result<OwnedGuard<'_>> {
        let mut token = self.token.lock()?;
        while token.holder.is_some() {
            token = self.released.wait(token)?;
        }
        token.holder = Some(owner);
        token.generation += 1;
        Ok(OwnedGuard {
            lock: self,
            generation: token.generation,
        })
    }

    #[cfg(test)]
    pub(crate) fn holder(&self) -> Result<Option<LockOwner>> {
        Ok(self.token.lock()?.holder)
    }

    /// Releases the lock if `owner` holds it. Any guard still alive for
    /// that hold becomes inert.
    pub(crate) fn revoke(&self, owner: LockOwner) -> Result<bool> {
        let mut token = self.token.lock()?;
        if token.holder != Some(owner) {
            return Ok(false);
        }
        token.holder = None;
        token.generation += 1;
        drop(token);
        self.released.notify_all();
        log::warn!("released {} lock held by dead {owner}", self.name);
        Ok(true)
    }

    fn release(&self, generation: u64) {
        let Ok(mut token) = self.token.lock() else {
            return;
        };
        if token.generation != generation {
            return;
        }
        token.holder = None;
        drop(token);
        self.released.notify_all();
    }
}

pub(crate) struct OwnedGuard<'a> {
    lock: &'a OwnedLock,
    generation: u64,
}

impl Drop for OwnedGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(self.generation);
    }
}
