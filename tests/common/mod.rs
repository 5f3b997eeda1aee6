#![allow(dead_code)]

use std::thread;
use std::time::{Duration, Instant};

use etbroker::{AttachmentId, EtSystem, EventId, ProcessHandle, Result, StationId, SystemConfig, WaitMode};

/// Small pool with a fast heartbeat. The background monitor is pushed far
/// out so tests drive heartbeat scans themselves.
pub fn config(events: usize, size: usize) -> SystemConfig {
    let mut config = SystemConfig::new(events, size);
    config.heartbeat_interval = Duration::from_millis(10);
    config.monitor_interval = Duration::from_secs(3600);
    config.remove_drain_timeout = Duration::from_millis(200);
    config
}

pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Waits until GrandCentral's input holds `count` events.
pub fn grand_central_holds(system: &EtSystem, count: usize) -> bool {
    wait_until(Duration::from_secs(2), || {
        system
            .station_stats(StationId::GRAND_CENTRAL)
            .map(|stats| stats.input.count == count)
            .unwrap_or(false)
    })
}

pub fn input_holds(system: &EtSystem, station: StationId, count: usize) -> bool {
    wait_until(Duration::from_secs(2), || {
        system
            .station_stats(station)
            .map(|stats| stats.input.count == count)
            .unwrap_or(false)
    })
}

/// Takes one fresh event per control entry and stamps each with its
/// control words and a payload naming its sequence number. `new` may hand
/// out fewer than asked, so keep asking until the batch is complete.
pub fn produce(
    process: &ProcessHandle,
    att: AttachmentId,
    controls: &[[i32; 6]],
    first_seq: u32,
) -> Result<Vec<EventId>> {
    let mut ids = Vec::with_capacity(controls.len());
    while ids.len() < controls.len() {
        let wanted = controls.len() - ids.len();
        ids.extend(process.new_events(att, WaitMode::Timed(Duration::from_secs(1)), 16, wanted)?);
    }
    for (offset, (&id, control)) in ids.iter().zip(controls).enumerate() {
        let mut event = process.event(att, id)?;
        event.write_payload(&(first_seq + offset as u32).to_le_bytes())?;
        event.set_control(control)?;
    }
    Ok(ids)
}

pub fn sequence(process: &ProcessHandle, att: AttachmentId, id: EventId) -> Result<u32> {
    let event = process.event(att, id)?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&event.payload()[..4]);
    Ok(u32::from_le_bytes(raw))
}

/// At quiescence every event is either listed or owned by an attachment.
/// Events a conductor is moving are in neither, so give it a moment.
pub fn assert_conserved(system: &EtSystem) -> Result<()> {
    let total = system.config().events;
    wait_until(Duration::from_secs(2), || {
        system
            .census()
            .map(|census| census.listed + census.owned == total)
            .unwrap_or(false)
    });
    let census = system.census()?;
    assert_eq!(census.listed + census.owned, total, "{census:?}");
    assert!(census.temps <= system.config().max_temps);
    Ok(())
}
