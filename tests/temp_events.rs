mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{assert_conserved, config, grand_central_holds, input_holds, wait_until};
use etbroker::{Error, EtSystem, StationConfig, StationId, WaitMode};

fn temps(system: &EtSystem) -> usize {
    system.system_stats().map(|s| s.temps).unwrap_or(usize::MAX)
}

#[test]
fn oversize_events_travel_in_temp_buffers() -> etbroker::Result<()> {
    let system = EtSystem::create(config(4, 32))?;
    let producer = system.open_privileged_process("producer")?;
    let consumer = system.open_process("consumer")?;
    let s = producer.create_station("s", &StationConfig::default())?;
    let c = consumer.attach(s)?;
    let p = producer.attach(StationId::GRAND_CENTRAL)?;

    let ids = producer.new_events(p, WaitMode::Async, 100, 2)?;
    let body: Vec<u8> = (0..100u8).collect();
    for &id in &ids {
        let mut event = producer.event(p, id)?;
        assert!(event.is_temp());
        assert_eq!(event.capacity(), 100);
        event.write_payload(&body)?;
    }
    assert_eq!(temps(&system), 2);
    producer.put_events(p, &ids)?;

    assert!(input_holds(&system, s, 2));
    let got = consumer.get_events(c, WaitMode::Async, 2)?;
    for &id in &got {
        assert_eq!(consumer.event(c, id)?.payload(), &body[..]);
    }
    consumer.put_events(c, &got)?;

    // GrandCentral frees the buffers as it takes the events back.
    assert!(grand_central_holds(&system, 4));
    assert!(wait_until(Duration::from_secs(1), || temps(&system) == 0));
    let ids = producer.new_events(p, WaitMode::Async, 16, 4)?;
    for &id in &ids {
        let event = producer.event(p, id)?;
        assert!(!event.is_temp());
        assert_eq!(event.capacity(), 32);
    }
    assert_conserved(&system)?;
    Ok(())
}

#[test]
fn exhausted_temp_quota_fails_after_retry_budget() -> etbroker::Result<()> {
    let mut config = config(4, 32);
    config.max_temps = 2;
    config.temp_retry_budget = Duration::from_millis(50);
    let system = EtSystem::create(config)?;
    let producer = system.open_privileged_process("producer")?;
    let p = producer.attach(StationId::GRAND_CENTRAL)?;

    let held = producer.new_events(p, WaitMode::Async, 64, 2)?;
    assert!(matches!(
        producer.new_events(p, WaitMode::Async, 64, 1),
        Err(Error::TooMany(_))
    ));
    // The slot taken for the failed request went back.
    assert!(grand_central_holds(&system, 2));
    assert_eq!(temps(&system), 2);

    producer.dump_events(p, &held)?;
    assert_eq!(temps(&system), 0);
    assert_eq!(producer.new_events(p, WaitMode::Async, 64, 2)?.len(), 2);
    assert_conserved(&system)?;
    Ok(())
}

#[test]
fn temp_request_waits_for_a_buffer_to_be_released() -> etbroker::Result<()> {
    let mut config = config(4, 32);
    config.max_temps = 1;
    config.temp_retry_budget = Duration::from_secs(5);
    let system = EtSystem::create(config)?;
    let producer = Arc::new(system.open_privileged_process("producer")?);
    let p = producer.attach(StationId::GRAND_CENTRAL)?;

    let held = producer.new_events(p, WaitMode::Async, 64, 1)?;
    let releaser = {
        let producer = Arc::clone(&producer);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            producer.dump_events(p, &held)
        })
    };
    let ids = producer.new_events(p, WaitMode::Async, 64, 1)?;
    releaser.join().expect("releaser thread")?;
    assert_eq!(ids.len(), 1);
    assert!(producer.event(p, ids[0])?.is_temp());
    assert_eq!(temps(&system), 1);
    Ok(())
}
