mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{config, input_holds, wait_until};
use etbroker::{
    BlockMode, Error, EtSystem, GatewayConfig, RemoteSystem, StationConfig, StationId, StationStatus,
    SystemConfig, WaitMode, GRAND_CENTRAL_NAME,
};

fn served(events: usize, size: usize) -> SystemConfig {
    let mut config = config(events, size);
    config.name = "remote-test".to_string();
    config.gateway = Some(GatewayConfig {
        poll_interval: Duration::from_millis(20),
        ..GatewayConfig::loopback()
    });
    config
}

fn connect(system: &EtSystem, name: &str) -> etbroker::Result<RemoteSystem> {
    let addr = system
        .gateway_addr()
        .ok_or(Error::InvalidOperation("gateway not running"))?;
    RemoteSystem::connect(addr, name)
}

#[test]
fn remote_producer_feeds_local_consumer() -> etbroker::Result<()> {
    let system = EtSystem::create(served(8, 64))?;
    let remote = connect(&system, "remote-producer")?;
    let info = remote.info();
    assert_eq!(info.system, "remote-test");
    assert_eq!((info.events, info.event_size, info.groups), (8, 64, 1));

    let filter = StationConfig::matching([3, -1, -1, -1, -1, -1]).with_block(BlockMode::Blocking, 4);
    let s = remote.create_station("filter", &filter)?;
    assert_eq!(system.station_id("filter")?, s);
    assert_eq!(remote.station_id("filter")?, s);

    let consumer = system.open_process("consumer")?;
    let c = consumer.attach(s)?;
    let p = remote.attach(StationId::GRAND_CENTRAL)?;

    let mut events = remote.new_events(p, WaitMode::Async, 16, 3)?;
    assert_eq!(events.len(), 3);
    for (n, event) in events.iter_mut().enumerate() {
        event.data = format!("remote-{n}").into_bytes();
        event.control[0] = if n == 1 { 9 } else { 3 };
    }
    remote.put_events(p, &events)?;

    assert!(input_holds(&system, s, 2));
    let got = consumer.get_events(c, WaitMode::Async, 4)?;
    let bodies: Vec<Vec<u8>> = got
        .iter()
        .map(|&id| consumer.event(c, id).map(|e| e.payload().to_vec()))
        .collect::<etbroker::Result<_>>()?;
    assert_eq!(bodies, vec![b"remote-0".to_vec(), b"remote-2".to_vec()]);
    consumer.put_events(c, &got)?;

    let stats = system.attachment_stats(p)?;
    assert_eq!((stats.made, stats.put), (3, 3));
    Ok(())
}

#[test]
fn remote_consumer_reads_what_local_producer_wrote() -> etbroker::Result<()> {
    let system = EtSystem::create(served(8, 64))?;
    let producer = system.open_privileged_process("producer")?;
    let s = producer.create_station("s", &StationConfig::default())?;
    let remote = connect(&system, "remote-consumer")?;
    let c = remote.attach(s)?;
    let p = producer.attach(StationId::GRAND_CENTRAL)?;

    let ids = producer.new_events(p, WaitMode::Async, 16, 2)?;
    for &id in &ids {
        producer.event(p, id)?.write_payload(b"local")?;
    }
    producer.put_events(p, &ids)?;

    let mut got = remote.get_events(c, WaitMode::Timed(Duration::from_secs(2)), 8)?;
    assert_eq!(got.len(), 2);
    for event in &got {
        assert_eq!(event.data, b"local");
        assert!(!event.needs_swap());
    }
    // Rewrite one event in place on its way downstream.
    got[0].data = b"changed".to_vec();
    remote.put_events(c, &got)?;
    assert!(common::grand_central_holds(&system, 8));
    Ok(())
}

#[test]
fn remote_errors_map_to_local_variants() -> etbroker::Result<()> {
    let system = EtSystem::create(served(4, 32))?;
    let remote = connect(&system, "remote")?;
    let p = remote.attach(StationId::GRAND_CENTRAL)?;

    assert!(matches!(remote.get_events(p, WaitMode::Async, 1), Err(Error::InvalidOperation(_))));
    assert!(matches!(remote.station_id("missing"), Err(Error::InvalidArgument(_))));

    remote.create_station("s", &StationConfig::default())?;
    let other = StationConfig::default().with_prescale(2);
    assert!(matches!(
        remote.create_station("s", &other),
        Err(Error::DuplicateName(name)) if name == "s"
    ));

    let mut events = remote.new_events(p, WaitMode::Async, 8, 1)?;
    events[0].data = vec![0; 33];
    assert!(matches!(
        remote.put_events(p, &events),
        Err(Error::LengthTooLarge { len: 33, capacity: 32 })
    ));
    remote.dump_events(p, &events)?;
    Ok(())
}

#[test]
fn rejected_remote_put_leaves_every_event_untouched() -> etbroker::Result<()> {
    let system = EtSystem::create(served(4, 32))?;
    let remote = connect(&system, "remote")?;
    let p = remote.attach(StationId::GRAND_CENTRAL)?;

    let mut events = remote.new_events(p, WaitMode::Async, 8, 2)?;
    events[0].data = b"changed".to_vec();
    events[0].control[0] = 5;
    // Lie about the capacity so the oversize payload reaches the gateway.
    events[1].capacity = 64;
    events[1].data = vec![1; 40];
    assert!(matches!(
        remote.put_events(p, &events),
        Err(Error::LengthTooLarge { len: 40, capacity: 32 })
    ));

    let first = system.event_info(events[0].id)?;
    assert_eq!(first.control, [0; 6]);
    assert_eq!(first.length, 8);
    let second = system.event_info(events[1].id)?;
    assert_eq!(second.length, 8);
    assert_eq!(system.attachment_stats(p)?.put, 0);

    let mut twice = events[0].clone();
    twice.data = b"again".to_vec();
    assert!(matches!(
        remote.put_events(p, &[events[0].clone(), twice]),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(system.event_info(events[0].id)?.length, 8);
    remote.dump_events(p, &events)?;
    assert!(common::grand_central_holds(&system, 4));
    Ok(())
}

#[test]
fn gateway_reports_stations_and_stats() -> etbroker::Result<()> {
    let system = EtSystem::create(served(6, 32))?;
    let local = system.open_process("local")?;
    let s = local.create_station("watch", &StationConfig::default())?;
    local.attach(s)?;

    let remote = connect(&system, "monitor")?;
    let stats = remote.system_stats()?;
    assert_eq!((stats.events, stats.event_size), (6, 32));
    assert_eq!(stats.processes, 2);
    assert_eq!(stats.stations, 2);

    let stations = remote.stations()?;
    assert_eq!(stations.len(), 2);
    assert_eq!(stations[0].name, GRAND_CENTRAL_NAME);
    assert_eq!(stations[0].input, 6);
    assert_eq!(stations[1].name, "watch");
    assert_eq!(stations[1].status, StationStatus::Active);
    assert_eq!(stations[1].attachments, 1);
    Ok(())
}

#[test]
fn closing_remote_handle_detaches_its_attachments() -> etbroker::Result<()> {
    let system = EtSystem::create(served(4, 32))?;
    let remote = connect(&system, "remote")?;
    let p = remote.attach(StationId::GRAND_CENTRAL)?;
    remote.new_events(p, WaitMode::Async, 8, 3)?;
    assert_eq!(system.system_stats()?.attachments, 1);

    remote.close()?;
    assert!(wait_until(Duration::from_secs(2), || {
        system
            .system_stats()
            .map(|s| s.processes == 0 && s.attachments == 0)
            .unwrap_or(false)
    }));
    assert!(common::grand_central_holds(&system, 4));
    assert!(matches!(remote.attach(StationId::GRAND_CENTRAL), Err(Error::Closed)));
    Ok(())
}

#[test]
fn remote_sleep_is_interrupted_by_wakeup() -> etbroker::Result<()> {
    let system = EtSystem::create(served(4, 32))?;
    let owner = system.open_process("owner")?;
    let s = owner.create_station("s", &StationConfig::default())?;
    let remote = Arc::new(connect(&system, "sleeper")?);
    let c = remote.attach(s)?;

    let sleeper = {
        let remote = Arc::clone(&remote);
        thread::spawn(move || remote.get_events(c, WaitMode::Sleep, 1))
    };
    // The gateway waits in slices, so keep poking until the call returns.
    let woke = wait_until(Duration::from_secs(3), || {
        owner.wakeup_all(s).is_ok() && sleeper.is_finished()
    });
    assert!(woke);
    assert!(matches!(sleeper.join().expect("sleeper thread"), Err(Error::Wakeup)));
    Ok(())
}
