mod common;

use std::fs;

use common::{config, grand_central_holds, input_holds, produce};
use etbroker::{
    Error, EtSystem, ParallelPosition, Position, SelectMode, Selector, StationConfig, StationId, StationStatus,
    SystemConfig, UserMode, WaitMode,
};
use tempfile::tempdir;

#[test]
fn creating_a_station_twice_is_idempotent_only_for_the_same_definition() -> etbroker::Result<()> {
    let system = EtSystem::create(config(4, 32))?;
    let a = system.open_process("a")?;
    let b = system.open_process("b")?;
    let config = StationConfig::default().with_prescale(3);

    let first = a.create_station("shared", &config)?;
    assert_eq!(b.create_station("shared", &config)?, first);
    assert!(matches!(
        b.create_station("shared", &StationConfig::default()),
        Err(Error::DuplicateName(name)) if name == "shared"
    ));
    assert!(matches!(
        a.create_station(&"x".repeat(200), &config),
        Err(Error::InvalidArgument(_))
    ));
    a.create_station("other", &config)?;
    assert!(matches!(
        a.create_station_at("nope", &config, Position::At(0), ParallelPosition::End),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(system.system_stats()?.stations, 3);
    Ok(())
}

#[test]
fn station_with_attachments_cannot_be_removed() -> etbroker::Result<()> {
    let system = EtSystem::create(config(6, 32))?;
    let producer = system.open_privileged_process("producer")?;
    let s = producer.create_station("s", &StationConfig::default())?;
    let c = producer.attach(s)?;
    assert!(matches!(producer.remove_station(s), Err(Error::InvalidOperation(_))));
    assert!(matches!(
        producer.remove_station(StationId::GRAND_CENTRAL),
        Err(Error::InvalidOperation(_))
    ));

    producer.detach(c)?;
    producer.remove_station(s)?;
    assert!(producer.station_id("s").is_err());
    assert!(grand_central_holds(&system, 6));
    // The freed slot is reused for the next station.
    let again = producer.create_station("t", &StationConfig::default())?;
    assert_eq!(again, s);
    assert_eq!(system.station_stats(again)?.input.tried, 0);
    Ok(())
}

#[test]
fn positions_follow_insertions_and_moves() -> etbroker::Result<()> {
    let system = EtSystem::create(config(4, 32))?;
    let process = system.open_process("p")?;
    let plain = StationConfig::default();
    let a = process.create_station("a", &plain)?;
    let b = process.create_station("b", &plain)?;
    let c = process.create_station_at("c", &plain, Position::At(1), ParallelPosition::End)?;

    assert_eq!(process.station_position(StationId::GRAND_CENTRAL)?, (0, 0));
    assert_eq!(process.station_position(c)?, (1, 0));
    assert_eq!(process.station_position(a)?, (2, 0));
    assert_eq!(process.station_position(b)?, (3, 0));

    process.set_station_position(c, Position::End, ParallelPosition::End)?;
    assert_eq!(process.station_position(a)?, (1, 0));
    assert_eq!(process.station_position(c)?, (3, 0));
    assert!(matches!(
        process.set_station_position(StationId::GRAND_CENTRAL, Position::At(2), ParallelPosition::End),
        Err(Error::InvalidOperation(_))
    ));

    let group = process.create_station("g0", &StationConfig::parallel())?;
    let member =
        process.create_station_at("g1", &StationConfig::parallel(), Position::At(4), ParallelPosition::End)?;
    assert_eq!(process.station_position(member)?, (4, 1));

    // A round-robin station cannot join a filtering group; a failed move
    // leaves it where it was.
    let rr = StationConfig::parallel().with_select_mode(SelectMode::RoundRobin);
    let dealer = process.create_station("rr", &rr)?;
    assert_eq!(process.station_position(dealer)?, (5, 0));
    assert!(matches!(
        process.set_station_position(dealer, Position::At(4), ParallelPosition::End),
        Err(Error::InvalidConfig(_))
    ));
    assert_eq!(process.station_position(dealer)?, (5, 0));
    assert_eq!(process.station_position(group)?, (4, 0));

    let names: Vec<String> = system.stations()?.into_iter().map(|s| s.name).collect();
    assert_eq!(names.len(), 7);
    Ok(())
}

#[test]
fn user_cap_limits_attachments() -> etbroker::Result<()> {
    let system = EtSystem::create(config(4, 32))?;
    let process = system.open_process("p")?;
    let single = process.create_station("single", &StationConfig::default().with_user(UserMode::Max(1)))?;
    let att = process.attach(single)?;
    assert!(matches!(process.attach(single), Err(Error::TooMany(_))));
    process.detach(att)?;
    process.attach(single)?;
    assert!(matches!(
        process.create_station("bad", &StationConfig::default().with_user(UserMode::Max(0))),
        Err(Error::InvalidConfig(_))
    ));
    Ok(())
}

#[test]
fn nonblocking_station_caps_its_input_at_cue() -> etbroker::Result<()> {
    let system = EtSystem::create(config(10, 32))?;
    let producer = system.open_privileged_process("producer")?;
    let consumer = system.open_process("consumer")?;
    let sampler = StationConfig::default().with_block(etbroker::BlockMode::NonBlocking, 3);
    let s = producer.create_station("sampler", &sampler)?;
    consumer.attach(s)?;
    let p = producer.attach(StationId::GRAND_CENTRAL)?;

    let ids = produce(&producer, p, &[[0; 6]; 8], 0)?;
    producer.put_events(p, &ids)?;
    assert!(input_holds(&system, s, 3));
    assert!(grand_central_holds(&system, 7));
    Ok(())
}

#[test]
fn prescale_takes_every_nth_event() -> etbroker::Result<()> {
    let system = EtSystem::create(config(10, 32))?;
    let producer = system.open_privileged_process("producer")?;
    let consumer = system.open_process("consumer")?;
    let s = producer.create_station("thin", &StationConfig::default().with_prescale(3))?;
    let c = consumer.attach(s)?;
    let p = producer.attach(StationId::GRAND_CENTRAL)?;

    let ids = produce(&producer, p, &[[0; 6]; 7], 0)?;
    producer.put_events(p, &ids)?;
    assert!(input_holds(&system, s, 3));
    let got = consumer.get_events(c, WaitMode::Async, 5)?;
    let seqs: Vec<u32> = got
        .iter()
        .map(|&id| common::sequence(&consumer, c, id))
        .collect::<etbroker::Result<_>>()?;
    assert_eq!(seqs, vec![0, 3, 6]);
    assert_eq!(system.station_stats(s)?.input.tried, 7);
    Ok(())
}

#[test]
fn select_words_and_selectors_can_change_while_running() -> etbroker::Result<()> {
    let system = EtSystem::create(config(10, 32))?;
    let producer = system.open_privileged_process("producer")?;
    let consumer = system.open_process("consumer")?;
    let s = producer.create_station("pick", &StationConfig::matching([1, -1, -1, -1, -1, -1]))?;
    consumer.attach(s)?;
    let p = producer.attach(StationId::GRAND_CENTRAL)?;

    producer.set_select_words(s, [2, -1, -1, -1, -1, -1])?;
    let ids = produce(&producer, p, &[[1, 0, 0, 0, 0, 0], [2, 0, 0, 0, 0, 0]], 0)?;
    producer.put_events(p, &ids)?;
    assert!(input_holds(&system, s, 1));

    producer.set_selector(s, Selector::new(|_, event| event.control()[1] == 42))?;
    let ids = produce(&producer, p, &[[0, 42, 0, 0, 0, 0], [0, 41, 0, 0, 0, 0]], 2)?;
    producer.put_events(p, &ids)?;
    assert!(input_holds(&system, s, 2));

    assert!(matches!(
        producer.set_select_words(StationId::GRAND_CENTRAL, [0; 6]),
        Err(Error::InvalidOperation(_))
    ));
    Ok(())
}

#[test]
fn failed_routing_returns_the_batch_to_grand_central() -> etbroker::Result<()> {
    let system = EtSystem::create(config(10, 32))?;
    let producer = system.open_privileged_process("producer")?;
    let consumer = system.open_process("consumer")?;
    let faulty = Selector::new(|_, event| {
        if event.control()[0] == 9 {
            panic!("selector cannot handle 9");
        }
        true
    });
    let s = producer.create_station("faulty", &StationConfig::default().with_selector(faulty))?;
    let c = consumer.attach(s)?;
    let p = producer.attach(StationId::GRAND_CENTRAL)?;

    let ids = produce(&producer, p, &[[1, 0, 0, 0, 0, 0], [9, 0, 0, 0, 0, 0], [1, 0, 0, 0, 0, 0]], 0)?;
    producer.put_events(p, &ids)?;
    assert!(grand_central_holds(&system, 10));
    assert_eq!(system.station_stats(s)?.input.count, 0);
    common::assert_conserved(&system)?;

    // The conductor survives and keeps routing.
    let ids = produce(&producer, p, &[[1, 0, 0, 0, 0, 0]; 2], 3)?;
    producer.put_events(p, &ids)?;
    assert!(input_holds(&system, s, 2));
    assert_eq!(consumer.get_events(c, WaitMode::Async, 5)?.len(), 2);
    Ok(())
}

#[test]
fn file_backed_pool_writes_payloads_to_the_segment() -> etbroker::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("events.seg");
    let mut config = config(4, 32);
    config.segment_path = Some(path.clone());
    let system = EtSystem::create(config)?;
    assert_eq!(fs::metadata(&path)?.len(), 4 * 32);

    let producer = system.open_privileged_process("producer")?;
    let p = producer.attach(StationId::GRAND_CENTRAL)?;
    let ids = producer.new_events(p, WaitMode::Async, 32, 1)?;
    producer.event(p, ids[0])?.write_payload(b"persisted-marker")?;
    let contents = fs::read(&path)?;
    assert!(contents.windows(16).any(|w| w == b"persisted-marker"));
    Ok(())
}

#[test]
fn system_config_loads_from_json() -> etbroker::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("system.json");
    fs::write(
        &path,
        r#"{
            "name": "from-json",
            "events": 12,
            "event_size": 48,
            "groups": [4, 8],
            "heartbeat_interval": 20,
            "monitor_interval": 3600000
        }"#,
    )?;
    let config = SystemConfig::from_json_file(&path)?;
    assert_eq!(config.name, "from-json");
    assert_eq!(config.group_sizes(), vec![4, 8]);

    let system = EtSystem::create(config)?;
    let stats = system.system_stats()?;
    assert_eq!((stats.events, stats.event_size, stats.groups), (12, 48, 2));
    assert_eq!(system.station_stats(StationId::GRAND_CENTRAL)?.status, StationStatus::Active);

    fs::write(&path, r#"{"events": 12, "groups": [4, 4]}"#)?;
    assert!(matches!(SystemConfig::from_json_file(&path), Err(Error::InvalidConfig(_))));
    Ok(())
}
