mod common;

use std::time::Duration;

use common::{assert_conserved, config, grand_central_holds, input_holds, produce, wait_until};
use etbroker::{
    Error, EtSystem, ParallelPosition, Position, SelectMode, StationConfig, StationId, WaitMode,
};

fn input_counts(system: &EtSystem, ids: &[StationId]) -> Vec<usize> {
    ids.iter()
        .map(|&id| system.station_stats(id).map(|s| s.input.count).unwrap_or(usize::MAX))
        .collect()
}

fn settle(system: &EtSystem, ids: &[StationId], total: usize) -> Vec<usize> {
    wait_until(Duration::from_secs(2), || {
        input_counts(system, ids).iter().sum::<usize>() == total
    });
    input_counts(system, ids)
}

#[test]
fn round_robin_deals_evenly_and_continues_after_last_receiver() -> etbroker::Result<()> {
    let system = EtSystem::create(config(30, 32))?;
    let producer = system.open_privileged_process("producer")?;
    let workers = system.open_process("workers")?;
    let rr = StationConfig::parallel().with_select_mode(SelectMode::RoundRobin);

    let first = producer.create_station("rr0", &rr)?;
    let members = vec![
        first,
        producer.create_station_at("rr1", &rr, Position::At(1), ParallelPosition::End)?,
        producer.create_station_at("rr2", &rr, Position::At(1), ParallelPosition::End)?,
    ];
    assert_eq!(producer.station_position(members[2])?, (1, 2));
    for &member in &members {
        workers.attach(member)?;
    }
    let p = producer.attach(StationId::GRAND_CENTRAL)?;

    let ids = produce(&producer, p, &[[0; 6]; 9], 0)?;
    producer.put_events(p, &ids)?;
    assert_eq!(settle(&system, &members, 9), vec![3, 3, 3]);

    // rr2 took the final event, so the next round starts at rr0.
    let ids = produce(&producer, p, &[[0; 6]; 2], 9)?;
    producer.put_events(p, &ids)?;
    assert_eq!(settle(&system, &members, 11), vec![4, 4, 3]);

    let ids = produce(&producer, p, &[[0; 6]; 1], 11)?;
    producer.put_events(p, &ids)?;
    assert_eq!(settle(&system, &members, 12), vec![4, 4, 4]);
    assert_conserved(&system)?;
    Ok(())
}

#[test]
fn round_robin_skips_idle_members() -> etbroker::Result<()> {
    let system = EtSystem::create(config(20, 32))?;
    let producer = system.open_privileged_process("producer")?;
    let workers = system.open_process("workers")?;
    let rr = StationConfig::parallel().with_select_mode(SelectMode::RoundRobin);
    let members = vec![
        producer.create_station("rr0", &rr)?,
        producer.create_station_at("rr1", &rr, Position::At(1), ParallelPosition::End)?,
        producer.create_station_at("rr2", &rr, Position::At(1), ParallelPosition::End)?,
    ];
    workers.attach(members[0])?;
    workers.attach(members[2])?;
    let p = producer.attach(StationId::GRAND_CENTRAL)?;

    let ids = produce(&producer, p, &[[0; 6]; 6], 0)?;
    producer.put_events(p, &ids)?;
    assert_eq!(settle(&system, &members, 6), vec![3, 0, 3]);
    Ok(())
}

#[test]
fn equal_cue_levels_member_queues() -> etbroker::Result<()> {
    let system = EtSystem::create(config(40, 32))?;
    let producer = system.open_privileged_process("producer")?;
    let workers = system.open_process("workers")?;
    let eq = StationConfig::parallel().with_select_mode(SelectMode::EqualCue);
    let members = vec![
        producer.create_station("eq0", &eq)?,
        producer.create_station_at("eq1", &eq, Position::At(1), ParallelPosition::End)?,
        producer.create_station_at("eq2", &eq, Position::At(1), ParallelPosition::End)?,
    ];
    let atts = members
        .iter()
        .map(|&m| workers.attach(m))
        .collect::<etbroker::Result<Vec<_>>>()?;
    let p = producer.attach(StationId::GRAND_CENTRAL)?;

    let ids = produce(&producer, p, &[[0; 6]; 9], 0)?;
    producer.put_events(p, &ids)?;
    assert_eq!(settle(&system, &members, 9), vec![3, 3, 3]);

    // Drain eq1 entirely; the next batch should refill it first.
    let taken = workers.get_events(atts[1], WaitMode::Async, 10)?;
    assert_eq!(taken.len(), 3);
    let ids = produce(&producer, p, &[[0; 6]; 5], 9)?;
    producer.put_events(p, &ids)?;
    let depths = settle(&system, &members, 11);
    assert_eq!(depths[1], 4);
    assert_eq!(depths[0] + depths[2], 7);
    let spread = depths.iter().max().copied().unwrap_or(0) - depths.iter().min().copied().unwrap_or(0);
    assert!(spread <= 1, "{depths:?}");

    // A batch too small to level everyone only feeds the shallowest.
    let taken = workers.get_events(atts[0], WaitMode::Async, 10)?;
    assert!(!taken.is_empty());
    let shallow = system.station_stats(members[0])?.input.count;
    assert_eq!(shallow, 0);
    let ids = produce(&producer, p, &[[0; 6]; 2], 14)?;
    producer.put_events(p, &ids)?;
    let before = depths;
    let after = settle(&system, &members, before[1] + before[2] + 2);
    assert_eq!(after[0], 2);
    assert_eq!((after[1], after[2]), (before[1], before[2]));
    Ok(())
}

#[test]
fn filtering_group_offers_to_members_in_turn() -> etbroker::Result<()> {
    let system = EtSystem::create(config(10, 32))?;
    let producer = system.open_privileged_process("producer")?;
    let workers = system.open_process("workers")?;
    let evens = StationConfig {
        select_mode: SelectMode::Match,
        select: [0, -1, -1, -1, -1, -1],
        ..StationConfig::parallel()
    };
    let ones = StationConfig {
        select: [1, -1, -1, -1, -1, -1],
        ..evens.clone()
    };
    let a = producer.create_station("zero", &evens)?;
    let b = producer.create_station_at("one", &ones, Position::At(1), ParallelPosition::End)?;
    workers.attach(a)?;
    workers.attach(b)?;
    let p = producer.attach(StationId::GRAND_CENTRAL)?;

    let ids = produce(
        &producer,
        p,
        &[[0, 0, 0, 0, 0, 0], [1, 0, 0, 0, 0, 0], [2, 0, 0, 0, 0, 0], [1, 0, 0, 0, 0, 0]],
        0,
    )?;
    producer.put_events(p, &ids)?;
    assert!(input_holds(&system, a, 1));
    assert!(input_holds(&system, b, 2));
    assert!(grand_central_holds(&system, 7));
    Ok(())
}

#[test]
fn parallel_group_rejects_mismatched_member() -> etbroker::Result<()> {
    let system = EtSystem::create(config(10, 32))?;
    let producer = system.open_privileged_process("producer")?;
    let rr = StationConfig::parallel().with_select_mode(SelectMode::RoundRobin);
    producer.create_station("rr0", &rr)?;
    let odd = StationConfig::parallel().with_select_mode(SelectMode::EqualCue);
    let err = producer.create_station_at("eq", &odd, Position::At(1), ParallelPosition::End);
    assert!(matches!(err, Err(Error::InvalidConfig(_))));
    // Starting a new group at that position is fine.
    let id = producer.create_station_at("eq", &odd, Position::At(1), ParallelPosition::NewHead)?;
    assert_eq!(producer.station_position(id)?, (1, 0));
    Ok(())
}
