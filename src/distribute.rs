//! Batch splitting for parallel groups that share events among their
//! active members instead of filtering them.

/// Which batch positions each member receives, in member order, and the
/// member that took the final event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RoundRobinPlan {
    pub(crate) shares: Vec<Vec<usize>>,
    pub(crate) last: usize,
}

/// Deals `events` one at a time starting at member `start`, wrapping
/// around `members`.
pub(crate) fn round_robin(events: usize, members: usize, start: usize) -> RoundRobinPlan {
    let mut shares = vec![Vec::with_capacity(events / members.max(1) + 1); members];
    if members == 0 {
        return RoundRobinPlan { shares, last: 0 };
    }
    let start = start % members;
    for position in 0..events {
        shares[(start + position % members) % members].push(position);
    }
    let last = if events == 0 {
        (start + members - 1) % members
    } else {
        (start + (events - 1) % members) % members
    };
    RoundRobinPlan { shares, last }
}

/// First member to deal to: the active member after the one flagged as
/// last receiver, wrapping to the first active member.
pub(crate) fn round_robin_start(active: &[bool], was_last: &[bool]) -> Option<usize> {
    let first = active.iter().position(|&a| a)?;
    let Some(flagged) = was_last.iter().position(|&w| w) else {
        return Some(first);
    };
    Some(
        (flagged + 1..active.len())
            .find(|&i| active[i])
            .unwrap_or(first),
    )
}

/// Water-fills `events` into members with the given input depths: the
/// shallowest members are raised to the next depth until the batch runs
/// out. A remainder that cannot lift the whole tied group to the next
/// depth is split evenly among that tied group only, extras going to the
/// earliest members.
pub(crate) fn equal_cue(depths: &[usize], events: usize) -> Vec<usize> {
    let n = depths.len();
    let mut counts = vec![0usize; n];
    if n == 0 || events == 0 {
        return counts;
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by_key(|&i| depths[i]);

    let mut remaining = events;
    let mut level = depths[order[0]];
    let mut tied = 0;
    loop {
        while tied < n && depths[order[tied]] <= level {
            tied += 1;
        }
        let lift = if tied < n {
            Some(depths[order[tied]] - level)
        } else {
            None
        };
        match lift {
            Some(step) if remaining >= step * tied => {
                for &member in &order[..tied] {
                    counts[member] += step;
                }
                remaining -= step * tied;
                level += step;
            }
            _ => {
                let share = remaining / tied;
                let extra = remaining % tied;
                for (rank, &member) in order[..tied].iter().enumerate() {
                    counts[member] += share + usize::from(rank < extra);
                }
                return counts;
            }
        }
    }
}
