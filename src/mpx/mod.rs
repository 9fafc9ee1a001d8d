//! The multiplex scheduler.
//!
//! Runs once per scheduler period for every running event set. A parked
//! event counts nothing, so the count of a multiplexed event covers only the
//! periods it was resident.

use std::time::Duration;

use crate::count::state::SetState;
use crate::driver::Pmu;
use crate::error::{Error, Result};
use crate::overflow::{self, Fired};
use crate::slot::{self, SlotPool};


/// Scheduler periods between two rotations of the set.
pub(crate) fn every(state: &SetState, interval: Duration) -> u64 {
    let Some(own) = state.opts.multiplex_interval else {
        return 1;
    };
    let n = own.as_nanos().div_ceil(interval.as_nanos().max(1));
    n.clamp(1, u64::MAX as u128) as u64
}

fn due(state: &SetState, now: u64, interval: Duration) -> bool {
    now.saturating_sub(state.last_rotation) >= every(state, interval)
}

// Folds the hardware progress and accounts for the period that just ended.
fn advance(pmu: &dyn Pmu, state: &mut SetState, now: u64) -> Result<()> {
    state.fold(pmu)?;
    state.ticks += 1;
    for ev in state.events.iter_mut().filter(|ev| ev.resident) {
        ev.resident_ticks += 1;
        ev.last_resident = now;
    }
    Ok(())
}

/// Runs scheduler period `now` for every running set in `sets`.
///
/// Multiplexed sets due for rotation share their slots and the free ones.
/// Returns, per set, the software overflows it detected, to be delivered
/// once the locks are released.
pub(crate) fn step(
    pool: &mut SlotPool,
    pmu: &dyn Pmu,
    sets: &mut [&mut SetState],
    now: u64,
    interval: Duration,
    timestamp: Duration,
) -> Vec<Result<Vec<Fired>>> {
    let mut results: Vec<Result<()>> = sets
        .iter_mut()
        .map(|state| advance(pmu, state, now))
        .collect();

    let mut owners = vec![];
    let mut due_sets = vec![];
    for (i, state) in sets.iter_mut().enumerate() {
        if results[i].is_ok() && state.multiplex && due(state, now, interval) {
            owners.push(i);
            due_sets.push(&mut **state);
        }
    }
    let failures = rotate(pool, pmu, &mut due_sets, now);
    for (i, failure) in owners.into_iter().zip(failures) {
        if let Some(e) = failure {
            results[i] = Err(e);
        }
    }

    sets.iter_mut()
        .zip(results)
        .map(|(state, result)| result.map(|()| overflow::poll(state, timestamp)))
        .collect()
}

/// Swaps parked events in for the ones resident the longest.
///
/// The sets may use every free slot plus the ones they already hold. Events
/// that stay resident keep their slot. Returns the first failure of each set,
/// the other sets are rotated regardless.
pub(crate) fn rotate(
    pool: &mut SlotPool,
    pmu: &dyn Pmu,
    sets: &mut [&mut SetState],
    now: u64,
) -> Vec<Option<Error>> {
    let budget = pool.free() + sets.iter().map(|state| state.held_slots()).sum::<usize>();
    let want = {
        let view: Vec<&SetState> = sets.iter().map(|state| &**state).collect();
        slot::choose(&view, budget)
    };

    for (state, want) in sets.iter_mut().zip(&want) {
        for (idx, &keep) in want.iter().enumerate() {
            if state.events[idx].resident && !keep {
                slot::evict(pool, pmu, state, idx, now);
            }
        }
    }

    let mut failures: Vec<Option<Error>> = sets.iter().map(|_| None).collect();
    for ((state, want), failure) in sets.iter_mut().zip(&want).zip(failures.iter_mut()) {
        for (idx, &take) in want.iter().enumerate() {
            if state.events[idx].resident || !take {
                continue;
            }
            if let Err(e) = slot::place(pool, pmu, state, idx, now) {
                log::warn!("{}: failed to make event {} resident: {}", state.id, idx, e);
                failure.get_or_insert(e);
            }
        }
        state.last_rotation = now;

        if log::log_enabled!(log::Level::Trace) {
            let resident: Vec<_> = (0..state.events.len())
                .filter(|&i| state.events[i].resident)
                .collect();
            log::trace!("{}: rotated, resident {:?}", state.id, resident);
        }
    }
    failures
}
