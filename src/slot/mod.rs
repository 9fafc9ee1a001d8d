//! Physical counter allocation.
//!
//! The pool is shared by every event set of a context and only mutated under
//! the context's global lock.

use std::cmp::Reverse;

use arrayvec::ArrayVec;

use crate::count::state::SetState;
use crate::count::EventSetId;
use crate::driver::Pmu;
use crate::error::{Error, Result};
use crate::event::{HwEvent, MAX_TERMS};
use crate::overflow::OverflowSink;


/// The event term a physical slot is bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Owner {
    pub set: EventSetId,
    pub event: usize,
    pub term: usize,
}

#[derive(Clone, Copy, Debug, Default)]
struct PhysicalSlot {
    owner: Option<Owner>,
    // Unique per binding, 0 while free. Mirrored into the overflow sink so
    // interrupt records can be checked against rebinding.
    token: u64,
}

pub(crate) struct SlotPool {
    slots: Vec<PhysicalSlot>,
    next_token: u64,
    sink: OverflowSink,
}

impl SlotPool {
    pub fn new(counters: usize, sink: OverflowSink) -> Self {
        Self {
            slots: vec![PhysicalSlot::default(); counters],
            next_token: 1,
            sink,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free(&self) -> usize {
        self.slots.iter().filter(|s| s.owner.is_none()).count()
    }

    pub fn in_use(&self) -> usize {
        self.capacity() - self.free()
    }

    fn claim(&mut self, owner: Owner) -> Option<usize> {
        let slot = self.slots.iter().position(|s| s.owner.is_none())?;
        self.slots[slot].owner = Some(owner);
        self.renew(slot);
        Some(slot)
    }

    // Invalidates every overflow record raised under the previous binding.
    fn renew(&mut self, slot: usize) {
        let token = self.next_token;
        self.next_token += 1;
        self.slots[slot].token = token;
        self.sink.publish(slot, token);
    }

    fn release(&mut self, slot: usize) {
        self.slots[slot] = PhysicalSlot::default();
        self.sink.publish(slot, 0);
    }

    /// The owner of `slot`, if it is still bound as it was when `token` was issued.
    pub fn resolve(&self, slot: usize, token: u64) -> Option<Owner> {
        let s = self.slots.get(slot)?;
        if s.token != token {
            return None;
        }
        s.owner
    }

    #[cfg(test)]
    pub fn owner(&self, slot: usize) -> Option<Owner> {
        self.slots[slot].owner
    }
}

/// Makes event `idx` resident: claims and programs one slot per term.
///
/// Either every term ends up bound or none does.
pub(crate) fn place(
    pool: &mut SlotPool,
    pmu: &dyn Pmu,
    state: &mut SetState,
    idx: usize,
    now: u64,
) -> Result<()> {
    let set = state.id;
    let (exclude, granularity) = (state.opts.exclude, state.opts.granularity);
    let ev = &mut state.events[idx];
    if ev.resident {
        return Ok(());
    }
    if pool.free() < ev.terms.len() {
        return Err(Error::CapacityExceeded);
    }
    let period = ev.overflow.as_ref().and_then(|r| r.interrupt_period());

    let mut placed = ArrayVec::<usize, MAX_TERMS>::new();
    let mut failure = None;
    for (t, term) in ev.resolved.terms.iter().enumerate() {
        let owner = Owner {
            set,
            event: idx,
            term: t,
        };
        let Some(slot) = pool.claim(owner) else {
            failure = Some(Error::CapacityExceeded);
            break;
        };
        let hw = HwEvent {
            term: *term,
            exclude,
            granularity,
        };
        if let Err(e) = pmu.program(slot, &hw, period.unwrap_or(0), period.is_some()) {
            pool.release(slot);
            failure = Some(e.into());
            break;
        }
        placed.push(slot);
        match pmu.read(slot) {
            Ok(raw) => {
                ev.terms[t].slot = Some(slot);
                ev.terms[t].baseline = raw;
            }
            Err(e) => {
                failure = Some(e.into());
                break;
            }
        }
    }

    if let Some(e) = failure {
        for slot in placed {
            if let Err(e) = pmu.unprogram(slot) {
                log::warn!("{}: failed to unprogram slot {}: {}", set, slot, e);
            }
            pool.release(slot);
        }
        ev.terms.iter_mut().for_each(|t| t.slot = None);
        return Err(e);
    }

    ev.resident = true;
    ev.resident_since = now;
    ev.last_resident = now;
    Ok(())
}

/// Programs the slots of resident event `idx` again after its overflow
/// registration changed.
///
/// The hardware progress must already be folded into the software counts.
/// Overflows raised before the call are never delivered afterwards.
pub(crate) fn reprogram(
    pool: &mut SlotPool,
    pmu: &dyn Pmu,
    state: &mut SetState,
    idx: usize,
) -> Result<()> {
    let (exclude, granularity) = (state.opts.exclude, state.opts.granularity);
    let ev = &mut state.events[idx];
    let period = ev.overflow.as_ref().and_then(|r| r.interrupt_period());
    for (term, hw) in ev.terms.iter_mut().zip(ev.resolved.terms.iter()) {
        let Some(slot) = term.slot else {
            continue;
        };
        let hw = HwEvent {
            term: *hw,
            exclude,
            granularity,
        };
        pmu.program(slot, &hw, period.unwrap_or(0), period.is_some())?;
        pool.renew(slot);
        term.baseline = pmu.read(slot)?;
    }
    Ok(())
}

/// Parks event `idx`, returning its slots to the pool.
///
/// The hardware progress must already be folded into the software counts.
/// Driver failures are logged: the slots are released regardless.
pub(crate) fn evict(
    pool: &mut SlotPool,
    pmu: &dyn Pmu,
    state: &mut SetState,
    idx: usize,
    now: u64,
) {
    let set = state.id;
    let ev = &mut state.events[idx];
    for term in ev.terms.iter_mut() {
        let Some(slot) = term.slot.take() else {
            continue;
        };
        if let Err(e) = pmu.unprogram(slot) {
            log::warn!("{}: failed to unprogram slot {}: {}", set, slot, e);
        }
        pool.release(slot);
    }
    if ev.resident {
        ev.resident = false;
        ev.last_resident = now;
    }
}

/// Binds a stopped event set for `start`.
///
/// Without multiplexing every event must fit, otherwise nothing is bound.
/// With multiplexing, events are made resident in insertion order while
/// slots remain and the rest stay parked, possibly all of them until the
/// next rotation.
pub(crate) fn bind(
    pool: &mut SlotPool,
    pmu: &dyn Pmu,
    state: &mut SetState,
    now: u64,
) -> Result<()> {
    let need: usize = state.events.iter().map(|ev| ev.terms.len()).sum();
    if !state.multiplex && need > pool.free() {
        return Err(Error::CapacityExceeded);
    }

    for idx in 0..state.events.len() {
        if state.multiplex && pool.free() < state.events[idx].terms.len() {
            continue;
        }
        if let Err(e) = place(pool, pmu, state, idx, now) {
            unbind(pool, pmu, state, now);
            return Err(e);
        }
    }

    log::debug!(
        "{}: bound {} of {} events, {} slots in use",
        state.id,
        state.events.iter().filter(|ev| ev.resident).count(),
        state.events.len(),
        pool.in_use()
    );
    Ok(())
}

/// Releases every slot held by the set.
///
/// Calling it on a set that holds no slot does nothing.
pub(crate) fn unbind(pool: &mut SlotPool, pmu: &dyn Pmu, state: &mut SetState, now: u64) {
    if state.held_slots() == 0 {
        return;
    }
    for idx in 0..state.events.len() {
        evict(pool, pmu, state, idx, now);
    }
    log::debug!("{}: unbound, {} slots in use", state.id, pool.in_use());
}

/// Decides which events of the multiplexed sets in `sets` should be
/// resident next, one vector of flags per set.
///
/// Events parked the longest come first, whatever set they belong to, so
/// every event gets its turn. Among events last resident at the same tick,
/// the one that became resident most recently wins, then the earlier set,
/// then the lower insertion index. Events are taken greedily while their
/// terms fit in `budget` slots.
pub(crate) fn choose(sets: &[&SetState], budget: usize) -> Vec<Vec<bool>> {
    let mut order: Vec<(usize, usize)> = sets
        .iter()
        .enumerate()
        .flat_map(|(s, state)| (0..state.events.len()).map(move |i| (s, i)))
        .collect();
    order.sort_by_key(|&(s, i)| {
        let ev = &sets[s].events[i];
        (ev.last_resident, Reverse(ev.resident_since), s, i)
    });

    let mut want: Vec<Vec<bool>> = sets
        .iter()
        .map(|state| vec![false; state.events.len()])
        .collect();
    let mut left = budget;
    for (s, i) in order {
        let need = sets[s].events[i].terms.len();
        if need <= left {
            want[s][i] = true;
            left -= need;
        }
    }
    want
}
