use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as MemOrd};
use std::sync::{Arc, MutexGuard};
use std::thread;

use crate::config::Opts;
use crate::context::{lock, Context, Global, Member, SetCell};
use crate::error::{Error, Misuse, Result};
use crate::event::EventCode;
use crate::overflow::{self, Caps, Delivery, OverflowHandler, Registration};
use crate::slot;

mod stat;
pub(crate) mod state;
#[cfg(test)]
mod test;

pub use stat::*;
use state::{LogicalEvent, SetState};

/// Upper bound on the number of events in one event set.
pub const MAX_EVENTS: usize = 64;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies an event set within the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventSetId(pub(crate) u64);

impl fmt::Display for EventSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event set {}", self.0)
    }
}

/// Lifecycle state of an event set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Status {
    /// Events may be added and removed.
    Stopped,
    /// Counting.
    Running,
    /// The handle is unusable.
    Destroyed,
}

/// An ordered set of events counted as a unit.
///
/// Created by [`Context::create`]. Event indices in the results of
/// [`read`][Self::read], [`stop`][Self::stop] and in overflow notifications
/// follow the order in which events were added.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
///
/// use pmu_mux::config::ContextOpts;
/// use pmu_mux::driver::SimPmu;
/// use pmu_mux::event::Preset;
/// use pmu_mux::Context;
///
/// let pmu = Arc::new(SimPmu::new(2));
/// let opts = ContextOpts {
///     background: false,
///     ..Default::default()
/// };
/// let ctx = Context::new(pmu.clone(), opts).unwrap();
///
/// let set = ctx.create();
/// set.add(Preset::TotIns).unwrap();
/// set.add(Preset::TotCyc).unwrap();
/// set.start().unwrap();
///
/// pmu.emit(Preset::TotIns.term(), 100);
/// pmu.emit(Preset::TotCyc.term(), 250);
///
/// assert_eq!(set.stop().unwrap(), vec![100, 250]);
/// ```
pub struct EventSet {
    ctx: Context,
    cell: Arc<SetCell>,
    id: EventSetId,
}

impl EventSet {
    pub(crate) fn new(ctx: Context) -> Self {
        let id = EventSetId(NEXT_ID.fetch_add(1, MemOrd::Relaxed));
        Self {
            ctx,
            cell: Arc::new(SetCell::new(SetState::new(id))),
            id,
        }
    }

    pub fn id(&self) -> EventSetId {
        self.id
    }

    fn state(&self) -> MutexGuard<'_, SetState> {
        lock(&self.cell.state)
    }

    fn caps(&self) -> Caps {
        Caps {
            interrupts: self.ctx.0.pmu.interrupts(),
            software: self.ctx.0.opts.software_overflow,
        }
    }

    /// Appends an event.
    ///
    /// Fails with [`Error::UnknownEvent`] if the PMU cannot count the event
    /// and with [`Error::CapacityExceeded`] if the event could never be
    /// resident, even alone.
    pub fn add(&self, code: impl Into<EventCode>) -> Result<()> {
        let code = code.into();
        let mut state = self.state();
        state.stopped()?;
        if state.position(&code).is_some() {
            return Err(Error::InvalidState(Misuse::DuplicateEvent));
        }

        let resolved = code.resolve();
        let pmu = &self.ctx.0.pmu;
        if !resolved.terms.iter().all(|t| pmu.supports(t)) {
            return Err(Error::UnknownEvent);
        }
        if resolved.terms.len() > pmu.counters() || state.events.len() >= MAX_EVENTS {
            return Err(Error::CapacityExceeded);
        }
        state.events.push(LogicalEvent::new(code, resolved));
        Ok(())
    }

    /// Removes an event, the events after it move one index down.
    pub fn remove(&self, code: impl Into<EventCode>) -> Result<()> {
        let code = code.into();
        let mut state = self.state();
        state.stopped()?;
        let idx = state.position(&code).ok_or(Error::UnknownEvent)?;
        state.events.remove(idx);
        Ok(())
    }

    /// Removes every event.
    pub fn cleanup(&self) -> Result<()> {
        let mut state = self.state();
        state.stopped()?;
        state.events.clear();
        Ok(())
    }

    /// Starts counting from zero.
    ///
    /// Without multiplexing every event gets a physical counter or the call
    /// fails with [`Error::CapacityExceeded`]. A multiplexed set takes the
    /// free counters, its other events wait for the next rotation.
    pub fn start(&self) -> Result<()> {
        let shared = &*self.ctx.0;
        let mut global = lock(&shared.global);
        let mut state = self.state();
        state.stopped()?;
        if state.events.is_empty() {
            return Err(Error::InvalidState(Misuse::NoEvents));
        }

        let now = global.tick;
        let Global { pool, running, .. } = &mut *global;
        slot::bind(pool, &*shared.pmu, &mut state, now)?;

        for ev in state.events.iter_mut() {
            ev.zero();
            if !ev.resident {
                ev.last_resident = now;
                ev.resident_since = now;
            }
        }
        state.ticks = 0;
        state.run += 1;
        state.last_rotation = now;
        state.deferred.clear();
        state.status = Status::Running;
        running.push(Member {
            id: self.id,
            cell: Arc::clone(&self.cell),
        });

        log::debug!(
            "{}: started with {} events{}",
            self.id,
            state.events.len(),
            if state.multiplex { ", multiplexed" } else { "" }
        );
        Ok(())
    }

    // Folds the hardware progress, polls software overflows and delivers
    // them once the set lock is released.
    fn sample(&self, reset: bool) -> Result<Vec<u64>> {
        let shared = &*self.ctx.0;
        let mut state = self.state();
        state.live()?;

        let mut fired = vec![];
        if state.status == Status::Running {
            state.fold(&*shared.pmu)?;
            fired = overflow::poll(&mut state, shared.sink.now());
        }
        let values = state.values();
        if reset {
            state.rebase(&*shared.pmu)?;
        }
        let run = state.run;
        drop(state);

        overflow::deliver(&self.cell, run, fired);
        Ok(values)
    }

    /// Current counts in insertion order.
    ///
    /// Multiplexed events only count while resident, so their counts are
    /// estimates: see [`stats`][Self::stats] for extrapolated values.
    /// Software overflows detected by the read are delivered before it returns.
    pub fn read(&self) -> Result<Vec<u64>> {
        self.sample(false)
    }

    /// Adds the current counts to `values` and zeroes them.
    ///
    /// Hardware counters keep running, only the baselines move.
    pub fn accum(&self, values: &mut [u64]) -> Result<()> {
        let counts = self.sample(true)?;
        for (acc, count) in values.iter_mut().zip(counts) {
            *acc = acc.wrapping_add(count);
        }
        Ok(())
    }

    /// Zeroes every count, legal while running.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.state();
        state.live()?;
        state.rebase(&*self.ctx.0.pmu)
    }

    /// Stops counting and returns the final counts.
    ///
    /// Once this returns, no overflow handler of this set is running on
    /// another thread and none will be called until the set is started again.
    pub fn stop(&self) -> Result<Vec<u64>> {
        self.halt(true)
    }

    fn halt(&self, strict: bool) -> Result<Vec<u64>> {
        let shared = &*self.ctx.0;
        let mut global = lock(&shared.global);
        let mut state = self.state();
        state.running()?;
        if let Err(e) = state.fold(&*shared.pmu) {
            if strict {
                return Err(e);
            }
            log::warn!("{}: failed to read final counts: {}", self.id, e);
        }

        let now = global.tick;
        let Global { pool, running, .. } = &mut *global;
        slot::unbind(pool, &*shared.pmu, &mut state, now);
        running.retain(|m| m.id != self.id);
        state.status = Status::Stopped;
        state.deferred.clear();

        let values = state.values();
        let dispatcher = state.dispatcher;
        drop(state);
        drop(global);

        // Wait for handlers in flight elsewhere, unless called from one.
        if dispatcher != Some(thread::current().id()) {
            drop(lock(&self.cell.gate));
        }
        log::debug!("{}: stopped", self.id);
        Ok(values)
    }

    /// Allows the set to hold more events than there are physical counters.
    ///
    /// Overflow registrations switch to polling, which fails with
    /// [`Error::NotSupported`] if the context has no software fallback.
    pub fn set_multiplex(&self) -> Result<()> {
        let mut state = self.state();
        state.stopped()?;
        let opts = state.opts.clone();
        self.redeliver(&mut state, true, opts)
    }

    /// Replaces the options of a stopped set.
    pub fn set_opts(&self, opts: Opts) -> Result<()> {
        let mut state = self.state();
        state.stopped()?;
        let multiplex = state.multiplex;
        self.redeliver(&mut state, multiplex, opts)
    }

    // Applies a new configuration if every overflow registration can still
    // be served under it.
    fn redeliver(&self, state: &mut SetState, multiplex: bool, opts: Opts) -> Result<()> {
        let caps = self.caps();
        let mut deliveries = Vec::with_capacity(state.events.len());
        for ev in state.events.iter() {
            let delivery = match ev.overflow {
                Some(_) => {
                    let derived = ev.resolved.is_derived();
                    Some(
                        Delivery::choose(caps, multiplex, opts.overflow, derived)
                            .ok_or(Error::NotSupported)?,
                    )
                }
                None => None,
            };
            deliveries.push(delivery);
        }

        for (ev, delivery) in state.events.iter_mut().zip(deliveries) {
            if let (Some(reg), Some(delivery)) = (ev.overflow.as_mut(), delivery) {
                reg.delivery = delivery;
            }
        }
        state.multiplex = multiplex;
        state.opts = opts;
        Ok(())
    }

    /// Calls `handler` every time event `code` counts `threshold` more events.
    ///
    /// A zero threshold removes the registration. Handlers registered with
    /// clones of the same [`OverflowHandler`] are called once for all events
    /// that overflowed together.
    pub fn set_overflow(
        &self,
        code: impl Into<EventCode>,
        threshold: u64,
        handler: OverflowHandler,
    ) -> Result<()> {
        let code = code.into();
        let shared = &*self.ctx.0;
        let mut global = lock(&shared.global);
        let pool = &mut global.pool;
        let mut state = self.state();
        state.live()?;
        let idx = state.position(&code).ok_or(Error::UnknownEvent)?;

        let mut reg = match threshold {
            0 => None,
            _ => {
                let derived = state.events[idx].resolved.is_derived();
                let delivery =
                    Delivery::choose(self.caps(), state.multiplex, state.opts.overflow, derived)
                        .ok_or(Error::NotSupported)?;
                Some(Registration {
                    threshold,
                    deadline: threshold,
                    handler,
                    delivery,
                })
            }
        };

        if state.status != Status::Running {
            state.events[idx].overflow = reg;
            return Ok(());
        }

        state.fold(&*shared.pmu)?;
        let ev = &mut state.events[idx];
        if let Some(reg) = reg.as_mut() {
            reg.deadline = ev.value().saturating_add(threshold);
        }
        let period = |r: &Option<Registration>| r.as_ref().and_then(Registration::interrupt_period);
        let before = period(&ev.overflow);
        let old = std::mem::replace(&mut ev.overflow, reg);
        if !ev.resident || before == period(&ev.overflow) {
            return Ok(());
        }

        match slot::reprogram(pool, &*shared.pmu, &mut state, idx) {
            Ok(()) => Ok(()),
            Err(e) if threshold == 0 => {
                log::warn!("{}: failed to disable overflow interrupt: {}", self.id, e);
                Ok(())
            }
            Err(e) => {
                state.events[idx].overflow = old;
                if let Err(e) = slot::reprogram(pool, &*shared.pmu, &mut state, idx) {
                    log::warn!("{}: failed to restore event {}: {}", self.id, idx, e);
                }
                Err(e)
            }
        }
    }

    /// Removes the overflow registration of `code`, if any.
    pub fn clear_overflow(&self, code: impl Into<EventCode>) -> Result<()> {
        self.set_overflow(code, 0, OverflowHandler::new(|_| {}))
    }

    /// Insertion indices of the events holding a physical counter in `mask`.
    pub fn overflow_events(&self, mask: u64) -> Vec<usize> {
        let state = self.state();
        state
            .events
            .iter()
            .enumerate()
            .filter(|(_, ev)| ev.slot_mask() & mask != 0)
            .map(|(i, _)| i)
            .collect()
    }

    /// Counts with the residency of each event, in insertion order.
    pub fn stats(&self) -> Result<Vec<Stat>> {
        let mut state = self.state();
        state.live()?;
        if state.status == Status::Running {
            state.fold(&*self.ctx.0.pmu)?;
        }
        let ticks = state.ticks;
        Ok(state
            .events
            .iter()
            .map(|ev| Stat {
                count: ev.value(),
                ticks_enabled: ticks,
                ticks_running: ev.resident_ticks,
            })
            .collect())
    }

    /// Marks a stopped, empty set as destroyed.
    pub fn destroy(&self) -> Result<()> {
        let mut state = self.state();
        state.stopped()?;
        if !state.events.is_empty() {
            return Err(Error::InvalidState(Misuse::NotEmpty));
        }
        state.status = Status::Destroyed;
        Ok(())
    }

    pub fn status(&self) -> Status {
        self.state().status
    }

    pub fn num_events(&self) -> usize {
        self.state().events.len()
    }

    pub fn events(&self) -> Vec<EventCode> {
        self.state().events.iter().map(|ev| ev.code.clone()).collect()
    }

    pub fn is_multiplexed(&self) -> bool {
        self.state().multiplex
    }

    pub fn opts(&self) -> Opts {
        self.state().opts.clone()
    }
}

impl fmt::Debug for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("EventSet")
            .field("id", &self.id)
            .field("status", &state.status)
            .field("events", &state.events.len())
            .field("multiplex", &state.multiplex)
            .finish()
    }
}

impl Drop for EventSet {
    fn drop(&mut self) {
        if self.status() == Status::Running {
            if let Err(e) = self.halt(false) {
                log::warn!("{}: failed to stop on drop: {}", self.id, e);
            }
        }
        self.state().status = Status::Destroyed;
    }
}
