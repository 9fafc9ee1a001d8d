//! Overflow notification.
//!
//! Overflows reach user handlers along two paths:
//!
//! - Interrupt driven: the driver reports a bitmask of overflowed physical
//!   counters through an [`OverflowSink`]. The sink only stamps the record and
//!   pushes it into a pre-allocated ring, which is safe inside a signal
//!   handler. The records are resolved to event sets and delivered later on a
//!   normal thread by [`Context::dispatch`][crate::Context::dispatch].
//!
//! - Polled: the accumulated count of an event is compared with its deadline
//!   on every scheduler tick and every [`EventSet::read`][crate::EventSet::read].
//!
//! Handlers of the same event set are never nested: an overflow raised while
//! one of its handlers is running is queued and delivered once it returns.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as MemOrd};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use arrayvec::ArrayVec;

use crate::config::OverflowMode;
use crate::context::{lock, SetCell};
use crate::count::state::SetState;
use crate::count::{EventSetId, Status, MAX_EVENTS};

pub(crate) mod rb;
#[cfg(test)]
mod test;

use rb::{Rb, Record};

/// An overflow as seen by a handler.
#[derive(Clone, Debug)]
pub struct Overflow {
    /// The event set the overflowed events belong to.
    pub event_set: EventSetId,

    /// Bitmask of the physical counters that overflowed.
    ///
    /// Polled overflows of events that are not resident set no bit.
    pub mask: u64,

    /// Insertion indices of the overflowed events, ascending.
    pub events: ArrayVec<usize, MAX_EVENTS>,

    /// Instruction address at the overflow, if the driver reports one.
    pub address: Option<usize>,

    /// When the overflow was detected, relative to the creation of the context.
    pub timestamp: Duration,
}

/// User callback invoked on overflow.
///
/// Registrations sharing a handler (clones of the same `OverflowHandler`)
/// are reported together in a single call.
#[derive(Clone)]
pub struct OverflowHandler(Arc<dyn Fn(&Overflow) + Send + Sync>);

impl OverflowHandler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Overflow) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for OverflowHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OverflowHandler")
            .field(&Arc::as_ptr(&self.0))
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
    Interrupt,
    Poll,
}

impl Delivery {
    /// Picks how an overflow registration is served, `None` if it cannot be.
    pub fn choose(caps: Caps, multiplex: bool, mode: OverflowMode, derived: bool) -> Option<Self> {
        if caps.interrupts && !multiplex && mode == OverflowMode::Auto && !derived {
            Some(Self::Interrupt)
        } else if caps.software {
            Some(Self::Poll)
        } else {
            None
        }
    }
}

/// What the context can offer for overflow detection.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Caps {
    pub interrupts: bool,
    pub software: bool,
}

#[derive(Clone, Debug)]
pub(crate) struct Registration {
    pub threshold: u64,
    // Count at which the next polled overflow fires.
    pub deadline: u64,
    pub handler: OverflowHandler,
    pub delivery: Delivery,
}

impl Registration {
    pub fn interrupt_period(&self) -> Option<u64> {
        (self.delivery == Delivery::Interrupt).then_some(self.threshold)
    }
}

// An overflow bound to the handler it is delivered to.
pub(crate) struct Fired {
    pub handler: OverflowHandler,
    pub overflow: Overflow,
}

// Groups overflowed events of one set by handler.
pub(crate) struct Batch {
    event_set: EventSetId,
    address: Option<usize>,
    timestamp: Duration,
    fired: Vec<Fired>,
}

impl Batch {
    pub fn new(event_set: EventSetId, address: Option<usize>, timestamp: Duration) -> Self {
        Self {
            event_set,
            address,
            timestamp,
            fired: vec![],
        }
    }

    pub fn add(&mut self, handler: &OverflowHandler, event: usize, mask: u64) {
        let pos = match self.fired.iter().position(|f| f.handler.same(handler)) {
            Some(pos) => pos,
            None => {
                self.fired.push(Fired {
                    handler: handler.clone(),
                    overflow: Overflow {
                        event_set: self.event_set,
                        mask: 0,
                        events: ArrayVec::new(),
                        address: self.address,
                        timestamp: self.timestamp,
                    },
                });
                self.fired.len() - 1
            }
        };
        let fired = &mut self.fired[pos];
        fired.overflow.mask |= mask;
        if !fired.overflow.events.contains(&event) {
            let at = fired.overflow.events.partition_point(|&e| e < event);
            // Never full: indices are unique and below `MAX_EVENTS`.
            let _ = fired.overflow.events.try_insert(at, event);
        }
    }

    pub fn into_fired(self) -> Vec<Fired> {
        self.fired
    }
}

/// Checks every polled registration against the accumulated counts.
///
/// A registration fires once per crossing: its deadline moves past the
/// current count before the overflow is reported.
pub(crate) fn poll(state: &mut SetState, timestamp: Duration) -> Vec<Fired> {
    let mut batch = Batch::new(state.id, None, timestamp);
    for (idx, ev) in state.events.iter_mut().enumerate() {
        let value = ev.value();
        let mask = ev.slot_mask();
        let Some(reg) = ev.overflow.as_mut() else {
            continue;
        };
        if reg.delivery != Delivery::Poll || value < reg.deadline {
            continue;
        }
        reg.deadline = value.saturating_add(reg.threshold);
        batch.add(&reg.handler, idx, mask);
    }
    batch.into_fired()
}

// Drops events whose registration was cleared or replaced after detection.
fn still_registered(state: &SetState, mut fired: Fired) -> Option<Fired> {
    let overflow = &mut fired.overflow;
    let mut mask = 0;
    overflow.events.retain(|idx| {
        let Some(ev) = state.events.get(*idx) else {
            return false;
        };
        match &ev.overflow {
            Some(reg) if reg.handler.same(&fired.handler) => {
                mask |= ev.slot_mask();
                true
            }
            _ => false,
        }
    });
    if overflow.events.is_empty() {
        return None;
    }
    // Never report a slot the event no longer holds.
    overflow.mask &= mask;
    Some(fired)
}

struct Dispatching<'a>(&'a SetCell);

impl Drop for Dispatching<'_> {
    fn drop(&mut self) {
        lock(&self.0.state).dispatcher = None;
    }
}

/// Runs handlers for overflows detected during run `run` of the set.
///
/// Overflows arriving while a handler of the same set runs on this thread
/// are queued behind it. Anything detected before the set was stopped or
/// restarted is discarded.
pub(crate) fn deliver(cell: &SetCell, run: u64, fired: Vec<Fired>) -> usize {
    if fired.is_empty() {
        return 0;
    }
    let me = thread::current().id();
    {
        let mut state = lock(&cell.state);
        if state.dispatcher == Some(me) {
            if state.status == Status::Running && state.run == run {
                state.deferred.extend(fired);
            }
            return 0;
        }
    }

    let _gate = lock(&cell.gate);
    {
        let mut state = lock(&cell.state);
        if state.status != Status::Running || state.run != run {
            log::trace!("{}: discarding stale overflow", state.id);
            return 0;
        }
        state.dispatcher = Some(me);
    }
    let _dispatching = Dispatching(cell);

    let mut delivered = 0;
    let mut queue = fired;
    loop {
        for fired in queue.drain(..) {
            let fired = {
                let state = lock(&cell.state);
                if state.status != Status::Running || state.run != run {
                    return delivered;
                }
                still_registered(&state, fired)
            };
            if let Some(fired) = fired {
                log::trace!(
                    "{}: overflow on events {:?}, mask {:#x}",
                    fired.overflow.event_set,
                    fired.overflow.events,
                    fired.overflow.mask
                );
                (fired.handler.0)(&fired.overflow);
                delivered += 1;
            }
        }
        let mut state = lock(&cell.state);
        if state.deferred.is_empty() {
            return delivered;
        }
        queue = std::mem::take(&mut state.deferred);
    }
}

pub(crate) struct SinkInner {
    pub tokens: Box<[AtomicU64]>,
    pub rb: Rb,
    pub epoch: Instant,
}

impl SinkInner {
    // Signal safe: atomics and the pre-allocated ring only.
    pub fn raise(&self, slots: u64, address: Option<usize>) {
        let at = self.epoch.elapsed().as_nanos() as u64;
        let mut bits = slots;
        while bits != 0 {
            let slot = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            let Some(token) = self.tokens.get(slot) else {
                continue;
            };
            let token = token.load(MemOrd::Acquire);
            if token == 0 {
                continue;
            }
            self.rb.push(Record {
                slot,
                token,
                address: address.unwrap_or(0),
                at,
            });
        }
    }
}

/// Receives overflow notifications from the driver.
///
/// [`raise`][Self::raise] does not allocate, block or lock, so it may be
/// called from a signal handler.
#[derive(Clone)]
pub struct OverflowSink(pub(crate) Arc<SinkInner>);

impl OverflowSink {
    pub(crate) fn new(counters: usize, queue: usize) -> Self {
        Self(Arc::new(SinkInner {
            tokens: (0..counters).map(|_| AtomicU64::new(0)).collect(),
            rb: Rb::new(queue),
            epoch: Instant::now(),
        }))
    }

    /// Reports that the physical counters in `slots` overflowed at
    /// instruction `address`, if known.
    ///
    /// Bits of counters that are not bound to any event are ignored.
    pub fn raise(&self, slots: u64, address: Option<usize>) {
        self.0.raise(slots, address)
    }

    #[cfg(target_os = "linux")]
    pub(crate) fn as_ptr(&self) -> *mut SinkInner {
        Arc::as_ptr(&self.0).cast_mut()
    }

    pub(crate) fn publish(&self, slot: usize, token: u64) {
        self.0.tokens[slot].store(token, MemOrd::Release);
    }

    pub(crate) fn pop(&self) -> Option<Record> {
        self.0.rb.pop()
    }

    pub(crate) fn lost(&self) -> u64 {
        self.0.rb.lost()
    }

    pub(crate) fn now(&self) -> Duration {
        self.0.epoch.elapsed()
    }
}

impl fmt::Debug for OverflowSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverflowSink")
            .field("counters", &self.0.tokens.len())
            .field("lost", &self.lost())
            .finish()
    }
}
