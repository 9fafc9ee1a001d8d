use std::io::{self, Result};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{OverflowSink, Pmu};
use crate::event::{HwEvent, Term};

/// A PMU counting in software.
///
/// Nothing is counted on its own: [`emit`][Self::emit] feeds events to every
/// slot programmed with the matching term. Useful for tests and for running
/// the engine where no hardware counters are available.
///
/// # Examples
///
/// ```rust
/// use pmu_mux::driver::{Pmu, SimPmu};
/// use pmu_mux::event::{HwEvent, Preset};
///
/// let pmu = SimPmu::new(2);
/// let event = HwEvent {
///     term: Preset::TotIns.term(),
///     exclude: Default::default(),
///     granularity: Default::default(),
/// };
/// pmu.program(0, &event, 0, false).unwrap();
/// pmu.emit(Preset::TotIns.term(), 42);
/// assert_eq!(pmu.read(0).unwrap(), 42);
/// ```
pub struct SimPmu {
    interrupts: bool,
    inner: Mutex<Sim>,
}

struct Sim {
    slots: Vec<SimSlot>,
    sink: Option<OverflowSink>,
}

#[derive(Clone, Default)]
struct SimSlot {
    event: Option<HwEvent>,
    value: u64,
    period: Option<u64>,
    // Events counted since the last reported overflow.
    pending: u64,
    fail_program: bool,
}

impl SimPmu {
    /// A PMU with `counters` slots that raises overflow interrupts.
    pub fn new(counters: usize) -> Self {
        Self::with(counters, true)
    }

    /// A PMU with `counters` slots and no overflow interrupts.
    pub fn without_interrupts(counters: usize) -> Self {
        Self::with(counters, false)
    }

    fn with(counters: usize, interrupts: bool) -> Self {
        Self {
            interrupts,
            inner: Mutex::new(Sim {
                slots: vec![SimSlot::default(); counters],
                sink: None,
            }),
        }
    }

    fn sim(&self) -> MutexGuard<'_, Sim> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts `n` occurrences of `term` on every slot programmed with it.
    ///
    /// Slots whose interrupt period is crossed are reported to the overflow
    /// sink in a single notification.
    pub fn emit(&self, term: Term, n: u64) {
        self.raise(term, n, None)
    }

    /// Like [`emit`][Self::emit], overflows are reported at instruction
    /// `address`.
    pub fn emit_at(&self, term: Term, n: u64, address: usize) {
        self.raise(term, n, Some(address))
    }

    fn raise(&self, term: Term, n: u64, address: Option<usize>) {
        let mut sim = self.sim();
        let mut mask = 0u64;
        for (i, slot) in sim.slots.iter_mut().enumerate() {
            if slot.event.map(|e| e.term) != Some(term) {
                continue;
            }
            slot.value = slot.value.wrapping_add(n);
            if let Some(period) = slot.period {
                slot.pending += n;
                if slot.pending >= period {
                    slot.pending %= period;
                    mask |= 1u64 << i;
                }
            }
        }
        let sink = sim.sink.clone();
        drop(sim);

        if let (Some(sink), true) = (sink, mask != 0) {
            sink.raise(mask, address);
        }
    }

    /// Every programmed slot with its event.
    pub fn programmed(&self) -> Vec<(usize, HwEvent)> {
        let sim = self.sim();
        sim.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.event.map(|e| (i, e)))
            .collect()
    }

    /// Interrupt period of `slot`, `None` if it does not interrupt.
    pub fn period(&self, slot: usize) -> Option<u64> {
        self.sim().slots.get(slot).and_then(|s| s.period)
    }

    /// Makes programming `slot` fail until called again with `false`.
    pub fn fail_program(&self, slot: usize, fail: bool) {
        if let Some(s) = self.sim().slots.get_mut(slot) {
            s.fail_program = fail;
        }
    }
}

fn no_slot(slot: usize) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("no counter slot {}", slot))
}

impl Pmu for SimPmu {
    fn counters(&self) -> usize {
        self.sim().slots.len()
    }

    fn interrupts(&self) -> bool {
        self.interrupts
    }

    fn read(&self, slot: usize) -> Result<u64> {
        let sim = self.sim();
        match sim.slots.get(slot) {
            Some(SimSlot {
                event: Some(_),
                value,
                ..
            }) => Ok(*value),
            Some(_) => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("counter slot {} is not programmed", slot),
            )),
            None => Err(no_slot(slot)),
        }
    }

    fn program(
        &self,
        slot: usize,
        event: &HwEvent,
        reset_value: u64,
        want_interrupt: bool,
    ) -> Result<()> {
        let interrupts = self.interrupts;
        let mut sim = self.sim();
        let s = sim.slots.get_mut(slot).ok_or_else(|| no_slot(slot))?;
        if s.fail_program {
            return Err(io::Error::other(format!("injected failure on slot {}", slot)));
        }
        if want_interrupt && (!interrupts || reset_value == 0) {
            return Err(io::Error::from(io::ErrorKind::Unsupported));
        }
        *s = SimSlot {
            event: Some(*event),
            period: want_interrupt.then_some(reset_value),
            ..SimSlot::default()
        };
        Ok(())
    }

    fn unprogram(&self, slot: usize) -> Result<()> {
        let mut sim = self.sim();
        let s = sim.slots.get_mut(slot).ok_or_else(|| no_slot(slot))?;
        let fail_program = s.fail_program;
        *s = SimSlot {
            fail_program,
            ..SimSlot::default()
        };
        Ok(())
    }

    fn register_overflow_handler(&self, sink: OverflowSink) -> Result<()> {
        self.sim().sink = Some(sink);
        Ok(())
    }
}
