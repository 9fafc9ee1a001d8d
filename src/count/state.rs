use std::thread::ThreadId;

use arrayvec::ArrayVec;

use super::{EventSetId, Status};
use crate::config::Opts;
use crate::driver::Pmu;
use crate::error::{Error, Misuse, Result};
use crate::event::{EventCode, Resolved, MAX_TERMS};
use crate::overflow::{Fired, Registration};

// Everything an event set owns, guarded by the set's own lock.
pub(crate) struct SetState {
    pub id: EventSetId,
    pub status: Status,
    pub opts: Opts,
    pub multiplex: bool,
    pub events: Vec<LogicalEvent>,

    // Bumped by every `start`, lets late deliveries detect a restart.
    pub run: u64,
    // Scheduler ticks observed since the last start or reset.
    pub ticks: u64,
    pub last_rotation: u64,

    pub dispatcher: Option<ThreadId>,
    pub deferred: Vec<Fired>,
}

pub(crate) struct LogicalEvent {
    pub code: EventCode,
    pub resolved: Resolved,
    pub terms: ArrayVec<TermState, MAX_TERMS>,
    pub resident: bool,
    pub resident_since: u64,
    pub last_resident: u64,
    pub resident_ticks: u64,
    pub overflow: Option<Registration>,
}

#[derive(Clone, Copy, Default)]
pub(crate) struct TermState {
    pub slot: Option<usize>,
    pub baseline: u64,
    pub count: u64,
}

impl LogicalEvent {
    pub fn new(code: EventCode, resolved: Resolved) -> Self {
        let terms = resolved.terms.iter().map(|_| TermState::default()).collect();
        Self {
            code,
            resolved,
            terms,
            resident: false,
            resident_since: 0,
            last_resident: 0,
            resident_ticks: 0,
            overflow: None,
        }
    }

    pub fn value(&self) -> u64 {
        self.resolved.value(self.terms.iter().map(|t| t.count))
    }

    // Bitmask of the physical slots currently holding this event.
    pub fn slot_mask(&self) -> u64 {
        self.terms
            .iter()
            .filter_map(|t| t.slot)
            .fold(0, |mask, slot| mask | 1u64 << slot)
    }

    pub fn zero(&mut self) {
        self.terms.iter_mut().for_each(|t| t.count = 0);
        self.resident_ticks = 0;
        if let Some(reg) = self.overflow.as_mut() {
            reg.deadline = reg.threshold;
        }
    }
}

impl SetState {
    pub fn new(id: EventSetId) -> Self {
        Self {
            id,
            status: Status::Stopped,
            opts: Opts::default(),
            multiplex: false,
            events: vec![],
            run: 0,
            ticks: 0,
            last_rotation: 0,
            dispatcher: None,
            deferred: vec![],
        }
    }

    pub fn live(&self) -> Result<()> {
        match self.status {
            Status::Destroyed => Err(Error::InvalidState(Misuse::Destroyed)),
            _ => Ok(()),
        }
    }

    pub fn stopped(&self) -> Result<()> {
        match self.status {
            Status::Stopped => Ok(()),
            Status::Running => Err(Error::InvalidState(Misuse::Running)),
            Status::Destroyed => Err(Error::InvalidState(Misuse::Destroyed)),
        }
    }

    pub fn running(&self) -> Result<()> {
        match self.status {
            Status::Running => Ok(()),
            Status::Stopped => Err(Error::InvalidState(Misuse::NotRunning)),
            Status::Destroyed => Err(Error::InvalidState(Misuse::Destroyed)),
        }
    }

    pub fn position(&self, code: &EventCode) -> Option<usize> {
        self.events.iter().position(|ev| &ev.code == code)
    }

    pub fn held_slots(&self) -> usize {
        self.events
            .iter()
            .flat_map(|ev| ev.terms.iter())
            .filter(|t| t.slot.is_some())
            .count()
    }

    pub fn values(&self) -> Vec<u64> {
        self.events.iter().map(LogicalEvent::value).collect()
    }

    // Raw values of every resident term, read before anything is updated
    // so a failing read leaves the set untouched.
    fn sample(&self, pmu: &dyn Pmu) -> Result<Vec<(usize, usize, u64)>> {
        let mut raws = Vec::with_capacity(self.events.len());
        for (e, ev) in self.events.iter().enumerate() {
            for (t, term) in ev.terms.iter().enumerate() {
                if let Some(slot) = term.slot {
                    raws.push((e, t, pmu.read(slot)?));
                }
            }
        }
        Ok(raws)
    }

    /// Moves the hardware progress of every resident term into its software count.
    pub fn fold(&mut self, pmu: &dyn Pmu) -> Result<()> {
        for (e, t, raw) in self.sample(pmu)? {
            let term = &mut self.events[e].terms[t];
            term.count = term.count.wrapping_add(raw.wrapping_sub(term.baseline));
            term.baseline = raw;
        }
        Ok(())
    }

    /// Zeroes the software counts and starts the hardware deltas over.
    pub fn rebase(&mut self, pmu: &dyn Pmu) -> Result<()> {
        for (e, t, raw) in self.sample(pmu)? {
            self.events[e].terms[t].baseline = raw;
        }
        self.events.iter_mut().for_each(LogicalEvent::zero);
        self.ticks = 0;
        Ok(())
    }
}
