use arrayvec::ArrayVec;

use crate::config::{Domain, Granularity};

mod derived;
mod preset;
#[cfg(test)]
mod test;

pub use derived::*;
pub use preset::*;

/// Upper bound on the number of hardware terms of a derived event.
pub const MAX_TERMS: usize = 4;

/// Component id of the generalized hardware events.
pub const HARDWARE: u32 = 0;
/// Component id of the generalized cache events.
pub const HW_CACHE: u32 = 3;
/// Component id of raw, model-specific events.
pub const RAW: u32 = 4;

/// One quantity a single physical counter can count.
///
/// `component` selects the PMU (or event namespace) and `config` the event
/// within it, the driver interprets both.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Term {
    pub component: u32,
    pub config: u64,
}

impl Term {
    pub const fn new(component: u32, config: u64) -> Self {
        Self { component, config }
    }

    /// A raw, model-specific event.
    pub const fn raw(config: u64) -> Self {
        Self::new(RAW, config)
    }
}

/// A countable quantity as requested by the user.
///
/// The code is resolved into hardware terms once, when it is added to an
/// event set.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EventCode {
    /// A portable, named event.
    Preset(Preset),

    /// An event of a specific component.
    Native { code: u64, component: u32 },

    /// An event computed from several hardware terms.
    Derived(Formula),
}

impl From<Preset> for EventCode {
    fn from(value: Preset) -> Self {
        Self::Preset(value)
    }
}

impl From<Term> for EventCode {
    fn from(value: Term) -> Self {
        Self::Native {
            code: value.config,
            component: value.component,
        }
    }
}

impl From<Formula> for EventCode {
    fn from(value: Formula) -> Self {
        Self::Derived(value)
    }
}

impl EventCode {
    pub(crate) fn resolve(&self) -> Resolved {
        match self {
            EventCode::Preset(p) => Resolved::single(p.term()),
            EventCode::Native { code, component } => {
                Resolved::single(Term::new(*component, *code))
            }
            EventCode::Derived(f) => Resolved {
                terms: f.terms().iter().copied().collect(),
                op: Some(f.op()),
            },
        }
    }
}

// An event code flattened into the terms that occupy physical counters.
#[derive(Clone, Debug)]
pub(crate) struct Resolved {
    pub terms: ArrayVec<Term, MAX_TERMS>,
    pub op: Option<Op>,
}

impl Resolved {
    fn single(term: Term) -> Self {
        let mut terms = ArrayVec::new();
        terms.push(term);
        Self { terms, op: None }
    }

    pub fn is_derived(&self) -> bool {
        self.op.is_some()
    }

    /// Combines the per term counts into the event value.
    pub fn value<I>(&self, counts: I) -> u64
    where
        I: IntoIterator<Item = u64>,
    {
        let mut counts = counts.into_iter();
        match self.op {
            None | Some(Op::Add) => counts.fold(0, u64::wrapping_add),
            Some(Op::Sub) => {
                let first = counts.next().unwrap_or(0);
                counts.fold(first, u64::saturating_sub)
            }
        }
    }
}

/// A term as programmed into a physical counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HwEvent {
    pub term: Term,
    pub exclude: Domain,
    pub granularity: Granularity,
}
