use arrayvec::ArrayVec;

use super::{Term, MAX_TERMS};

/// How the terms of a derived event are combined.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Op {
    /// Sum of all terms.
    Add,
    /// First term minus the others, saturating at zero.
    Sub,
}

/// Formula of a derived event.
///
/// A derived event needs one physical counter per term, and it only counts
/// while all of them are resident.
///
/// ```rust
/// use pmu_mux::event::{Formula, Preset};
///
/// let non_branch = Formula::diff(Preset::TotIns.term(), &[Preset::BrIns.term()]).unwrap();
/// assert_eq!(non_branch.terms().len(), 2);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Formula {
    op: Op,
    terms: ArrayVec<Term, MAX_TERMS>,
}

impl Formula {
    /// Returns `None` if `terms` is empty or longer than [`MAX_TERMS`].
    pub fn new(op: Op, terms: &[Term]) -> Option<Self> {
        if terms.is_empty() {
            return None;
        }
        let terms = ArrayVec::try_from(terms).ok()?;
        Some(Self { op, terms })
    }

    pub fn sum(terms: &[Term]) -> Option<Self> {
        Self::new(Op::Add, terms)
    }

    pub fn diff(minuend: Term, subtrahends: &[Term]) -> Option<Self> {
        let mut terms = ArrayVec::<Term, MAX_TERMS>::new();
        terms.try_push(minuend).ok()?;
        terms.try_extend_from_slice(subtrahends).ok()?;
        Self::new(Op::Sub, &terms)
    }

    pub fn op(&self) -> Op {
        self.op
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }
}
