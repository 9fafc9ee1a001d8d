//! PMU drivers.
//!
//! The engine never touches hardware itself, it goes through a [`Pmu`]:
//! a fixed array of physical counter slots that can be programmed, read and
//! released one by one.

use std::io::Result;

use crate::event::{HwEvent, Term};

#[cfg(target_os = "linux")]
mod perf;
mod sim;

pub use crate::overflow::OverflowSink;
#[cfg(target_os = "linux")]
pub use perf::*;
pub use sim::*;

/// Upper bound on the number of counter slots of a PMU.
pub const MAX_SLOTS: usize = 64;

/// A performance monitoring unit with a fixed number of counter slots.
///
/// Slots are identified by their index in `0..counters()`. The engine
/// serializes `program` and `unprogram`, while `read` may be called
/// concurrently for different slots.
pub trait Pmu: Send + Sync {
    /// Number of physical counter slots, at most [`MAX_SLOTS`].
    fn counters(&self) -> usize;

    /// Whether `term` can be counted at all.
    fn supports(&self, term: &Term) -> bool {
        let _ = term;
        true
    }

    /// Whether the PMU can raise an interrupt when a counter overflows.
    fn interrupts(&self) -> bool;

    /// Raw value of the counter in `slot`.
    ///
    /// The value only ever grows while the slot stays programmed, wrapping
    /// at `u64::MAX`.
    fn read(&self, slot: usize) -> Result<u64>;

    /// Assigns `event` to `slot`.
    ///
    /// With `want_interrupt`, the PMU reports an overflow every `reset_value`
    /// counted events through the sink given to
    /// [`register_overflow_handler`][Self::register_overflow_handler]. The
    /// counter keeps counting across overflows.
    fn program(
        &self,
        slot: usize,
        event: &HwEvent,
        reset_value: u64,
        want_interrupt: bool,
    ) -> Result<()>;

    /// Stops counting in `slot`.
    fn unprogram(&self, slot: usize) -> Result<()>;

    /// Installs the process-wide overflow notification target.
    fn register_overflow_handler(&self, sink: OverflowSink) -> Result<()>;
}
