use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by event set, scheduler and dispatcher operations.
///
/// Every operation that returns an error leaves the event set and the slot
/// pool exactly as they were before the call.
#[derive(Debug, Error)]
pub enum Error {
    /// The operation is not legal in the current event set state.
    #[error("invalid state: {0}")]
    InvalidState(Misuse),

    /// The event is not part of this event set, or the PMU cannot count it.
    #[error("unknown event")]
    UnknownEvent,

    /// Not enough physical counters to bind the event set.
    #[error("not enough physical counters")]
    CapacityExceeded,

    /// Overflow requested with neither interrupt support nor a polling fallback.
    #[error("not supported")]
    NotSupported,

    /// The PMU driver failed.
    #[error("driver error: {0}")]
    Driver(#[from] io::Error),
}

/// Why an operation was rejected with [`Error::InvalidState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Misuse {
    /// The event set is running.
    Running,
    /// The event set is not running.
    NotRunning,
    /// The event set still contains events.
    NotEmpty,
    /// The event set contains no events.
    NoEvents,
    /// The event set handle was destroyed.
    Destroyed,
    /// The event is already part of the event set.
    DuplicateEvent,
}

impl std::fmt::Display for Misuse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Misuse::Running => "event set is running",
            Misuse::NotRunning => "event set is not running",
            Misuse::NotEmpty => "event set is not empty",
            Misuse::NoEvents => "event set has no events",
            Misuse::Destroyed => "event set was destroyed",
            Misuse::DuplicateEvent => "event already in event set",
        };
        f.write_str(s)
    }
}

impl Error {
    /// Returns the refined reason of an [`Error::InvalidState`].
    pub fn misuse(&self) -> Option<Misuse> {
        match self {
            Error::InvalidState(m) => Some(*m),
            _ => None,
        }
    }
}
