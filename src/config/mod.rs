use std::time::Duration;

/// Process-wide options, fixed when the [`Context`][crate::Context] is created.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ContextOpts {
    /// Period of the multiplex scheduler.
    ///
    /// Every running multiplexed event set gets its resident events rotated
    /// at most once per period.
    pub multiplex_interval: Duration,

    /// How often the service thread drains pending overflow records.
    pub poll_interval: Duration,

    /// Capacity of the ring that buffers interrupt-driven overflow records.
    ///
    /// Rounded up to a power of two. Records raised while the ring is full
    /// are dropped and counted in [`Context::lost_overflows`][crate::Context::lost_overflows].
    pub overflow_queue: usize,

    /// Allow overflow detection by polling when interrupts are unavailable.
    pub software_overflow: bool,

    /// Spawn the background service thread.
    ///
    /// Without it, the caller drives the scheduler with
    /// [`Context::tick`][crate::Context::tick] and delivers interrupt-driven
    /// overflows with [`Context::dispatch`][crate::Context::dispatch].
    pub background: bool,
}

impl Default for ContextOpts {
    fn default() -> Self {
        Self {
            multiplex_interval: Duration::from_millis(10),
            poll_interval: Duration::from_millis(1),
            overflow_queue: 256,
            software_overflow: true,
            background: true,
        }
    }
}

/// Per event set options.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Opts {
    /// Privilege levels excluded from counting.
    pub exclude: Domain,

    /// What is being counted.
    pub granularity: Granularity,

    /// Rotation period of this event set when multiplexed.
    ///
    /// Rounded up to whole scheduler periods, `None` rotates on every period.
    pub multiplex_interval: Option<Duration>,

    /// How overflows are detected.
    pub overflow: OverflowMode,
}

/// Privilege levels.
///
/// The engine passes this through to the driver untouched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Domain {
    /// User space.
    pub user: bool,

    /// Kernel space.
    pub kernel: bool,

    /// Hypervisor.
    pub hv: bool,
}

/// Counting scope of an event set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Granularity {
    /// The calling thread only.
    #[default]
    Thread,

    /// The calling thread and the threads it creates afterwards.
    Process,

    /// Every task on the current CPU.
    System,
}

/// Controls how overflows are detected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OverflowMode {
    /// Use counter interrupts when the PMU and the event allow it,
    /// polling otherwise.
    #[default]
    Auto,

    /// Always poll, even if the PMU can interrupt.
    ForceSoftware,
}
