/// Counting statistics of one event.
///
/// A multiplexed event only counts while it is resident, `ticks_running`
/// tells for how many of the scheduler ticks since the event set was started
/// (or reset) that was the case.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Stat {
    /// Raw count, as returned by [`EventSet::read`][super::EventSet::read].
    pub count: u64,

    /// Scheduler ticks the event set was running for.
    pub ticks_enabled: u64,

    /// Scheduler ticks the event was resident for.
    pub ticks_running: u64,
}

impl Stat {
    /// Extrapolates the count over the whole time the event set was running.
    ///
    /// ```rust
    /// use pmu_mux::count::Stat;
    ///
    /// let stat = Stat {
    ///     count: 500,
    ///     ticks_enabled: 10,
    ///     ticks_running: 5,
    /// };
    /// assert_eq!(stat.scaled(), 1000);
    /// ```
    pub fn scaled(&self) -> u64 {
        if self.ticks_running == 0 {
            return if self.ticks_enabled == 0 { self.count } else { 0 };
        }
        let scaled = self.count as u128 * self.ticks_enabled as u128 / self.ticks_running as u128;
        scaled.min(u64::MAX as u128) as u64
    }
}
