//! The process-wide engine state.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering as MemOrd};
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::ContextOpts;
use crate::count::state::SetState;
use crate::count::{EventSet, EventSetId};
use crate::driver::{Pmu, MAX_SLOTS};
use crate::error::{Error, Result};
use crate::mpx;
use crate::overflow::{self, Batch, Delivery, OverflowSink};
use crate::slot::SlotPool;


/// Locks `mutex`, ignoring poisoning.
///
/// A handler that panicked must not wedge the engine: every operation leaves
/// the state consistent before it can call out.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct SetCell {
    pub state: Mutex<SetState>,
    // Held while handlers of the set run.
    pub gate: Mutex<()>,
}

impl SetCell {
    pub fn new(state: SetState) -> Self {
        Self {
            state: Mutex::new(state),
            gate: Mutex::new(()),
        }
    }
}

pub(crate) struct Member {
    pub id: EventSetId,
    pub cell: Arc<SetCell>,
}

// Everything guarded by the global lock. Lock order: global, then set state.
pub(crate) struct Global {
    pub pool: SlotPool,
    pub running: Vec<Member>,
    pub tick: u64,
}

pub(crate) struct Shared {
    pub opts: ContextOpts,
    pub pmu: Arc<dyn Pmu>,
    pub sink: OverflowSink,
    pub global: Mutex<Global>,
    drain: Mutex<()>,
    lost_seen: AtomicU64,
    service: Mutex<Option<Service>>,
}

struct Service {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Owns the physical counters of a PMU and schedules the event sets sharing
/// them.
///
/// Cloning is cheap and every clone refers to the same engine. Event sets
/// keep their context alive.
///
/// Unless [`ContextOpts::background`] is turned off, a service thread rotates
/// multiplexed event sets every [`ContextOpts::multiplex_interval`] and
/// delivers interrupt-driven overflows every [`ContextOpts::poll_interval`].
#[derive(Clone)]
pub struct Context(pub(crate) Arc<Shared>);

impl Context {
    /// Takes over `pmu`.
    ///
    /// Fails with [`Error::NotSupported`] if the PMU has no counters or more
    /// than [`MAX_SLOTS`].
    pub fn new(pmu: Arc<dyn Pmu>, opts: ContextOpts) -> Result<Self> {
        let counters = pmu.counters();
        if counters == 0 || counters > MAX_SLOTS {
            return Err(Error::NotSupported);
        }

        let sink = OverflowSink::new(counters, opts.overflow_queue);
        if pmu.interrupts() {
            pmu.register_overflow_handler(sink.clone())?;
        }

        let background = opts.background;
        let shared = Arc::new(Shared {
            global: Mutex::new(Global {
                pool: SlotPool::new(counters, sink.clone()),
                running: vec![],
                tick: 0,
            }),
            opts,
            pmu,
            sink,
            drain: Mutex::new(()),
            lost_seen: AtomicU64::new(0),
            service: Mutex::new(None),
        });

        if background {
            let service = spawn(Arc::downgrade(&shared))?;
            *lock(&shared.service) = Some(service);
        }
        log::debug!("context created with {} counters", counters);
        Ok(Self(shared))
    }

    /// Creates an empty, stopped event set.
    pub fn create(&self) -> EventSet {
        EventSet::new(self.clone())
    }

    /// Runs one scheduler period.
    ///
    /// Every running event set folds its hardware progress, multiplexed sets
    /// due for rotation share the counters they hold and the free ones, and
    /// polled overflows are delivered. Every set is visited even if one
    /// fails, the first error is returned.
    pub fn tick(&self) -> Result<()> {
        let shared = &*self.0;
        let timestamp = shared.sink.now();
        let mut pending = vec![];
        let mut first = None;
        {
            let mut global = lock(&shared.global);
            global.tick += 1;
            let now = global.tick;
            let Global { pool, running, .. } = &mut *global;
            // Every running set is locked for the period: multiplexed sets
            // trade slots among themselves.
            let mut guards: Vec<MutexGuard<'_, SetState>> =
                running.iter().map(|member| lock(&member.cell.state)).collect();
            let mut sets: Vec<&mut SetState> =
                guards.iter_mut().map(|state| &mut **state).collect();
            let interval = shared.opts.multiplex_interval;
            let results = mpx::step(pool, &*shared.pmu, &mut sets, now, interval, timestamp);

            for ((member, state), result) in running.iter().zip(&sets).zip(results) {
                match result {
                    Ok(fired) if fired.is_empty() => {}
                    Ok(fired) => pending.push((Arc::clone(&member.cell), state.run, fired)),
                    Err(e) => {
                        log::warn!("{}: scheduler tick failed: {}", state.id, e);
                        first.get_or_insert(e);
                    }
                }
            }
        }

        for (cell, run, fired) in pending {
            overflow::deliver(&cell, run, fired);
        }
        first.map_or(Ok(()), Err)
    }

    /// Delivers pending interrupt-driven overflows, returns the number of
    /// handler calls.
    ///
    /// Records of counters that were released or rebound since the overflow
    /// are discarded. Returns 0 right away if another thread is dispatching.
    pub fn dispatch(&self) -> usize {
        let shared = &*self.0;
        let _drain = match shared.drain.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => return 0,
        };

        let lost = shared.sink.lost();
        let seen = shared.lost_seen.swap(lost, MemOrd::Relaxed);
        if lost > seen {
            log::warn!("{} overflow records lost, queue full", lost - seen);
        }

        let mut groups: Vec<(Arc<SetCell>, u64, Batch)> = vec![];
        {
            let global = lock(&shared.global);
            while let Some(record) = shared.sink.pop() {
                let Some(owner) = global.pool.resolve(record.slot, record.token) else {
                    log::trace!("discarding overflow of released slot {}", record.slot);
                    continue;
                };
                let Some(member) = global.running.iter().find(|m| m.id == owner.set) else {
                    continue;
                };

                let state = lock(&member.cell.state);
                let reg = state
                    .events
                    .get(owner.event)
                    .and_then(|ev| ev.overflow.as_ref())
                    .filter(|reg| reg.delivery == Delivery::Interrupt);
                let Some(reg) = reg else {
                    continue;
                };

                let pos = match groups.iter().position(|g| Arc::ptr_eq(&g.0, &member.cell)) {
                    Some(pos) => pos,
                    None => {
                        let address = (record.address != 0).then_some(record.address);
                        let at = Duration::from_nanos(record.at);
                        let batch = Batch::new(owner.set, address, at);
                        groups.push((Arc::clone(&member.cell), state.run, batch));
                        groups.len() - 1
                    }
                };
                groups[pos].2.add(&reg.handler, owner.event, 1u64 << record.slot);
            }
        }

        groups
            .into_iter()
            .map(|(cell, run, batch)| overflow::deliver(&cell, run, batch.into_fired()))
            .sum()
    }

    /// Overflow records dropped because the queue was full.
    pub fn lost_overflows(&self) -> u64 {
        self.0.sink.lost()
    }

    /// Physical counters currently bound to an event.
    pub fn slots_in_use(&self) -> usize {
        lock(&self.0.global).pool.in_use()
    }

    /// Physical counters of the PMU.
    pub fn counters(&self) -> usize {
        lock(&self.0.global).pool.capacity()
    }

    /// Stops the service thread and waits for it to exit.
    ///
    /// Event sets keep working, driven by [`tick`][Self::tick] and
    /// [`dispatch`][Self::dispatch].
    pub fn shutdown(&self) {
        let Some(service) = lock(&self.0.service).take() else {
            return;
        };
        drop(service.stop);
        if service.handle.thread().id() == thread::current().id() {
            return;
        }
        if service.handle.join().is_err() {
            log::warn!("service thread panicked");
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("opts", &self.0.opts)
            .field("sink", &self.0.sink)
            .finish()
    }
}

fn spawn(shared: Weak<Shared>) -> io::Result<Service> {
    let (stop, rx) = channel::<()>();
    let handle = thread::Builder::new()
        .name("pmu-mux".into())
        .spawn(move || {
            let mut last_tick = Instant::now();
            loop {
                let interval = match shared.upgrade() {
                    Some(shared) => shared.opts.poll_interval,
                    None => break,
                };
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    // Stopped, or the context is gone.
                    _ => break,
                }
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let ctx = Context(shared);
                ctx.dispatch();
                if last_tick.elapsed() >= ctx.0.opts.multiplex_interval {
                    last_tick = Instant::now();
                    // Failures are logged per event set.
                    let _ = ctx.tick();
                }
            }
        })?;
    Ok(Service { stop, handle })
}
