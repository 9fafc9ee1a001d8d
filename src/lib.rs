//! Event-set multiplexing and overflow dispatch over a small pool of hardware
//! performance counters.
//!
//! An [`EventSet`] groups events that are started, read and stopped as a unit.
//! Every event set of a [`Context`] competes for the same physical counters
//! of one [`Pmu`][driver::Pmu]. A set may hold more events than there are
//! counters once multiplexing is enabled: the scheduler then rotates which
//! events are resident, and each count covers only the periods its event
//! was resident.
//!
//! Handlers registered with [`EventSet::set_overflow`] are called each time
//! an event counts another `threshold` events, detected either by counter
//! interrupts or by polling.
//!
//! ## Example
//!
//! Multiplex four events over two counters and get notified every 1000
//! instructions.
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! use pmu_mux::config::ContextOpts;
//! use pmu_mux::driver::SimPmu;
//! use pmu_mux::event::Preset;
//! use pmu_mux::overflow::OverflowHandler;
//! use pmu_mux::Context;
//!
//! let pmu = Arc::new(SimPmu::new(2));
//! let opts = ContextOpts {
//!     background: false, // Drive the scheduler by hand.
//!     ..Default::default()
//! };
//! let ctx = Context::new(pmu.clone(), opts).unwrap();
//!
//! let events = [Preset::TotIns, Preset::TotCyc, Preset::BrIns, Preset::BrMsp];
//! let set = ctx.create();
//! for event in events {
//!     set.add(event).unwrap();
//! }
//! set.set_multiplex().unwrap();
//!
//! let calls = Arc::new(AtomicUsize::new(0));
//! let handler = {
//!     let calls = calls.clone();
//!     OverflowHandler::new(move |_| {
//!         calls.fetch_add(1, Ordering::Relaxed);
//!     })
//! };
//! set.set_overflow(Preset::TotIns, 1000, handler).unwrap();
//!
//! set.start().unwrap();
//! for _ in 0..10 {
//!     for event in events {
//!         pmu.emit(event.term(), 500);
//!     }
//!     ctx.tick().unwrap();
//! }
//! let counts = set.stop().unwrap();
//!
//! // Every event was resident for half of the periods.
//! assert_eq!(counts, vec![2500; 4]);
//! assert_eq!(calls.load(Ordering::Relaxed), 2);
//! ```

pub mod config;
mod context;
pub mod count;
pub mod driver;
pub mod error;
pub mod event;
#[cfg(target_os = "linux")]
mod ffi;
mod mpx;
pub mod overflow;
mod slot;

pub use context::Context;
pub use count::EventSet;
pub use error::{Error, Result};
