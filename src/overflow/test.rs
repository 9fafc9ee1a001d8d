use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::{Overflow, OverflowHandler};
use crate::config::ContextOpts;
use crate::count::Status;
use crate::driver::SimPmu;
use crate::error::Error;
use crate::event::Preset;
use crate::Context;

fn context(pmu: &Arc<SimPmu>, software: bool) -> Context {
    let opts = ContextOpts {
        background: false,
        software_overflow: software,
        ..Default::default()
    };
    Context::new(pmu.clone(), opts).unwrap()
}

fn recorder() -> (OverflowHandler, Arc<Mutex<Vec<Overflow>>>) {
    let seen = Arc::new(Mutex::new(vec![]));
    let handler = {
        let seen = seen.clone();
        OverflowHandler::new(move |o| seen.lock().unwrap().push(o.clone()))
    };
    (handler, seen)
}

#[test]
fn test_interrupt_overflow() {
    let pmu = Arc::new(SimPmu::new(2));
    let ctx = context(&pmu, true);
    let set = ctx.create();
    set.add(Preset::TotCyc).unwrap();
    set.add(Preset::TotIns).unwrap();
    let (handler, seen) = recorder();
    set.set_overflow(Preset::TotIns, 100, handler).unwrap();
    set.start().unwrap();
    assert_eq!(pmu.period(1), Some(100));
    assert_eq!(pmu.period(0), None);

    pmu.emit(Preset::TotIns.term(), 250);
    assert_eq!(ctx.dispatch(), 1);
    assert_eq!(ctx.dispatch(), 0);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].event_set, set.id());
    assert_eq!(seen[0].events.as_slice(), &[1]);
    assert_eq!(seen[0].mask, 0b10);
    assert_eq!(set.overflow_events(seen[0].mask), vec![1]);
}

#[test]
fn test_pending_interrupts_coalesce() {
    let pmu = Arc::new(SimPmu::new(2));
    let ctx = context(&pmu, true);
    let set = ctx.create();
    set.add(Preset::TotIns).unwrap();
    let (handler, seen) = recorder();
    set.set_overflow(Preset::TotIns, 100, handler).unwrap();
    set.start().unwrap();

    pmu.emit(Preset::TotIns.term(), 100);
    pmu.emit(Preset::TotIns.term(), 100);
    assert_eq!(ctx.dispatch(), 1);
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(seen.lock().unwrap()[0].mask, 0b1);
}

#[test]
fn test_shared_handler_called_once() {
    let pmu = Arc::new(SimPmu::new(2));
    let ctx = context(&pmu, true);
    let set = ctx.create();
    set.add(Preset::TotIns).unwrap();
    set.add(Preset::TotCyc).unwrap();
    let (handler, seen) = recorder();
    set.set_overflow(Preset::TotIns, 10, handler.clone()).unwrap();
    set.set_overflow(Preset::TotCyc, 10, handler).unwrap();
    set.start().unwrap();

    pmu.emit(Preset::TotCyc.term(), 10);
    pmu.emit(Preset::TotIns.term(), 10);
    assert_eq!(ctx.dispatch(), 1);

    let seen = seen.lock().unwrap();
    assert_eq!(seen[0].events.as_slice(), &[0, 1]);
    assert_eq!(seen[0].mask, 0b11);
}

#[test]
fn test_cleared_registration_is_filtered() {
    let pmu = Arc::new(SimPmu::new(2));
    let ctx = context(&pmu, true);
    let set = ctx.create();
    set.add(Preset::TotIns).unwrap();
    let (handler, seen) = recorder();
    set.set_overflow(Preset::TotIns, 100, handler).unwrap();
    set.start().unwrap();

    pmu.emit(Preset::TotIns.term(), 250);
    set.clear_overflow(Preset::TotIns).unwrap();
    assert_eq!(pmu.period(0), None);
    assert_eq!(ctx.dispatch(), 0);
    assert!(seen.lock().unwrap().is_empty());

    // Reprogramming the counter lost nothing.
    pmu.emit(Preset::TotIns.term(), 10);
    assert_eq!(set.read().unwrap(), vec![260]);
}

#[test]
fn test_stop_discards_pending() {
    let pmu = Arc::new(SimPmu::new(1));
    let ctx = context(&pmu, true);
    let set = ctx.create();
    set.add(Preset::TotIns).unwrap();
    let (handler, seen) = recorder();
    set.set_overflow(Preset::TotIns, 100, handler).unwrap();
    set.start().unwrap();

    pmu.emit(Preset::TotIns.term(), 100);
    set.stop().unwrap();
    set.start().unwrap();
    assert_eq!(ctx.dispatch(), 0);
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn test_not_supported_without_fallback() {
    let pmu = Arc::new(SimPmu::without_interrupts(2));
    let ctx = context(&pmu, false);
    let set = ctx.create();
    set.add(Preset::TotIns).unwrap();
    let (handler, _) = recorder();
    let err = set.set_overflow(Preset::TotIns, 100, handler).unwrap_err();
    assert!(matches!(err, Error::NotSupported));

    // Clearing never needs support.
    set.clear_overflow(Preset::TotIns).unwrap();
}

#[test]
fn test_multiplex_needs_polling() {
    let pmu = Arc::new(SimPmu::new(2));
    let ctx = context(&pmu, false);
    let set = ctx.create();
    set.add(Preset::TotIns).unwrap();
    let (handler, _) = recorder();
    set.set_overflow(Preset::TotIns, 100, handler.clone()).unwrap();

    let err = set.set_multiplex().unwrap_err();
    assert!(matches!(err, Error::NotSupported));
    assert!(!set.is_multiplexed());

    set.clear_overflow(Preset::TotIns).unwrap();
    set.set_multiplex().unwrap();
    let err = set.set_overflow(Preset::TotIns, 100, handler).unwrap_err();
    assert!(matches!(err, Error::NotSupported));
}

#[test]
fn test_unknown_event() {
    let pmu = Arc::new(SimPmu::new(2));
    let ctx = context(&pmu, true);
    let set = ctx.create();
    set.add(Preset::TotIns).unwrap();
    let (handler, _) = recorder();

    let err = set.set_overflow(Preset::TotCyc, 100, handler).unwrap_err();
    assert!(matches!(err, Error::UnknownEvent));
    // Clearing an event that has no registration is fine.
    set.clear_overflow(Preset::TotIns).unwrap();
}

#[test]
fn test_polled_on_read() {
    let pmu = Arc::new(SimPmu::without_interrupts(2));
    let ctx = context(&pmu, true);
    let set = ctx.create();
    set.add(Preset::TotIns).unwrap();
    let (handler, seen) = recorder();
    set.set_overflow(Preset::TotIns, 100, handler).unwrap();
    set.start().unwrap();

    pmu.emit(Preset::TotIns.term(), 150);
    set.read().unwrap();
    assert_eq!(seen.lock().unwrap().len(), 1);
    set.read().unwrap();
    assert_eq!(seen.lock().unwrap().len(), 1);

    // Next deadline is 150 + 100.
    pmu.emit(Preset::TotIns.term(), 60);
    set.read().unwrap();
    assert_eq!(seen.lock().unwrap().len(), 1);
    pmu.emit(Preset::TotIns.term(), 40);
    set.read().unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].events.as_slice(), &[0]);
    assert_eq!(seen[1].address, None);
}

#[test]
fn test_force_software() {
    let pmu = Arc::new(SimPmu::new(2));
    let ctx = context(&pmu, true);
    let set = ctx.create();
    set.add(Preset::TotIns).unwrap();
    set.set_opts(crate::config::Opts {
        overflow: crate::config::OverflowMode::ForceSoftware,
        ..Default::default()
    })
    .unwrap();
    let (handler, seen) = recorder();
    set.set_overflow(Preset::TotIns, 100, handler).unwrap();
    set.start().unwrap();
    assert_eq!(pmu.period(0), None);

    pmu.emit(Preset::TotIns.term(), 100);
    assert_eq!(ctx.dispatch(), 0);
    ctx.tick().unwrap();
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[test]
fn test_nested_overflow_is_deferred() {
    let pmu = Arc::new(SimPmu::without_interrupts(2));
    let ctx = context(&pmu, true);
    let set = Arc::new(ctx.create());
    set.add(Preset::TotIns).unwrap();

    let depth = Arc::new(AtomicUsize::new(0));
    let deepest = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = {
        let (depth, deepest, calls) = (depth.clone(), deepest.clone(), calls.clone());
        let (pmu, set) = (pmu.clone(), Arc::downgrade(&set));
        OverflowHandler::new(move |_| {
            let d = depth.fetch_add(1, Ordering::SeqCst) + 1;
            deepest.fetch_max(d, Ordering::SeqCst);
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                // Crosses the next deadline from inside the handler.
                pmu.emit(Preset::TotIns.term(), 100);
                if let Some(set) = set.upgrade() {
                    set.read().unwrap();
                }
            }
            depth.fetch_sub(1, Ordering::SeqCst);
        })
    };
    set.set_overflow(Preset::TotIns, 100, handler).unwrap();
    set.start().unwrap();

    pmu.emit(Preset::TotIns.term(), 100);
    set.read().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(deepest.load(Ordering::SeqCst), 1);
}

#[test]
fn test_stop_from_handler() {
    let pmu = Arc::new(SimPmu::without_interrupts(2));
    let ctx = context(&pmu, true);
    let set = Arc::new(ctx.create());
    set.add(Preset::TotIns).unwrap();

    let handler = {
        let set = Arc::downgrade(&set);
        OverflowHandler::new(move |_| {
            if let Some(set) = set.upgrade() {
                set.stop().unwrap();
            }
        })
    };
    set.set_overflow(Preset::TotIns, 10, handler).unwrap();
    set.start().unwrap();

    pmu.emit(Preset::TotIns.term(), 10);
    set.read().unwrap();
    assert_eq!(set.status(), Status::Stopped);
    assert_eq!(ctx.slots_in_use(), 0);
}

#[test]
fn test_stop_waits_for_running_handler() {
    let pmu = Arc::new(SimPmu::new(2));
    let ctx = context(&pmu, true);
    let set = ctx.create();
    set.add(Preset::TotIns).unwrap();

    let (entered, wait) = channel();
    let done = Arc::new(AtomicBool::new(false));
    let handler = {
        let done = done.clone();
        OverflowHandler::new(move |_| {
            entered.send(()).unwrap();
            thread::sleep(Duration::from_millis(50));
            done.store(true, Ordering::SeqCst);
        })
    };
    set.set_overflow(Preset::TotIns, 10, handler).unwrap();
    set.start().unwrap();
    pmu.emit(Preset::TotIns.term(), 10);

    let dispatcher = {
        let ctx = ctx.clone();
        thread::spawn(move || ctx.dispatch())
    };
    wait.recv().unwrap();
    set.stop().unwrap();
    assert!(done.load(Ordering::SeqCst));
    assert_eq!(dispatcher.join().unwrap(), 1);
}

#[test]
fn test_new_handler_skips_earlier_overflow() {
    let pmu = Arc::new(SimPmu::new(2));
    let ctx = context(&pmu, true);
    let set = ctx.create();
    set.add(Preset::TotIns).unwrap();
    let (first, first_seen) = recorder();
    set.set_overflow(Preset::TotIns, 100, first).unwrap();
    set.start().unwrap();

    pmu.emit(Preset::TotIns.term(), 150);
    set.clear_overflow(Preset::TotIns).unwrap();
    let (second, second_seen) = recorder();
    set.set_overflow(Preset::TotIns, 100, second).unwrap();
    assert_eq!(ctx.dispatch(), 0);
    assert!(second_seen.lock().unwrap().is_empty());

    pmu.emit(Preset::TotIns.term(), 100);
    assert_eq!(ctx.dispatch(), 1);
    assert_eq!(second_seen.lock().unwrap().len(), 1);
    assert!(first_seen.lock().unwrap().is_empty());
    assert_eq!(set.read().unwrap(), vec![250]);
}

#[test]
fn test_overflow_address() {
    let pmu = Arc::new(SimPmu::new(1));
    let ctx = context(&pmu, true);
    let set = ctx.create();
    set.add(Preset::TotIns).unwrap();
    let (handler, seen) = recorder();
    set.set_overflow(Preset::TotIns, 10, handler).unwrap();
    set.start().unwrap();

    pmu.emit_at(Preset::TotIns.term(), 10, 0x4000);
    assert_eq!(ctx.dispatch(), 1);
    pmu.emit(Preset::TotIns.term(), 10);
    assert_eq!(ctx.dispatch(), 1);

    let seen = seen.lock().unwrap();
    assert_eq!(seen[0].address, Some(0x4000));
    assert_eq!(seen[1].address, None);
}

#[test]
fn test_interrupt_during_handler() {
    let pmu = Arc::new(SimPmu::new(2));
    let ctx = context(&pmu, true);
    let set = ctx.create();
    set.add(Preset::TotIns).unwrap();

    let depth = Arc::new(AtomicUsize::new(0));
    let deepest = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));
    let inner = Arc::new(AtomicUsize::new(usize::MAX));
    let handler = {
        let (depth, deepest, calls, inner) =
            (depth.clone(), deepest.clone(), calls.clone(), inner.clone());
        let (pmu, ctx) = (pmu.clone(), ctx.clone());
        OverflowHandler::new(move |_| {
            let d = depth.fetch_add(1, Ordering::SeqCst) + 1;
            deepest.fetch_max(d, Ordering::SeqCst);
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                // Two more crossings while this call is still running.
                pmu.emit(Preset::TotIns.term(), 100);
                pmu.emit(Preset::TotIns.term(), 100);
                inner.store(ctx.dispatch(), Ordering::SeqCst);
            }
            depth.fetch_sub(1, Ordering::SeqCst);
        })
    };
    set.set_overflow(Preset::TotIns, 100, handler).unwrap();
    set.start().unwrap();

    pmu.emit(Preset::TotIns.term(), 100);
    assert_eq!(ctx.dispatch(), 1);
    assert_eq!(inner.load(Ordering::SeqCst), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Both pending interrupts end up in a single call.
    assert_eq!(ctx.dispatch(), 1);
    assert_eq!(ctx.dispatch(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(deepest.load(Ordering::SeqCst), 1);
}
