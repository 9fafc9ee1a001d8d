use std::sync::Arc;

use super::{Stat, Status};
use crate::config::{ContextOpts, Opts};
use crate::driver::SimPmu;
use crate::error::{Error, Misuse};
use crate::event::{EventCode, Formula, Preset};
use crate::Context;

const EVENTS: [Preset; 4] = [Preset::TotIns, Preset::TotCyc, Preset::BrIns, Preset::BrMsp];

fn context(counters: usize) -> (Arc<SimPmu>, Context) {
    let pmu = Arc::new(SimPmu::new(counters));
    let opts = ContextOpts {
        background: false,
        ..Default::default()
    };
    let ctx = Context::new(pmu.clone(), opts).unwrap();
    (pmu, ctx)
}

fn misuse<T: std::fmt::Debug>(r: crate::Result<T>) -> Misuse {
    r.unwrap_err().misuse().unwrap()
}

#[test]
fn test_two_events_two_counters() {
    let (_, ctx) = context(2);
    let set = ctx.create();
    set.add(Preset::TotIns).unwrap();
    set.add(Preset::TotCyc).unwrap();
    set.start().unwrap();
    assert_eq!(set.status(), Status::Running);
    assert_eq!(ctx.slots_in_use(), 2);
}

#[test]
fn test_three_events_two_counters() {
    let (pmu, ctx) = context(2);
    let set = ctx.create();
    for p in &EVENTS[..3] {
        set.add(*p).unwrap();
    }
    let err = set.start().unwrap_err();
    assert!(matches!(err, Error::CapacityExceeded));
    assert_eq!(set.status(), Status::Stopped);
    assert_eq!(ctx.slots_in_use(), 0);
    assert!(pmu.programmed().is_empty());

    // Still stopped and editable.
    set.remove(Preset::BrIns).unwrap();
    set.start().unwrap();
}

#[test]
fn test_running_rejects_changes() {
    let (_, ctx) = context(2);
    let set = ctx.create();
    set.add(Preset::TotIns).unwrap();
    set.start().unwrap();

    assert_eq!(misuse(set.add(Preset::TotCyc)), Misuse::Running);
    assert_eq!(misuse(set.remove(Preset::TotIns)), Misuse::Running);
    assert_eq!(misuse(set.cleanup()), Misuse::Running);
    assert_eq!(misuse(set.set_multiplex()), Misuse::Running);
    assert_eq!(misuse(set.set_opts(Opts::default())), Misuse::Running);
    assert_eq!(misuse(set.destroy()), Misuse::Running);
    assert_eq!(misuse(set.start()), Misuse::Running);
    assert_eq!(set.num_events(), 1);
}

#[test]
fn test_state_errors() {
    let (_, ctx) = context(2);
    let set = ctx.create();
    assert_eq!(misuse(set.start()), Misuse::NoEvents);
    assert_eq!(misuse(set.stop()), Misuse::NotRunning);

    set.add(Preset::TotIns).unwrap();
    assert_eq!(misuse(set.add(Preset::TotIns)), Misuse::DuplicateEvent);
    assert!(matches!(set.remove(Preset::TotCyc), Err(Error::UnknownEvent)));
}

#[test]
fn test_add_rejects_oversized_event() {
    let (_, ctx) = context(2);
    let set = ctx.create();
    let terms = [Preset::TotIns.term(), Preset::TotCyc.term(), Preset::BrIns.term()];
    let err = set.add(Formula::sum(&terms).unwrap()).unwrap_err();
    assert!(matches!(err, Error::CapacityExceeded));
    assert_eq!(set.num_events(), 0);
}

#[test]
fn test_add_to_running_set() {
    let (_, ctx) = context(2);
    let set = ctx.create();
    set.add(Preset::TotIns).unwrap();
    set.start().unwrap();

    // The state is checked before the event itself.
    let terms = [Preset::TotCyc.term(), Preset::BrIns.term(), Preset::BrMsp.term()];
    assert_eq!(misuse(set.add(Formula::sum(&terms).unwrap())), Misuse::Running);
    assert_eq!(set.num_events(), 1);
}

#[test]
fn test_restart_starts_from_zero() {
    let (pmu, ctx) = context(2);
    let set = ctx.create();
    set.add(Preset::TotIns).unwrap();

    set.start().unwrap();
    pmu.emit(Preset::TotIns.term(), 100);
    assert_eq!(set.stop().unwrap(), vec![100]);
    assert_eq!(set.read().unwrap(), vec![100]);

    pmu.emit(Preset::TotIns.term(), 50);
    set.start().unwrap();
    pmu.emit(Preset::TotIns.term(), 7);
    assert_eq!(set.read().unwrap(), vec![7]);
}

#[test]
fn test_failed_start_leaves_nothing_bound() {
    let (pmu, ctx) = context(2);
    let set = ctx.create();
    set.add(Preset::TotIns).unwrap();
    set.add(Preset::TotCyc).unwrap();
    pmu.fail_program(1, true);

    assert!(matches!(set.start(), Err(Error::Driver(_))));
    assert_eq!(set.status(), Status::Stopped);
    assert_eq!(ctx.slots_in_use(), 0);
    assert!(pmu.programmed().is_empty());

    pmu.fail_program(1, false);
    set.start().unwrap();
    assert_eq!(ctx.slots_in_use(), 2);
}

#[test]
fn test_destroy() {
    let (_, ctx) = context(2);
    let set = ctx.create();
    set.add(Preset::TotIns).unwrap();
    assert_eq!(misuse(set.destroy()), Misuse::NotEmpty);

    set.cleanup().unwrap();
    set.destroy().unwrap();
    assert_eq!(set.status(), Status::Destroyed);
    assert_eq!(misuse(set.add(Preset::TotIns)), Misuse::Destroyed);
    assert_eq!(misuse(set.read()), Misuse::Destroyed);
    assert_eq!(misuse(set.destroy()), Misuse::Destroyed);
}

#[test]
fn test_accum_adds_and_zeroes() {
    let (pmu, ctx) = context(2);
    let set = ctx.create();
    set.add(Preset::TotIns).unwrap();
    set.add(Preset::TotCyc).unwrap();
    set.start().unwrap();

    let mut acc = [5, 0];
    pmu.emit(Preset::TotIns.term(), 10);
    set.accum(&mut acc).unwrap();
    assert_eq!(acc, [15, 0]);

    pmu.emit(Preset::TotIns.term(), 3);
    pmu.emit(Preset::TotCyc.term(), 4);
    set.accum(&mut acc).unwrap();
    assert_eq!(acc, [18, 4]);
    assert_eq!(set.read().unwrap(), vec![0, 0]);
}

#[test]
fn test_reset_while_running() {
    let (pmu, ctx) = context(2);
    let set = ctx.create();
    set.add(Preset::TotIns).unwrap();
    set.start().unwrap();

    pmu.emit(Preset::TotIns.term(), 10);
    set.reset().unwrap();
    pmu.emit(Preset::TotIns.term(), 5);
    assert_eq!(set.read().unwrap(), vec![5]);
}

#[test]
fn test_multiplexed_stats() {
    let (pmu, ctx) = context(2);
    let set = ctx.create();
    for p in EVENTS {
        set.add(p).unwrap();
    }
    set.set_multiplex().unwrap();
    set.start().unwrap();
    assert_eq!(ctx.slots_in_use(), 2);

    let mut last = vec![0; 4];
    for _ in 0..10 {
        for p in EVENTS {
            pmu.emit(p.term(), 100);
        }
        ctx.tick().unwrap();
        let counts = set.read().unwrap();
        assert!(counts.iter().zip(&last).all(|(c, l)| c >= l));
        last = counts;
    }

    let stats = set.stats().unwrap();
    for stat in stats {
        assert_eq!(
            stat,
            Stat {
                count: 500,
                ticks_enabled: 10,
                ticks_running: 5,
            }
        );
        assert_eq!(stat.scaled(), 1000);
    }
    assert_eq!(set.stop().unwrap(), vec![500; 4]);
    assert_eq!(ctx.slots_in_use(), 0);
}

#[test]
fn test_sets_share_counters() {
    let (_, ctx) = context(3);
    let a = ctx.create();
    a.add(Preset::TotIns).unwrap();
    a.add(Preset::TotCyc).unwrap();
    a.start().unwrap();

    let b = ctx.create();
    b.add(Preset::BrIns).unwrap();
    b.add(Preset::BrMsp).unwrap();
    assert!(matches!(b.start(), Err(Error::CapacityExceeded)));

    b.set_multiplex().unwrap();
    b.start().unwrap();
    assert_eq!(ctx.slots_in_use(), 3);

    a.stop().unwrap();
    ctx.tick().unwrap();
    assert_eq!(ctx.slots_in_use(), 2);
    assert!(b.stats().unwrap().iter().all(|s| s.ticks_enabled == 1));
}

#[test]
fn test_multiplexed_set_starts_on_busy_counters() {
    let (pmu, ctx) = context(2);
    let a = ctx.create();
    EVENTS.iter().for_each(|&p| a.add(p).unwrap());
    a.set_multiplex().unwrap();
    a.start().unwrap();
    for _ in 0..5 {
        ctx.tick().unwrap();
    }

    let b = ctx.create();
    b.add(Preset::L1Dcm).unwrap();
    b.set_multiplex().unwrap();
    b.start().unwrap();
    assert_eq!(ctx.slots_in_use(), 2);
    assert_eq!(b.read().unwrap(), vec![0]);

    for _ in 0..3 {
        pmu.emit(Preset::L1Dcm.term(), 100);
        ctx.tick().unwrap();
    }
    assert!(b.read().unwrap()[0] > 0);
    assert!(b.stats().unwrap()[0].ticks_running > 0);
    assert_eq!(ctx.slots_in_use(), 2);
}

#[test]
fn test_multiplexed_sets_take_turns() {
    let (pmu, ctx) = context(2);
    let a = ctx.create();
    EVENTS.iter().for_each(|&p| a.add(p).unwrap());
    a.set_multiplex().unwrap();
    let b = ctx.create();
    b.add(Preset::L1Dcm).unwrap();
    b.add(Preset::L1Icm).unwrap();
    b.set_multiplex().unwrap();
    a.start().unwrap();
    b.start().unwrap();

    // Six events on two counters: every pair is resident one tick in three.
    for _ in 0..12 {
        EVENTS.iter().for_each(|p| pmu.emit(p.term(), 10));
        pmu.emit(Preset::L1Dcm.term(), 10);
        pmu.emit(Preset::L1Icm.term(), 10);
        ctx.tick().unwrap();
        assert_eq!(ctx.slots_in_use(), 2);
    }

    for stats in [a.stats().unwrap(), b.stats().unwrap()] {
        for stat in stats {
            assert_eq!(stat.ticks_enabled, 12);
            assert_eq!(stat.ticks_running, 4);
            assert_eq!(stat.scaled(), stat.count * 3);
        }
    }
}

#[test]
fn test_drop_releases_counters() {
    let (pmu, ctx) = context(2);
    let set = ctx.create();
    set.add(Preset::TotIns).unwrap();
    set.start().unwrap();
    assert_eq!(ctx.slots_in_use(), 1);

    drop(set);
    assert_eq!(ctx.slots_in_use(), 0);
    assert!(pmu.programmed().is_empty());
}

#[test]
fn test_listing() {
    let (_, ctx) = context(2);
    let set = ctx.create();
    set.add(Preset::TotIns).unwrap();
    set.add(EventCode::Native {
        code: 0x1c2,
        component: 4,
    })
    .unwrap();
    assert_eq!(set.num_events(), 2);
    assert_eq!(set.events()[0], EventCode::Preset(Preset::TotIns));
    assert!(!set.is_multiplexed());
    assert_eq!(set.opts(), Opts::default());

    set.start().unwrap();
    assert_eq!(set.overflow_events(0b10), vec![1]);
    assert_eq!(set.overflow_events(0b100), Vec::<usize>::new());
}

#[test]
fn test_scaled_without_ticks() {
    let stat = Stat {
        count: 42,
        ticks_enabled: 0,
        ticks_running: 0,
    };
    assert_eq!(stat.scaled(), 42);

    let parked = Stat {
        count: 42,
        ticks_enabled: 3,
        ticks_running: 0,
    };
    assert_eq!(parked.scaled(), 0);
}
