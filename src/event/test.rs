use super::{EventCode, Formula, Op, Preset, Term, HARDWARE, MAX_TERMS};

#[test]
fn test_preset_code_round_trip() {
    let code = Preset::TotIns.code();
    assert_eq!(code & 0x8000_0000, 0x8000_0000);
    assert_eq!(Preset::from_code(code), Some(Preset::TotIns));
    assert_eq!(Preset::from_code(0x1234), None);
}

#[test]
fn test_resolve_preset() {
    let r = EventCode::from(Preset::TotCyc).resolve();
    assert!(!r.is_derived());
    assert_eq!(r.terms.as_slice(), &[Term::new(HARDWARE, 0)]);
}

#[test]
fn test_resolve_native() {
    let r = EventCode::Native {
        code: 0x1c2,
        component: 4,
    }
    .resolve();
    assert_eq!(r.terms.as_slice(), &[Term::raw(0x1c2)]);
}

#[test]
fn test_formula_bounds() {
    assert!(Formula::sum(&[]).is_none());

    let terms = [Term::raw(1); MAX_TERMS + 1];
    assert!(Formula::sum(&terms).is_none());
    assert!(Formula::sum(&terms[..MAX_TERMS]).is_some());
    assert!(Formula::diff(Term::raw(0), &terms[..MAX_TERMS]).is_none());
}

#[test]
fn test_derived_value() {
    let f = Formula::diff(Term::raw(1), &[Term::raw(2), Term::raw(3)]).unwrap();
    assert_eq!(f.op(), Op::Sub);

    let r = EventCode::from(f).resolve();
    assert!(r.is_derived());
    assert_eq!(r.value([100, 30, 20]), 50);
    assert_eq!(r.value([10, 30, 20]), 0);

    let r = EventCode::from(Formula::sum(&[Term::raw(1), Term::raw(2)]).unwrap()).resolve();
    assert_eq!(r.value([7, 8]), 15);
}
