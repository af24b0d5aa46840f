//! Property tests for the interval lattice: order laws the fixpoint
//! machinery relies on.

use proptest::prelude::*;
use solscope_core::domain::{Interval, IntervalKind};

const KIND: IntervalKind = IntervalKind::Uint { bits: 8 };

fn interval() -> impl Strategy<Value = Interval> {
    (0u16..=255, 0u16..=255).prop_map(|(a, b)| {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Interval::of_bigints(KIND, lo.into(), hi.into())
    })
}

fn interval_or_bottom() -> impl Strategy<Value = Interval> {
    prop_oneof![
        9 => interval(),
        1 => Just(Interval::bottom(KIND)),
    ]
}

proptest! {
    #[test]
    fn join_is_commutative(a in interval_or_bottom(), b in interval_or_bottom()) {
        prop_assert_eq!(a.join(&b), b.join(&a));
    }

    #[test]
    fn meet_is_commutative(a in interval_or_bottom(), b in interval_or_bottom()) {
        prop_assert_eq!(a.meet(&b), b.meet(&a));
    }

    #[test]
    fn join_is_associative(
        a in interval_or_bottom(),
        b in interval_or_bottom(),
        c in interval_or_bottom(),
    ) {
        prop_assert_eq!(a.join(&b).join(&c), a.join(&b.join(&c)));
    }

    #[test]
    fn join_and_meet_are_idempotent(a in interval_or_bottom()) {
        prop_assert_eq!(a.join(&a), a.clone());
        prop_assert_eq!(a.meet(&a), a.clone());
    }

    #[test]
    fn absorption(a in interval(), b in interval()) {
        prop_assert_eq!(a.join(&a.meet(&b)), a.clone());
        prop_assert_eq!(a.meet(&a.join(&b)), a.clone());
    }

    #[test]
    fn join_is_an_upper_bound(a in interval(), b in interval()) {
        let j = a.join(&b);
        prop_assert!(a.le(&j));
        prop_assert!(b.le(&j));
    }

    #[test]
    fn meet_is_a_lower_bound(a in interval(), b in interval()) {
        let m = a.meet(&b);
        prop_assert!(m.le(&a));
        prop_assert!(m.le(&b));
    }

    #[test]
    fn widen_covers_both_iterates(a in interval(), b in interval()) {
        let w = a.widen(&b);
        prop_assert!(a.le(&w));
        prop_assert!(b.le(&w));
    }

    #[test]
    fn widen_reaches_a_fixed_point(a in interval(), b in interval()) {
        let w = a.widen(&b);
        prop_assert_eq!(w.widen(&b), w);
    }

    #[test]
    fn narrow_never_widens(a in interval(), b in interval()) {
        let w = a.widen(&b);
        prop_assert!(w.narrow(&a.join(&b)).le(&w));
    }

    #[test]
    fn refine_lt_stays_within_operands(a in interval(), b in interval()) {
        let (l, r) = a.refine_lt(&b);
        prop_assert!(l.le(&a));
        prop_assert!(r.le(&b));
    }

    #[test]
    fn refine_eq_is_symmetric_meet(a in interval(), b in interval()) {
        let (l, r) = a.refine_eq(&b);
        prop_assert_eq!(l, a.meet(&b));
        prop_assert_eq!(r, b.meet(&a));
    }
}
