//! Interval lattice over machine-integer and boolean kinds.
//!
//! Bounds are arbitrary-precision so `uint256` ranges are exact. Widening
//! drives a growing bound to the corresponding infinity; the infinity is
//! clamped back to the kind's bit width whenever a concrete bound is
//! needed (arithmetic, comparison, display).

use std::fmt;

use num_bigint::BigInt;
use num_traits::{One, Signed, ToPrimitive, Zero};
use serde::{Deserialize, Serialize};

/// One end of an interval. `NegInf`/`PosInf` only appear after widening.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Bound {
    NegInf,
    Finite(BigInt),
    PosInf,
}

impl Bound {
    pub fn finite(v: impl Into<BigInt>) -> Self {
        Bound::Finite(v.into())
    }

    pub fn is_infinite(&self) -> bool {
        !matches!(self, Bound::Finite(_))
    }
}

/// Value kind an interval ranges over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntervalKind {
    Int { bits: u16 },
    Uint { bits: u16 },
    Bool,
}

impl IntervalKind {
    pub const UINT256: IntervalKind = IntervalKind::Uint { bits: 256 };
    pub const INT256: IntervalKind = IntervalKind::Int { bits: 256 };
    /// Addresses are modelled as 160-bit unsigned values.
    pub const ADDRESS: IntervalKind = IntervalKind::Uint { bits: 160 };

    pub fn is_signed(&self) -> bool {
        matches!(self, IntervalKind::Int { .. })
    }

    pub fn bits(&self) -> u16 {
        match self {
            IntervalKind::Int { bits } | IntervalKind::Uint { bits } => *bits,
            IntervalKind::Bool => 1,
        }
    }

    /// Smallest representable value of the kind.
    pub fn min_value(&self) -> BigInt {
        match self {
            IntervalKind::Uint { .. } | IntervalKind::Bool => BigInt::zero(),
            IntervalKind::Int { bits } => -(BigInt::one() << (usize::from(*bits) - 1)),
        }
    }

    /// Largest representable value of the kind.
    pub fn max_value(&self) -> BigInt {
        match self {
            IntervalKind::Uint { bits } => (BigInt::one() << usize::from(*bits)) - 1,
            IntervalKind::Int { bits } => (BigInt::one() << (usize::from(*bits) - 1)) - 1,
            IntervalKind::Bool => BigInt::one(),
        }
    }
}

/// A closed interval `[lo, hi]` of the given kind; `range == None` is
/// bottom (the empty set).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub kind: IntervalKind,
    pub range: Option<(Bound, Bound)>,
}

impl Interval {
    pub fn bottom(kind: IntervalKind) -> Self {
        Interval { kind, range: None }
    }

    /// The full representable range of the kind.
    pub fn top(kind: IntervalKind) -> Self {
        Interval {
            kind,
            range: Some((Bound::Finite(kind.min_value()), Bound::Finite(kind.max_value()))),
        }
    }

    pub fn singleton(kind: IntervalKind, v: impl Into<BigInt>) -> Self {
        let v = v.into();
        Interval::of_bigints(kind, v.clone(), v)
    }

    /// Builds `[lo, hi]` clamped to the kind's representable range.
    /// A range that falls entirely outside the kind collapses to bottom.
    pub fn of_bigints(kind: IntervalKind, lo: BigInt, hi: BigInt) -> Self {
        let kmin = kind.min_value();
        let kmax = kind.max_value();
        let lo = if lo < kmin { kmin.clone() } else { lo };
        let hi = if hi > kmax { kmax } else { hi };
        if lo > hi {
            return Interval::bottom(kind);
        }
        Interval { kind, range: Some((Bound::Finite(lo), Bound::Finite(hi))) }
    }

    pub fn of_bounds(kind: IntervalKind, lo: Bound, hi: Bound) -> Self {
        if let (Bound::Finite(a), Bound::Finite(b)) = (&lo, &hi) {
            if a > b {
                return Interval::bottom(kind);
            }
        }
        Interval { kind, range: Some((lo, hi)) }
    }

    pub fn bool_true() -> Self {
        Interval::singleton(IntervalKind::Bool, 1)
    }

    pub fn bool_false() -> Self {
        Interval::singleton(IntervalKind::Bool, 0)
    }

    pub fn bool_unknown() -> Self {
        Interval::top(IntervalKind::Bool)
    }

    pub fn is_bottom(&self) -> bool {
        self.range.is_none()
    }

    pub fn is_top(&self) -> bool {
        match self.finite_bounds() {
            Some((lo, hi)) => lo == self.kind.min_value() && hi == self.kind.max_value(),
            None => false,
        }
    }

    /// Concrete bounds with any widened infinity clamped to the kind.
    pub fn finite_bounds(&self) -> Option<(BigInt, BigInt)> {
        let (lo, hi) = self.range.as_ref()?;
        let lo = match lo {
            Bound::NegInf => self.kind.min_value(),
            Bound::Finite(v) => v.clone(),
            Bound::PosInf => self.kind.max_value(),
        };
        let hi = match hi {
            Bound::PosInf => self.kind.max_value(),
            Bound::Finite(v) => v.clone(),
            Bound::NegInf => self.kind.min_value(),
        };
        if lo > hi {
            None
        } else {
            Some((lo, hi))
        }
    }

    /// The interval with infinities replaced by the kind's extremes.
    pub fn materialized(&self) -> Interval {
        match self.finite_bounds() {
            Some((lo, hi)) => Interval::of_bigints(self.kind, lo, hi),
            None => Interval::bottom(self.kind),
        }
    }

    pub fn contains(&self, v: &BigInt) -> bool {
        match self.finite_bounds() {
            Some((lo, hi)) => &lo <= v && v <= &hi,
            None => false,
        }
    }

    pub fn as_singleton(&self) -> Option<BigInt> {
        let (lo, hi) = self.finite_bounds()?;
        if lo == hi {
            Some(lo)
        } else {
            None
        }
    }

    // --- lattice ---

    pub fn join(&self, other: &Interval) -> Interval {
        match (&self.range, &other.range) {
            (None, _) => other.with_kind(self.kind),
            (_, None) => self.clone(),
            (Some((a_lo, a_hi)), Some((b_lo, b_hi))) => Interval::of_bounds(
                self.kind,
                a_lo.clone().min(b_lo.clone()),
                a_hi.clone().max(b_hi.clone()),
            ),
        }
    }

    pub fn meet(&self, other: &Interval) -> Interval {
        match (&self.range, &other.range) {
            (None, _) | (_, None) => Interval::bottom(self.kind),
            (Some((a_lo, a_hi)), Some((b_lo, b_hi))) => {
                let lo = a_lo.clone().max(b_lo.clone());
                let hi = a_hi.clone().min(b_hi.clone());
                if let (Bound::Finite(l), Bound::Finite(h)) = (&lo, &hi) {
                    if l > h {
                        return Interval::bottom(self.kind);
                    }
                }
                if lo == Bound::PosInf && hi != Bound::PosInf {
                    return Interval::bottom(self.kind);
                }
                if hi == Bound::NegInf && lo != Bound::NegInf {
                    return Interval::bottom(self.kind);
                }
                Interval { kind: self.kind, range: Some((lo, hi)) }
            }
        }
    }

    /// `self` ⊆ `other`.
    pub fn le(&self, other: &Interval) -> bool {
        match (&self.range, &other.range) {
            (None, _) => true,
            (_, None) => false,
            (Some((a_lo, a_hi)), Some((b_lo, b_hi))) => b_lo <= a_lo && a_hi <= b_hi,
        }
    }

    /// Classic interval widening: a bound that moved past the previous
    /// one jumps to the corresponding infinity. `self` is the previous
    /// iterate, `next` the new one.
    pub fn widen(&self, next: &Interval) -> Interval {
        match (&self.range, &next.range) {
            (None, _) => next.with_kind(self.kind),
            (_, None) => self.clone(),
            (Some((p_lo, p_hi)), Some((n_lo, n_hi))) => {
                let lo = if n_lo < p_lo { Bound::NegInf } else { p_lo.clone() };
                let hi = if n_hi > p_hi { Bound::PosInf } else { p_hi.clone() };
                Interval { kind: self.kind, range: Some((lo, hi)) }
            }
        }
    }

    /// Narrowing: only bounds currently at an infinity are refined with
    /// the other operand's bound.
    pub fn narrow(&self, other: &Interval) -> Interval {
        match (&self.range, &other.range) {
            (None, _) => Interval::bottom(self.kind),
            (_, None) => Interval::bottom(self.kind),
            (Some((s_lo, s_hi)), Some((o_lo, o_hi))) => {
                let lo = if *s_lo == Bound::NegInf { o_lo.clone() } else { s_lo.clone() };
                let hi = if *s_hi == Bound::PosInf { o_hi.clone() } else { s_hi.clone() };
                Interval::of_bounds(self.kind, lo, hi)
            }
        }
    }

    /// Re-types the interval, clamping bounds to the new kind.
    pub fn with_kind(&self, kind: IntervalKind) -> Interval {
        if self.kind == kind {
            return self.clone();
        }
        match self.finite_bounds() {
            Some((lo, hi)) => Interval::of_bigints(kind, lo, hi),
            None => Interval::bottom(kind),
        }
    }

    // --- arithmetic (corner-combination, bottom absorbing) ---

    fn corner_op(
        &self,
        rhs: &Interval,
        kind: IntervalKind,
        f: impl Fn(&BigInt, &BigInt) -> Option<BigInt>,
    ) -> Interval {
        let (a_lo, a_hi) = match self.finite_bounds() {
            Some(b) => b,
            None => return Interval::bottom(kind),
        };
        let (b_lo, b_hi) = match rhs.finite_bounds() {
            Some(b) => b,
            None => return Interval::bottom(kind),
        };
        let mut lo: Option<BigInt> = None;
        let mut hi: Option<BigInt> = None;
        for x in [&a_lo, &a_hi] {
            for y in [&b_lo, &b_hi] {
                match f(x, y) {
                    Some(v) => {
                        if lo.as_ref().map_or(true, |cur| &v < cur) {
                            lo = Some(v.clone());
                        }
                        if hi.as_ref().map_or(true, |cur| &v > cur) {
                            hi = Some(v);
                        }
                    }
                    // A corner the closure cannot evaluate (e.g. an
                    // astronomically large exponent) loses all precision.
                    None => return Interval::top(kind),
                }
            }
        }
        match (lo, hi) {
            (Some(lo), Some(hi)) => Interval::of_bigints(kind, lo, hi),
            _ => Interval::bottom(kind),
        }
    }

    pub fn add(&self, rhs: &Interval) -> Interval {
        self.corner_op(rhs, self.kind, |a, b| Some(a + b))
    }

    pub fn sub(&self, rhs: &Interval) -> Interval {
        self.corner_op(rhs, self.kind, |a, b| Some(a - b))
    }

    pub fn mul(&self, rhs: &Interval) -> Interval {
        self.corner_op(rhs, self.kind, |a, b| Some(a * b))
    }

    /// Truncating division. A divisor that may be zero yields bottom.
    pub fn div(&self, rhs: &Interval) -> Interval {
        if rhs.may_be_zero() {
            return Interval::bottom(self.kind);
        }
        self.corner_op(rhs, self.kind, |a, b| Some(a / b))
    }

    /// Conservative remainder: `[0, |d|max - 1]` for non-negative
    /// dividends, symmetric around zero when the dividend may be
    /// negative. A divisor that may be zero yields bottom.
    pub fn rem(&self, rhs: &Interval) -> Interval {
        if rhs.may_be_zero() {
            return Interval::bottom(self.kind);
        }
        let (d_lo, d_hi) = match self.finite_bounds() {
            Some(b) => b,
            None => return Interval::bottom(self.kind),
        };
        let (r_lo, r_hi) = match rhs.finite_bounds() {
            Some(b) => b,
            None => return Interval::bottom(self.kind),
        };
        let abs_max = r_lo.abs().max(r_hi.abs());
        let cap = &abs_max - 1;
        // A dividend already inside [0, |d|min) is untouched by `%`.
        let abs_min = r_lo.abs().min(r_hi.abs());
        if d_lo >= BigInt::zero() && d_hi < abs_min {
            return Interval::of_bigints(self.kind, d_lo, d_hi);
        }
        if d_lo >= BigInt::zero() {
            Interval::of_bigints(self.kind, BigInt::zero(), cap)
        } else {
            Interval::of_bigints(self.kind, -cap.clone(), cap)
        }
    }

    pub fn pow(&self, rhs: &Interval) -> Interval {
        let (b_lo, _) = match self.finite_bounds() {
            Some(b) => b,
            None => return Interval::bottom(self.kind),
        };
        if rhs.is_bottom() {
            return Interval::bottom(self.kind);
        }
        // Sign alternation under a negative base defeats corner
        // evaluation; fall back to the type range.
        if b_lo < BigInt::zero() {
            return Interval::top(self.kind);
        }
        self.corner_op(rhs, self.kind, |a, b| {
            if b < &BigInt::zero() {
                return None;
            }
            let e = b.to_u32()?;
            if e > 1024 {
                return None;
            }
            Some(a.pow(e))
        })
    }

    pub fn shl(&self, rhs: &Interval) -> Interval {
        self.corner_op(rhs, self.kind, |a, b| {
            let s = b.to_u32()?;
            if s > 1024 {
                return None;
            }
            Some(a << s)
        })
    }

    pub fn shr(&self, rhs: &Interval) -> Interval {
        self.corner_op(rhs, self.kind, |a, b| {
            let s = b.to_u32()?;
            if s > 1024 {
                return None;
            }
            Some(a >> s)
        })
    }

    pub fn bitand(&self, rhs: &Interval) -> Interval {
        self.bitwise(rhs, true)
    }

    pub fn bitor(&self, rhs: &Interval) -> Interval {
        self.bitwise(rhs, false)
    }

    pub fn bitxor(&self, rhs: &Interval) -> Interval {
        self.bitwise(rhs, false)
    }

    fn bitwise(&self, rhs: &Interval, is_and: bool) -> Interval {
        let (a_lo, a_hi) = match self.finite_bounds() {
            Some(b) => b,
            None => return Interval::bottom(self.kind),
        };
        let (b_lo, b_hi) = match rhs.finite_bounds() {
            Some(b) => b,
            None => return Interval::bottom(self.kind),
        };
        if self.kind.is_signed() && (a_lo < BigInt::zero() || b_lo < BigInt::zero()) {
            return Interval::top(self.kind);
        }
        if is_and {
            Interval::of_bigints(self.kind, BigInt::zero(), a_hi.min(b_hi))
        } else {
            // `|` and `^` can set any bit up to the widest operand.
            let widest = a_hi.max(b_hi);
            Interval::of_bigints(self.kind, BigInt::zero(), next_bit_ceiling(&widest))
        }
    }

    pub fn neg(&self) -> Interval {
        match self.finite_bounds() {
            Some((lo, hi)) => Interval::of_bigints(self.kind, -hi, -lo),
            None => Interval::bottom(self.kind),
        }
    }

    pub fn may_be_zero(&self) -> bool {
        self.contains(&BigInt::zero())
    }

    // --- boolean algebra (three-valued) ---

    pub fn is_definitely_true(&self) -> bool {
        self.finite_bounds().map_or(false, |(lo, _)| lo.is_one())
    }

    pub fn is_definitely_false(&self) -> bool {
        self.finite_bounds().map_or(false, |(_, hi)| hi.is_zero())
    }

    pub fn logical_and(&self, rhs: &Interval) -> Interval {
        if self.is_bottom() || rhs.is_bottom() {
            return Interval::bool_unknown();
        }
        if self.is_definitely_false() || rhs.is_definitely_false() {
            Interval::bool_false()
        } else if self.is_definitely_true() && rhs.is_definitely_true() {
            Interval::bool_true()
        } else {
            Interval::bool_unknown()
        }
    }

    pub fn logical_or(&self, rhs: &Interval) -> Interval {
        if self.is_bottom() || rhs.is_bottom() {
            return Interval::bool_unknown();
        }
        if self.is_definitely_true() || rhs.is_definitely_true() {
            Interval::bool_true()
        } else if self.is_definitely_false() && rhs.is_definitely_false() {
            Interval::bool_false()
        } else {
            Interval::bool_unknown()
        }
    }

    pub fn logical_not(&self) -> Interval {
        if self.is_bottom() {
            return Interval::bool_unknown();
        }
        if self.is_definitely_true() {
            Interval::bool_false()
        } else if self.is_definitely_false() {
            Interval::bool_true()
        } else {
            Interval::bool_unknown()
        }
    }

    // --- comparison evaluation (Bool-kinded results) ---

    pub fn cmp_lt(&self, rhs: &Interval) -> Interval {
        let (a, b) = match (self.finite_bounds(), rhs.finite_bounds()) {
            (Some(a), Some(b)) => (a, b),
            _ => return Interval::bool_unknown(),
        };
        if a.1 < b.0 {
            Interval::bool_true()
        } else if a.0 >= b.1 {
            Interval::bool_false()
        } else {
            Interval::bool_unknown()
        }
    }

    pub fn cmp_le(&self, rhs: &Interval) -> Interval {
        let (a, b) = match (self.finite_bounds(), rhs.finite_bounds()) {
            (Some(a), Some(b)) => (a, b),
            _ => return Interval::bool_unknown(),
        };
        if a.1 <= b.0 {
            Interval::bool_true()
        } else if a.0 > b.1 {
            Interval::bool_false()
        } else {
            Interval::bool_unknown()
        }
    }

    pub fn cmp_gt(&self, rhs: &Interval) -> Interval {
        rhs.cmp_lt(self)
    }

    pub fn cmp_ge(&self, rhs: &Interval) -> Interval {
        rhs.cmp_le(self)
    }

    pub fn cmp_eq(&self, rhs: &Interval) -> Interval {
        let (a, b) = match (self.finite_bounds(), rhs.finite_bounds()) {
            (Some(a), Some(b)) => (a, b),
            _ => return Interval::bool_unknown(),
        };
        if a.0 == a.1 && b.0 == b.1 && a.0 == b.0 {
            Interval::bool_true()
        } else if a.1 < b.0 || b.1 < a.0 {
            Interval::bool_false()
        } else {
            Interval::bool_unknown()
        }
    }

    pub fn cmp_ne(&self, rhs: &Interval) -> Interval {
        self.cmp_eq(rhs).logical_not()
    }

    // --- branch refinement primitives ---

    /// Tightens `(self, rhs)` under the assumption `self < rhs`: the
    /// left loses every value at or above the right's minimum, then the
    /// right loses every value at or below the refined left's maximum.
    /// An infinite bound refines nothing on its side.
    pub fn refine_lt(&self, rhs: &Interval) -> (Interval, Interval) {
        let (a, b) = match (&self.range, &rhs.range) {
            (Some(a), Some(b)) => (a.clone(), b.clone()),
            _ => return (self.clone(), rhs.clone()),
        };
        let new_a = match &b.0 {
            Bound::Finite(b_lo) => self.meet(&Interval::of_bounds(
                self.kind,
                a.0,
                Bound::Finite(b_lo - 1),
            )),
            _ => self.clone(),
        };
        if new_a.is_bottom() {
            return (new_a, rhs.clone());
        }
        let new_b = match new_a.range.as_ref().map(|(_, hi)| hi) {
            Some(Bound::Finite(a_hi)) => rhs.meet(&Interval::of_bounds(
                rhs.kind,
                Bound::Finite(a_hi + 1),
                b.1,
            )),
            _ => rhs.clone(),
        };
        (new_a, new_b)
    }

    /// Tightens `(self, rhs)` under the assumption `self > rhs`; the
    /// mirror of [`refine_lt`](Interval::refine_lt), clamping the left
    /// first.
    pub fn refine_gt(&self, rhs: &Interval) -> (Interval, Interval) {
        let (a, b) = match (&self.range, &rhs.range) {
            (Some(a), Some(b)) => (a.clone(), b.clone()),
            _ => return (self.clone(), rhs.clone()),
        };
        let new_a = match &b.1 {
            Bound::Finite(b_hi) => self.meet(&Interval::of_bounds(
                self.kind,
                Bound::Finite(b_hi + 1),
                a.1,
            )),
            _ => self.clone(),
        };
        if new_a.is_bottom() {
            return (new_a, rhs.clone());
        }
        let new_b = match new_a.range.as_ref().map(|(lo, _)| lo) {
            Some(Bound::Finite(a_lo)) => rhs.meet(&Interval::of_bounds(
                rhs.kind,
                b.0,
                Bound::Finite(a_lo - 1),
            )),
            _ => rhs.clone(),
        };
        (new_a, new_b)
    }

    /// `<=` refines to the join of the strict and the equality cases.
    pub fn refine_le(&self, rhs: &Interval) -> (Interval, Interval) {
        let (lt_a, lt_b) = self.refine_lt(rhs);
        let (eq_a, eq_b) = self.refine_eq(rhs);
        (lt_a.join(&eq_a), lt_b.join(&eq_b))
    }

    pub fn refine_ge(&self, rhs: &Interval) -> (Interval, Interval) {
        let (gt_a, gt_b) = self.refine_gt(rhs);
        let (eq_a, eq_b) = self.refine_eq(rhs);
        (gt_a.join(&eq_a), gt_b.join(&eq_b))
    }

    pub fn refine_eq(&self, rhs: &Interval) -> (Interval, Interval) {
        let m = self.meet(&rhs.with_kind(self.kind));
        (m.clone(), m.with_kind(rhs.kind))
    }

    /// `!=` only refines when both sides are the same singleton, in
    /// which case the assumption is contradictory.
    pub fn refine_ne(&self, rhs: &Interval) -> (Interval, Interval) {
        if let (Some(a), Some(b)) = (self.as_singleton(), rhs.as_singleton()) {
            if a == b {
                return (Interval::bottom(self.kind), Interval::bottom(rhs.kind));
            }
        }
        (self.clone(), rhs.clone())
    }
}

/// Smallest `2^k - 1` covering `v`; bound for `|`/`^` results.
fn next_bit_ceiling(v: &BigInt) -> BigInt {
    if v <= &BigInt::zero() {
        return BigInt::zero();
    }
    let bits = v.bits();
    (BigInt::one() << bits) - 1
}

/// Estimated trip count for a loop guarded by `left OP right`, used as
/// the narrowing-pass budget. `!=` guards get a flat estimate.
pub fn estimate_trip_count(left: &Interval, right: &Interval, op: crate::ir::BinOp) -> u32 {
    use crate::ir::BinOp;
    let diff = |a: &Interval, b: &Interval| -> Option<BigInt> {
        let (a_lo, _) = a.finite_bounds()?;
        let (_, b_hi) = b.finite_bounds()?;
        Some(&b_hi - &a_lo)
    };
    let est: Option<BigInt> = match op {
        BinOp::Lt => diff(left, right),
        BinOp::Le => diff(left, right).map(|d| d + 1),
        BinOp::Gt => diff(right, left),
        BinOp::Ge => diff(right, left).map(|d| d + 1),
        BinOp::Ne => Some(BigInt::from(10)),
        _ => None,
    };
    match est.and_then(|e| e.to_u32()) {
        Some(n) => n.clamp(1, 20),
        None => 20,
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.finite_bounds() {
            Some((lo, hi)) => write!(f, "[{},{}]", lo, hi),
            None => write!(f, "[bottom]"),
        }
    }
}
