//! Core pattern engine
//!
//! A pattern is a pure function from a time span to the events (haps) that
//! occur inside it. Time is exact rational arithmetic throughout; floats only
//! appear at the edges (continuous signal values, wall-clock conversion).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Fraction type for rational time values
///
/// Always stored reduced with a positive denominator, so equality and hashing
/// are structural. Arithmetic goes through i128 intermediates and panics on
/// genuine i64 overflow rather than silently wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fraction {
    pub numerator: i64,
    pub denominator: i64,
}

fn gcd(a: i128, b: i128) -> i128 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

impl Fraction {
    pub fn new(n: i64, d: i64) -> Self {
        Self::from_i128(n as i128, d as i128)
    }

    fn from_i128(n: i128, d: i128) -> Self {
        if d == 0 {
            panic!("fraction with zero denominator");
        }
        let g = gcd(n.abs(), d.abs()).max(1);
        let sign = d.signum();
        let n = n / g * sign;
        let d = d.abs() / g;
        if n > i64::MAX as i128 || n < i64::MIN as i128 || d > i64::MAX as i128 {
            panic!("fraction overflow: {}/{}", n, d);
        }
        Self {
            numerator: n as i64,
            denominator: d as i64,
        }
    }

    pub fn from_integer(n: i64) -> Self {
        Self {
            numerator: n,
            denominator: 1,
        }
    }

    pub fn zero() -> Self {
        Self::from_integer(0)
    }

    pub fn one() -> Self {
        Self::from_integer(1)
    }

    /// Best rational approximation by continued fractions, denominator
    /// bounded at 10^9. Hosts use this to bring wall-clock derived floats
    /// into pattern time.
    pub fn from_float(f: f64) -> Self {
        if !f.is_finite() {
            panic!("cannot convert {} to a fraction", f);
        }
        let negative = f < 0.0;
        let mut x = f.abs();
        let (mut h0, mut k0): (i128, i128) = (1, 0);
        let (mut h1, mut k1): (i128, i128) = (x.floor() as i128, 1);
        let mut frac = x - x.floor();
        while frac > 1e-12 {
            x = 1.0 / frac;
            let a = x.floor();
            if a > 1e18 {
                break;
            }
            let h2 = a as i128 * h1 + h0;
            let k2 = a as i128 * k1 + k0;
            if k2 > 1_000_000_000 {
                break;
            }
            h0 = h1;
            k0 = k1;
            h1 = h2;
            k1 = k2;
            frac = x - a;
        }
        let n = if negative { -h1 } else { h1 };
        Self::from_i128(n, k1)
    }

    pub fn to_float(&self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }

    /// Integer part, rounding toward negative infinity (the cycle index).
    pub fn floor(&self) -> i64 {
        self.numerator.div_euclid(self.denominator)
    }

    pub fn ceil(&self) -> i64 {
        -((-self.numerator).div_euclid(self.denominator))
    }

    /// Start of the cycle this time falls in.
    pub fn sam(&self) -> Fraction {
        Fraction::from_integer(self.floor())
    }

    /// Start of the next cycle.
    pub fn next_sam(&self) -> Fraction {
        Fraction::from_integer(self.floor() + 1)
    }

    /// Position within the cycle, in `[0, 1)`.
    pub fn cycle_pos(&self) -> Fraction {
        *self - self.sam()
    }

    pub fn is_integer(&self) -> bool {
        self.denominator == 1
    }
}

impl std::ops::Add for Fraction {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Fraction::from_i128(
            self.numerator as i128 * other.denominator as i128
                + other.numerator as i128 * self.denominator as i128,
            self.denominator as i128 * other.denominator as i128,
        )
    }
}

impl std::ops::Sub for Fraction {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Fraction::from_i128(
            self.numerator as i128 * other.denominator as i128
                - other.numerator as i128 * self.denominator as i128,
            self.denominator as i128 * other.denominator as i128,
        )
    }
}

impl std::ops::Mul for Fraction {
    type Output = Self;

    fn mul(self, other: Self) -> Self {
        Fraction::from_i128(
            self.numerator as i128 * other.numerator as i128,
            self.denominator as i128 * other.denominator as i128,
        )
    }
}

impl std::ops::Div for Fraction {
    type Output = Self;

    fn div(self, other: Self) -> Self {
        Fraction::from_i128(
            self.numerator as i128 * other.denominator as i128,
            self.denominator as i128 * other.numerator as i128,
        )
    }
}

impl std::ops::Neg for Fraction {
    type Output = Self;

    fn neg(self) -> Self {
        Fraction {
            numerator: -self.numerator,
            denominator: self.denominator,
        }
    }
}

impl std::cmp::PartialOrd for Fraction {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::cmp::Ord for Fraction {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let lhs = self.numerator as i128 * other.denominator as i128;
        let rhs = other.numerator as i128 * self.denominator as i128;
        lhs.cmp(&rhs)
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.denominator == 1 {
            write!(f, "{}", self.numerator)
        } else {
            write!(f, "{}/{}", self.numerator, self.denominator)
        }
    }
}

impl From<i64> for Fraction {
    fn from(n: i64) -> Self {
        Fraction::from_integer(n)
    }
}

/// TimeSpan represents a half-open time interval `[begin, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSpan {
    pub begin: Fraction,
    pub end: Fraction,
}

impl TimeSpan {
    pub fn new(begin: Fraction, end: Fraction) -> Self {
        Self { begin, end }
    }

    pub fn duration(&self) -> Fraction {
        self.end - self.begin
    }

    pub fn midpoint(&self) -> Fraction {
        (self.begin + self.end) / Fraction::from_integer(2)
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    /// Intersection with another span, `None` when empty.
    pub fn sect(&self, other: &TimeSpan) -> Option<TimeSpan> {
        let begin = self.begin.max(other.begin);
        let end = self.end.min(other.end);
        if begin < end {
            Some(TimeSpan::new(begin, end))
        } else {
            None
        }
    }

    /// Split at every cycle boundary between begin and end. Zero-width spans
    /// split to nothing, which is what makes zero-length queries yield no
    /// events.
    pub fn cycle_spans(&self) -> Vec<TimeSpan> {
        let mut spans = Vec::new();
        let mut begin = self.begin;
        while begin < self.end {
            let end = begin.next_sam().min(self.end);
            spans.push(TimeSpan::new(begin, end));
            begin = end;
        }
        spans
    }

    pub fn shift(&self, amount: Fraction) -> TimeSpan {
        TimeSpan::new(self.begin + amount, self.end + amount)
    }

    pub fn with_time(&self, f: impl Fn(Fraction) -> Fraction) -> TimeSpan {
        TimeSpan::new(f(self.begin), f(self.end))
    }
}

impl fmt::Display for TimeSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

/// Source back-references carried by every hap, pointing at the spans of
/// mini-notation source that produced it. Editors use these to highlight the
/// playing tokens; combinators only ever propagate and merge them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub locations: Vec<(usize, usize)>,
}

impl Context {
    pub fn with_location(span: (usize, usize)) -> Self {
        Self {
            locations: vec![span],
        }
    }

    pub fn merged(&self, other: &Context) -> Context {
        let mut locations = self.locations.clone();
        locations.extend(other.locations.iter().copied());
        Context { locations }
    }
}

/// Hap (short for "happening") is an event with a value
///
/// `part` is the fragment visible to the query that produced it; `whole` is
/// the event's full extent, absent for continuous (analog) values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hap<T> {
    pub whole: Option<TimeSpan>,
    pub part: TimeSpan,
    pub value: T,
    pub context: Context,
}

impl<T: Clone> Hap<T> {
    pub fn new(whole: Option<TimeSpan>, part: TimeSpan, value: T) -> Self {
        Self {
            whole,
            part,
            value,
            context: Context::default(),
        }
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn with_value<U>(&self, f: impl FnOnce(&T) -> U) -> Hap<U> {
        Hap {
            whole: self.whole,
            part: self.part,
            value: f(&self.value),
            context: self.context.clone(),
        }
    }

    /// Map both part and whole through a time transform.
    pub fn with_time(mut self, f: impl Fn(Fraction) -> Fraction) -> Self {
        self.part = self.part.with_time(&f);
        self.whole = self.whole.map(|w| w.with_time(&f));
        self
    }

    pub fn whole_or_part(&self) -> TimeSpan {
        self.whole.unwrap_or(self.part)
    }

    /// True when the hap's visible part starts at its logical onset. The
    /// scheduler only triggers onsets, so look-ahead windows never fire the
    /// same event twice.
    pub fn has_onset(&self) -> bool {
        match self.whole {
            Some(w) => w.begin == self.part.begin,
            None => false,
        }
    }
}

/// State for pattern queries
#[derive(Debug, Clone)]
pub struct State {
    pub span: TimeSpan,
    pub controls: HashMap<String, f64>,
}

impl State {
    pub fn new(span: TimeSpan) -> Self {
        Self {
            span,
            controls: HashMap::new(),
        }
    }

    pub fn with_span(&self, span: TimeSpan) -> State {
        State {
            span,
            controls: self.controls.clone(),
        }
    }
}

// Node ids feed the per-cycle random seeds: every combinator that introduces
// randomness takes one at construction, so the same program always produces
// the same streams, while two `degrade` calls in one program stay independent.
static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_node_id() -> u64 {
    NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn splitmix(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E3779B97F4A7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Seed for per-cycle decisions.
pub(crate) fn cycle_seed(node: u64, cycle: i64) -> u64 {
    splitmix(node ^ splitmix(cycle as u64))
}

/// Seed for per-event decisions, keyed on the event's onset time. Reduced
/// fractions are canonical, so equal times always hash alike.
pub(crate) fn time_seed(node: u64, t: Fraction) -> u64 {
    splitmix(node ^ splitmix(t.numerator as u64) ^ splitmix(t.denominator as u64).rotate_left(17))
}

/// Core Pattern type - the heart of the system
pub struct Pattern<T: Clone + Send + Sync> {
    // The query function is the essence of a pattern
    query: Arc<dyn Fn(&State) -> Vec<Hap<T>> + Send + Sync>,
    steps: Option<Fraction>,
}

// Manual Debug implementation for Pattern since it contains a closure
impl<T: Clone + Send + Sync> fmt::Debug for Pattern<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pattern")
            .field("query", &"<closure>")
            .field("steps", &self.steps)
            .finish()
    }
}

impl<T: Clone + Send + Sync> Clone for Pattern<T> {
    fn clone(&self) -> Self {
        Self {
            query: self.query.clone(),
            steps: self.steps,
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Pattern<T> {
    /// Create a new pattern from a query function
    pub fn new(query: impl Fn(&State) -> Vec<Hap<T>> + Send + Sync + 'static) -> Self {
        Self {
            query: Arc::new(query),
            steps: None,
        }
    }

    /// Query the pattern for events in a time span
    pub fn query(&self, state: &State) -> Vec<Hap<T>> {
        (self.query)(state)
    }

    /// Structural step count per cycle, where known. Polymeter alignment and
    /// the mini-notation `%` modifier read this.
    pub fn steps(&self) -> Option<Fraction> {
        self.steps
    }

    pub fn with_steps(mut self, steps: Fraction) -> Self {
        self.steps = Some(steps);
        self
    }

    pub(crate) fn with_steps_opt(mut self, steps: Option<Fraction>) -> Self {
        self.steps = steps;
        self
    }

    /// One event per cycle carrying the value, repeating forever.
    pub fn pure(value: T) -> Self {
        Pattern::new(move |state: &State| {
            state
                .span
                .cycle_spans()
                .into_iter()
                .map(|part| {
                    let whole = TimeSpan::new(part.begin.sam(), part.begin.next_sam());
                    Hap::new(Some(whole), part, value.clone())
                })
                .collect()
        })
        .with_steps(Fraction::one())
    }

    /// The empty pattern.
    pub fn silence() -> Self {
        Pattern::new(|_| vec![])
    }

    // ============= Core Transformations =============

    /// Transform the values in a pattern
    pub fn fmap<U: Clone + Send + Sync + 'static>(
        self,
        f: impl Fn(T) -> U + Send + Sync + 'static,
    ) -> Pattern<U> {
        let steps = self.steps;
        Pattern::new(move |state: &State| {
            self.query(state)
                .into_iter()
                .map(|hap| hap.with_value(|v| f(v.clone())))
                .collect()
        })
        .with_steps_opt(steps)
    }

    /// Keep only the haps the predicate accepts.
    pub fn filter_haps(self, f: impl Fn(&Hap<T>) -> bool + Send + Sync + 'static) -> Self {
        let steps = self.steps;
        Pattern::new(move |state: &State| self.query(state).into_iter().filter(|h| f(h)).collect())
            .with_steps_opt(steps)
    }

    pub fn filter_values(self, f: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.filter_haps(move |hap| f(&hap.value))
    }

    /// Rewrite each hap; empty parts are dropped on the way out.
    pub fn with_haps(self, f: impl Fn(Hap<T>) -> Hap<T> + Send + Sync + 'static) -> Self {
        let steps = self.steps;
        Pattern::new(move |state: &State| {
            self.query(state)
                .into_iter()
                .map(&f)
                .filter(|h| !h.part.is_empty())
                .collect()
        })
        .with_steps_opt(steps)
    }

    /// Add a source location to every hap this pattern produces.
    pub fn with_location(self, span: (usize, usize)) -> Self {
        self.with_haps(move |mut hap| {
            hap.context.locations.push(span);
            hap
        })
    }

    /// Speed up a pattern by a factor. The factor must be positive;
    /// `fast(0)` is a degenerate pattern and refuses to exist.
    pub fn fast(self, factor: Fraction) -> Self {
        if factor <= Fraction::zero() {
            panic!("fast requires a positive factor, got {}", factor);
        }
        let steps = self.steps.map(|s| s * factor);
        Pattern::new(move |state: &State| {
            let span = state.span.with_time(|t| t * factor);
            self.query(&state.with_span(span))
                .into_iter()
                .map(|hap| hap.with_time(|t| t / factor))
                .collect()
        })
        .with_steps_opt(steps)
    }

    /// Slow down a pattern by a factor
    pub fn slow(self, factor: Fraction) -> Self {
        if factor <= Fraction::zero() {
            panic!("slow requires a positive factor, got {}", factor);
        }
        self.fast(Fraction::one() / factor)
    }

    /// Shift the pattern earlier in time: an event at `t` now happens at
    /// `t - amount`.
    pub fn early(self, amount: Fraction) -> Self {
        let steps = self.steps;
        Pattern::new(move |state: &State| {
            let span = state.span.shift(amount);
            self.query(&state.with_span(span))
                .into_iter()
                .map(|hap| hap.with_time(|t| t - amount))
                .collect()
        })
        .with_steps_opt(steps)
    }

    /// Shift the pattern later in time
    pub fn late(self, amount: Fraction) -> Self {
        self.early(-amount)
    }

    /// Reverse a pattern within each cycle
    pub fn rev(self) -> Self {
        let steps = self.steps;
        Pattern::new(move |state: &State| {
            let mut out = Vec::new();
            for span in state.span.cycle_spans() {
                let cycle = span.begin.sam();
                // reflection across the middle of cycle n: t -> 2n + 1 - t
                let pivot = cycle + cycle + Fraction::one();
                let reflected = TimeSpan::new(pivot - span.end, pivot - span.begin);
                for hap in self.query(&state.with_span(reflected)) {
                    let part = TimeSpan::new(pivot - hap.part.end, pivot - hap.part.begin);
                    let whole = hap
                        .whole
                        .map(|w| TimeSpan::new(pivot - w.end, pivot - w.begin));
                    out.push(Hap {
                        whole,
                        part,
                        value: hap.value,
                        context: hap.context,
                    });
                }
            }
            out.sort_by(|a, b| a.part.begin.cmp(&b.part.begin));
            out
        })
        .with_steps_opt(steps)
    }

    /// Sample the pattern's value just after `time`. Used by combinators
    /// that take one pattern's structure and another's values.
    pub(crate) fn sample_at(&self, time: Fraction, state: &State) -> Option<Hap<T>> {
        let probe = TimeSpan::new(time, time + Fraction::new(1, 1_000_000));
        self.query(&state.with_span(probe)).into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(b: (i64, i64), e: (i64, i64)) -> TimeSpan {
        TimeSpan::new(Fraction::new(b.0, b.1), Fraction::new(e.0, e.1))
    }

    #[test]
    fn test_fraction_reduction() {
        let f = Fraction::new(4, 8);
        assert_eq!(f.numerator, 1);
        assert_eq!(f.denominator, 2);
        assert_eq!(Fraction::new(-3, -6), Fraction::new(1, 2));
        assert_eq!(Fraction::new(3, -6), Fraction::new(-1, 2));
    }

    #[test]
    fn test_fraction_arithmetic_is_exact() {
        let third = Fraction::new(1, 3);
        let sum = third + third + third;
        assert_eq!(sum, Fraction::one());
        assert_eq!(
            Fraction::new(1, 2) * Fraction::new(2, 3),
            Fraction::new(1, 3)
        );
        assert_eq!(
            Fraction::new(1, 2) / Fraction::new(1, 4),
            Fraction::new(2, 1)
        );
    }

    #[test]
    fn test_fraction_floor_and_sam() {
        assert_eq!(Fraction::new(7, 2).floor(), 3);
        assert_eq!(Fraction::new(-1, 2).floor(), -1);
        assert_eq!(Fraction::new(5, 2).sam(), Fraction::from_integer(2));
        assert_eq!(Fraction::new(5, 2).next_sam(), Fraction::from_integer(3));
        assert_eq!(Fraction::new(5, 2).cycle_pos(), Fraction::new(1, 2));
    }

    #[test]
    fn test_fraction_from_float() {
        assert_eq!(Fraction::from_float(0.5), Fraction::new(1, 2));
        assert_eq!(Fraction::from_float(2.5), Fraction::new(5, 2));
        assert_eq!(Fraction::from_float(-0.25), Fraction::new(-1, 4));
        assert_eq!(Fraction::from_float(3.0), Fraction::from_integer(3));
    }

    #[test]
    fn test_cycle_spans() {
        let spans = span((1, 2), (5, 2)).cycle_spans();
        assert_eq!(
            spans,
            vec![
                span((1, 2), (1, 1)),
                span((1, 1), (2, 1)),
                span((2, 1), (5, 2))
            ]
        );
        assert!(span((1, 2), (1, 2)).cycle_spans().is_empty());
    }

    #[test]
    fn test_pure_one_hap_per_cycle() {
        let p = Pattern::pure("bd");
        let haps = p.query(&State::new(span((0, 1), (2, 1))));
        assert_eq!(haps.len(), 2);
        assert_eq!(haps[0].whole, Some(span((0, 1), (1, 1))));
        assert_eq!(haps[1].whole, Some(span((1, 1), (2, 1))));
        assert!(haps.iter().all(|h| h.value == "bd"));
    }

    #[test]
    fn test_pure_clips_part_to_query() {
        let p = Pattern::pure(1);
        let haps = p.query(&State::new(span((1, 4), (1, 2))));
        assert_eq!(haps.len(), 1);
        assert_eq!(haps[0].part, span((1, 4), (1, 2)));
        assert_eq!(haps[0].whole, Some(span((0, 1), (1, 1))));
    }

    #[test]
    fn test_zero_width_query_is_empty() {
        let p = Pattern::pure(1);
        assert!(p.query(&State::new(span((1, 2), (1, 2)))).is_empty());
    }

    #[test]
    fn test_fast_doubles_events() {
        let p = Pattern::pure("x").fast(Fraction::from_integer(2));
        let haps = p.query(&State::new(span((0, 1), (1, 1))));
        assert_eq!(haps.len(), 2);
        assert_eq!(haps[0].whole, Some(span((0, 1), (1, 2))));
        assert_eq!(haps[1].whole, Some(span((1, 2), (1, 1))));
    }

    #[test]
    #[should_panic(expected = "positive factor")]
    fn test_fast_zero_panics() {
        let _ = Pattern::pure(1).fast(Fraction::zero());
    }

    #[test]
    fn test_late_shifts_events() {
        let p = Pattern::pure("x").late(Fraction::new(1, 4));
        let haps = p.query(&State::new(span((0, 1), (1, 1))));
        // the tail of the previous cycle's event, then the current one
        assert_eq!(haps.len(), 2);
        assert_eq!(haps[0].whole, Some(span((-3, 4), (1, 4))));
        assert_eq!(haps[0].part, span((0, 1), (1, 4)));
        assert_eq!(haps[1].whole, Some(span((1, 4), (5, 4))));
        assert_eq!(haps[1].part, span((1, 4), (1, 1)));
    }

    #[test]
    fn test_rev_is_involutive() {
        let p = crate::pattern_structure::fastcat(vec![
            Pattern::pure("a"),
            Pattern::pure("b"),
            Pattern::pure("c"),
        ]);
        let q = State::new(span((0, 1), (1, 1)));
        let forward = p.clone().query(&q);
        let back = p.rev().rev().query(&q);
        assert_eq!(forward.len(), back.len());
        for (f, b) in forward.iter().zip(back.iter()) {
            assert_eq!(f.part, b.part);
            assert_eq!(f.value, b.value);
        }
    }

    #[test]
    fn test_rev_reflects_within_cycle() {
        let p =
            crate::pattern_structure::fastcat(vec![Pattern::pure("a"), Pattern::pure("b")]).rev();
        let haps = p.query(&State::new(span((0, 1), (1, 1))));
        assert_eq!(haps.len(), 2);
        assert_eq!(haps[0].value, "b");
        assert_eq!(haps[0].part, span((0, 1), (1, 2)));
        assert_eq!(haps[1].value, "a");
        assert_eq!(haps[1].part, span((1, 2), (1, 1)));
    }

    #[test]
    fn test_query_is_deterministic() {
        let p = Pattern::pure(3).fast(Fraction::from_integer(3));
        let s = State::new(span((0, 1), (2, 1)));
        assert_eq!(p.query(&s), p.query(&s));
    }
}
