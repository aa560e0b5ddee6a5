//! Pattern operators
//!
//! Conditional application, per-event randomness, repetition and the value
//! arithmetic used to build parameter bundles for the output sink.

use crate::pattern::{
    cycle_seed, next_node_id, time_seed, Fraction, Hap, Pattern, State, TimeSpan,
};
use crate::pattern_structure::stack;
use crate::value::Value;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::debug;

impl<T: Clone + Send + Sync + 'static> Pattern<T> {
    // ============= Conditional Application =============

    /// Apply a function every n cycles (on cycles where `cycle % n == 0`).
    pub fn every(self, n: i64, f: impl FnOnce(Pattern<T>) -> Pattern<T>) -> Self {
        if n <= 0 {
            return self;
        }
        let transformed = f(self.clone());
        Pattern::new(move |state: &State| {
            let mut out = Vec::new();
            for span in state.span.cycle_spans() {
                let sub = state.with_span(span);
                if span.begin.floor().rem_euclid(n) == 0 {
                    out.extend(transformed.query(&sub));
                } else {
                    out.extend(self.query(&sub));
                }
            }
            out
        })
    }

    /// Apply a function on cycles where `(cycle - offset) % modulo == 0`.
    pub fn when_mod(
        self,
        modulo: i64,
        offset: i64,
        f: impl FnOnce(Pattern<T>) -> Pattern<T>,
    ) -> Self {
        if modulo <= 0 {
            return self;
        }
        let transformed = f(self.clone());
        Pattern::new(move |state: &State| {
            let mut out = Vec::new();
            for span in state.span.cycle_spans() {
                let sub = state.with_span(span);
                if (span.begin.floor() - offset).rem_euclid(modulo) == 0 {
                    out.extend(transformed.query(&sub));
                } else {
                    out.extend(self.query(&sub));
                }
            }
            out
        })
    }

    /// Overlay a transformed copy, shifted later by `amount`.
    pub fn off(self, amount: Fraction, f: impl FnOnce(Pattern<T>) -> Pattern<T>) -> Self {
        let shifted = f(self.clone()).late(amount);
        stack(vec![self, shifted])
    }

    /// Overlay a transformed copy of the pattern on itself.
    pub fn superimpose(self, f: impl FnOnce(Pattern<T>) -> Pattern<T>) -> Self {
        let transformed = f(self.clone());
        stack(vec![self, transformed])
    }

    /// Alternate between the pattern and its reverse, one cycle each.
    pub fn palindrome(self) -> Self {
        crate::pattern_structure::slowcat(vec![self.clone(), self.rev()])
    }

    /// Split each cycle into `n` chunks and apply `f` to one chunk per
    /// cycle, advancing each cycle.
    pub fn chunk(self, n: usize, f: impl FnOnce(Pattern<T>) -> Pattern<T>) -> Self {
        if n == 0 {
            return self;
        }
        let transformed = f(self.clone());
        let n = n as i64;
        Pattern::new(move |state: &State| {
            let mut out = Vec::new();
            for span in state.span.cycle_spans() {
                let sub = state.with_span(span);
                let sam = span.begin.sam();
                let k = span.begin.floor().rem_euclid(n);
                let win_begin = sam + Fraction::new(k, n);
                let win_end = sam + Fraction::new(k + 1, n);
                let in_window = |h: &Hap<T>| {
                    let onset = h.whole_or_part().begin;
                    onset >= win_begin && onset < win_end
                };
                out.extend(transformed.query(&sub).into_iter().filter(&in_window));
                out.extend(self.query(&sub).into_iter().filter(|h| !in_window(h)));
            }
            out.sort_by(|a, b| a.part.begin.cmp(&b.part.begin));
            out
        })
    }

    // ============= Repetition =============

    /// Replace each event by `n` copies subdividing its whole.
    pub fn ply(self, n: usize) -> Self {
        if n == 0 {
            return Pattern::silence();
        }
        if n == 1 {
            return self;
        }
        let n_frac = Fraction::from_integer(n as i64);
        Pattern::new(move |state: &State| {
            let mut out = Vec::new();
            for hap in self.query(state) {
                let extent = hap.whole_or_part();
                let step = extent.duration() / n_frac;
                for i in 0..n {
                    let begin = extent.begin + step * Fraction::from_integer(i as i64);
                    let sub_whole = TimeSpan::new(begin, begin + step);
                    if let Some(part) = sub_whole.sect(&hap.part) {
                        out.push(Hap {
                            whole: hap.whole.map(|_| sub_whole),
                            part,
                            value: hap.value.clone(),
                            context: hap.context.clone(),
                        });
                    }
                }
            }
            out
        })
    }

    /// Rotate the pattern by `k/n` of a cycle, `k` advancing per cycle.
    pub fn iter(self, n: usize) -> Self {
        self.iter_with(n, false)
    }

    /// Like [`Pattern::iter`], rotating the other way.
    pub fn iter_back(self, n: usize) -> Self {
        self.iter_with(n, true)
    }

    fn iter_with(self, n: usize, back: bool) -> Self {
        if n == 0 {
            return self;
        }
        let n = n as i64;
        Pattern::new(move |state: &State| {
            let mut out = Vec::new();
            for span in state.span.cycle_spans() {
                let k = span.begin.floor().rem_euclid(n);
                let mut shift = Fraction::new(k, n);
                if back {
                    shift = -shift;
                }
                let inner = span.shift(shift);
                for hap in self.query(&state.with_span(inner)) {
                    out.push(hap.with_time(|t| t - shift));
                }
            }
            out
        })
    }

    /// Repeat the first `amount` of every cycle for the whole cycle.
    pub fn linger(self, amount: Fraction) -> Self {
        if amount <= Fraction::zero() {
            return Pattern::silence();
        }
        if amount >= Fraction::one() {
            return self;
        }
        Pattern::new(move |state: &State| {
            let mut out = Vec::new();
            for span in state.span.cycle_spans() {
                let sam = span.begin.sam();
                let next = span.begin.next_sam();
                let mut offset = Fraction::zero();
                while sam + offset < next {
                    let slice = TimeSpan::new(sam + offset, (sam + offset + amount).min(next));
                    if let Some(visible) = span.sect(&slice) {
                        let inner = visible.shift(-offset);
                        for hap in self.query(&state.with_span(inner)) {
                            out.push(hap.with_time(|t| t + offset));
                        }
                    }
                    offset = offset + amount;
                }
            }
            out.sort_by(|a, b| a.part.begin.cmp(&b.part.begin));
            out
        })
    }

    // ============= Time Windows =============

    /// Squeeze each cycle's content into its first `1/factor`, leaving the
    /// rest of the cycle silent.
    pub fn fast_gap(self, factor: Fraction) -> Self {
        if factor <= Fraction::zero() {
            panic!("fast_gap requires a positive factor, got {}", factor);
        }
        Pattern::new(move |state: &State| {
            let mut out = Vec::new();
            for span in state.span.cycle_spans() {
                let sam = span.begin.sam();
                let munge_in =
                    |t: Fraction| sam + ((t - sam) * factor).min(Fraction::one());
                let munge_out = |t: Fraction| sam + (t - sam) / factor;
                let inner = TimeSpan::new(munge_in(span.begin), munge_in(span.end));
                if inner.is_empty() {
                    continue;
                }
                for hap in self.query(&state.with_span(inner)) {
                    let hap = hap.with_time(munge_out);
                    if !hap.part.is_empty() {
                        out.push(hap);
                    }
                }
            }
            out
        })
    }

    /// Squeeze the pattern into the window `[begin, end)` of every cycle.
    pub fn compress(self, begin: Fraction, end: Fraction) -> Self {
        if begin > end
            || begin < Fraction::zero()
            || end > Fraction::one()
            || begin == end
        {
            return Pattern::silence();
        }
        self.fast_gap(Fraction::one() / (end - begin)).late(begin)
    }

    /// Play only the `[begin, end)` window of every cycle, stretched to fill
    /// the whole cycle.
    pub fn zoom(self, begin: Fraction, end: Fraction) -> Self {
        let d = end - begin;
        if d <= Fraction::zero() {
            return Pattern::silence();
        }
        Pattern::new(move |state: &State| {
            let mut out = Vec::new();
            for span in state.span.cycle_spans() {
                let sam = span.begin.sam();
                let to_inner = |t: Fraction| sam + begin + (t - sam) * d;
                let to_outer = |t: Fraction| sam + (t - sam - begin) / d;
                let inner = TimeSpan::new(to_inner(span.begin), to_inner(span.end));
                for hap in self.query(&state.with_span(inner)) {
                    out.push(hap.with_time(to_outer));
                }
            }
            out
        })
    }

    /// Sample the pattern into `n` discrete steps per cycle. Mainly useful
    /// for turning continuous signals into events.
    pub fn segment(self, n: usize) -> Self {
        if n == 0 {
            return Pattern::silence();
        }
        self.struct_with(Pattern::<bool>::euclid(n, n, 0))
    }

    // ============= Randomness & Probability =============

    /// Randomly drop events with the given probability. Decisions are keyed
    /// on the event's onset, so every query of a cycle agrees.
    pub fn degrade_by(self, probability: f64) -> Self {
        let node = next_node_id();
        Pattern::new(move |state: &State| {
            self.query(state)
                .into_iter()
                .filter(|hap| {
                    let mut rng =
                        StdRng::seed_from_u64(time_seed(node, hap.whole_or_part().begin));
                    rng.gen::<f64>() >= probability
                })
                .collect()
        })
    }

    /// Drop half of the events.
    pub fn degrade(self) -> Self {
        self.degrade_by(0.5)
    }

    /// Apply a function with the given probability, decided once per cycle.
    pub fn sometimes_by(self, prob: f64, f: impl FnOnce(Pattern<T>) -> Pattern<T>) -> Self {
        let node = next_node_id();
        let transformed = f(self.clone());
        Pattern::new(move |state: &State| {
            let mut out = Vec::new();
            for span in state.span.cycle_spans() {
                let sub = state.with_span(span);
                let mut rng = StdRng::seed_from_u64(cycle_seed(node, span.begin.floor()));
                if rng.gen::<f64>() < prob {
                    out.extend(transformed.query(&sub));
                } else {
                    out.extend(self.query(&sub));
                }
            }
            out
        })
    }

    /// Sometimes apply a function (50% of cycles).
    pub fn sometimes(self, f: impl FnOnce(Pattern<T>) -> Pattern<T>) -> Self {
        self.sometimes_by(0.5, f)
    }

    /// Rarely apply a function (10% of cycles).
    pub fn rarely(self, f: impl FnOnce(Pattern<T>) -> Pattern<T>) -> Self {
        self.sometimes_by(0.1, f)
    }

    /// Often apply a function (75% of cycles).
    pub fn often(self, f: impl FnOnce(Pattern<T>) -> Pattern<T>) -> Self {
        self.sometimes_by(0.75, f)
    }

    /// Almost always apply a function (90% of cycles).
    pub fn almost_always(self, f: impl FnOnce(Pattern<T>) -> Pattern<T>) -> Self {
        self.sometimes_by(0.9, f)
    }

    /// Almost never apply a function (10% of cycles).
    pub fn almost_never(self, f: impl FnOnce(Pattern<T>) -> Pattern<T>) -> Self {
        self.sometimes_by(0.1, f)
    }

    /// Always apply a function. Exists so probability arguments can be
    /// swapped without restructuring code.
    pub fn always(self, f: impl FnOnce(Pattern<T>) -> Pattern<T>) -> Self {
        f(self)
    }
}

impl Pattern<f64> {
    /// Rescale values from `[0, 1]` to `[lo, hi]`.
    pub fn range(self, lo: f64, hi: f64) -> Self {
        self.fmap(move |v| lo + v * (hi - lo))
    }
}

// ============= Value Arithmetic & Merging =============

impl Pattern<Value> {
    /// Overwrite every event's value.
    pub fn set_value(self, value: Value) -> Self {
        self.fmap(move |_| value.clone())
    }

    fn numeric_op_with(
        self,
        other: Pattern<Value>,
        op: impl Fn(f64, f64) -> f64 + Copy + Send + Sync + 'static,
    ) -> Self {
        Pattern::new(move |state: &State| {
            self.query(state)
                .into_iter()
                .filter_map(|hap| {
                    let onset = hap.whole_or_part().begin;
                    let sampled = other.sample_at(onset, state)?;
                    match hap.value.clone().numeric_op(sampled.value, op) {
                        Some(value) => Some(Hap {
                            whole: hap.whole,
                            part: hap.part,
                            value,
                            context: hap.context.merged(&sampled.context),
                        }),
                        None => {
                            debug!("dropping hap at {}: non-numeric operand", hap.part.begin);
                            None
                        }
                    }
                })
                .collect()
        })
    }

    pub fn add(self, other: Pattern<Value>) -> Self {
        self.numeric_op_with(other, |a, b| a + b)
    }

    pub fn sub(self, other: Pattern<Value>) -> Self {
        self.numeric_op_with(other, |a, b| a - b)
    }

    pub fn mul(self, other: Pattern<Value>) -> Self {
        self.numeric_op_with(other, |a, b| a * b)
    }

    pub fn div(self, other: Pattern<Value>) -> Self {
        self.numeric_op_with(other, |a, b| a / b)
    }

    fn merge_with(self, other: Pattern<Value>, right_wins: bool) -> Self {
        Pattern::new(move |state: &State| {
            self.query(state)
                .into_iter()
                .filter_map(|hap| {
                    let onset = hap.whole_or_part().begin;
                    let sampled = other.sample_at(onset, state)?;
                    Some(Hap {
                        whole: hap.whole,
                        part: hap.part,
                        value: hap.value.clone().merged_with(sampled.value, right_wins),
                        context: hap.context.merged(&sampled.context),
                    })
                })
                .collect()
        })
    }

    /// Merge with another pattern, structure and colliding keys from the
    /// left.
    pub fn merge_left(self, other: Pattern<Value>) -> Self {
        self.merge_with(other, false)
    }

    /// Merge with another pattern, structure from the left, colliding keys
    /// from the right (the `#` chain operator).
    pub fn merge_right(self, other: Pattern<Value>) -> Self {
        self.merge_with(other, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern_structure::fastcat;

    fn query_cycle<T: Clone + Send + Sync + 'static>(p: &Pattern<T>, n: i64) -> Vec<Hap<T>> {
        p.query(&State::new(TimeSpan::new(
            Fraction::from_integer(n),
            Fraction::from_integer(n + 1),
        )))
    }

    #[test]
    fn test_every_applies_on_multiples() {
        let p = fastcat(vec![Pattern::pure("a"), Pattern::pure("b")]).every(2, |p| p.rev());
        let c0: Vec<_> = query_cycle(&p, 0).into_iter().map(|h| h.value).collect();
        let c1: Vec<_> = query_cycle(&p, 1).into_iter().map(|h| h.value).collect();
        assert_eq!(c0, vec!["b", "a"]);
        assert_eq!(c1, vec!["a", "b"]);
    }

    #[test]
    fn test_off_stacks_shifted_copy() {
        let p = Pattern::pure("x").off(Fraction::new(1, 4), |p| p);
        let haps = query_cycle(&p, 0);
        assert_eq!(haps.len(), 3);
        // original first (argument order), then the shifted tail and onset
        assert_eq!(haps[0].part.begin, Fraction::zero());
    }

    #[test]
    fn test_ply_subdivides_wholes() {
        let p = fastcat(vec![Pattern::pure("a"), Pattern::pure("b")]).ply(2);
        let haps = query_cycle(&p, 0);
        assert_eq!(haps.len(), 4);
        assert_eq!(haps[0].whole, Some(TimeSpan::new(Fraction::zero(), Fraction::new(1, 4))));
        assert_eq!(haps[1].whole, Some(TimeSpan::new(Fraction::new(1, 4), Fraction::new(1, 2))));
        assert_eq!(haps[0].value, "a");
        assert_eq!(haps[1].value, "a");
        assert_eq!(haps[2].value, "b");
    }

    #[test]
    fn test_iter_rotates_per_cycle() {
        let p = fastcat(vec![
            Pattern::pure("a"),
            Pattern::pure("b"),
            Pattern::pure("c"),
            Pattern::pure("d"),
        ])
        .iter(4);
        let first: Vec<_> = query_cycle(&p, 0).into_iter().map(|h| h.value).collect();
        let second: Vec<_> = query_cycle(&p, 1).into_iter().map(|h| h.value).collect();
        assert_eq!(first, vec!["a", "b", "c", "d"]);
        assert_eq!(second, vec!["b", "c", "d", "a"]);
    }

    #[test]
    fn test_degrade_is_stable_across_queries() {
        let p = fastcat(vec![
            Pattern::pure(1),
            Pattern::pure(2),
            Pattern::pure(3),
            Pattern::pure(4),
        ])
        .degrade();
        let a: Vec<_> = query_cycle(&p, 0).into_iter().map(|h| h.part).collect();
        let b: Vec<_> = query_cycle(&p, 0).into_iter().map(|h| h.part).collect();
        assert_eq!(a, b);
        assert!(a.len() <= 4);
    }

    #[test]
    fn test_degrade_by_extremes() {
        let p = fastcat(vec![Pattern::pure(1), Pattern::pure(2)]);
        assert_eq!(query_cycle(&p.clone().degrade_by(0.0), 0).len(), 2);
        assert_eq!(query_cycle(&p.degrade_by(1.0), 0).len(), 0);
    }

    #[test]
    fn test_compress_confines_to_window() {
        let p = Pattern::pure("x").compress(Fraction::new(1, 4), Fraction::new(1, 2));
        let haps = query_cycle(&p, 0);
        assert_eq!(haps.len(), 1);
        assert_eq!(
            haps[0].whole,
            Some(TimeSpan::new(Fraction::new(1, 4), Fraction::new(1, 2)))
        );
    }

    #[test]
    fn test_zoom_stretches_window() {
        let p = fastcat(vec![
            Pattern::pure("a"),
            Pattern::pure("b"),
            Pattern::pure("c"),
            Pattern::pure("d"),
        ])
        .zoom(Fraction::zero(), Fraction::new(1, 2));
        let values: Vec<_> = query_cycle(&p, 0).into_iter().map(|h| h.value).collect();
        assert_eq!(values, vec!["a", "b"]);
    }

    #[test]
    fn test_value_add_broadcasts() {
        let left = Pattern::pure(Value::map(vec![("n", Value::from(3.0))]));
        let right = Pattern::pure(Value::from(2.0));
        let haps = query_cycle(&left.add(right), 0);
        assert_eq!(haps.len(), 1);
        match &haps[0].value {
            Value::Map(m) => assert_eq!(m.get("n"), Some(&Value::Number(5.0))),
            other => panic!("expected map, got {:?}", other),
        }
    }

    #[test]
    fn test_value_add_drops_non_numeric() {
        let left = Pattern::pure(Value::from("bd"));
        let right = Pattern::pure(Value::from(1.0));
        assert!(query_cycle(&left.add(right), 0).is_empty());
    }

    #[test]
    fn test_merge_right_overrides() {
        let left = Pattern::pure(Value::map(vec![
            ("s", Value::from("bd")),
            ("gain", Value::from(0.5)),
        ]));
        let right = Pattern::pure(Value::map(vec![("gain", Value::from(1.0))]));
        let haps = query_cycle(&left.merge_right(right), 0);
        match &haps[0].value {
            Value::Map(m) => {
                assert_eq!(m.get("s"), Some(&Value::from("bd")));
                assert_eq!(m.get("gain"), Some(&Value::Number(1.0)));
            }
            other => panic!("expected map, got {:?}", other),
        }
    }

    #[test]
    fn test_linger_repeats_head() {
        let p = fastcat(vec![
            Pattern::pure("a"),
            Pattern::pure("b"),
            Pattern::pure("c"),
            Pattern::pure("d"),
        ])
        .linger(Fraction::new(1, 4));
        let values: Vec<_> = query_cycle(&p, 0).into_iter().map(|h| h.value).collect();
        assert_eq!(values, vec!["a", "a", "a", "a"]);
    }

    #[test]
    fn test_segment_discretizes_signal() {
        let p = crate::pattern_signal::saw().segment(4);
        let haps = query_cycle(&p, 0);
        assert_eq!(haps.len(), 4);
        assert!(haps.iter().all(|h| h.whole.is_some()));
        assert_eq!(haps[1].part.begin, Fraction::new(1, 4));
    }
}
