//! Signal and continuous pattern operations
//!
//! Continuous (analog) patterns have no discrete onsets: a query returns a
//! single hap with no `whole`, valued at the midpoint of the query span.
//! Discretize them with `segment` or sample them through `struct_with`.

use crate::pattern::{cycle_seed, next_node_id, time_seed, Hap, Pattern, State};
use rand::distributions::{Distribution, WeightedIndex};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Create a continuous signal pattern from a function of cycle time.
pub fn signal<T: Clone + Send + Sync + 'static>(
    f: impl Fn(f64) -> T + Send + Sync + 'static,
) -> Pattern<T> {
    Pattern::new(move |state: &State| {
        if state.span.is_empty() {
            return vec![];
        }
        let value = f(state.span.midpoint().to_float());
        vec![Hap::new(None, state.span, value)]
    })
}

/// A signal holding one value forever.
pub fn steady<T: Clone + Send + Sync + 'static>(value: T) -> Pattern<T> {
    signal(move |_| value.clone())
}

/// Sine wave signal (0 to 1), one period per cycle.
pub fn sine() -> Pattern<f64> {
    signal(|t| (t * std::f64::consts::TAU).sin() * 0.5 + 0.5)
}

/// Cosine wave signal (0 to 1)
pub fn cosine() -> Pattern<f64> {
    signal(|t| (t * std::f64::consts::TAU).cos() * 0.5 + 0.5)
}

/// Sawtooth wave signal (0 to 1)
pub fn saw() -> Pattern<f64> {
    signal(|t| t.rem_euclid(1.0))
}

/// Inverse sawtooth wave signal (1 to 0)
pub fn isaw() -> Pattern<f64> {
    signal(|t| 1.0 - t.rem_euclid(1.0))
}

/// Triangle wave signal (0 to 1)
pub fn tri() -> Pattern<f64> {
    signal(|t| {
        let phase = t.rem_euclid(1.0);
        if phase < 0.5 {
            phase * 2.0
        } else {
            2.0 - phase * 2.0
        }
    })
}

/// Square wave signal (0 or 1)
pub fn square() -> Pattern<f64> {
    signal(|t| if t.rem_euclid(1.0) < 0.5 { 0.0 } else { 1.0 })
}

/// Continuous random values in `[0, 1)`. Deterministic: the value depends
/// only on the query time and this node's identity, so replaying a cycle
/// replays its randomness.
pub fn rand() -> Pattern<f64> {
    let node = next_node_id();
    Pattern::new(move |state: &State| {
        if state.span.is_empty() {
            return vec![];
        }
        let mut rng = StdRng::seed_from_u64(time_seed(node, state.span.midpoint()));
        vec![Hap::new(None, state.span, rng.gen::<f64>())]
    })
}

/// Random integers in `[0, max)`, as a continuous pattern.
pub fn irand(max: i64) -> Pattern<f64> {
    if max <= 0 {
        return steady(0.0);
    }
    rand().fmap(move |v| (v * max as f64).floor())
}

/// Map a selector pattern's `[0, 1)` values over a list of choices.
pub fn choose_by<T: Clone + Send + Sync + 'static>(
    selector: Pattern<f64>,
    choices: Vec<T>,
) -> Pattern<T> {
    if choices.is_empty() {
        return Pattern::silence();
    }
    selector.fmap(move |v| {
        let idx = ((v.rem_euclid(1.0)) * choices.len() as f64).floor() as usize;
        choices[idx.min(choices.len() - 1)].clone()
    })
}

/// Choose a value at random (continuous; one value per query).
pub fn choose<T: Clone + Send + Sync + 'static>(choices: Vec<T>) -> Pattern<T> {
    choose_by(rand(), choices)
}

/// Weighted random choice, one value per cycle.
pub fn wchoose<T: Clone + Send + Sync + 'static>(choices: Vec<(T, f64)>) -> Pattern<T> {
    if choices.is_empty() {
        return Pattern::silence();
    }
    let node = next_node_id();
    let weights: Vec<f64> = choices.iter().map(|(_, w)| w.max(0.0)).collect();
    let dist = WeightedIndex::new(&weights).ok();
    Pattern::new(move |state: &State| {
        let mut out = Vec::new();
        for span in state.span.cycle_spans() {
            let mut rng = StdRng::seed_from_u64(cycle_seed(node, span.begin.floor()));
            let idx = match &dist {
                Some(d) => d.sample(&mut rng),
                None => rng.gen_range(0..choices.len()),
            };
            let whole =
                crate::pattern::TimeSpan::new(span.begin.sam(), span.begin.next_sam());
            out.push(Hap::new(Some(whole), span, choices[idx].0.clone()));
        }
        out
    })
}

/// Pick a whole pattern at random each cycle; the chosen pattern supplies
/// the cycle's structure. This is what the mini-notation `|` choice lowers
/// to.
pub fn choose_cycles<T: Clone + Send + Sync + 'static>(
    choices: Vec<(f64, Pattern<T>)>,
) -> Pattern<T> {
    if choices.is_empty() {
        return Pattern::silence();
    }
    let node = next_node_id();
    let weights: Vec<f64> = choices.iter().map(|(w, _)| w.max(0.0)).collect();
    let dist = WeightedIndex::new(&weights).ok();
    Pattern::new(move |state: &State| {
        let mut out = Vec::new();
        for span in state.span.cycle_spans() {
            let mut rng = StdRng::seed_from_u64(cycle_seed(node, span.begin.floor()));
            let idx = match &dist {
                Some(d) => d.sample(&mut rng),
                None => rng.gen_range(0..choices.len()),
            };
            out.extend(choices[idx].1.query(&state.with_span(span)));
        }
        out
    })
}

/// The integers `0..n`, one cycle's worth of ascending steps.
pub fn run(n: usize) -> Pattern<f64> {
    crate::pattern_structure::fastcat((0..n).map(|i| Pattern::pure(i as f64)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::{Fraction, TimeSpan};

    fn span(b: (i64, i64), e: (i64, i64)) -> TimeSpan {
        TimeSpan::new(Fraction::new(b.0, b.1), Fraction::new(e.0, e.1))
    }

    #[test]
    fn test_signal_samples_midpoint() {
        let p = signal(|t| t);
        let haps = p.query(&State::new(span((0, 1), (1, 2))));
        assert_eq!(haps.len(), 1);
        assert_eq!(haps[0].whole, None);
        assert!((haps[0].value - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_signal_empty_on_zero_width() {
        let p = sine();
        assert!(p.query(&State::new(span((1, 2), (1, 2)))).is_empty());
    }

    #[test]
    fn test_sine_range() {
        let p = sine();
        for i in 0..16 {
            let haps = p.query(&State::new(TimeSpan::new(
                Fraction::new(i, 16),
                Fraction::new(i + 1, 16),
            )));
            assert!(haps[0].value >= 0.0 && haps[0].value <= 1.0);
        }
    }

    #[test]
    fn test_rand_deterministic() {
        let p = rand();
        let s = State::new(span((0, 1), (1, 1)));
        assert_eq!(p.query(&s)[0].value, p.query(&s)[0].value);
    }

    #[test]
    fn test_two_rand_nodes_differ() {
        let a = rand();
        let b = rand();
        // Independent nodes should not produce identical streams.
        let differs = (0..8).any(|i| {
            let s = State::new(TimeSpan::new(
                Fraction::from_integer(i),
                Fraction::from_integer(i + 1),
            ));
            a.query(&s)[0].value != b.query(&s)[0].value
        });
        assert!(differs);
    }

    #[test]
    fn test_irand_bounds() {
        let p = irand(8);
        for i in 0..32 {
            let haps = p.query(&State::new(TimeSpan::new(
                Fraction::from_integer(i),
                Fraction::from_integer(i + 1),
            )));
            let v = haps[0].value;
            assert!(v >= 0.0 && v < 8.0);
            assert_eq!(v, v.floor());
        }
    }

    #[test]
    fn test_wchoose_respects_weights() {
        let p = wchoose(vec![("common", 9.0), ("rare", 1.0), ("never", 0.0)]);
        let mut common = 0;
        let mut rare = 0;
        for cycle in 0..200 {
            let s = State::new(TimeSpan::new(
                Fraction::from_integer(cycle),
                Fraction::from_integer(cycle + 1),
            ));
            let haps = p.query(&s);
            assert_eq!(haps.len(), 1);
            // the same cycle always picks the same value
            assert_eq!(haps[0].value, p.query(&s)[0].value);
            match haps[0].value {
                "common" => common += 1,
                "rare" => rare += 1,
                other => panic!("zero-weight value chosen: {}", other),
            }
        }
        assert!(common > rare, "9:1 weighting chose common {} of 200", common);
    }

    #[test]
    fn test_choose_cycles_stable_within_cycle() {
        let p = choose_cycles(vec![
            (1.0, Pattern::pure("a")),
            (1.0, Pattern::pure("b")),
        ]);
        for i in 0..8 {
            let s = State::new(TimeSpan::new(
                Fraction::from_integer(i),
                Fraction::from_integer(i + 1),
            ));
            assert_eq!(p.query(&s)[0].value, p.query(&s)[0].value);
        }
    }

    #[test]
    fn test_run_counts_up() {
        let p = run(4);
        let haps = p.query(&State::new(span((0, 1), (1, 1))));
        let values: Vec<f64> = haps.into_iter().map(|h| h.value).collect();
        assert_eq!(values, vec![0.0, 1.0, 2.0, 3.0]);
    }
}
