//! Structural pattern combinators
//!
//! Everything that builds one pattern out of several: stacking,
//! concatenation, weighted timelines, polymeters, and the combinators that
//! take structure from one pattern and values from another.

use crate::pattern::{Fraction, Hap, Pattern, State, TimeSpan};

/// Play all patterns simultaneously. Events that start together are kept in
/// argument order, which is the ordering contract visualizers rely on.
pub fn stack<T: Clone + Send + Sync + 'static>(patterns: Vec<Pattern<T>>) -> Pattern<T> {
    Pattern::new(move |state: &State| patterns.iter().flat_map(|p| p.query(state)).collect())
}

/// One pattern per cycle, round-robin. Constituent patterns advance through
/// their own cycles one visit at a time, so `slowcat([a, b])` plays a's
/// cycle 0, b's cycle 0, a's cycle 1, b's cycle 1, ...
pub fn slowcat<T: Clone + Send + Sync + 'static>(patterns: Vec<Pattern<T>>) -> Pattern<T> {
    if patterns.is_empty() {
        return Pattern::silence();
    }
    let len = patterns.len() as i64;
    Pattern::new(move |state: &State| {
        let mut out = Vec::new();
        for span in state.span.cycle_spans() {
            let cycle = span.begin.floor();
            let idx = cycle.rem_euclid(len) as usize;
            let offset = Fraction::from_integer(cycle - cycle.div_euclid(len));
            let inner = span.shift(-offset);
            for hap in patterns[idx].query(&state.with_span(inner)) {
                out.push(hap.with_time(|t| t + offset));
            }
        }
        out
    })
}

/// Alias for [`slowcat`].
pub fn cat<T: Clone + Send + Sync + 'static>(patterns: Vec<Pattern<T>>) -> Pattern<T> {
    slowcat(patterns)
}

/// Squeeze all patterns into a single cycle, each taking an equal share.
pub fn fastcat<T: Clone + Send + Sync + 'static>(patterns: Vec<Pattern<T>>) -> Pattern<T> {
    if patterns.is_empty() {
        return Pattern::silence();
    }
    let len = patterns.len() as i64;
    slowcat(patterns)
        .fast(Fraction::from_integer(len))
        .with_steps(Fraction::from_integer(len))
}

/// Like [`fastcat`] but each pattern's share of the cycle is proportional to
/// its weight. Zero and negative weights are skipped.
pub fn timecat<T: Clone + Send + Sync + 'static>(
    items: Vec<(Fraction, Pattern<T>)>,
) -> Pattern<T> {
    let total: Fraction = items
        .iter()
        .filter(|(w, _)| *w > Fraction::zero())
        .fold(Fraction::zero(), |acc, (w, _)| acc + *w);
    if total <= Fraction::zero() {
        return Pattern::silence();
    }
    let mut layers = Vec::new();
    let mut pos = Fraction::zero();
    for (weight, pattern) in items {
        if weight <= Fraction::zero() {
            continue;
        }
        let begin = pos / total;
        pos = pos + weight;
        let end = pos / total;
        layers.push(pattern.compress(begin, end));
    }
    stack(layers).with_steps(total)
}

/// Stack the patterns with each one's step rate aligned to `steps` steps per
/// cycle. Without an explicit step count the longest pattern wins.
pub fn polymeter<T: Clone + Send + Sync + 'static>(
    patterns: Vec<Pattern<T>>,
    steps: Option<Fraction>,
) -> Pattern<T> {
    if patterns.is_empty() {
        return Pattern::silence();
    }
    let target = steps
        .or_else(|| patterns.iter().filter_map(|p| p.steps()).max())
        .unwrap_or_else(Fraction::one);
    if target <= Fraction::zero() {
        return Pattern::silence();
    }
    let layers = patterns
        .into_iter()
        .map(|p| {
            let own = p.steps().unwrap_or_else(Fraction::one);
            p.fast(target / own)
        })
        .collect();
    stack(layers).with_steps(target)
}

/// Stack patterns without any tactus rescaling; every pattern keeps its own
/// cycle as the common cycle.
pub fn polyrhythm<T: Clone + Send + Sync + 'static>(patterns: Vec<Pattern<T>>) -> Pattern<T> {
    stack(patterns)
}

impl<T: Clone + Send + Sync + 'static> Pattern<T> {
    /// Take event structure from `structure`: wherever it yields a truthy
    /// hap, emit this pattern's value sampled at that hap's onset.
    pub fn struct_with(self, structure: Pattern<bool>) -> Self {
        Pattern::new(move |state: &State| {
            let mut out = Vec::new();
            for shap in structure.query(state) {
                if !shap.value {
                    continue;
                }
                let onset = shap.whole_or_part().begin;
                if let Some(vhap) = self.sample_at(onset, state) {
                    out.push(Hap {
                        whole: shap.whole,
                        part: shap.part,
                        value: vhap.value,
                        context: shap.context.merged(&vhap.context),
                    });
                }
            }
            out
        })
    }

    /// The inverse of [`Pattern::struct_with`]: keep this pattern's own
    /// events, but only where the mask pattern is truthy. Parts are clipped
    /// to the truthy regions.
    pub fn mask(self, mask: Pattern<bool>) -> Self {
        Pattern::new(move |state: &State| {
            let mask_haps: Vec<Hap<bool>> = mask
                .query(state)
                .into_iter()
                .filter(|h| h.value)
                .collect();
            let mut out = Vec::new();
            for hap in self.query(state) {
                for mhap in &mask_haps {
                    if let Some(part) = hap.part.sect(&mhap.part) {
                        out.push(Hap {
                            whole: hap.whole,
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
}

/// Bjorklund's algorithm: distribute `pulses` onsets over `steps` slots as
/// evenly as possible. `(3, 8)` gives `10010010`.
pub fn bjorklund(pulses: usize, steps: usize) -> Vec<bool> {
    if steps == 0 {
        return vec![];
    }
    if pulses == 0 {
        return vec![false; steps];
    }
    if pulses >= steps {
        return vec![true; steps];
    }
    let mut a: Vec<Vec<bool>> = vec![vec![true]; pulses];
    let mut b: Vec<Vec<bool>> = vec![vec![false]; steps - pulses];
    while b.len() > 1 {
        let n = a.len().min(b.len());
        let mut merged = Vec::with_capacity(n);
        for i in 0..n {
            let mut seq = a[i].clone();
            seq.extend_from_slice(&b[i]);
            merged.push(seq);
        }
        let remainder = if a.len() > n {
            a[n..].to_vec()
        } else {
            b[n..].to_vec()
        };
        a = merged;
        b = remainder;
    }
    a.into_iter().chain(b).flatten().collect()
}

impl Pattern<bool> {
    /// Euclidean rhythm as a boolean pattern of `steps` slots per cycle,
    /// rotated left by `rotation` slots.
    pub fn euclid(pulses: usize, steps: usize, rotation: i64) -> Self {
        if steps == 0 {
            return Pattern::silence();
        }
        let mut slots = bjorklund(pulses, steps);
        let rot = rotation.rem_euclid(steps as i64) as usize;
        slots.rotate_left(rot);
        fastcat(slots.into_iter().map(Pattern::pure).collect())
    }
}
