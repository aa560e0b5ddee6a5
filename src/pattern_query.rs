//! Pattern query and inspection helpers
//!
//! Conveniences over `Pattern::query` for tests, the CLI and visualizers.

use crate::pattern::{Fraction, Hap, Pattern, State, TimeSpan};
use std::fmt::Debug;

impl<T: Clone + Send + Sync + 'static> Pattern<T> {
    /// All events in cycle zero.
    pub fn first_cycle(&self) -> Vec<Hap<T>> {
        self.query_span(Fraction::zero(), Fraction::one())
    }

    /// Query between two cycle positions.
    pub fn query_span(&self, begin: Fraction, end: Fraction) -> Vec<Hap<T>> {
        self.query(&State::new(TimeSpan::new(begin, end)))
    }

    /// Do two patterns produce the same events over the given number of
    /// cycles?
    pub fn equivalent_to(&self, other: &Pattern<T>, cycles: i64) -> bool
    where
        T: PartialEq,
    {
        let a = self.query_span(Fraction::zero(), Fraction::from_integer(cycles));
        let b = other.query_span(Fraction::zero(), Fraction::from_integer(cycles));
        a.len() == b.len()
            && a.iter()
                .zip(b.iter())
                .all(|(x, y)| x.value == y.value && x.part == y.part && x.whole == y.whole)
    }
}

impl<T: Clone + Send + Sync + Debug + 'static> Pattern<T> {
    /// Multi-line listing of one cycle, for terminals.
    pub fn show(&self) -> String {
        let haps = self.first_cycle();
        let mut out = format!("{} event(s) in cycle 0:\n", haps.len());
        for hap in &haps {
            let whole = match hap.whole {
                Some(w) => format!("{}", w),
                None => "(analog)".to_string(),
            };
            out.push_str(&format!("  {} {} {:?}\n", hap.part, whole, hap.value));
        }
        out
    }

    /// One-line ASCII rendering of cycle zero.
    pub fn draw_line(&self, width: usize) -> String {
        let mut line = vec!['.'; width];
        for hap in self.first_cycle() {
            let begin = (hap.part.begin.to_float() * width as f64) as usize;
            let end = (hap.part.end.to_float() * width as f64).ceil() as usize;
            for (i, slot) in line.iter_mut().enumerate().take(end.min(width)) {
                if i >= begin {
                    *slot = if i == begin { '|' } else { '_' };
                }
            }
        }
        line.into_iter().collect()
    }
}
