//! # Chronon - Live Coding Pattern Engine
//!
//! Chronon is the core of a live-coding system in the TidalCycles/Strudel
//! family: a pattern algebra over exact rational time, a mini-notation
//! front end, and a look-ahead scheduler that turns patterns into
//! wall-clock-timestamped events for an output sink (audio engine, MIDI,
//! OSC). The core is symbolic; it never touches audio buffers.
//!
//! ## Patterns
//!
//! A pattern is a pure function from a time span to events. Querying is
//! cheap, deterministic and side-effect free, so the scheduler can ask for
//! any window of pattern time at any moment:
//!
//! ```rust
//! use chronon::mini_notation::parse_mini_notation;
//! use chronon::pattern::Fraction;
//!
//! let pattern = parse_mini_notation("bd [sd cp]*2").unwrap();
//! let haps = pattern.first_cycle();
//! assert_eq!(haps.len(), 5);
//! assert_eq!(haps[1].part.begin, Fraction::new(1, 2));
//! ```
//!
//! ## Mini-notation
//!
//! - **`bd sn hh`** - sequence within one cycle
//! - **`bd*4`** / **`bd/2`** - repeat faster / stretch slower
//! - **`bd ~ ~ ~`** - rests
//! - **`<bd sn cp>`** - alternate, one per cycle
//! - **`[bd, sn sn]`** - stack simultaneously
//! - **`bd(3,8)`** - euclidean rhythm (`10010010`)
//! - **`{bd sn cp}%4`** - polymeter at four steps per cycle
//! - **`bd:3`** - sample index; **`bd@2`** weight; **`bd!3`** replicate
//! - **`bd?`** / **`bd??0.2`** - random drops; **`a | b`** random choice
//!
//! ## Evaluation and scheduling
//!
//! ```rust
//! use chronon::evaluator::{evaluate_with, Registry};
//!
//! let registry = Registry::with_defaults();
//! let pattern = evaluate_with("every(2, rev, \"bd [sd cp]*2\")", &registry).unwrap();
//! assert_eq!(pattern.first_cycle().len(), 5);
//! ```
//!
//! The [`scheduler::Scheduler`] consumes a host [`scheduler::Clock`] and an
//! [`scheduler::OutputSink`], querying the active pattern in look-ahead
//! windows and emitting each event once, at an absolute trigger time the
//! sink can hand to a sample-accurate backend. Pattern swaps land on cycle
//! boundaries; tempo changes preserve phase; parse and evaluation errors
//! surface as diagnostics while the previous pattern keeps playing.

pub mod error_diagnostics;
pub mod evaluator;
pub mod mini_notation;
pub mod pattern;
pub mod pattern_ops;
pub mod pattern_query;
pub mod pattern_signal;
pub mod pattern_structure;
pub mod scheduler;
pub mod value;
