//! Clock-driven look-ahead scheduler
//!
//! A single-threaded cooperative loop: every tick it queries the active
//! pattern over the window of pattern time between the last tick's horizon
//! and `now + look_ahead`, converts the resulting onsets to absolute
//! wall-clock timestamps and hands them to the output sink. Windows only
//! move forward, so no event is ever emitted twice; a late tick simply
//! covers a larger window.
//!
//! External writers never touch scheduler state directly: play, stop, tempo
//! and seek arrive as commands on a channel and apply at tick boundaries.
//! Pattern swaps land exactly on the next cycle boundary, which keeps
//! per-cycle randomness coherent. No panic crosses a tick: queries run under
//! `catch_unwind` and a blown budget skips the window with a one-shot
//! diagnostic.

use crate::pattern::{Context, Fraction, Hap, Pattern, State, TimeSpan};
use crate::value::Value;
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Monotonic time source supplied by the host. `epoch` is the fixed instant
/// where cycle 0 starts.
pub trait Clock: Send {
    fn now(&self) -> Instant;
    fn epoch(&self) -> Instant;
}

/// Process-lifetime monotonic clock; the fallback when no audio clock is
/// available.
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn epoch(&self) -> Instant {
        self.epoch
    }
}

#[derive(Debug, Clone)]
pub struct SinkError(pub String);

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for SinkError {}

/// Consumer of scheduled events: an audio engine, MIDI out, OSC sender, or a
/// test collector. Timestamps are absolute in the clock's domain and at or
/// after `now`, so a sample-accurate backend can take over from there.
pub trait OutputSink: Send {
    fn emit(
        &mut self,
        time: Instant,
        value: &Value,
        duration: Duration,
        context: &Context,
    ) -> Result<(), SinkError>;

    /// Drop any queued events triggering after `horizon`. Called on stop and
    /// shutdown.
    fn flush(&mut self, horizon: Instant) {
        let _ = horizon;
    }
}

/// Commands applied at the next tick boundary.
pub enum SchedulerCommand {
    /// Swap in a new pattern at the next cycle boundary.
    Play(Pattern<Value>),
    /// Silence and flush.
    Stop,
    /// Change tempo, preserving phase.
    SetCps(Fraction),
    /// Jump to a cycle position.
    Seek(Fraction),
}

/// Cloneable handle for external writers (REPL, tempo faders).
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    pub fn play(&self, pattern: Pattern<Value>) {
        let _ = self.tx.send(SchedulerCommand::Play(pattern));
    }

    pub fn stop(&self) {
        let _ = self.tx.send(SchedulerCommand::Stop);
    }

    pub fn set_cps(&self, cps: Fraction) {
        let _ = self.tx.send(SchedulerCommand::SetCps(cps));
    }

    pub fn seek(&self, cycle: Fraction) {
        let _ = self.tx.send(SchedulerCommand::Seek(cycle));
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Cycles per second.
    pub cps: Fraction,
    /// How far past `now` each tick schedules.
    pub look_ahead: Duration,
    /// Expected tick period; also the query time budget.
    pub interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cps: Fraction::new(1, 2),
            look_ahead: Duration::from_millis(100),
            interval: Duration::from_millis(50),
        }
    }
}

pub struct Scheduler<C: Clock, S: OutputSink> {
    clock: C,
    sink: S,
    cps: Fraction,
    /// Tempo anchor: `origin` is the wall time of cycle `origin_cycle` under
    /// the current cps. Re-anchored on tempo changes so phase is preserved.
    origin: Instant,
    origin_cycle: Fraction,
    active: Pattern<Value>,
    pending: Option<Pattern<Value>>,
    look_ahead: Duration,
    interval: Duration,
    /// Pattern time up to which events have been emitted. Only ever grows.
    last_scheduled_to: Fraction,
    tx: Sender<SchedulerCommand>,
    rx: Receiver<SchedulerCommand>,
    budget_blown: bool,
    query_poisoned: bool,
}

impl<C: Clock, S: OutputSink> Scheduler<C, S> {
    pub fn new(clock: C, sink: S, config: SchedulerConfig) -> Self {
        let (tx, rx) = unbounded();
        let origin = clock.epoch();
        Self {
            clock,
            sink,
            cps: config.cps,
            origin,
            origin_cycle: Fraction::zero(),
            active: Pattern::silence(),
            pending: None,
            look_ahead: config.look_ahead,
            interval: config.interval,
            last_scheduled_to: Fraction::zero(),
            tx,
            rx,
            budget_blown: false,
            query_poisoned: false,
        }
    }

    /// Handle for other threads or components to send commands through.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            tx: self.tx.clone(),
        }
    }

    /// Schedule a pattern to start at the next cycle boundary.
    pub fn play(&self, pattern: Pattern<Value>) {
        let _ = self.tx.send(SchedulerCommand::Play(pattern));
    }

    pub fn stop(&self) {
        let _ = self.tx.send(SchedulerCommand::Stop);
    }

    pub fn set_cps(&self, cps: Fraction) {
        let _ = self.tx.send(SchedulerCommand::SetCps(cps));
    }

    pub fn seek(&self, cycle: Fraction) {
        let _ = self.tx.send(SchedulerCommand::Seek(cycle));
    }

    pub fn cps(&self) -> Fraction {
        self.cps
    }

    /// Cycle position at a wall-clock instant under the current tempo.
    fn cycle_at(&self, t: Instant) -> Fraction {
        let secs = t.saturating_duration_since(self.origin).as_secs_f64();
        self.origin_cycle + Fraction::from_float(secs) * self.cps
    }

    /// Wall-clock instant of a cycle position under the current tempo.
    fn wall_time_at(&self, cycle: Fraction) -> Instant {
        let delta = ((cycle - self.origin_cycle) / self.cps).to_float();
        if delta >= 0.0 {
            self.origin + Duration::from_secs_f64(delta)
        } else {
            self.origin
                .checked_sub(Duration::from_secs_f64(-delta))
                .unwrap_or(self.origin)
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.rx.try_recv() {
            match command {
                SchedulerCommand::Play(pattern) => {
                    self.pending = Some(pattern);
                }
                SchedulerCommand::Stop => {
                    self.pending = None;
                    self.active = Pattern::silence();
                    let horizon = self.clock.now() + self.look_ahead;
                    self.sink.flush(horizon);
                    info!("scheduler stopped");
                }
                SchedulerCommand::SetCps(cps) => {
                    if cps <= Fraction::zero() {
                        warn!("ignoring non-positive cps {}", cps);
                        continue;
                    }
                    let now = self.clock.now();
                    self.origin_cycle = self.cycle_at(now);
                    self.origin = now;
                    self.cps = cps;
                    info!("cps set to {}", cps);
                }
                SchedulerCommand::Seek(cycle) => {
                    let now = self.clock.now();
                    self.origin = now;
                    self.origin_cycle = cycle;
                    self.last_scheduled_to = cycle;
                    info!("seek to cycle {}", cycle);
                }
            }
        }
    }

    /// One pass of the look-ahead loop. Host timers or audio callbacks call
    /// this every `interval`.
    pub fn tick(&mut self) {
        self.drain_commands();

        let now = self.clock.now();
        let window_end = self.cycle_at(now + self.look_ahead);
        let begin = self.last_scheduled_to;
        if window_end <= begin {
            return;
        }

        // Pending patterns take over exactly at a cycle boundary, splitting
        // the window in two if it straddles one.
        let mut batches: Vec<(Pattern<Value>, TimeSpan)> = Vec::new();
        if let Some(pattern) = self.pending.take() {
            let boundary = if begin.is_integer() {
                begin
            } else {
                begin.next_sam()
            };
            if boundary <= window_end {
                if boundary > begin {
                    batches.push((self.active.clone(), TimeSpan::new(begin, boundary)));
                }
                info!("pattern swap at cycle {}", boundary);
                self.active = pattern;
                self.budget_blown = false;
                self.query_poisoned = false;
                if window_end > boundary {
                    batches.push((self.active.clone(), TimeSpan::new(boundary, window_end)));
                }
            } else {
                self.pending = Some(pattern);
                batches.push((self.active.clone(), TimeSpan::new(begin, window_end)));
            }
        } else {
            batches.push((self.active.clone(), TimeSpan::new(begin, window_end)));
        }

        let mut haps: Vec<Hap<Value>> = Vec::new();
        for (pattern, span) in batches {
            let started = Instant::now();
            match catch_unwind(AssertUnwindSafe(|| pattern.query(&State::new(span)))) {
                Ok(batch) => {
                    if started.elapsed() > self.interval {
                        if !self.budget_blown {
                            warn!(
                                "query of {} blew the {:?} tick budget; skipping window",
                                span, self.interval
                            );
                            self.budget_blown = true;
                        }
                        continue;
                    }
                    haps.extend(batch);
                }
                Err(payload) => {
                    if !self.query_poisoned {
                        error!("pattern query panicked: {}", panic_message(&payload));
                        self.query_poisoned = true;
                    }
                }
            }
        }
        self.last_scheduled_to = window_end;

        // Only onsets trigger; continuation fragments of already-started
        // events were emitted by an earlier window.
        let mut events: Vec<Hap<Value>> = haps.into_iter().filter(|h| h.has_onset()).collect();
        events.sort_by(|a, b| a.part.begin.cmp(&b.part.begin));
        for hap in events {
            let time = self.wall_time_at(hap.part.begin);
            let duration =
                Duration::from_secs_f64(((hap.part.duration()) / self.cps).to_float().max(0.0));
            if let Err(err) = self.sink.emit(time, &hap.value, duration, &hap.context) {
                warn!("sink rejected event: {}", err);
            }
        }
    }

    /// Flush and hand back the clock and sink.
    pub fn shutdown(mut self) -> (C, S) {
        let now = self.clock.now();
        self.sink.flush(now);
        (self.clock, self.sink)
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Clock whose time only moves when the test says so.
    #[derive(Clone)]
    struct TestClock {
        epoch: Instant,
        elapsed: Arc<Mutex<Duration>>,
    }

    impl TestClock {
        fn new() -> Self {
            Self {
                epoch: Instant::now(),
                elapsed: Arc::new(Mutex::new(Duration::ZERO)),
            }
        }

        fn advance(&self, d: Duration) {
            *self.elapsed.lock().unwrap() += d;
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> Instant {
            self.epoch + *self.elapsed.lock().unwrap()
        }

        fn epoch(&self) -> Instant {
            self.epoch
        }
    }

    #[derive(Clone, Default)]
    struct CollectingSink {
        events: Arc<Mutex<Vec<(Duration, Value, Duration)>>>,
        epoch: Option<Instant>,
    }

    impl CollectingSink {
        fn with_epoch(epoch: Instant) -> Self {
            Self {
                events: Arc::new(Mutex::new(Vec::new())),
                epoch: Some(epoch),
            }
        }

        fn times(&self) -> Vec<Duration> {
            self.events.lock().unwrap().iter().map(|(t, _, _)| *t).collect()
        }
    }

    impl OutputSink for CollectingSink {
        fn emit(
            &mut self,
            time: Instant,
            value: &Value,
            duration: Duration,
            _context: &Context,
        ) -> Result<(), SinkError> {
            let offset = time.saturating_duration_since(self.epoch.unwrap());
            self.events
                .lock()
                .unwrap()
                .push((offset, value.clone(), duration));
            Ok(())
        }
    }

    fn scheduler_with(
        cps: Fraction,
    ) -> (Scheduler<TestClock, CollectingSink>, TestClock, CollectingSink) {
        let clock = TestClock::new();
        let sink = CollectingSink::with_epoch(clock.epoch);
        let config = SchedulerConfig {
            cps,
            look_ahead: Duration::from_millis(100),
            interval: Duration::from_millis(50),
        };
        let scheduler = Scheduler::new(clock.clone(), sink.clone(), config);
        (scheduler, clock, sink)
    }

    #[test]
    fn test_no_duplicate_events() {
        let (mut scheduler, clock, sink) = scheduler_with(Fraction::one());
        scheduler.play(Pattern::pure(Value::from("x")));
        for _ in 0..100 {
            scheduler.tick();
            clock.advance(Duration::from_millis(50));
        }
        let times = sink.times();
        // 5 seconds plus 100ms look-ahead: cycles 0..=5
        assert_eq!(times.len(), 6);
        for (i, t) in times.iter().enumerate() {
            assert_eq!(*t, Duration::from_secs(i as u64));
        }
    }

    #[test]
    fn test_late_tick_catches_up() {
        let (mut scheduler, clock, sink) = scheduler_with(Fraction::one());
        scheduler.play(Pattern::pure(Value::from("x")));
        scheduler.tick();
        // a stall: several intervals pass without ticks
        clock.advance(Duration::from_millis(2500));
        scheduler.tick();
        let times = sink.times();
        assert_eq!(times.len(), 3);
        assert_eq!(times, vec![
            Duration::from_secs(0),
            Duration::from_secs(1),
            Duration::from_secs(2),
        ]);
    }

    #[test]
    fn test_swap_lands_on_cycle_boundary() {
        let (mut scheduler, clock, sink) = scheduler_with(Fraction::one());
        scheduler.play(Pattern::pure(Value::from("a")));
        scheduler.tick();
        // mid-cycle: request a swap
        clock.advance(Duration::from_millis(450));
        scheduler.play(Pattern::pure(Value::from("b")));
        for _ in 0..40 {
            scheduler.tick();
            clock.advance(Duration::from_millis(50));
        }
        let events = sink.events.lock().unwrap().clone();
        let first_b = events
            .iter()
            .find(|(_, v, _)| *v == Value::from("b"))
            .expect("b never played");
        assert_eq!(first_b.0, Duration::from_secs(1));
        // nothing from "a" at or after the boundary
        assert!(events
            .iter()
            .filter(|(_, v, _)| *v == Value::from("a"))
            .all(|(t, _, _)| *t < Duration::from_secs(1)));
    }

    #[test]
    fn test_event_spacing_at_constant_cps() {
        let (mut scheduler, clock, sink) = scheduler_with(Fraction::one());
        let p = crate::pattern_structure::fastcat(vec![
            Pattern::pure(Value::from("a")),
            Pattern::pure(Value::from("b")),
            Pattern::pure(Value::from("c")),
            Pattern::pure(Value::from("d")),
        ]);
        scheduler.play(p);
        for _ in 0..50 {
            scheduler.tick();
            clock.advance(Duration::from_millis(50));
        }
        let times = sink.times();
        assert!(times.len() >= 8);
        for pair in times.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_millis(250));
        }
    }

    #[test]
    fn test_stop_silences() {
        let (mut scheduler, clock, sink) = scheduler_with(Fraction::one());
        scheduler.play(Pattern::pure(Value::from("x")));
        scheduler.tick();
        scheduler.stop();
        for _ in 0..40 {
            scheduler.tick();
            clock.advance(Duration::from_millis(50));
        }
        // only what the first window scheduled
        assert_eq!(sink.times().len(), 1);
    }

    #[test]
    fn test_panicking_pattern_does_not_kill_tick() {
        let (mut scheduler, clock, sink) = scheduler_with(Fraction::one());
        let bomb: Pattern<Value> = Pattern::new(|_| panic!("boom"));
        scheduler.play(bomb);
        for _ in 0..10 {
            scheduler.tick();
            clock.advance(Duration::from_millis(50));
        }
        assert!(sink.times().is_empty());
        // scheduler still accepts a healthy pattern afterwards
        scheduler.play(Pattern::pure(Value::from("x")));
        for _ in 0..30 {
            scheduler.tick();
            clock.advance(Duration::from_millis(50));
        }
        assert!(!sink.times().is_empty());
    }

    #[test]
    fn test_set_cps_preserves_phase() {
        let (mut scheduler, clock, sink) = scheduler_with(Fraction::one());
        scheduler.play(Pattern::pure(Value::from("x")));
        for _ in 0..10 {
            scheduler.tick();
            clock.advance(Duration::from_millis(50));
        }
        scheduler.set_cps(Fraction::from_integer(2));
        for _ in 0..30 {
            scheduler.tick();
            clock.advance(Duration::from_millis(50));
        }
        let times = sink.times();
        assert!(times.len() >= 3);
        // events keep strictly increasing trigger times across the change
        for pair in times.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }
}
