//! Chronon CLI - inspect and play patterns from the command line

use chronon::error_diagnostics::Diagnostic;
use chronon::evaluator::{evaluate_with, Registry};
use chronon::pattern::{Context, Fraction, Pattern};
use chronon::scheduler::{
    Clock, OutputSink, Scheduler, SchedulerConfig, SinkError, SystemClock,
};
use chronon::value::Value;
use clap::{Parser, Subcommand};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Parser)]
#[command(name = "chronon")]
#[command(about = "Chronon pattern engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a pattern and list its events
    Show {
        /// Mini-notation, or a host expression with --expr
        input: String,

        /// Number of cycles to list (default: 1)
        #[arg(short, long, default_value = "1")]
        cycles: i64,

        /// Treat the input as a host expression instead of mini-notation
        #[arg(long)]
        expr: bool,
    },

    /// ASCII-render one cycle of a pattern
    Draw {
        input: String,

        /// Line width in characters (default: 48)
        #[arg(short, long, default_value = "48")]
        width: usize,

        #[arg(long)]
        expr: bool,
    },

    /// Run the scheduler against the system clock, logging events
    Play {
        input: String,

        /// Cycles per second (default: 0.5)
        #[arg(long, default_value = "0.5")]
        cps: f64,

        /// How long to play, in seconds (default: 4.0)
        #[arg(short, long, default_value = "4.0")]
        seconds: f64,

        #[arg(long)]
        expr: bool,
    },
}

/// Sink that logs events instead of synthesizing them.
struct LogSink {
    epoch: Instant,
}

impl OutputSink for LogSink {
    fn emit(
        &mut self,
        time: Instant,
        value: &Value,
        duration: Duration,
        _context: &Context,
    ) -> Result<(), SinkError> {
        let at = time.saturating_duration_since(self.epoch);
        info!("{:>8.3}s  {}  ({:.3}s)", at.as_secs_f64(), value, duration.as_secs_f64());
        Ok(())
    }
}

fn load_pattern(input: &str, expr: bool) -> Result<Pattern<Value>, Diagnostic> {
    let registry = Registry::with_defaults();
    if expr {
        evaluate_with(input, &registry)
    } else {
        registry.reify(input)
    }
}

fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Show { input, cycles, expr } => load_pattern(&input, expr).map(|pattern| {
            for cycle in 0..cycles.max(1) {
                let haps = pattern.query_span(
                    Fraction::from_integer(cycle),
                    Fraction::from_integer(cycle + 1),
                );
                println!("cycle {} ({} events)", cycle, haps.len());
                for hap in haps {
                    let whole = match hap.whole {
                        Some(w) => format!("{}", w),
                        None => "(analog)".to_string(),
                    };
                    println!("  {:<16} {:<16} {}", format!("{}", hap.part), whole, hap.value);
                }
            }
        }),
        Commands::Draw { input, width, expr } => load_pattern(&input, expr).map(|pattern| {
            println!("{}", pattern.draw_line(width));
        }),
        Commands::Play {
            input,
            cps,
            seconds,
            expr,
        } => load_pattern(&input, expr).map(|pattern| {
            let clock = SystemClock::new();
            let epoch = clock.epoch();
            let config = SchedulerConfig {
                cps: Fraction::from_float(cps),
                ..SchedulerConfig::default()
            };
            let interval = config.interval;
            let mut scheduler = Scheduler::new(clock, LogSink { epoch }, config);
            scheduler.play(pattern);
            let deadline = Instant::now() + Duration::from_secs_f64(seconds);
            while Instant::now() < deadline {
                scheduler.tick();
                std::thread::sleep(interval);
            }
            scheduler.stop();
            scheduler.tick();
            scheduler.shutdown();
        }),
    };

    if let Err(diag) = result {
        eprintln!("{}", diag);
        std::process::exit(1);
    }
}
