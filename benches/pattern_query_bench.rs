use chronon::mini_notation::parse_mini_notation;
use chronon::pattern::{Fraction, State, TimeSpan};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn bench_query(c: &mut Criterion) {
    let simple = parse_mini_notation("bd sn hh cp").unwrap();
    let dense = parse_mini_notation("bd(3,8) [sd cp]*4 <hh oh ride>*2 {a b c, d e}%8").unwrap();

    c.bench_function("query_simple_cycle", |b| {
        let state = State::new(TimeSpan::new(Fraction::zero(), Fraction::one()));
        b.iter(|| black_box(simple.query(&state)))
    });

    c.bench_function("query_dense_cycle", |b| {
        let state = State::new(TimeSpan::new(Fraction::zero(), Fraction::one()));
        b.iter(|| black_box(dense.query(&state)))
    });

    c.bench_function("query_lookahead_window", |b| {
        // the shape the scheduler asks for: a 50 ms slice mid-cycle
        let state = State::new(TimeSpan::new(
            Fraction::new(13, 40),
            Fraction::new(27, 80),
        ));
        b.iter(|| black_box(dense.query(&state)))
    });

    c.bench_function("parse_dense_source", |b| {
        b.iter(|| parse_mini_notation(black_box("bd(3,8) [sd cp]*4 <hh oh ride>*2")))
    });
}

criterion_group!(benches, bench_query);
criterion_main!(benches);
