//! Wire-surface snapshots
//!
//! The mini-notation grammar and its event output are a compatibility
//! contract: these tests pin the exact JSON serialization of the haps
//! produced by canonical sources. If one of these changes shape, so has the
//! public surface.

use chronon::mini_notation::parse_mini_notation;
use serde_json::{json, Value as Json};

fn snapshot(input: &str) -> Json {
    let pattern = parse_mini_notation(input).unwrap();
    let haps = pattern.first_cycle();
    serde_json::to_value(&haps).unwrap()
}

fn frac(n: i64, d: i64) -> Json {
    json!({ "numerator": n, "denominator": d })
}

fn span(b: (i64, i64), e: (i64, i64)) -> Json {
    json!({ "begin": frac(b.0, b.1), "end": frac(e.0, e.1) })
}

#[test]
fn snapshot_two_step_sequence() {
    assert_eq!(
        snapshot("bd sn"),
        json!([
            {
                "whole": span((0, 1), (1, 2)),
                "part": span((0, 1), (1, 2)),
                "value": "bd",
                "context": { "locations": [[0, 2]] }
            },
            {
                "whole": span((1, 2), (1, 1)),
                "part": span((1, 2), (1, 1)),
                "value": "sn",
                "context": { "locations": [[3, 5]] }
            }
        ])
    );
}

#[test]
fn snapshot_subdivided_group() {
    assert_eq!(
        snapshot("bd [sd cp]*2"),
        json!([
            {
                "whole": span((0, 1), (1, 2)),
                "part": span((0, 1), (1, 2)),
                "value": "bd",
                "context": { "locations": [[0, 2]] }
            },
            {
                "whole": span((1, 2), (5, 8)),
                "part": span((1, 2), (5, 8)),
                "value": "sd",
                "context": { "locations": [[4, 6]] }
            },
            {
                "whole": span((5, 8), (3, 4)),
                "part": span((5, 8), (3, 4)),
                "value": "cp",
                "context": { "locations": [[7, 9]] }
            },
            {
                "whole": span((3, 4), (7, 8)),
                "part": span((3, 4), (7, 8)),
                "value": "sd",
                "context": { "locations": [[4, 6]] }
            },
            {
                "whole": span((7, 8), (1, 1)),
                "part": span((7, 8), (1, 1)),
                "value": "cp",
                "context": { "locations": [[7, 9]] }
            }
        ])
    );
}

#[test]
fn snapshot_euclid() {
    assert_eq!(
        snapshot("bd(3,8)"),
        json!([
            {
                "whole": span((0, 1), (1, 8)),
                "part": span((0, 1), (1, 8)),
                "value": "bd",
                "context": { "locations": [[0, 2]] }
            },
            {
                "whole": span((3, 8), (1, 2)),
                "part": span((3, 8), (1, 2)),
                "value": "bd",
                "context": { "locations": [[0, 2]] }
            },
            {
                "whole": span((3, 4), (7, 8)),
                "part": span((3, 4), (7, 8)),
                "value": "bd",
                "context": { "locations": [[0, 2]] }
            }
        ])
    );
}

#[test]
fn snapshot_sample_index() {
    assert_eq!(
        snapshot("bd:3"),
        json!([
            {
                "whole": span((0, 1), (1, 1)),
                "part": span((0, 1), (1, 1)),
                "value": { "s": "bd", "n": 3.0 },
                "context": { "locations": [[0, 2]] }
            }
        ])
    );
}
