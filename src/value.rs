//! Event payloads
//!
//! Every hap carries a `Value`: a number, a piece of text, a boolean, a list,
//! or a map of named parameters (the `{s: "bd", n: 3, gain: 0.8}` bundles that
//! output sinks consume). Values merge structurally, which is what the `#`
//! style chain operators and the numeric pattern operators are built on.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn map(entries: Vec<(&str, Value)>) -> Value {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    /// The value as a number, parsing numeric text the way pattern arguments do.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Text(s) => s.parse().ok(),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Map(m) => m.get("value").and_then(|v| v.as_number()),
            Value::List(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Truthiness used by structure/mask patterns: `0`, `false`, empty text
    /// and empty collections are false, everything else true.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::Text(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Map(m) => !m.is_empty(),
        }
    }

    /// Promote a scalar to a parameter map. Maps pass through, anything else
    /// lands under the `"value"` key.
    pub fn promote(self) -> BTreeMap<String, Value> {
        match self {
            Value::Map(m) => m,
            other => {
                let mut m = BTreeMap::new();
                m.insert("value".to_string(), other);
                m
            }
        }
    }

    /// Structural merge. Both sides promote to maps; on key collision the
    /// right side wins when `right_wins`, the left otherwise.
    pub fn merged_with(self, other: Value, right_wins: bool) -> Value {
        let mut left = self.promote();
        let right = other.promote();
        for (k, v) in right {
            match left.entry(k) {
                std::collections::btree_map::Entry::Vacant(e) => {
                    e.insert(v);
                }
                std::collections::btree_map::Entry::Occupied(mut e) => {
                    if right_wins {
                        e.insert(v);
                    }
                }
            }
        }
        Value::Map(left)
    }

    /// Apply a numeric operation, broadcasting over map entries. Keys present
    /// on both sides must both be numeric; a scalar against a map applies to
    /// the map's numeric entries and leaves the rest alone. Returns `None`
    /// when there is nothing numeric to combine, in which case the caller
    /// drops the offending hap.
    pub fn numeric_op(self, other: Value, op: impl Fn(f64, f64) -> f64 + Copy) -> Option<Value> {
        match (self, other) {
            (Value::Map(a), Value::Map(b)) => {
                let mut out = a.clone();
                for (k, y) in b {
                    match a.get(&k) {
                        Some(x) => {
                            let combined = op(x.as_number()?, y.as_number()?);
                            out.insert(k, Value::Number(combined));
                        }
                        None => {
                            out.insert(k, y);
                        }
                    }
                }
                Some(Value::Map(out))
            }
            (Value::Map(a), b) => {
                let bn = b.as_number()?;
                let mut out = BTreeMap::new();
                let mut touched = false;
                for (k, v) in a {
                    match v.as_number() {
                        Some(vn) if !matches!(v, Value::Text(_)) => {
                            touched = true;
                            out.insert(k, Value::Number(op(vn, bn)));
                        }
                        _ => {
                            out.insert(k, v);
                        }
                    }
                }
                if touched {
                    Some(Value::Map(out))
                } else {
                    None
                }
            }
            (a, Value::Map(b)) => {
                let an = a.as_number()?;
                let mut out = BTreeMap::new();
                let mut touched = false;
                for (k, v) in b {
                    match v.as_number() {
                        Some(vn) if !matches!(v, Value::Text(_)) => {
                            touched = true;
                            out.insert(k, Value::Number(op(an, vn)));
                        }
                        _ => {
                            out.insert(k, v);
                        }
                    }
                }
                if touched {
                    Some(Value::Map(out))
                } else {
                    None
                }
            }
            (a, b) => {
                let an = a.as_number()?;
                let bn = b.as_number()?;
                Some(Value::Number(op(an, bn)))
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(s) => write!(f, "{}", s),
            Value::List(l) => {
                write!(f, "[")?;
                for (i, v) in l.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Map(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}
