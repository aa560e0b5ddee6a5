//! Host evaluator
//!
//! Turns user source into a `Pattern<Value>` through a registry of named
//! combinators. The expression surface is a small call language:
//!
//! ```text
//! every(2, rev, "bd [sd cp]*2")
//! stack(s("bd ~ bd ~"), fast(2, s("hh*4")))
//! ```
//!
//! Bare strings go through the registry's one-slot string reifier, which by
//! default is the mini-notation parser. Registered sound names evaluate to
//! `{s: name}` patterns. Evaluation is failure-proof from the scheduler's
//! point of view: errors (including panics out of pattern construction) come
//! back as `Eval` diagnostics and whatever was playing keeps playing.

use crate::error_diagnostics::Diagnostic;
use crate::mini_notation;
use crate::pattern::{Fraction, Pattern};
use crate::pattern_signal;
use crate::pattern_structure::{fastcat, slowcat, stack};
use crate::value::Value;
use lazy_static::lazy_static;
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

pub type Reifier = Arc<dyn Fn(&str) -> Result<Pattern<Value>, Diagnostic> + Send + Sync>;

type Transform = Arc<dyn Fn(Pattern<Value>) -> Pattern<Value> + Send + Sync>;

/// Name scope for evaluation: registered sounds plus the string reifier.
/// Built up at runtime, never statically.
pub struct Registry {
    sounds: BTreeSet<String>,
    reifier: Option<Reifier>,
}

impl Registry {
    /// An empty registry: no sounds, bare strings stay literal.
    pub fn new() -> Self {
        Self {
            sounds: BTreeSet::new(),
            reifier: None,
        }
    }

    /// The usual setup: bare strings parse as mini-notation.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.set_string_reifier(Arc::new(|s| mini_notation::parse_mini_notation(s)));
        registry
    }

    /// Register a sound name; it becomes a no-argument combinator producing
    /// `{s: name}` every cycle.
    pub fn register_sound(&mut self, name: impl Into<String>) {
        self.sounds.insert(name.into());
    }

    pub fn register_sounds<S: Into<String>, I: IntoIterator<Item = S>>(&mut self, names: I) {
        for name in names {
            self.register_sound(name);
        }
    }

    pub fn is_sound(&self, name: &str) -> bool {
        self.sounds.contains(name)
    }

    pub fn set_string_reifier(&mut self, reifier: Reifier) {
        self.reifier = Some(reifier);
    }

    pub fn clear_string_reifier(&mut self) {
        self.reifier = None;
    }

    /// Turn a bare string into a pattern: through the reifier when one is
    /// set, literally otherwise.
    pub fn reify(&self, source: &str) -> Result<Pattern<Value>, Diagnostic> {
        match &self.reifier {
            Some(reifier) => reifier(source),
            None => Ok(Pattern::pure(Value::Text(source.to_string()))),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

lazy_static! {
    static ref GLOBAL_REGISTRY: RwLock<Registry> = RwLock::new(Registry::with_defaults());
}

/// The process-wide registry used by [`evaluate`]. Hosts register sounds
/// here as samples are discovered.
pub fn global_registry() -> &'static RwLock<Registry> {
    &GLOBAL_REGISTRY
}

/// Evaluate source against the global registry.
pub fn evaluate(source: &str) -> Result<Pattern<Value>, Diagnostic> {
    let registry = GLOBAL_REGISTRY
        .read()
        .map_err(|_| Diagnostic::eval("registry lock poisoned"))?;
    evaluate_with(source, &registry)
}

/// Evaluate source against a specific registry. Panics from pattern
/// construction are caught and reported as diagnostics.
pub fn evaluate_with(source: &str, registry: &Registry) -> Result<Pattern<Value>, Diagnostic> {
    match catch_unwind(AssertUnwindSafe(|| eval_source(source, registry))) {
        Ok(result) => result,
        Err(payload) => {
            let message = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            Err(Diagnostic::eval(format!("evaluation failed: {}", message)))
        }
    }
}

fn eval_source(source: &str, registry: &Registry) -> Result<Pattern<Value>, Diagnostic> {
    let expr = ExprParser::new(source).parse()?;
    let evaluated = eval_expr(&expr, registry)?;
    as_pattern(evaluated, registry)
}

// ============= Expression parsing =============

#[derive(Debug, Clone)]
enum Expr {
    Call(String, Vec<Expr>, (usize, usize)),
    Ident(String, (usize, usize)),
    Str(String, (usize, usize)),
    Num(f64, (usize, usize)),
}

struct ExprParser {
    chars: Vec<(usize, char)>,
    len: usize,
    position: usize,
}

impl ExprParser {
    fn new(source: &str) -> Self {
        Self {
            chars: source.char_indices().collect(),
            len: source.len(),
            position: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.position).map(|(_, c)| *c)
    }

    fn offset(&self) -> usize {
        self.chars
            .get(self.position)
            .map(|(i, _)| *i)
            .unwrap_or(self.len)
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.position += 1;
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().map_or(false, |c| c.is_whitespace()) {
            self.advance();
        }
    }

    fn parse(&mut self) -> Result<Expr, Diagnostic> {
        self.skip_ws();
        let expr = self.parse_expr()?;
        self.skip_ws();
        if self.peek().is_some() {
            return Err(Diagnostic::eval("unexpected trailing input")
                .with_span((self.offset(), self.len)));
        }
        Ok(expr)
    }

    fn parse_expr(&mut self) -> Result<Expr, Diagnostic> {
        self.skip_ws();
        let begin = self.offset();
        match self.peek() {
            Some('"') => self.parse_string(begin),
            Some('(') => {
                self.advance();
                let inner = self.parse_expr()?;
                self.skip_ws();
                if self.peek() != Some(')') {
                    return Err(Diagnostic::eval("expected ')'")
                        .with_span((self.offset(), self.offset() + 1)));
                }
                self.advance();
                Ok(inner)
            }
            Some(c) if c.is_ascii_digit() || c == '-' => self.parse_number(begin),
            Some(c) if c.is_alphabetic() || c == '_' => {
                let name = self.read_ident();
                self.skip_ws();
                if self.peek() == Some('(') {
                    self.advance();
                    let mut args = Vec::new();
                    self.skip_ws();
                    if self.peek() == Some(')') {
                        self.advance();
                    } else {
                        loop {
                            args.push(self.parse_expr()?);
                            self.skip_ws();
                            match self.peek() {
                                Some(',') => {
                                    self.advance();
                                }
                                Some(')') => {
                                    self.advance();
                                    break;
                                }
                                _ => {
                                    return Err(Diagnostic::eval("expected ',' or ')'")
                                        .with_span((self.offset(), self.offset() + 1)));
                                }
                            }
                        }
                    }
                    Ok(Expr::Call(name, args, (begin, self.offset())))
                } else {
                    Ok(Expr::Ident(name, (begin, self.offset())))
                }
            }
            Some(c) => Err(Diagnostic::eval(format!("unexpected character '{}'", c))
                .with_span((begin, begin + c.len_utf8()))),
            None => {
                Err(Diagnostic::eval("expected an expression").with_span((begin, begin)))
            }
        }
    }

    fn read_ident(&mut self) -> String {
        let mut ident = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                ident.push(c);
                self.advance();
            } else {
                break;
            }
        }
        ident
    }

    fn parse_string(&mut self, begin: usize) -> Result<Expr, Diagnostic> {
        self.advance(); // opening quote
        let mut text = String::new();
        loop {
            match self.advance() {
                Some('"') => break,
                Some('\\') => match self.advance() {
                    Some(c) => text.push(c),
                    None => {
                        return Err(Diagnostic::eval("unterminated string")
                            .with_span((begin, self.len)))
                    }
                },
                Some(c) => text.push(c),
                None => {
                    return Err(
                        Diagnostic::eval("unterminated string").with_span((begin, self.len))
                    )
                }
            }
        }
        Ok(Expr::Str(text, (begin, self.offset())))
    }

    fn parse_number(&mut self, begin: usize) -> Result<Expr, Diagnostic> {
        let mut text = String::new();
        if self.peek() == Some('-') {
            text.push('-');
            self.advance();
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '.' {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        text.parse::<f64>()
            .map(|n| Expr::Num(n, (begin, self.offset())))
            .map_err(|_| {
                Diagnostic::eval(format!("malformed number '{}'", text))
                    .with_span((begin, self.offset()))
            })
    }
}

// ============= Evaluation =============

enum Evaluated {
    Pat(Pattern<Value>),
    Num(f64),
    Str(String),
    Transform(Transform),
}

fn as_pattern(value: Evaluated, registry: &Registry) -> Result<Pattern<Value>, Diagnostic> {
    match value {
        Evaluated::Pat(p) => Ok(p),
        Evaluated::Str(s) => registry.reify(&s),
        Evaluated::Num(n) => Ok(Pattern::pure(Value::Number(n))),
        Evaluated::Transform(_) => Err(Diagnostic::type_error(
            "expected a pattern, found a transform",
        )),
    }
}

fn as_number(value: Evaluated) -> Result<f64, Diagnostic> {
    match value {
        Evaluated::Num(n) => Ok(n),
        Evaluated::Str(s) => s
            .parse()
            .map_err(|_| Diagnostic::type_error(format!("expected a number, found \"{}\"", s))),
        _ => Err(Diagnostic::type_error("expected a number")),
    }
}

fn as_transform(value: Evaluated) -> Result<Transform, Diagnostic> {
    match value {
        Evaluated::Transform(t) => Ok(t),
        _ => Err(Diagnostic::type_error(
            "expected a transform like rev or fast(2)",
        )),
    }
}

fn positive_factor(n: f64) -> Result<Fraction, Diagnostic> {
    if !(n > 0.0) {
        return Err(Diagnostic::eval(format!(
            "factor must be positive, got {}",
            n
        )));
    }
    Ok(Fraction::from_float(n))
}

/// Wrap scalar values under a control key; parameter bundles pass through.
fn control(key: &'static str, pattern: Pattern<Value>) -> Pattern<Value> {
    pattern.fmap(move |v| match v {
        Value::Map(m) => Value::Map(m),
        other => Value::map(vec![(key, other)]),
    })
}

fn eval_expr(expr: &Expr, registry: &Registry) -> Result<Evaluated, Diagnostic> {
    match expr {
        Expr::Num(n, _) => Ok(Evaluated::Num(*n)),
        Expr::Str(s, _) => Ok(Evaluated::Str(s.clone())),
        Expr::Ident(name, span) => eval_name(name, *span, registry),
        Expr::Call(name, args, span) => {
            let args = args
                .iter()
                .map(|a| eval_expr(a, registry))
                .collect::<Result<Vec<_>, _>>()?;
            eval_call(name, args, *span, registry)
        }
    }
}

fn eval_name(
    name: &str,
    span: (usize, usize),
    registry: &Registry,
) -> Result<Evaluated, Diagnostic> {
    if registry.is_sound(name) {
        let value = Value::map(vec![("s", Value::Text(name.to_string()))]);
        return Ok(Evaluated::Pat(Pattern::pure(value)));
    }
    match name {
        "silence" => Ok(Evaluated::Pat(Pattern::silence())),
        "sine" => Ok(Evaluated::Pat(pattern_signal::sine().fmap(Value::Number))),
        "cosine" => Ok(Evaluated::Pat(pattern_signal::cosine().fmap(Value::Number))),
        "saw" => Ok(Evaluated::Pat(pattern_signal::saw().fmap(Value::Number))),
        "isaw" => Ok(Evaluated::Pat(pattern_signal::isaw().fmap(Value::Number))),
        "tri" => Ok(Evaluated::Pat(pattern_signal::tri().fmap(Value::Number))),
        "square" => Ok(Evaluated::Pat(pattern_signal::square().fmap(Value::Number))),
        "rand" => Ok(Evaluated::Pat(pattern_signal::rand().fmap(Value::Number))),
        // zero-argument transforms usable in function position
        "rev" | "degrade" | "palindrome" => {
            Ok(Evaluated::Transform(make_transform(name, Vec::new())?))
        }
        _ => Err(Diagnostic::eval(format!("unknown name '{}'", name))
            .with_span(span)
            .with_hint("register the sound, or check the combinator name")),
    }
}

/// Prefix-argument count for transforms; the optional final argument is the
/// pattern to apply them to.
fn transform_arity(name: &str) -> Option<usize> {
    Some(match name {
        "rev" | "degrade" | "palindrome" => 0,
        "fast" | "slow" | "early" | "late" | "ply" | "iter" | "iter_back" | "segment"
        | "linger" | "degrade_by" | "add" | "sub" | "mul" | "div" | "sometimes" | "often"
        | "rarely" | "almost_always" | "almost_never" | "superimpose" => 1,
        "every" | "sometimes_by" | "chunk" | "off" | "range" => 2,
        "when_mod" => 3,
        _ => return None,
    })
}

fn make_transform(name: &str, args: Vec<Evaluated>) -> Result<Transform, Diagnostic> {
    let mut args = args.into_iter();
    let mut next = || {
        args.next()
            .ok_or_else(|| Diagnostic::eval("missing argument"))
    };
    let transform: Transform = match name {
        "rev" => Arc::new(|p| p.rev()),
        "degrade" => Arc::new(|p| p.degrade()),
        "palindrome" => Arc::new(|p| p.palindrome()),
        "fast" => {
            let factor = positive_factor(as_number(next()?)?)?;
            Arc::new(move |p| p.fast(factor))
        }
        "slow" => {
            let factor = positive_factor(as_number(next()?)?)?;
            Arc::new(move |p| p.slow(factor))
        }
        "early" => {
            let amount = Fraction::from_float(as_number(next()?)?);
            Arc::new(move |p| p.early(amount))
        }
        "late" => {
            let amount = Fraction::from_float(as_number(next()?)?);
            Arc::new(move |p| p.late(amount))
        }
        "ply" => {
            let n = as_number(next()?)?.max(0.0) as usize;
            Arc::new(move |p| p.ply(n))
        }
        "iter" => {
            let n = as_number(next()?)?.max(0.0) as usize;
            Arc::new(move |p| p.iter(n))
        }
        "iter_back" => {
            let n = as_number(next()?)?.max(0.0) as usize;
            Arc::new(move |p| p.iter_back(n))
        }
        "segment" => {
            let n = as_number(next()?)?.max(0.0) as usize;
            Arc::new(move |p| p.segment(n))
        }
        "linger" => {
            let amount = Fraction::from_float(as_number(next()?)?);
            Arc::new(move |p| p.linger(amount))
        }
        "degrade_by" => {
            let prob = as_number(next()?)?;
            Arc::new(move |p| p.degrade_by(prob))
        }
        "add" | "sub" | "mul" | "div" => {
            let operand = match next()? {
                Evaluated::Pat(p) => p,
                Evaluated::Num(n) => Pattern::pure(Value::Number(n)),
                _ => {
                    return Err(Diagnostic::type_error("expected a number or pattern")
                        .with_hint(format!("in {}(..)", name)))
                }
            };
            let op = name.to_string();
            Arc::new(move |p| match op.as_str() {
                "add" => p.add(operand.clone()),
                "sub" => p.sub(operand.clone()),
                "mul" => p.mul(operand.clone()),
                _ => p.div(operand.clone()),
            })
        }
        "sometimes" | "often" | "rarely" | "almost_always" | "almost_never" => {
            let inner = as_transform(next()?)?;
            let prob = match name {
                "sometimes" => 0.5,
                "often" => 0.75,
                "rarely" => 0.1,
                "almost_always" => 0.9,
                _ => 0.1,
            };
            Arc::new(move |p| {
                let inner = inner.clone();
                p.sometimes_by(prob, move |q| inner(q))
            })
        }
        "superimpose" => {
            let inner = as_transform(next()?)?;
            Arc::new(move |p| {
                let inner = inner.clone();
                p.superimpose(move |q| inner(q))
            })
        }
        "every" => {
            let n = as_number(next()?)? as i64;
            let inner = as_transform(next()?)?;
            Arc::new(move |p| {
                let inner = inner.clone();
                p.every(n, move |q| inner(q))
            })
        }
        "sometimes_by" => {
            let prob = as_number(next()?)?;
            let inner = as_transform(next()?)?;
            Arc::new(move |p| {
                let inner = inner.clone();
                p.sometimes_by(prob, move |q| inner(q))
            })
        }
        "chunk" => {
            let n = as_number(next()?)?.max(0.0) as usize;
            let inner = as_transform(next()?)?;
            Arc::new(move |p| {
                let inner = inner.clone();
                p.chunk(n, move |q| inner(q))
            })
        }
        "off" => {
            let amount = Fraction::from_float(as_number(next()?)?);
            let inner = as_transform(next()?)?;
            Arc::new(move |p| {
                let inner = inner.clone();
                p.off(amount, move |q| inner(q))
            })
        }
        "range" => {
            let lo = as_number(next()?)?;
            let hi = as_number(next()?)?;
            Arc::new(move |p| {
                p.fmap(move |v| match v.as_number() {
                    Some(n) if !matches!(v, Value::Text(_)) => Value::Number(lo + n * (hi - lo)),
                    _ => v,
                })
            })
        }
        "when_mod" => {
            let modulo = as_number(next()?)? as i64;
            let offset = as_number(next()?)? as i64;
            let inner = as_transform(next()?)?;
            Arc::new(move |p| {
                let inner = inner.clone();
                p.when_mod(modulo, offset, move |q| inner(q))
            })
        }
        other => {
            return Err(Diagnostic::eval(format!(
                "'{}' is not a transform",
                other
            )))
        }
    };
    Ok(transform)
}

fn eval_call(
    name: &str,
    mut args: Vec<Evaluated>,
    span: (usize, usize),
    registry: &Registry,
) -> Result<Evaluated, Diagnostic> {
    match name {
        // pattern constructors
        "pure" => {
            if args.len() != 1 {
                return Err(Diagnostic::eval("pure takes one argument").with_span(span));
            }
            let value = match args.remove(0) {
                Evaluated::Num(n) => Value::Number(n),
                Evaluated::Str(s) => Value::Text(s),
                _ => return Err(Diagnostic::type_error("pure takes a number or string")),
            };
            return Ok(Evaluated::Pat(Pattern::pure(value)));
        }
        "irand" => {
            if args.len() != 1 {
                return Err(Diagnostic::eval("irand takes one argument").with_span(span));
            }
            let n = as_number(args.remove(0))? as i64;
            return Ok(Evaluated::Pat(pattern_signal::irand(n).fmap(Value::Number)));
        }
        "run" => {
            if args.len() != 1 {
                return Err(Diagnostic::eval("run takes one argument").with_span(span));
            }
            let n = as_number(args.remove(0))?.max(0.0) as usize;
            return Ok(Evaluated::Pat(pattern_signal::run(n).fmap(Value::Number)));
        }
        "choose" => {
            let values = args
                .into_iter()
                .map(|a| match a {
                    Evaluated::Num(n) => Ok(Value::Number(n)),
                    Evaluated::Str(s) => Ok(Value::Text(s)),
                    _ => Err(Diagnostic::type_error("choose takes numbers or strings")),
                })
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Evaluated::Pat(pattern_signal::choose(values)));
        }
        "wchoose" => {
            if args.is_empty() || args.len() % 2 != 0 {
                return Err(
                    Diagnostic::eval("wchoose takes value, weight pairs").with_span(span)
                );
            }
            let mut choices = Vec::new();
            let mut pairs = args.into_iter();
            while let (Some(value), Some(weight)) = (pairs.next(), pairs.next()) {
                let value = match value {
                    Evaluated::Num(n) => Value::Number(n),
                    Evaluated::Str(s) => Value::Text(s),
                    _ => {
                        return Err(Diagnostic::type_error(
                            "wchoose takes numbers or strings as values",
                        ))
                    }
                };
                choices.push((value, as_number(weight)?));
            }
            return Ok(Evaluated::Pat(pattern_signal::wchoose(choices)));
        }
        // combination
        "stack" | "overlay" => {
            let patterns = args
                .into_iter()
                .map(|a| as_pattern(a, registry))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Evaluated::Pat(stack(patterns)));
        }
        "cat" | "slowcat" => {
            let patterns = args
                .into_iter()
                .map(|a| as_pattern(a, registry))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Evaluated::Pat(slowcat(patterns)));
        }
        "fastcat" | "seq" => {
            let patterns = args
                .into_iter()
                .map(|a| as_pattern(a, registry))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Evaluated::Pat(fastcat(patterns)));
        }
        "merge" => {
            if args.len() != 2 {
                return Err(Diagnostic::eval("merge takes two patterns").with_span(span));
            }
            let right = as_pattern(args.pop().unwrap(), registry)?;
            let left = as_pattern(args.pop().unwrap(), registry)?;
            return Ok(Evaluated::Pat(left.merge_right(right)));
        }
        "union" => {
            if args.len() != 2 {
                return Err(Diagnostic::eval("union takes two patterns").with_span(span));
            }
            let right = as_pattern(args.pop().unwrap(), registry)?;
            let left = as_pattern(args.pop().unwrap(), registry)?;
            return Ok(Evaluated::Pat(left.merge_left(right)));
        }
        // controls
        "s" | "sound" => return control_call("s", args, span, registry),
        "n" => return control_call("n", args, span, registry),
        "note" => return control_call("note", args, span, registry),
        "gain" => return control_call("gain", args, span, registry),
        "pan" => return control_call("pan", args, span, registry),
        "speed" => return control_call("speed", args, span, registry),
        "euclid" => {
            if !(args.len() == 3 || args.len() == 4) {
                return Err(
                    Diagnostic::eval("euclid takes (pulses, steps, [rotation], pattern)")
                        .with_span(span),
                );
            }
            let pattern = as_pattern(args.pop().unwrap(), registry)?;
            let mut numbers = args.into_iter();
            let pulses = as_number(numbers.next().unwrap())?.max(0.0) as usize;
            let steps = as_number(numbers.next().unwrap())?.max(0.0) as usize;
            let rotation = numbers
                .next()
                .map(as_number)
                .transpose()?
                .unwrap_or(0.0) as i64;
            return Ok(Evaluated::Pat(pattern.struct_with(Pattern::<bool>::euclid(
                pulses, steps, rotation,
            ))));
        }
        _ => {}
    }

    if let Some(arity) = transform_arity(name) {
        if args.len() == arity {
            return Ok(Evaluated::Transform(make_transform(name, args)?));
        }
        if args.len() == arity + 1 {
            let pattern = as_pattern(args.pop().unwrap(), registry)?;
            let transform = make_transform(name, args)?;
            return Ok(Evaluated::Pat(transform(pattern)));
        }
        return Err(Diagnostic::eval(format!(
            "{} takes {} argument(s), plus an optional pattern",
            name, arity
        ))
        .with_span(span));
    }

    Err(Diagnostic::eval(format!("unknown combinator '{}'", name))
        .with_span(span)
        .with_hint("see the registry for available names"))
}

fn control_call(
    key: &'static str,
    mut args: Vec<Evaluated>,
    span: (usize, usize),
    registry: &Registry,
) -> Result<Evaluated, Diagnostic> {
    if args.len() != 1 {
        return Err(Diagnostic::eval(format!("{} takes one argument", key)).with_span(span));
    }
    let pattern = as_pattern(args.remove(0), registry)?;
    Ok(Evaluated::Pat(control(key, pattern)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::{Fraction, State, TimeSpan};

    fn first_cycle(p: &Pattern<Value>) -> Vec<crate::pattern::Hap<Value>> {
        p.query(&State::new(TimeSpan::new(Fraction::zero(), Fraction::one())))
    }

    #[test]
    fn test_bare_string_reifies_as_mini() {
        let registry = Registry::with_defaults();
        let p = evaluate_with("\"bd sd cp\"", &registry).unwrap();
        assert_eq!(first_cycle(&p).len(), 3);
    }

    #[test]
    fn test_registered_sound_is_a_combinator() {
        let mut registry = Registry::with_defaults();
        registry.register_sound("bd");
        let p = evaluate_with("bd", &registry).unwrap();
        let haps = first_cycle(&p);
        assert_eq!(haps.len(), 1);
        match &haps[0].value {
            Value::Map(m) => assert_eq!(m.get("s"), Some(&Value::Text("bd".into()))),
            other => panic!("expected map, got {:?}", other),
        }
    }

    #[test]
    fn test_transform_in_function_position() {
        let registry = Registry::with_defaults();
        let p = evaluate_with("every(2, rev, \"a b\")", &registry).unwrap();
        let c0: Vec<String> = first_cycle(&p).iter().map(|h| h.value.to_string()).collect();
        assert_eq!(c0, vec!["b", "a"]);
    }

    #[test]
    fn test_partial_application() {
        let registry = Registry::with_defaults();
        let p = evaluate_with("every(2, fast(2), \"a b\")", &registry).unwrap();
        let c0 = first_cycle(&p);
        assert_eq!(c0.len(), 4);
    }

    #[test]
    fn test_stack_and_controls() {
        let registry = Registry::with_defaults();
        let p = evaluate_with("stack(s(\"bd ~\"), n(\"1 2 3\"))", &registry).unwrap();
        let haps = first_cycle(&p);
        assert_eq!(haps.len(), 4);
    }

    #[test]
    fn test_unknown_name_is_diagnosed() {
        let registry = Registry::with_defaults();
        let err = evaluate_with("fsat(2, \"bd\")", &registry).unwrap_err();
        assert!(err.message.contains("fsat"));
    }

    #[test]
    fn test_parse_error_in_mini_surfaces() {
        let registry = Registry::with_defaults();
        assert!(evaluate_with("\"bd ]\"", &registry).is_err());
    }

    #[test]
    fn test_fast_zero_is_caught_not_panicking() {
        let registry = Registry::with_defaults();
        let err = evaluate_with("fast(0, \"bd\")", &registry).unwrap_err();
        assert!(err.message.contains("positive"));
    }

    #[test]
    fn test_no_reifier_keeps_strings_literal() {
        let mut registry = Registry::with_defaults();
        registry.clear_string_reifier();
        let p = evaluate_with("\"bd sd\"", &registry).unwrap();
        let haps = first_cycle(&p);
        assert_eq!(haps.len(), 1);
        assert_eq!(haps[0].value, Value::Text("bd sd".into()));
    }

    #[test]
    fn test_merge_chains_controls() {
        let mut registry = Registry::with_defaults();
        registry.register_sound("bd");
        let p = evaluate_with("merge(s(\"bd bd\"), gain(0.8))", &registry).unwrap();
        let haps = first_cycle(&p);
        assert_eq!(haps.len(), 2);
        match &haps[0].value {
            Value::Map(m) => {
                assert_eq!(m.get("s"), Some(&Value::Text("bd".into())));
                assert_eq!(m.get("gain"), Some(&Value::Number(0.8)));
            }
            other => panic!("expected map, got {:?}", other),
        }
    }
}
