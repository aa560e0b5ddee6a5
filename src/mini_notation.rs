//! Mini-notation parser and evaluator
//!
//! The compact pattern DSL: `"bd [sd cp]*2 <hh oh>(3,8)"`. Parsing happens in
//! two stages, a tokenizer and a recursive-descent parser producing an AST
//! whose nodes carry byte spans, followed by a lowering stage that turns the
//! AST into a `Pattern<Value>`. Source spans travel into the haps' contexts
//! so editors can highlight the tokens that are playing.
//!
//! The parser never panics: malformed input comes back as a `Parse`
//! diagnostic with a position and what was expected there.

use crate::error_diagnostics::Diagnostic;
use crate::pattern::{Fraction, Pattern, State};
use crate::pattern_signal::choose_cycles;
use crate::pattern_structure::{fastcat, polymeter, slowcat, stack, timecat};
use crate::value::Value;
use tracing::{debug, error};

// ============= Tokenizer =============

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Word(String),
    Number(Fraction),
    Rest,             // ~ or -
    OpenBracket,      // [
    CloseBracket,     // ]
    OpenAngle,        // <
    CloseAngle,       // >
    OpenBrace,        // {
    CloseBrace,       // }
    OpenParen,        // (
    CloseParen,       // )
    Comma,            // ,
    Star,             // *
    Slash,            // /
    Colon,            // :
    At,               // @
    Percent,          // %
    Bang,             // !
    Pipe,             // |
    Question,         // ?
    DoubleQuestion,   // ??
}

impl TokenKind {
    fn describe(&self) -> &'static str {
        match self {
            TokenKind::Word(_) => "a word",
            TokenKind::Number(_) => "a number",
            TokenKind::Rest => "a rest",
            TokenKind::OpenBracket => "'['",
            TokenKind::CloseBracket => "']'",
            TokenKind::OpenAngle => "'<'",
            TokenKind::CloseAngle => "'>'",
            TokenKind::OpenBrace => "'{'",
            TokenKind::CloseBrace => "'}'",
            TokenKind::OpenParen => "'('",
            TokenKind::CloseParen => "')'",
            TokenKind::Comma => "','",
            TokenKind::Star => "'*'",
            TokenKind::Slash => "'/'",
            TokenKind::Colon => "':'",
            TokenKind::At => "'@'",
            TokenKind::Percent => "'%'",
            TokenKind::Bang => "'!'",
            TokenKind::Pipe => "'|'",
            TokenKind::Question => "'?'",
            TokenKind::DoubleQuestion => "'??'",
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    span: (usize, usize),
}

struct Tokenizer<'a> {
    input: &'a str,
    chars: Vec<(usize, char)>,
    position: usize,
}

impl<'a> Tokenizer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.char_indices().collect(),
            position: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.position).map(|(_, c)| *c)
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.position + offset).map(|(_, c)| *c)
    }

    fn offset(&self) -> usize {
        self.chars
            .get(self.position)
            .map(|(i, _)| *i)
            .unwrap_or(self.input.len())
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.position += 1;
        Some(c)
    }

    fn skip_trivia(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.advance();
            } else if c == '#' {
                // comment to end of line
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.advance();
                }
            } else {
                break;
            }
        }
    }

    fn is_word_char(c: char) -> bool {
        c.is_alphanumeric() || c == '_'
    }

    fn read_word(&mut self) -> String {
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if Self::is_word_char(c) {
                word.push(c);
                self.advance();
            } else if c == '-' && self.peek_at(1).map_or(false, Self::is_word_char) {
                word.push(c);
                self.advance();
            } else {
                break;
            }
        }
        word
    }

    /// Decimal literals parse exactly: "2.5" becomes 5/2, not a float.
    fn read_number(&mut self) -> Option<Fraction> {
        let mut negative = false;
        if self.peek() == Some('-') {
            negative = true;
            self.advance();
        }
        let mut int_part: i64 = 0;
        let mut any = false;
        while let Some(c) = self.peek() {
            if let Some(d) = c.to_digit(10) {
                int_part = int_part.checked_mul(10)?.checked_add(d as i64)?;
                any = true;
                self.advance();
            } else {
                break;
            }
        }
        if !any {
            return None;
        }
        let mut numerator = int_part;
        let mut denominator: i64 = 1;
        if self.peek() == Some('.') && self.peek_at(1).map_or(false, |c| c.is_ascii_digit()) {
            self.advance();
            while let Some(c) = self.peek() {
                if let Some(d) = c.to_digit(10) {
                    numerator = numerator.checked_mul(10)?.checked_add(d as i64)?;
                    denominator = denominator.checked_mul(10)?;
                    self.advance();
                } else {
                    break;
                }
            }
        }
        if negative {
            numerator = -numerator;
        }
        Some(Fraction::new(numerator, denominator))
    }

    fn tokenize(mut self) -> Result<Vec<Token>, Diagnostic> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia();
            let begin = self.offset();
            let Some(c) = self.peek() else { break };
            let kind = match c {
                '~' => {
                    self.advance();
                    TokenKind::Rest
                }
                '[' => {
                    self.advance();
                    TokenKind::OpenBracket
                }
                ']' => {
                    self.advance();
                    TokenKind::CloseBracket
                }
                '<' => {
                    self.advance();
                    TokenKind::OpenAngle
                }
                '>' => {
                    self.advance();
                    TokenKind::CloseAngle
                }
                '{' => {
                    self.advance();
                    TokenKind::OpenBrace
                }
                '}' => {
                    self.advance();
                    TokenKind::CloseBrace
                }
                '(' => {
                    self.advance();
                    TokenKind::OpenParen
                }
                ')' => {
                    self.advance();
                    TokenKind::CloseParen
                }
                ',' => {
                    self.advance();
                    TokenKind::Comma
                }
                '*' => {
                    self.advance();
                    TokenKind::Star
                }
                '/' => {
                    self.advance();
                    TokenKind::Slash
                }
                ':' => {
                    self.advance();
                    TokenKind::Colon
                }
                '@' => {
                    self.advance();
                    TokenKind::At
                }
                '%' => {
                    self.advance();
                    TokenKind::Percent
                }
                '!' => {
                    self.advance();
                    TokenKind::Bang
                }
                '|' => {
                    self.advance();
                    TokenKind::Pipe
                }
                '?' => {
                    self.advance();
                    if self.peek() == Some('?') {
                        self.advance();
                        TokenKind::DoubleQuestion
                    } else {
                        TokenKind::Question
                    }
                }
                '-' => {
                    if self.peek_at(1).map_or(false, |c| c.is_ascii_digit()) {
                        match self.read_number() {
                            Some(n) => TokenKind::Number(n),
                            None => {
                                return Err(Diagnostic::parse(
                                    "number literal out of range",
                                    (begin, self.offset()),
                                ))
                            }
                        }
                    } else {
                        self.advance();
                        TokenKind::Rest
                    }
                }
                '0'..='9' => match self.read_number() {
                    Some(n) => TokenKind::Number(n),
                    None => {
                        return Err(Diagnostic::parse(
                            "number literal out of range",
                            (begin, self.offset()),
                        ))
                    }
                },
                c if c.is_alphabetic() || c == '_' => TokenKind::Word(self.read_word()),
                other => {
                    return Err(Diagnostic::parse(
                        format!("unexpected character '{}'", other),
                        (begin, begin + other.len_utf8()),
                    ))
                }
            };
            tokens.push(Token {
                kind,
                span: (begin, self.offset()),
            });
        }
        Ok(tokens)
    }
}

// ============= AST =============

#[derive(Debug, Clone)]
pub struct Node {
    kind: NodeKind,
    span: (usize, usize),
}

#[derive(Debug, Clone)]
enum NodeKind {
    Word(String),
    Number(Fraction),
    Rest,
    /// Weighted sequence within one cycle.
    Seq(Vec<(Fraction, Node)>),
    /// Simultaneous branches.
    Stack(Vec<Node>),
    /// One branch per cycle.
    Alt(Vec<(Fraction, Node)>),
    /// Polymeter branches, optionally with an explicit step count.
    Poly(Vec<Node>, Option<Fraction>),
    /// Weighted random choice per cycle.
    Choice(Vec<(Fraction, Node)>),
    Fast(Box<Node>, Box<Node>),
    Slow(Box<Node>, Box<Node>),
    Euclid {
        value: Box<Node>,
        pulses: Box<Node>,
        steps: Box<Node>,
        rotation: Option<Box<Node>>,
    },
    DegradeBy(Box<Node>, f64),
    /// `e:x` sample index / bank selection.
    Index(Box<Node>, Box<Node>),
}

impl Node {
    fn new(kind: NodeKind, span: (usize, usize)) -> Self {
        Self { kind, span }
    }
}

// ============= Parser =============

struct MiniParser {
    tokens: Vec<Token>,
    position: usize,
    input_len: usize,
}

/// What a sequence stops at, besides end of input.
#[derive(Clone, Copy, PartialEq)]
enum Closer {
    None,
    Bracket,
    Angle,
    Brace,
    Paren,
}

impl Closer {
    fn matches(&self, kind: &TokenKind) -> bool {
        matches!(
            (self, kind),
            (Closer::Bracket, TokenKind::CloseBracket)
                | (Closer::Angle, TokenKind::CloseAngle)
                | (Closer::Brace, TokenKind::CloseBrace)
                | (Closer::Paren, TokenKind::CloseParen)
        )
    }

}

impl MiniParser {
    fn current(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        self.position += 1;
        token
    }

    fn here(&self) -> (usize, usize) {
        self.current()
            .map(|t| t.span)
            .unwrap_or((self.input_len, self.input_len))
    }

    fn unexpected(&self, expected: &str) -> Diagnostic {
        let found = self
            .current()
            .map(|t| t.kind.describe())
            .unwrap_or("end of input");
        Diagnostic::parse(format!("expected {}, found {}", expected, found), self.here())
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, Diagnostic> {
        match self.current() {
            Some(t) if t.kind == kind => Ok(self.advance().unwrap()),
            _ => Err(self.unexpected(kind.describe())),
        }
    }

    /// Top level: a choice of sequences separated by `|`, stopping at the
    /// given closer. Each `|` may carry a weight: `bd | 3 sn` picks `sn`
    /// three times as often as `bd`.
    fn parse_choice(&mut self, closer: Closer) -> Result<Node, Diagnostic> {
        let begin = self.here().0;
        let first = self.parse_sequence(closer)?;
        if !matches!(self.current().map(|t| &t.kind), Some(TokenKind::Pipe)) {
            return Ok(first);
        }
        let mut branches = vec![(Fraction::one(), first)];
        while matches!(self.current().map(|t| &t.kind), Some(TokenKind::Pipe)) {
            self.advance();
            let weight = self.parse_branch_weight();
            branches.push((weight, self.parse_sequence(closer)?));
        }
        let end = branches.last().map(|(_, n)| n.span.1).unwrap_or(begin);
        Ok(Node::new(NodeKind::Choice(branches), (begin, end)))
    }

    /// The optional weight straight after `|`. A number counts as a weight
    /// only when branch content follows it; a lone number (or a number with
    /// modifiers) is the branch itself.
    fn parse_branch_weight(&mut self) -> Fraction {
        if let Some(TokenKind::Number(n)) = self.current().map(|t| t.kind.clone()) {
            let element_follows = matches!(
                self.tokens.get(self.position + 1).map(|t| &t.kind),
                Some(TokenKind::Word(_))
                    | Some(TokenKind::Number(_))
                    | Some(TokenKind::Rest)
                    | Some(TokenKind::OpenBracket)
                    | Some(TokenKind::OpenAngle)
                    | Some(TokenKind::OpenBrace)
            );
            if element_follows {
                self.advance();
                return n;
            }
        }
        Fraction::one()
    }

    fn at_sequence_end(&self, closer: Closer) -> bool {
        match self.current() {
            None => true,
            Some(t) => {
                matches!(t.kind, TokenKind::Comma | TokenKind::Pipe)
                    || closer.matches(&t.kind)
                    || matches!(
                        t.kind,
                        TokenKind::CloseBracket
                            | TokenKind::CloseAngle
                            | TokenKind::CloseBrace
                            | TokenKind::CloseParen
                    )
            }
        }
    }

    /// A space-separated run of weighted steps.
    fn parse_sequence(&mut self, closer: Closer) -> Result<Node, Diagnostic> {
        let begin = self.here().0;
        let mut steps: Vec<(Fraction, Node)> = Vec::new();
        while !self.at_sequence_end(closer) {
            let element = self.parse_element()?;
            let mut weight = Fraction::one();
            let mut copies: usize = 1;
            loop {
                match self.current().map(|t| t.kind.clone()) {
                    Some(TokenKind::At) => {
                        self.advance();
                        match self.current().map(|t| t.kind.clone()) {
                            Some(TokenKind::Number(n)) => {
                                self.advance();
                                weight = n;
                            }
                            _ => return Err(self.unexpected("a weight after '@'")),
                        }
                    }
                    Some(TokenKind::Bang) => {
                        self.advance();
                        match self.current().map(|t| t.kind.clone()) {
                            Some(TokenKind::Number(n)) => {
                                self.advance();
                                copies = n.to_float().max(0.0) as usize;
                            }
                            _ => copies = 2,
                        }
                    }
                    _ => break,
                }
            }
            for _ in 0..copies {
                steps.push((weight, element.clone()));
            }
        }
        let end = self
            .tokens
            .get(self.position.saturating_sub(1))
            .map(|t| t.span.1)
            .unwrap_or(begin);
        match steps.len() {
            0 => Ok(Node::new(NodeKind::Rest, (begin, end))),
            1 if steps[0].0 == Fraction::one() => Ok(steps.into_iter().next().unwrap().1),
            _ => Ok(Node::new(NodeKind::Seq(steps), (begin, end))),
        }
    }

    /// An atom with its postfix modifiers.
    fn parse_element(&mut self) -> Result<Node, Diagnostic> {
        let mut node = self.parse_atom()?;
        loop {
            let Some(token) = self.current() else { break };
            match token.kind.clone() {
                TokenKind::Star => {
                    self.advance();
                    let arg = self.parse_modifier_arg()?;
                    let span = (node.span.0, arg.span.1);
                    node = Node::new(NodeKind::Fast(Box::new(node), Box::new(arg)), span);
                }
                TokenKind::Slash => {
                    self.advance();
                    let arg = self.parse_modifier_arg()?;
                    let span = (node.span.0, arg.span.1);
                    node = Node::new(NodeKind::Slow(Box::new(node), Box::new(arg)), span);
                }
                TokenKind::OpenParen => {
                    self.advance();
                    let pulses = self.parse_sequence(Closer::Paren)?;
                    self.expect(TokenKind::Comma)?;
                    let steps = self.parse_sequence(Closer::Paren)?;
                    let rotation = if matches!(
                        self.current().map(|t| &t.kind),
                        Some(TokenKind::Comma)
                    ) {
                        self.advance();
                        Some(Box::new(self.parse_sequence(Closer::Paren)?))
                    } else {
                        None
                    };
                    let close = self.expect(TokenKind::CloseParen)?;
                    let span = (node.span.0, close.span.1);
                    node = Node::new(
                        NodeKind::Euclid {
                            value: Box::new(node),
                            pulses: Box::new(pulses),
                            steps: Box::new(steps),
                            rotation,
                        },
                        span,
                    );
                }
                TokenKind::Colon => {
                    self.advance();
                    let index = self.parse_atom()?;
                    let span = (node.span.0, index.span.1);
                    node = Node::new(NodeKind::Index(Box::new(node), Box::new(index)), span);
                }
                TokenKind::Question => {
                    let t = self.advance().unwrap();
                    let span = (node.span.0, t.span.1);
                    node = Node::new(NodeKind::DegradeBy(Box::new(node), 0.5), span);
                }
                TokenKind::DoubleQuestion => {
                    self.advance();
                    match self.current().map(|t| t.kind.clone()) {
                        Some(TokenKind::Number(n)) => {
                            let t = self.advance().unwrap();
                            let span = (node.span.0, t.span.1);
                            node = Node::new(
                                NodeKind::DegradeBy(Box::new(node), n.to_float()),
                                span,
                            );
                        }
                        _ => return Err(self.unexpected("a probability after '??'")),
                    }
                }
                _ => break,
            }
        }
        Ok(node)
    }

    /// Arguments to `*` and `/`: a number, a word, or a group.
    fn parse_modifier_arg(&mut self) -> Result<Node, Diagnostic> {
        match self.current().map(|t| t.kind.clone()) {
            Some(TokenKind::Number(_))
            | Some(TokenKind::Word(_))
            | Some(TokenKind::OpenAngle)
            | Some(TokenKind::OpenBracket) => self.parse_atom(),
            _ => Err(self.unexpected("a factor")),
        }
    }

    fn parse_atom(&mut self) -> Result<Node, Diagnostic> {
        let Some(token) = self.current().cloned() else {
            return Err(self.unexpected("a pattern element"));
        };
        match token.kind {
            TokenKind::Word(w) => {
                self.advance();
                Ok(Node::new(NodeKind::Word(w), token.span))
            }
            TokenKind::Number(n) => {
                self.advance();
                Ok(Node::new(NodeKind::Number(n), token.span))
            }
            TokenKind::Rest => {
                self.advance();
                Ok(Node::new(NodeKind::Rest, token.span))
            }
            TokenKind::OpenBracket => {
                self.advance();
                let node = self.parse_branches(Closer::Bracket, token.span.0)?;
                let close = self.expect(TokenKind::CloseBracket)?;
                Ok(Node::new(node.kind, (token.span.0, close.span.1)))
            }
            TokenKind::OpenAngle => {
                self.advance();
                let node = self.parse_alt(token.span.0)?;
                let close = self.expect(TokenKind::CloseAngle)?;
                Ok(Node::new(node.kind, (token.span.0, close.span.1)))
            }
            TokenKind::OpenBrace => {
                self.advance();
                let mut branches = vec![self.parse_choice(Closer::Brace)?];
                while matches!(self.current().map(|t| &t.kind), Some(TokenKind::Comma)) {
                    self.advance();
                    branches.push(self.parse_choice(Closer::Brace)?);
                }
                let close = self.expect(TokenKind::CloseBrace)?;
                let mut steps = None;
                if matches!(self.current().map(|t| &t.kind), Some(TokenKind::Percent)) {
                    self.advance();
                    match self.current().map(|t| t.kind.clone()) {
                        Some(TokenKind::Number(n)) => {
                            self.advance();
                            steps = Some(n);
                        }
                        _ => return Err(self.unexpected("a step count after '%'")),
                    }
                }
                let end = self
                    .tokens
                    .get(self.position.saturating_sub(1))
                    .map(|t| t.span.1)
                    .unwrap_or(close.span.1);
                Ok(Node::new(
                    NodeKind::Poly(branches, steps),
                    (token.span.0, end),
                ))
            }
            other => Err(Diagnostic::parse(
                format!(
                    "expected a word, number, rest or group, found {}",
                    other.describe()
                ),
                token.span,
            )),
        }
    }

    /// Comma-separated branches inside `[...]`: one branch is a plain
    /// (sub)pattern, several become a stack.
    fn parse_branches(&mut self, closer: Closer, begin: usize) -> Result<Node, Diagnostic> {
        let mut branches = vec![self.parse_choice(closer)?];
        while matches!(self.current().map(|t| &t.kind), Some(TokenKind::Comma)) {
            self.advance();
            branches.push(self.parse_choice(closer)?);
        }
        if branches.len() == 1 {
            Ok(branches.into_iter().next().unwrap())
        } else {
            let end = branches.last().map(|n| n.span.1).unwrap_or(begin);
            Ok(Node::new(NodeKind::Stack(branches), (begin, end)))
        }
    }

    /// The inside of `<...>`: weighted steps, with comma-separated branches
    /// stacking.
    fn parse_alt(&mut self, begin: usize) -> Result<Node, Diagnostic> {
        let mut branches = Vec::new();
        loop {
            let mut steps: Vec<(Fraction, Node)> = Vec::new();
            while !self.at_sequence_end(Closer::Angle) {
                let element = self.parse_element()?;
                let mut weight = Fraction::one();
                let mut copies: usize = 1;
                loop {
                    match self.current().map(|t| t.kind.clone()) {
                        Some(TokenKind::At) => {
                            self.advance();
                            match self.current().map(|t| t.kind.clone()) {
                                Some(TokenKind::Number(n)) => {
                                    self.advance();
                                    weight = n;
                                }
                                _ => return Err(self.unexpected("a weight after '@'")),
                            }
                        }
                        Some(TokenKind::Bang) => {
                            self.advance();
                            match self.current().map(|t| t.kind.clone()) {
                                Some(TokenKind::Number(n)) => {
                                    self.advance();
                                    copies = n.to_float().max(0.0) as usize;
                                }
                                _ => copies = 2,
                            }
                        }
                        _ => break,
                    }
                }
                for _ in 0..copies {
                    steps.push((weight, element.clone()));
                }
            }
            let end = self
                .tokens
                .get(self.position.saturating_sub(1))
                .map(|t| t.span.1)
                .unwrap_or(begin);
            branches.push(Node::new(NodeKind::Alt(steps), (begin, end)));
            if matches!(self.current().map(|t| &t.kind), Some(TokenKind::Comma)) {
                self.advance();
            } else {
                break;
            }
        }
        if branches.len() == 1 {
            Ok(branches.into_iter().next().unwrap())
        } else {
            let end = branches.last().map(|n| n.span.1).unwrap_or(begin);
            Ok(Node::new(NodeKind::Stack(branches), (begin, end)))
        }
    }
}

/// Parse mini-notation source into an AST.
pub fn parse(input: &str) -> Result<Node, Diagnostic> {
    let tokens = Tokenizer::new(input).tokenize()?;
    let mut parser = MiniParser {
        tokens,
        position: 0,
        input_len: input.len(),
    };
    let node = parser.parse_choice(Closer::None)?;
    if parser.current().is_some() {
        return Err(parser.unexpected("end of input"));
    }
    Ok(node)
}

// ============= Lowering =============

fn as_static_number(node: &Node) -> Option<Fraction> {
    match &node.kind {
        NodeKind::Number(n) => Some(*n),
        _ => None,
    }
}

/// Resolve a patterned argument (like the `<2 3>` in `bd*<2 3>`) to a number
/// for the cycle containing `span`.
fn resolve_number(arg: &Pattern<Value>, sam: Fraction, state: &State) -> Option<f64> {
    arg.sample_at(sam, state).and_then(|h| h.value.as_number())
}

fn lower(node: &Node) -> Result<Pattern<Value>, Diagnostic> {
    match &node.kind {
        NodeKind::Word(w) => {
            Ok(Pattern::pure(Value::Text(w.clone())).with_location(node.span))
        }
        NodeKind::Number(n) => {
            Ok(Pattern::pure(Value::Number(n.to_float())).with_location(node.span))
        }
        NodeKind::Rest => Ok(Pattern::silence()),
        NodeKind::Seq(steps) => {
            let uniform = steps.iter().all(|(w, _)| *w == Fraction::one());
            if uniform {
                let patterns = steps
                    .iter()
                    .map(|(_, n)| lower(n))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(fastcat(patterns))
            } else {
                let items = steps
                    .iter()
                    .map(|(w, n)| Ok((*w, lower(n)?)))
                    .collect::<Result<Vec<_>, Diagnostic>>()?;
                Ok(timecat(items))
            }
        }
        NodeKind::Stack(branches) => {
            let patterns = branches
                .iter()
                .map(lower)
                .collect::<Result<Vec<_>, _>>()?;
            let steps = patterns.first().and_then(|p| p.steps());
            Ok(stack(patterns).with_steps_opt(steps))
        }
        NodeKind::Alt(steps) => {
            if steps.is_empty() {
                return Ok(Pattern::silence());
            }
            let uniform = steps.iter().all(|(w, _)| *w == Fraction::one());
            if uniform {
                let patterns = steps
                    .iter()
                    .map(|(_, n)| lower(n))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(slowcat(patterns))
            } else {
                // weighted alternation: each branch holds for its weight in
                // cycles
                let items = steps
                    .iter()
                    .map(|(w, n)| Ok((*w, lower(n)?)))
                    .collect::<Result<Vec<_>, Diagnostic>>()?;
                let total = items
                    .iter()
                    .fold(Fraction::zero(), |acc, (w, _)| acc + *w);
                if total <= Fraction::zero() {
                    return Ok(Pattern::silence());
                }
                Ok(timecat(items).slow(total))
            }
        }
        NodeKind::Poly(branches, steps) => {
            let patterns = branches
                .iter()
                .map(lower)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(polymeter(patterns, *steps))
        }
        NodeKind::Choice(branches) => {
            let patterns = branches
                .iter()
                .map(|(w, n)| Ok((w.to_float().max(0.0), lower(n)?)))
                .collect::<Result<Vec<_>, Diagnostic>>()?;
            Ok(choose_cycles(patterns))
        }
        NodeKind::Fast(inner, arg) => lower_tempo(inner, arg, false),
        NodeKind::Slow(inner, arg) => lower_tempo(inner, arg, true),
        NodeKind::Euclid {
            value,
            pulses,
            steps,
            rotation,
        } => {
            let value_pat = lower(value)?;
            let statics = (
                as_static_number(pulses),
                as_static_number(steps),
                rotation.as_deref().map(as_static_number),
            );
            match statics {
                (Some(p), Some(s), r) if r.map_or(true, |r| r.is_some()) => {
                    let pulses = p.to_float().max(0.0) as usize;
                    let steps = s.to_float().max(0.0) as usize;
                    let rot = r.flatten().map(|f| f.to_float() as i64).unwrap_or(0);
                    Ok(value_pat.struct_with(Pattern::<bool>::euclid(pulses, steps, rot)))
                }
                _ => {
                    // patterned arguments resolve once per cycle
                    let pulses_pat = lower(pulses)?;
                    let steps_pat = lower(steps)?;
                    let rot_pat = rotation.as_deref().map(lower).transpose()?;
                    Ok(Pattern::new(move |state: &State| {
                        let mut out = Vec::new();
                        for span in state.span.cycle_spans() {
                            let sub = state.with_span(span);
                            let sam = span.begin.sam();
                            let Some(p) = resolve_number(&pulses_pat, sam, &sub) else {
                                continue;
                            };
                            let Some(s) = resolve_number(&steps_pat, sam, &sub) else {
                                continue;
                            };
                            let r = rot_pat
                                .as_ref()
                                .and_then(|rp| resolve_number(rp, sam, &sub))
                                .unwrap_or(0.0);
                            let structure = Pattern::<bool>::euclid(
                                p.max(0.0) as usize,
                                s.max(0.0) as usize,
                                r as i64,
                            );
                            out.extend(
                                value_pat.clone().struct_with(structure).query(&sub),
                            );
                        }
                        out
                    }))
                }
            }
        }
        NodeKind::DegradeBy(inner, prob) => Ok(lower(inner)?.degrade_by(*prob)),
        NodeKind::Index(inner, index) => {
            let base = lower(inner)?;
            let (key, index_value) = match &index.kind {
                NodeKind::Number(n) => ("n", Value::Number(n.to_float())),
                NodeKind::Word(w) => ("s", Value::Text(w.clone())),
                _ => {
                    return Err(Diagnostic::parse(
                        "sample index must be a name or number",
                        index.span,
                    ))
                }
            };
            Ok(base.fmap(move |v| {
                let mut entries = match v {
                    Value::Map(m) => m,
                    Value::Text(t) => {
                        let mut m = std::collections::BTreeMap::new();
                        m.insert("s".to_string(), Value::Text(t));
                        m
                    }
                    other => other.promote(),
                };
                entries.insert(key.to_string(), index_value.clone());
                Value::Map(entries)
            }))
        }
    }
}

fn lower_tempo(inner: &Node, arg: &Node, slow: bool) -> Result<Pattern<Value>, Diagnostic> {
    let pattern = lower(inner)?;
    if let Some(factor) = as_static_number(arg) {
        if factor <= Fraction::zero() {
            return Err(Diagnostic::parse(
                format!(
                    "cannot {} by {}",
                    if slow { "slow" } else { "speed up" },
                    factor
                ),
                arg.span,
            ));
        }
        return Ok(if slow {
            pattern.slow(factor)
        } else {
            pattern.fast(factor)
        });
    }
    let factor_pat = lower(arg)?;
    let arg_span = arg.span;
    Ok(Pattern::new(move |state: &State| {
        let mut out = Vec::new();
        for span in state.span.cycle_spans() {
            let sub = state.with_span(span);
            let factor = resolve_number(&factor_pat, span.begin.sam(), &sub).unwrap_or(1.0);
            if factor <= 0.0 {
                debug!(
                    "skipping cycle {}: non-positive factor at {:?}",
                    span.begin.floor(),
                    arg_span
                );
                continue;
            }
            let factor = Fraction::from_float(factor);
            let transformed = if slow {
                pattern.clone().slow(factor)
            } else {
                pattern.clone().fast(factor)
            };
            out.extend(transformed.query(&sub));
        }
        out
    }))
}

/// Parse mini-notation into a pattern, or a diagnostic explaining why not.
pub fn parse_mini_notation(input: &str) -> Result<Pattern<Value>, Diagnostic> {
    let ast = parse(input)?;
    lower(&ast)
}

/// Infallible variant: parse failures are reported and become silence, so a
/// bad edit never stops the music.
pub fn mini(input: &str) -> Pattern<Value> {
    match parse_mini_notation(input) {
        Ok(pattern) => pattern,
        Err(diag) => {
            error!("{}", diag.render(input));
            Pattern::silence()
        }
    }
}
