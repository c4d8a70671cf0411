//! Pattern-directed instruction decoder.
//!
//! The decoder works like a recursive-descent parser over bit patterns. A
//! rule is a sequence of token patterns; a [`Disassembler`] holds an ordered
//! list of rules and tries them in turn, running the semantic actions of the
//! first rule whose patterns all match. Rules are built from plain
//! combinator values ([`TokenExpr`]): token patterns with capture groups,
//! sequencing, optionals and embedded sub-decoders. Alternation is the rule
//! list itself.
//!
//! Semantic actions receive a [`SemState`] and append mnemonics and
//! control-flow jumps to it; they never consume tokens themselves.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use crate::architecture::{Architecture, Token};
use crate::area::Area;
use crate::codegen::CodeGenerator;
use crate::error::Error;
use crate::guard::Guard;
use crate::il::{Addr, Instr, Value};
use crate::mnemonic::Mnemonic;

/// A semantic action mutating the per-decode state.
pub type Action<A> = Arc<dyn Fn(&mut SemState<A>) -> Result<(), Error> + Send + Sync>;

/// Per-decode-attempt state.
///
/// Collects the consumed tokens and capture-group values while the rules
/// match, and the mnemonics and jumps the semantic actions produce. Each
/// mnemonic is appended at a running address that starts at the seed and is
/// bumped by the mnemonic's length.
#[derive(Clone)]
pub struct SemState<A: Architecture> {
    /// Address the decode attempt started at.
    pub address: Addr,
    /// Tokens consumed so far.
    pub tokens: Vec<A::Token>,
    /// Accumulated capture-group values, bits appended MSB-first.
    pub capture_groups: BTreeMap<String, u64>,
    /// Mnemonics produced by the semantic actions, in address order.
    pub mnemonics: Vec<Mnemonic>,
    /// Control transfers leaving the last mnemonic: target value plus guard.
    pub jumps: Vec<(Value, Guard)>,
    /// Opaque architecture-specific state.
    pub state: A::State,
    arch: A,
    next_address: Addr,
}

impl<A: Architecture> SemState<A> {
    /// A fresh state for a decode attempt at `address`.
    pub fn new(address: Addr, arch: A) -> Self {
        SemState {
            address,
            tokens: Vec::new(),
            capture_groups: BTreeMap::new(),
            mnemonics: Vec::new(),
            jumps: Vec::new(),
            state: A::State::default(),
            arch,
            next_address: address,
        }
    }

    /// The architecture descriptor of this decode.
    pub fn arch(&self) -> &A {
        &self.arch
    }

    /// The value of a capture group, if the matched patterns filled it.
    pub fn capture(&self, group: &str) -> Option<u64> {
        self.capture_groups.get(group).copied()
    }

    /// Appends a `len` byte mnemonic at the running address. `code` receives
    /// a generator whose output becomes the mnemonic's IL; a width error in
    /// it aborts this mnemonic without touching the state.
    pub fn mnemonic(
        &mut self,
        len: usize,
        opcode: &str,
        operands: Vec<Value>,
        code: impl FnOnce(&mut CodeGenerator<A>) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let mut instructions: Vec<Instr> = Vec::new();
        let mut cg = CodeGenerator::new(&self.arch, &mut instructions);

        code(&mut cg)?;

        let area = Area::new(self.next_address, self.next_address + len as Addr);

        self.mnemonics
            .push(Mnemonic::with_code(area, opcode, operands, instructions));
        self.next_address += len as Addr;
        Ok(())
    }

    /// Appends a mnemonic without IL.
    pub fn opaque_mnemonic(&mut self, len: usize, opcode: &str, operands: Vec<Value>) {
        let area = Area::new(self.next_address, self.next_address + len as Addr);

        self.mnemonics.push(Mnemonic::new(area, opcode, operands));
        self.next_address += len as Addr;
    }

    /// Records an unconditional control transfer to `target`.
    pub fn jump(&mut self, target: impl Into<Value>) {
        self.jumps.push((target.into(), Guard::always()));
    }

    /// Records a control transfer to `target`, taken when `guard` holds.
    pub fn jump_if(&mut self, guard: Guard, target: impl Into<Value>) {
        self.jumps.push((target.into(), guard));
    }
}

/// One compiled alternative: a token-pattern sequence, its capture masks and
/// the semantic actions to run on a match.
pub struct RuleMatch<A: Architecture> {
    /// `(mask, bits)` per consumed token.
    patterns: Vec<(A::Token, A::Token)>,
    /// Capture-group masks, one mask per pattern position.
    captures: Vec<(String, Vec<A::Token>)>,
    /// Actions in registration order.
    actions: Vec<Action<A>>,
}

impl<A: Architecture> Clone for RuleMatch<A> {
    fn clone(&self) -> Self {
        RuleMatch {
            patterns: self.patterns.clone(),
            captures: self.captures.clone(),
            actions: self.actions.clone(),
        }
    }
}

/// A rule combinator: pattern, sequence, optional or embedded sub-decoder.
///
/// Expressions are plain values compiled into [`RuleMatch`] lists when a rule
/// is registered; alternation distributes into one `RuleMatch` per
/// alternative (first match wins, in listing order).
pub enum TokenExpr<A: Architecture> {
    /// A fully fixed token.
    Literal(u64),
    /// A textual bit pattern, e.g. `"0011 d@.... r@...."`.
    Pattern(String),
    /// Two expressions matched one after the other.
    Sequence(Box<TokenExpr<A>>, Box<TokenExpr<A>>),
    /// An expression that may be skipped.
    Optional(Box<TokenExpr<A>>),
    /// A snapshot of another decoder's rules.
    Decoder(Vec<RuleMatch<A>>),
}

impl<A: Architecture> TokenExpr<A> {
    /// Sequences `self` before `next`.
    pub fn then(self, next: impl Into<TokenExpr<A>>) -> TokenExpr<A> {
        TokenExpr::Sequence(Box::new(self), Box::new(next.into()))
    }

    /// Makes `self` optional.
    pub fn optional(self) -> TokenExpr<A> {
        TokenExpr::Optional(Box::new(self))
    }

    fn compile(&self) -> Result<Vec<RuleMatch<A>>, Error> {
        match self {
            TokenExpr::Literal(bits) => Ok(vec![RuleMatch {
                patterns: vec![(A::Token::all_set(), A::Token::from_u64(*bits))],
                captures: Vec::new(),
                actions: Vec::new(),
            }]),
            TokenExpr::Pattern(s) => {
                let (mask, bits, captures) = parse_pattern::<A::Token>(s)?;

                Ok(vec![RuleMatch {
                    patterns: vec![(mask, bits)],
                    captures: captures
                        .into_iter()
                        .map(|(name, mask)| (name, vec![mask]))
                        .collect(),
                    actions: Vec::new(),
                }])
            }
            TokenExpr::Sequence(a, b) => {
                let left = a.compile()?;
                let right = b.compile()?;
                let mut out = Vec::with_capacity(left.len() * right.len());

                for x in &left {
                    for y in &right {
                        out.push(sequence(x, y));
                    }
                }

                Ok(out)
            }
            TokenExpr::Optional(e) => {
                let mut alternatives = e.compile()?;

                alternatives.push(RuleMatch {
                    patterns: Vec::new(),
                    captures: Vec::new(),
                    actions: Vec::new(),
                });
                Ok(alternatives)
            }
            TokenExpr::Decoder(rules) => Ok(rules.clone()),
        }
    }
}

impl<A: Architecture> From<&str> for TokenExpr<A> {
    fn from(pattern: &str) -> Self {
        TokenExpr::Pattern(pattern.to_string())
    }
}

impl<A: Architecture> From<String> for TokenExpr<A> {
    fn from(pattern: String) -> Self {
        TokenExpr::Pattern(pattern)
    }
}

impl<A: Architecture> From<u64> for TokenExpr<A> {
    fn from(bits: u64) -> Self {
        TokenExpr::Literal(bits)
    }
}

impl<A: Architecture> From<&Disassembler<A>> for TokenExpr<A> {
    fn from(sub: &Disassembler<A>) -> Self {
        TokenExpr::Decoder(sub.rules.clone())
    }
}

/// Concatenates two compiled alternatives, keeping per-position capture masks
/// aligned with the combined pattern sequence.
fn sequence<A: Architecture>(x: &RuleMatch<A>, y: &RuleMatch<A>) -> RuleMatch<A> {
    let zero = A::Token::from_u64(0);
    let mut patterns = x.patterns.clone();

    patterns.extend(y.patterns.iter().cloned());

    let mut captures: Vec<(String, Vec<A::Token>)> = x.captures.clone();

    // Pad the left-hand groups up to the full sequence length.
    for (_, masks) in captures.iter_mut() {
        masks.resize(patterns.len(), zero);
    }

    for (name, masks) in &y.captures {
        let mut padded = vec![zero; x.patterns.len()];

        padded.extend(masks.iter().cloned());
        padded.resize(patterns.len(), zero);

        if let Some((_, existing)) = captures.iter_mut().find(|(n, _)| n == name) {
            // The same group on both sides keeps appending bits MSB-first.
            for (slot, mask) in existing.iter_mut().zip(padded) {
                if mask != zero {
                    *slot = mask;
                }
            }
        } else {
            captures.push((name.clone(), padded));
        }
    }

    let mut actions = x.actions.clone();

    actions.extend(y.actions.iter().cloned());

    RuleMatch {
        patterns,
        captures,
        actions,
    }
}

/// Parses a textual token pattern into `(mask, bits, capture masks)`.
///
/// The syntax is a sequence of `0`, `1`, spaces and capture groups
/// `name@....` where each dot captures one bit. Patterns longer than the
/// token width fail; shorter patterns are left-padded with zero mask bits
/// (the high bits become wildcards). Groups that capture no bits are
/// dropped.
fn parse_pattern<T: Token>(pattern: &str) -> Result<(T, T, Vec<(String, T)>), Error> {
    enum PState {
        Any,
        At(String),
        Pat(usize),
    }

    let fail = |column: usize| Error::TokenPattern {
        pattern: pattern.to_string(),
        column,
    };

    let mut bit = T::BITS as i64 - 1;
    let mut mask = 0u64;
    let mut bits = 0u64;
    let mut groups: Vec<(String, u64)> = Vec::new();
    let mut ps = PState::Any;

    for (column, c) in pattern.chars().enumerate() {
        loop {
            match &mut ps {
                PState::Any => match c {
                    '0' | '1' => {
                        if bit < 0 {
                            return Err(fail(column));
                        }

                        if c == '1' {
                            bits |= 1 << bit;
                        }

                        mask |= 1 << bit;
                        bit -= 1;
                    }
                    ' ' => {}
                    _ if c.is_alphabetic() => {
                        ps = PState::At(c.to_string());
                    }
                    _ => return Err(fail(column)),
                },
                PState::At(name) => match c {
                    '@' => {
                        let index = match groups.iter().position(|(n, _)| n == name) {
                            Some(i) => i,
                            None => {
                                groups.push((name.clone(), 0));
                                groups.len() - 1
                            }
                        };

                        ps = PState::Pat(index);
                    }
                    _ if c.is_alphabetic() => name.push(c),
                    _ => return Err(fail(column)),
                },
                PState::Pat(index) => match c {
                    '.' => {
                        if bit < 0 {
                            return Err(fail(column));
                        }

                        groups[*index].1 |= 1 << bit;
                        bit -= 1;
                    }
                    _ => {
                        ps = PState::Any;
                        continue;
                    }
                },
            }

            break;
        }
    }

    if matches!(ps, PState::At(_)) {
        return Err(fail(pattern.chars().count()));
    }

    // Shorter patterns shift down; the vacated high bits stay wildcards.
    let shift = (bit + 1) as u32;
    let down = |v: u64| if shift >= 64 { 0 } else { v >> shift };

    if shift > 0 {
        mask = down(mask);
        bits = down(bits);

        for (_, g) in groups.iter_mut() {
            *g = down(*g);
        }
    }

    Ok((
        T::from_u64(mask),
        T::from_u64(bits),
        groups
            .into_iter()
            .filter(|(_, mask)| *mask != 0)
            .map(|(n, mask)| (n, T::from_u64(mask)))
            .collect(),
    ))
}

/// Anything that can decode one instruction at an address.
///
/// On success the implementation returns the position past the last consumed
/// byte and the updated semantic state; on failure the caller's state is
/// untouched.
pub trait Matcher<A: Architecture> {
    /// Attempts a single decode of `data` at byte position `addr`.
    fn try_match(&self, data: &[u8], addr: Addr, state: &SemState<A>) -> Option<(Addr, SemState<A>)>;
}

/// An ordered rule list with an optional default action.
///
/// Rules are tried in registration order; the first whose patterns match has
/// its actions run. If nothing matches and a default action is declared, the
/// default consumes exactly one token (typically emitting an "unknown"
/// mnemonic).
pub struct Disassembler<A: Architecture> {
    rules: Vec<RuleMatch<A>>,
    default_action: Option<Action<A>>,
}

impl<A: Architecture> Default for Disassembler<A> {
    fn default() -> Self {
        Disassembler {
            rules: Vec::new(),
            default_action: None,
        }
    }
}

impl<A: Architecture> Disassembler<A> {
    /// An empty decoder.
    pub fn new() -> Self {
        Disassembler::default()
    }

    /// Registers a rule. Alternatives produced by optionals and sub-decoders
    /// inside `expr` all receive `action`; pattern errors surface here, at
    /// construction time.
    pub fn rule<E, F>(&mut self, expr: E, action: F) -> Result<&mut Self, Error>
    where
        E: Into<TokenExpr<A>>,
        F: Fn(&mut SemState<A>) -> Result<(), Error> + Send + Sync + 'static,
    {
        let action: Action<A> = Arc::new(action);
        let mut compiled = expr.into().compile()?;

        for rule in compiled.iter_mut() {
            rule.actions.push(action.clone());
        }

        self.rules.append(&mut compiled);
        Ok(self)
    }

    /// Declares the fallback action run when no rule matches.
    pub fn default_rule<F>(&mut self, action: F) -> &mut Self
    where
        F: Fn(&mut SemState<A>) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.default_action = Some(Arc::new(action));
        self
    }
}

impl<A: Architecture> Matcher<A> for Disassembler<A> {
    fn try_match(&self, data: &[u8], addr: Addr, state: &SemState<A>) -> Option<(Addr, SemState<A>)> {
        let base = addr as usize;
        let size = A::Token::SIZE;
        let token_at =
            |index: usize| data.get(base + index * size..).and_then(A::Token::read);

        if base >= data.len() {
            return None;
        }

        let mut read: Vec<A::Token> = Vec::new();

        'rules: for rule in &self.rules {
            let wanted = rule.patterns.len();

            while read.len() < wanted {
                match token_at(read.len()) {
                    Some(t) => read.push(t),
                    None => continue 'rules,
                }
            }

            let matches = rule
                .patterns
                .iter()
                .zip(read.iter())
                .all(|((mask, bits), t)| t.to_u64() & mask.to_u64() == bits.to_u64());

            if !matches {
                continue;
            }

            let mut st = state.clone();

            for (name, masks) in &rule.captures {
                let mut bits = st.capture_groups.get(name).copied().unwrap_or(0);

                for (mask, token) in masks.iter().zip(read.iter()) {
                    let mask = mask.to_u64();

                    if mask == 0 {
                        continue;
                    }

                    let token = token.to_u64();

                    for bit in (0..A::Token::BITS as u64).rev() {
                        if (mask >> bit) & 1 == 1 {
                            bits = (bits << 1) | ((token >> bit) & 1);
                        }
                    }
                }

                st.capture_groups.insert(name.clone(), bits);
            }

            st.tokens.extend(read.iter().take(wanted).copied());

            for action in &rule.actions {
                if let Err(e) = action(&mut st) {
                    warn!(address = addr, error = %e, "semantic action failed, skipping rule");
                    continue 'rules;
                }
            }

            return Some((addr + (wanted * size) as Addr, st));
        }

        if let Some(default) = &self.default_action {
            let token = match read.first().copied().or_else(|| token_at(0)) {
                Some(t) => t,
                None => return None,
            };
            let mut st = state.clone();

            st.tokens.push(token);

            match default(&mut st) {
                Ok(()) => return Some((addr + size as Addr, st)),
                Err(e) => {
                    warn!(address = addr, error = %e, "default action failed");
                    return None;
                }
            }
        }

        None
    }
}
