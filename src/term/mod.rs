//! Prolog terms
//!
//! The host-side value model for everything that crosses the guest boundary:
//! goals, answers, host-call arguments and replies.
//!
//! - `text` renders terms as Prolog source text (what the engine reads)
//! - `json` decodes the engine's structured wire text (what the engine writes)

pub mod iso;
mod json;
mod text;

pub use iso::{domain_error, existence_error, system_error, throw_term, type_error};
pub use json::{from_json, from_json_value, to_json, to_json_value, AtomEncoding, DecodeOptions, IntegerEncoding, StringEncoding};
pub use text::{escape_atom, escape_string, format_float, parse_quoted, to_prolog};

use crate::error::EncodingError;
use num_bigint::BigInt;
use std::fmt;

/// A Prolog term.
///
/// `Bool`, `Null` and `Undefined` have no Prolog counterpart of their own.
/// They are produced by the decoder when a sentinel wrapper such as
/// `{}(true)` is configured in [`DecodeOptions`], and render back as `{true}`,
/// `{null}` and `{undefined}`.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Atom(String),
    Compound(Compound),
    Variable(Variable),
    List(Vec<Term>),
    Number(Number),
    String(String),
    Bool(bool),
    Null,
    Undefined,
}

/// Compound term with at least one argument.
#[derive(Debug, Clone, PartialEq)]
pub struct Compound {
    functor: String,
    args: Vec<Term>,
}

impl Compound {
    /// Returns `None` when `args` is empty; use [`Term::atomic`] to get an
    /// atom in that case.
    pub fn new(functor: impl Into<String>, args: Vec<Term>) -> Option<Self> {
        if args.is_empty() {
            return None;
        }
        Some(Self {
            functor: functor.into(),
            args,
        })
    }

    pub fn functor(&self) -> &str {
        &self.functor
    }

    pub fn args(&self) -> &[Term] {
        &self.args
    }

    pub fn arity(&self) -> usize {
        self.args.len()
    }

    pub fn arg(&self, i: usize) -> Option<&Term> {
        self.args.get(i)
    }

    pub fn into_parts(self) -> (String, Vec<Term>) {
        (self.functor, self.args)
    }

    /// Copy of this compound with argument `i` replaced.
    pub fn with_arg(&self, i: usize, value: Term) -> Self {
        let mut args = self.args.clone();
        if let Some(slot) = args.get_mut(i) {
            *slot = value;
        }
        Self {
            functor: self.functor.clone(),
            args,
        }
    }
}

/// Logic variable, optionally carrying residual goals (attributes).
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    name: String,
    attr: Vec<Term>,
}

impl Variable {
    pub fn new(name: impl Into<String>) -> Result<Self, EncodingError> {
        Self::with_attr(name, Vec::new())
    }

    pub fn with_attr(name: impl Into<String>, attr: Vec<Term>) -> Result<Self, EncodingError> {
        let name = name.into();
        if !valid_var(&name) {
            return Err(EncodingError::InvalidVariable(name));
        }
        Ok(Self { name, attr })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attr(&self) -> &[Term] {
        &self.attr
    }
}

fn valid_var(name: &str) -> bool {
    match name.chars().next() {
        Some('_') => true,
        Some(c) => c.is_uppercase(),
        None => false,
    }
}

/// Numeric term.
#[derive(Debug, Clone, PartialEq)]
pub enum Number {
    Int(i64),
    BigInt(BigInt),
    Float(f64),
    /// Numerator, denominator.
    Rational(BigInt, BigInt),
}

impl Term {
    pub fn atom(name: impl Into<String>) -> Self {
        Term::Atom(name.into())
    }

    /// An atom when `args` is empty, a compound otherwise.
    pub fn atomic(functor: impl Into<String>, args: Vec<Term>) -> Self {
        let functor = functor.into();
        match Compound::new(functor.clone(), args) {
            Some(c) => Term::Compound(c),
            None => Term::Atom(functor),
        }
    }

    pub fn compound(functor: impl Into<String>, args: Vec<Term>) -> Self {
        Self::atomic(functor, args)
    }

    pub fn var(name: impl Into<String>) -> Result<Self, EncodingError> {
        Variable::new(name).map(Term::Variable)
    }

    pub fn int(n: i64) -> Self {
        Term::Number(Number::Int(n))
    }

    pub fn float(f: f64) -> Self {
        Term::Number(Number::Float(f))
    }

    pub fn rational(numerator: impl Into<BigInt>, denominator: impl Into<BigInt>) -> Self {
        Term::Number(Number::Rational(numerator.into(), denominator.into()))
    }

    pub fn string(s: impl Into<String>) -> Self {
        Term::String(s.into())
    }

    /// Atom-or-compound: something the engine can call.
    pub fn is_callable(&self) -> bool {
        matches!(self, Term::Atom(_) | Term::Compound(_))
    }

    pub fn is_atom(&self, name: &str) -> bool {
        matches!(self, Term::Atom(a) if a == name)
    }

    pub fn is_compound(&self, name: &str, arity: Option<usize>) -> bool {
        match self {
            Term::Compound(c) => c.functor == name && arity.map_or(true, |n| c.arity() == n),
            _ => false,
        }
    }

    pub fn is_rational(&self) -> bool {
        matches!(self, Term::Number(Number::Rational(..)))
    }

    pub fn as_compound(&self) -> Option<&Compound> {
        match self {
            Term::Compound(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Term]> {
        match self {
            Term::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Term::Number(Number::Int(n)) => Some(*n),
            Term::Number(Number::BigInt(n)) => i64::try_from(n).ok(),
            _ => None,
        }
    }

    /// Integers and floats as `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Term::Number(Number::Int(n)) => Some(*n as f64),
            Term::Number(Number::Float(f)) => Some(*f),
            _ => None,
        }
    }

    /// Name of an atom or functor of a compound.
    pub fn functor(&self) -> Option<&str> {
        match self {
            Term::Atom(a) => Some(a),
            Term::Compound(c) => Some(&c.functor),
            _ => None,
        }
    }

    pub fn arity(&self) -> Option<usize> {
        match self {
            Term::Atom(_) => Some(0),
            Term::Compound(c) => Some(c.arity()),
            _ => None,
        }
    }

    /// Predicate indicator text, e.g. `"foo/2"`.
    pub fn pi(&self) -> Option<String> {
        Some(format!("{}/{}", self.functor()?, self.arity()?))
    }

    /// Predicate indicator as a term, e.g. `foo/2`.
    pub fn pi_term(&self) -> Option<Term> {
        Some(pi_term(self.functor()?, self.arity()?))
    }

    pub fn to_prolog(&self) -> Result<String, EncodingError> {
        to_prolog(self)
    }
}

/// `Name/Arity` as a term.
pub fn pi_term(name: &str, arity: usize) -> Term {
    Term::compound("/", vec![Term::atom(name), Term::int(arity as i64)])
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = to_prolog(self).map_err(|_| fmt::Error)?;
        f.write_str(&text)
    }
}

impl From<i64> for Term {
    fn from(n: i64) -> Self {
        Term::int(n)
    }
}

impl From<f64> for Term {
    fn from(f: f64) -> Self {
        Term::float(f)
    }
}

impl From<BigInt> for Term {
    fn from(n: BigInt) -> Self {
        Term::Number(Number::BigInt(n))
    }
}

impl From<bool> for Term {
    fn from(b: bool) -> Self {
        Term::Bool(b)
    }
}

impl From<&str> for Term {
    fn from(s: &str) -> Self {
        Term::String(s.to_string())
    }
}

impl From<String> for Term {
    fn from(s: String) -> Self {
        Term::String(s)
    }
}

impl From<Vec<Term>> for Term {
    fn from(items: Vec<Term>) -> Self {
        Term::List(items)
    }
}

impl From<Compound> for Term {
    fn from(c: Compound) -> Self {
        Term::Compound(c)
    }
}

impl From<Variable> for Term {
    fn from(v: Variable) -> Self {
        Term::Variable(v)
    }
}
