//! Prolog source text rendering.

use super::{Number, Term};
use crate::error::EncodingError;

/// Render a term as Prolog text the engine can read back.
pub fn to_prolog(term: &Term) -> Result<String, EncodingError> {
    let mut out = String::new();
    write_term(&mut out, term)?;
    Ok(out)
}

fn write_term(out: &mut String, term: &Term) -> Result<(), EncodingError> {
    match term {
        Term::Atom(name) => out.push_str(&escape_atom(name)),
        Term::Compound(c) => {
            // a:b and a/b are written infix
            if let Some((left_max, right_max)) = infix_bounds(c.functor(), c.arity()) {
                let left = operand(&c.args()[0], left_max)?;
                let right = operand(&c.args()[1], right_max)?;
                out.push_str(&left);
                // keep `a: -1` from reading back as `a :- 1`
                if left.ends_with(is_symbol_char) {
                    out.push(' ');
                }
                out.push_str(c.functor());
                if right.starts_with(is_symbol_char) {
                    out.push(' ');
                }
                out.push_str(&right);
            } else {
                out.push_str(&escape_atom(c.functor()));
                out.push('(');
                write_seq(out, c.args())?;
                out.push(')');
            }
        }
        Term::Variable(v) => {
            if v.attr().is_empty() {
                out.push_str(v.name());
            } else {
                write_seq(out, v.attr())?;
            }
        }
        Term::List(items) => {
            out.push('[');
            write_seq(out, items)?;
            out.push(']');
        }
        Term::Number(n) => write_number(out, n)?,
        Term::String(s) => out.push_str(&escape_string(s)),
        Term::Bool(true) => out.push_str("{true}"),
        Term::Bool(false) => out.push_str("{false}"),
        Term::Null => out.push_str("{null}"),
        Term::Undefined => out.push_str("{undefined}"),
    }
    Ok(())
}

/// Highest operand priority on each side of an infix operator:
/// `:` is xfy 200, `/` is yfx 400.
fn infix_bounds(functor: &str, arity: usize) -> Option<(u32, u32)> {
    match (functor, arity) {
        (":", 2) => Some((199, 200)),
        ("/", 2) => Some((400, 399)),
        _ => None,
    }
}

/// Priority of a term as written; zero unless it renders as an operator.
fn priority(term: &Term) -> u32 {
    match term {
        Term::Compound(c) if c.arity() == 2 && c.functor() == ":" => 200,
        Term::Compound(c) if c.arity() == 2 && c.functor() == "/" => 400,
        // N rdiv D
        Term::Number(Number::Rational(..)) => 400,
        _ => 0,
    }
}

fn operand(term: &Term, max: u32) -> Result<String, EncodingError> {
    let text = to_prolog(term)?;
    Ok(if priority(term) > max { format!("({text})") } else { text })
}

fn is_symbol_char(c: char) -> bool {
    "+-*/\\^<>=~:.?@#&$".contains(c)
}

fn write_seq(out: &mut String, items: &[Term]) -> Result<(), EncodingError> {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_term(out, item)?;
    }
    Ok(())
}

fn write_number(out: &mut String, n: &Number) -> Result<(), EncodingError> {
    match n {
        Number::Int(i) => out.push_str(&i.to_string()),
        Number::BigInt(i) => out.push_str(&i.to_string()),
        Number::Float(f) => out.push_str(&format_float(*f)?),
        Number::Rational(num, den) => {
            out.push_str(&num.to_string());
            out.push_str(" rdiv ");
            out.push_str(&den.to_string());
        }
    }
    Ok(())
}

/// Format a float so the engine parses it back as a float.
///
/// Exponent forms without a fractional part (`1e21`) get one (`1.0e21`).
pub fn format_float(f: f64) -> Result<String, EncodingError> {
    if !f.is_finite() {
        return Err(EncodingError::Unrepresentable(format!("{f}")));
    }
    let s = format!("{f:?}");
    match s.find('e') {
        Some(idx) if !s[..idx].contains('.') => {
            Ok(format!("{}.0{}", &s[..idx], &s[idx..]))
        }
        _ => Ok(s),
    }
}

fn is_bare_atom(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Quote an atom unless it is a plain lowercase identifier.
pub fn escape_atom(atom: &str) -> String {
    if is_bare_atom(atom) {
        return atom.to_string();
    }
    quote(atom, '\'')
}

/// Double-quoted Prolog string literal.
pub fn escape_string(s: &str) -> String {
    quote(s, '"')
}

fn quote(s: &str, q: char) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push(q);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c if c == q => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(q);
    out
}

/// Read back a single quoted atom or string literal (or a bare atom).
///
/// Inverse of [`escape_atom`] and [`escape_string`]. Doubled quotes (`''`)
/// are accepted as well.
pub fn parse_quoted(text: &str) -> Result<String, EncodingError> {
    let bad = || EncodingError::BadLiteral(text.to_string());
    let q = match text.chars().next() {
        Some(q @ ('\'' | '"')) => q,
        Some(_) if is_bare_atom(text) => return Ok(text.to_string()),
        _ => return Err(bad()),
    };
    if text.len() < 2 || !text.ends_with(q) {
        return Err(bad());
    }
    let body = &text[1..text.len() - 1];
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('\\') => out.push('\\'),
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('\'') => out.push('\''),
                Some('"') => out.push('"'),
                Some('`') => out.push('`'),
                _ => return Err(bad()),
            },
            c if c == q => {
                if chars.next() != Some(q) {
                    return Err(bad());
                }
                out.push(q);
            }
            c => out.push(c),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::Variable;

    #[test]
    fn atoms_quote_only_when_needed() {
        assert_eq!(escape_atom("foo"), "foo");
        assert_eq!(escape_atom("fooBar_1"), "fooBar_1");
        assert_eq!(escape_atom("Foo"), "'Foo'");
        assert_eq!(escape_atom("_x"), "'_x'");
        assert_eq!(escape_atom(""), "''");
        assert_eq!(escape_atom("[]"), "'[]'");
        assert_eq!(escape_atom("hello world"), "'hello world'");
        assert_eq!(escape_atom("世界"), "'世界'");
    }

    #[test]
    fn escaping_round_trips() {
        let nasty = "back\\slash 'quote'\nnew\tline";
        let quoted = escape_atom(nasty);
        assert_eq!(quoted, "'back\\\\slash \\'quote\\'\\nnew\\tline'");
        assert_eq!(parse_quoted(&quoted).unwrap(), nasty);

        for s in ["", "[]", "X", "_", "end_of_file", "日本語", "a\"b"] {
            assert_eq!(parse_quoted(&escape_atom(s)).unwrap(), s);
            assert_eq!(parse_quoted(&escape_string(s)).unwrap(), s);
        }
    }

    #[test]
    fn parse_quoted_rejects_garbage() {
        assert!(parse_quoted("'unterminated").is_err());
        assert!(parse_quoted("'bad\\q'").is_err());
        assert!(parse_quoted("Upper").is_err());
        assert_eq!(parse_quoted("'it''s'").unwrap(), "it's");
    }

    #[test]
    fn compounds_and_infix() {
        let t = Term::compound(
            "foo",
            vec![Term::atom("a"), Term::string("b"), Term::List(vec![Term::int(1), Term::int(2)])],
        );
        assert_eq!(to_prolog(&t).unwrap(), "foo(a,\"b\",[1,2])");

        let module = Term::compound(":", vec![Term::atom("lists"), Term::atom("append")]);
        assert_eq!(to_prolog(&module).unwrap(), "lists:append");

        let pi = Term::compound("/", vec![Term::atom("Foo"), Term::int(3)]);
        assert_eq!(to_prolog(&pi).unwrap(), "'Foo'/3");

        let plus = Term::compound("+", vec![Term::int(1), Term::int(2)]);
        assert_eq!(to_prolog(&plus).unwrap(), "'+'(1,2)");

        let signed = Term::compound(":", vec![Term::atom("a"), Term::int(-1)]);
        assert_eq!(to_prolog(&signed).unwrap(), "a: -1");
        let ratio = Term::compound("/", vec![Term::int(1), Term::int(-2)]);
        assert_eq!(to_prolog(&ratio).unwrap(), "1/ -2");
    }

    #[test]
    fn nested_infix_keeps_its_structure() {
        let infix = |op: &str, l: Term, r: Term| Term::compound(op, vec![l, r]);
        let (a, b, c) = (Term::atom("a"), Term::atom("b"), Term::atom("c"));

        let qualified = infix(":", Term::atom("lists"), infix("/", Term::atom("append"), Term::int(3)));
        assert_eq!(to_prolog(&qualified).unwrap(), "lists:(append/3)");
        let nested_pi = infix("/", a.clone(), infix("/", b.clone(), c.clone()));
        assert_eq!(to_prolog(&nested_pi).unwrap(), "a/(b/c)");
        let left_module = infix(":", infix(":", a.clone(), b.clone()), c.clone());
        assert_eq!(to_prolog(&left_module).unwrap(), "(a:b):c");

        // already unambiguous
        assert_eq!(to_prolog(&infix(":", a.clone(), infix(":", b.clone(), c.clone()))).unwrap(), "a:b:c");
        assert_eq!(to_prolog(&infix("/", infix("/", a.clone(), b.clone()), c.clone())).unwrap(), "a/b/c");
        assert_eq!(to_prolog(&infix("/", infix(":", a.clone(), b.clone()), Term::int(2))).unwrap(), "a:b/2");

        assert_eq!(to_prolog(&infix(":", Term::rational(1, 3), a.clone())).unwrap(), "(1 rdiv 3):a");
        assert_eq!(to_prolog(&infix("/", a, Term::rational(1, 3))).unwrap(), "a/(1 rdiv 3)");
    }

    #[test]
    fn variables_and_residual_goals() {
        assert_eq!(to_prolog(&Term::var("X").unwrap()).unwrap(), "X");
        let attr = Variable::with_attr(
            "X",
            vec![
                Term::compound("dif", vec![Term::var("X").unwrap(), Term::atom("a")]),
                Term::compound("dif", vec![Term::var("X").unwrap(), Term::atom("b")]),
            ],
        )
        .unwrap();
        assert_eq!(to_prolog(&Term::Variable(attr)).unwrap(), "dif(X,a),dif(X,b)");
    }

    #[test]
    fn numbers() {
        assert_eq!(format_float(1.5).unwrap(), "1.5");
        assert_eq!(format_float(3.0).unwrap(), "3.0");
        assert_eq!(format_float(1e21).unwrap(), "1.0e21");
        assert_eq!(format_float(1e-7).unwrap(), "1.0e-7");
        assert_eq!(format_float(1.5e300).unwrap(), "1.5e300");
        assert!(format_float(f64::NAN).is_err());
        assert!(to_prolog(&Term::float(f64::INFINITY)).is_err());

        let big: num_bigint::BigInt = "123456789012345678901234567890".parse().unwrap();
        assert_eq!(to_prolog(&Term::from(big)).unwrap(), "123456789012345678901234567890");
        assert_eq!(to_prolog(&Term::rational(1, 3)).unwrap(), "1 rdiv 3");
    }

    #[test]
    fn host_sentinels() {
        assert_eq!(to_prolog(&Term::Bool(true)).unwrap(), "{true}");
        assert_eq!(to_prolog(&Term::Bool(false)).unwrap(), "{false}");
        assert_eq!(to_prolog(&Term::Null).unwrap(), "{null}");
        assert_eq!(to_prolog(&Term::Undefined).unwrap(), "{undefined}");
    }
}
