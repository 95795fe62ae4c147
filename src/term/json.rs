//! Structured wire format.
//!
//! The engine reports answers and host-call goals as JSON:
//!
//! ```text
//! foo            {"functor":"foo"}
//! foo(1, X)      {"functor":"foo","args":[1,{"var":"X"}]}
//! "text"         "text"
//! [a]            [{"functor":"a"}]
//! 2**100         {"number":"1267650600228229401496703205376"}
//! 1r3            {"numerator":1,"denominator":3}
//! ```

use super::{Compound, Number, Term, Variable};
use crate::error::EncodingError;
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// How atoms decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AtomEncoding {
    /// `Term::Atom`
    #[default]
    Object,
    /// `Term::String` holding the atom's name
    String,
}

/// How strings decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StringEncoding {
    #[default]
    String,
    /// List of single-character atoms
    List,
}

/// How integers decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegerEncoding {
    /// `Int` when it fits in an i64, `BigInt` otherwise
    #[default]
    Fit,
    BigInt,
    /// Always `Float`
    Number,
}

/// Decoding policy for wire text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeOptions {
    pub atoms: AtomEncoding,
    pub strings: StringEncoding,
    pub integers: IntegerEncoding,
    /// Functor of arity-1 compounds that decode to booleans, e.g. `"{}"`
    /// turns `{true}` into `Term::Bool(true)`.
    pub booleans: Option<String>,
    /// Functor of arity-1 compounds that decode `null` to `Term::Null`.
    pub nulls: Option<String>,
    /// Functor of arity-1 compounds that decode `undefined` to `Term::Undefined`.
    pub undefineds: Option<String>,
}

impl DecodeOptions {
    fn has_sentinels(&self) -> bool {
        self.booleans.is_some() || self.nulls.is_some() || self.undefineds.is_some()
    }
}

/// Parse wire text into a term.
pub fn from_json(text: &str, opts: &DecodeOptions) -> Result<Term, EncodingError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| EncodingError::Malformed(e.to_string()))?;
    from_json_value(&value, opts)
}

/// Decode an already-parsed wire value.
pub fn from_json_value(value: &Value, opts: &DecodeOptions) -> Result<Term, EncodingError> {
    match value {
        Value::Null => Ok(Term::compound("{}", vec![Term::atom("null")])),
        Value::Bool(b) => Ok(Term::Bool(*b)),
        Value::Number(n) => decode_number(n, opts),
        Value::String(s) => Ok(match opts.strings {
            StringEncoding::String => Term::String(s.clone()),
            StringEncoding::List => {
                Term::List(s.chars().map(|c| Term::Atom(c.to_string())).collect())
            }
        }),
        Value::Array(items) => items
            .iter()
            .map(|item| from_json_value(item, opts))
            .collect::<Result<Vec<_>, _>>()
            .map(Term::List),
        Value::Object(obj) => decode_object(obj, opts),
    }
}

fn decode_object(obj: &Map<String, Value>, opts: &DecodeOptions) -> Result<Term, EncodingError> {
    if let Some(functor) = obj.get("functor") {
        let functor = match functor {
            Value::String(s) => s.clone(),
            // the engine writes the empty atom as []
            Value::Array(a) if a.is_empty() => String::new(),
            other => return Err(EncodingError::Malformed(format!("bad functor: {other}"))),
        };
        let raw_args = match obj.get("args") {
            Some(Value::Array(args)) => args.as_slice(),
            Some(other) => return Err(EncodingError::Malformed(format!("bad args: {other}"))),
            None => &[],
        };

        if raw_args.is_empty() {
            return Ok(match opts.atoms {
                AtomEncoding::Object => Term::Atom(functor),
                AtomEncoding::String => Term::String(functor),
            });
        }

        if raw_args.len() == 1 && opts.has_sentinels() {
            if let Some(sentinel) = decode_sentinel(&functor, &raw_args[0], opts) {
                return Ok(sentinel);
            }
        }

        let args = raw_args
            .iter()
            .map(|arg| from_json_value(arg, opts))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Term::Compound(Compound { functor, args }));
    }

    if let Some(Value::String(name)) = obj.get("var") {
        let attr = match obj.get("attr") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| from_json_value(item, opts))
                .collect::<Result<Vec<_>, _>>()?,
            _ => Vec::new(),
        };
        // trust the engine's variable names
        return Ok(Term::Variable(Variable {
            name: name.clone(),
            attr,
        }));
    }

    if let Some(Value::String(digits)) = obj.get("number") {
        let n = parse_bigint(digits)?;
        return Ok(match opts.integers {
            IntegerEncoding::Number => Term::float(bigint_to_f64(&n)),
            _ => Term::Number(Number::BigInt(n)),
        });
    }

    if let (Some(num), Some(den)) = (obj.get("numerator"), obj.get("denominator")) {
        return Ok(Term::Number(Number::Rational(
            wire_bigint(num)?,
            wire_bigint(den)?,
        )));
    }

    Err(EncodingError::Malformed(format!(
        "object is not a term: {}",
        Value::Object(obj.clone())
    )))
}

fn decode_sentinel(functor: &str, arg: &Value, opts: &DecodeOptions) -> Option<Term> {
    let name = match arg {
        Value::String(s) => s.as_str(),
        Value::Object(o) => o.get("functor")?.as_str()?,
        _ => return None,
    };
    if opts.booleans.as_deref() == Some(functor) {
        match name {
            "true" => return Some(Term::Bool(true)),
            "false" => return Some(Term::Bool(false)),
            _ => {}
        }
    }
    if opts.nulls.as_deref() == Some(functor) && name == "null" {
        return Some(Term::Null);
    }
    if opts.undefineds.as_deref() == Some(functor) && name == "undefined" {
        return Some(Term::Undefined);
    }
    None
}

fn decode_number(n: &serde_json::Number, opts: &DecodeOptions) -> Result<Term, EncodingError> {
    if let Some(i) = n.as_i64() {
        return Ok(match opts.integers {
            IntegerEncoding::Fit => Term::int(i),
            IntegerEncoding::BigInt => Term::Number(Number::BigInt(BigInt::from(i))),
            IntegerEncoding::Number => Term::float(i as f64),
        });
    }
    if let Some(u) = n.as_u64() {
        return Ok(match opts.integers {
            IntegerEncoding::Number => Term::float(u as f64),
            _ => Term::Number(Number::BigInt(BigInt::from(u))),
        });
    }
    n.as_f64()
        .map(Term::float)
        .ok_or_else(|| EncodingError::Malformed(format!("bad number: {n}")))
}

fn parse_bigint(digits: &str) -> Result<BigInt, EncodingError> {
    digits
        .parse::<BigInt>()
        .map_err(|e| EncodingError::Malformed(format!("bad integer {digits:?}: {e}")))
}

fn wire_bigint(value: &Value) -> Result<BigInt, EncodingError> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(BigInt::from(i))
            } else if let Some(u) = n.as_u64() {
                Ok(BigInt::from(u))
            } else {
                Err(EncodingError::Malformed(format!("not an integer: {n}")))
            }
        }
        Value::Object(o) => match o.get("number") {
            Some(Value::String(digits)) => parse_bigint(digits),
            _ => Err(EncodingError::Malformed(format!("not an integer: {value}"))),
        },
        other => Err(EncodingError::Malformed(format!("not an integer: {other}"))),
    }
}

fn bigint_to_f64(n: &BigInt) -> f64 {
    n.to_string().parse().unwrap_or(f64::NAN)
}

/// Encode a term as wire text; the inverse of [`from_json`] with default options.
///
/// `Bool`, `Null` and `Undefined` are sent as `{}`-wrapped atoms. They only
/// decode back to those variants when the matching sentinel functor is set
/// in [`DecodeOptions`]; by default they come back as `{}/1` compounds.
pub fn to_json(term: &Term) -> Result<String, EncodingError> {
    let value = to_json_value(term)?;
    serde_json::to_string(&value).map_err(|e| EncodingError::Unrepresentable(e.to_string()))
}

pub fn to_json_value(term: &Term) -> Result<Value, EncodingError> {
    Ok(match term {
        Term::Atom(name) => serde_json::json!({ "functor": name }),
        Term::Compound(c) => {
            let args = c
                .args()
                .iter()
                .map(to_json_value)
                .collect::<Result<Vec<_>, _>>()?;
            serde_json::json!({ "functor": c.functor(), "args": args })
        }
        Term::Variable(v) => {
            if v.attr().is_empty() {
                serde_json::json!({ "var": v.name() })
            } else {
                let attr = v
                    .attr()
                    .iter()
                    .map(to_json_value)
                    .collect::<Result<Vec<_>, _>>()?;
                serde_json::json!({ "var": v.name(), "attr": attr })
            }
        }
        Term::List(items) => Value::Array(
            items
                .iter()
                .map(to_json_value)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Term::Number(Number::Int(i)) => Value::from(*i),
        Term::Number(Number::BigInt(n)) => serde_json::json!({ "number": n.to_string() }),
        Term::Number(Number::Float(f)) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .ok_or_else(|| EncodingError::Unrepresentable(format!("{f}")))?,
        Term::Number(Number::Rational(num, den)) => serde_json::json!({
            "numerator": bigint_value(num),
            "denominator": bigint_value(den),
        }),
        Term::String(s) => Value::String(s.clone()),
        Term::Bool(b) => wrapped(if *b { "true" } else { "false" }),
        Term::Null => wrapped("null"),
        Term::Undefined => wrapped("undefined"),
    })
}

fn bigint_value(n: &BigInt) -> Value {
    match i64::try_from(n) {
        Ok(i) => Value::from(i),
        Err(_) => serde_json::json!({ "number": n.to_string() }),
    }
}

fn wrapped(name: &str) -> Value {
    serde_json::json!({ "functor": "{}", "args": [{ "functor": name }] })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(text: &str) -> Term {
        from_json(text, &DecodeOptions::default()).unwrap()
    }

    #[test]
    fn decodes_basic_terms() {
        assert_eq!(decode(r#"{"functor":"foo"}"#), Term::atom("foo"));
        assert_eq!(decode(r#"{"functor":[]}"#), Term::atom(""));
        assert_eq!(
            decode(r#"{"functor":"f","args":[1,"s",{"var":"X"}]}"#),
            Term::compound("f", vec![Term::int(1), Term::string("s"), Term::var("X").unwrap()])
        );
        assert_eq!(decode("[1.5,[]]"), Term::List(vec![Term::float(1.5), Term::List(vec![])]));
        assert_eq!(decode("null"), Term::compound("{}", vec![Term::atom("null")]));
    }

    #[test]
    fn decodes_big_numbers() {
        let big = decode(r#"{"number":"1267650600228229401496703205376"}"#);
        assert_eq!(big.to_string(), "1267650600228229401496703205376");
        assert_eq!(decode(r#"{"numerator":1,"denominator":3}"#), Term::rational(1, 3));
        assert_eq!(
            decode("18446744073709551615"),
            Term::from(BigInt::from(u64::MAX))
        );
    }

    #[test]
    fn atom_and_string_policies() {
        let opts = DecodeOptions {
            atoms: AtomEncoding::String,
            strings: StringEncoding::List,
            ..Default::default()
        };
        assert_eq!(from_json(r#"{"functor":"world"}"#, &opts).unwrap(), Term::string("world"));
        assert_eq!(
            from_json(r#""ab""#, &opts).unwrap(),
            Term::List(vec![Term::atom("a"), Term::atom("b")])
        );
    }

    #[test]
    fn integer_policies() {
        let bigint = DecodeOptions {
            integers: IntegerEncoding::BigInt,
            ..Default::default()
        };
        assert_eq!(from_json("7", &bigint).unwrap(), Term::from(BigInt::from(7)));
        let number = DecodeOptions {
            integers: IntegerEncoding::Number,
            ..Default::default()
        };
        assert_eq!(from_json("7", &number).unwrap(), Term::float(7.0));
    }

    #[test]
    fn sentinels() {
        let opts = DecodeOptions {
            booleans: Some("{}".into()),
            nulls: Some("@".into()),
            undefineds: Some("{}".into()),
            ..Default::default()
        };
        let wrap = |f: &str, a: &str| format!(r#"{{"functor":"{f}","args":[{{"functor":"{a}"}}]}}"#);
        assert_eq!(from_json(&wrap("{}", "true"), &opts).unwrap(), Term::Bool(true));
        assert_eq!(from_json(&wrap("{}", "false"), &opts).unwrap(), Term::Bool(false));
        assert_eq!(from_json(&wrap("@", "null"), &opts).unwrap(), Term::Null);
        assert_eq!(from_json(&wrap("{}", "undefined"), &opts).unwrap(), Term::Undefined);
        // wrong functor for the category stays a compound
        assert_eq!(
            from_json(&wrap("{}", "null"), &opts).unwrap(),
            Term::compound("{}", vec![Term::atom("null")])
        );
        // without options nothing is special
        assert_eq!(
            decode(&wrap("{}", "true")),
            Term::compound("{}", vec![Term::atom("true")])
        );
    }

    #[test]
    fn round_trips_with_default_policy() {
        let terms = vec![
            Term::atom(""),
            Term::atom("end_of_file"),
            Term::atom("X"),
            Term::atom("[]"),
            Term::atom("héllo 世界\n'\\"),
            Term::compound("f", vec![Term::var("_G1").unwrap(), Term::List(vec![])]),
            Term::string("line\nbreak"),
            Term::int(-42),
            Term::float(0.25),
            Term::float(3.0),
            Term::from("9999999999999999999999".parse::<BigInt>().unwrap()),
            Term::rational(-2, 7),
            Term::Variable(
                Variable::with_attr("X", vec![Term::compound("dif", vec![Term::var("X").unwrap(), Term::atom("a")])])
                    .unwrap(),
            ),
        ];
        for t in terms {
            let text = to_json(&t).unwrap();
            assert_eq!(from_json(&text, &DecodeOptions::default()).unwrap(), t, "{text}");
        }
    }

    #[test]
    fn rejects_unrepresentable() {
        assert!(to_json(&Term::float(f64::NAN)).is_err());
        assert!(from_json("{not json", &DecodeOptions::default()).is_err());
        assert!(from_json(r#"{"hello":1}"#, &DecodeOptions::default()).is_err());
    }

    #[test]
    fn options_deserialize() {
        let opts: DecodeOptions =
            serde_json::from_str(r#"{"atoms":"string","integers":"bigint","booleans":"@"}"#).unwrap();
        assert_eq!(opts.atoms, AtomEncoding::String);
        assert_eq!(opts.integers, IntegerEncoding::BigInt);
        assert_eq!(opts.booleans.as_deref(), Some("@"));
        assert_eq!(opts.strings, StringEncoding::String);
    }
}
