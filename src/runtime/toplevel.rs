//! Answer framing strategies.
//!
//! A [`Toplevel`] decides how a goal is wrapped before it is handed to the
//! engine and how each engine result becomes a caller-visible value. The
//! controller calls `parse` when a result has content (a pushed answer for
//! structured toplevels, console text otherwise) and `truth` when it does
//! not; `truth` returning `None` ends the query without a further redo.

use crate::error::{EncodingError, Error, ProtocolError};
use crate::term::{escape_string, from_json_value, to_json_value, DecodeOptions, Term};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Variable name → value substitutions.
pub type Bindings = BTreeMap<String, Term>;

pub trait Toplevel: Send + Sync + 'static {
    type Output: Send + 'static;

    /// Text passed to `pl_query`.
    fn query(&self, goal: &str, bind: &Bindings) -> Result<String, Error>;

    /// Frame a result that produced output (or a pushed answer).
    fn parse(&self, status: bool, stdout: &[u8], stderr: &[u8], answer: Option<&str>) -> Result<Self::Output, Error>;

    /// Frame a result without output. `None` stops the query.
    fn truth(&self, status: bool, stderr: &[u8]) -> Option<Self::Output>;

    /// Whether results arrive through `host-push-answer` rather than stdout.
    fn structured(&self) -> bool {
        false
    }
}

/// Prefix `goal` with `Name = Value` for every binding.
///
/// Rationals use `is` so the engine evaluates `N rdiv D`.
pub fn bind_vars(goal: &str, bind: &Bindings) -> Result<String, EncodingError> {
    let mut vars = Vec::with_capacity(bind.len());
    for (name, value) in bind {
        let op = if value.is_rational() { "is" } else { "=" };
        vars.push(format!("{name} {op} {}", value.to_prolog()?));
    }
    if vars.is_empty() {
        return Ok(goal.to_string());
    }
    Ok(format!("{}, {goal}", vars.join(", ")))
}

// ============================================================================
// Structured answers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Failure,
    Error,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::Failure => "failure",
            Status::Error => "error",
        }
    }
}

/// One solution in structured form.
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub status: Status,
    /// Variable bindings (empty unless successful).
    pub answer: Bindings,
    /// Thrown term when `status` is `Error`.
    pub error: Option<Term>,
    /// The `__GOAL` binding, used by futures to carry the solved goal.
    pub goal: Option<Term>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl Answer {
    pub fn success(answer: Bindings) -> Self {
        Self {
            status: Status::Success,
            answer,
            error: None,
            goal: None,
            stdout: None,
            stderr: None,
        }
    }

    pub fn failure() -> Self {
        Self {
            status: Status::Failure,
            ..Self::success(Bindings::new())
        }
    }

    pub fn error(error: Term) -> Self {
        Self {
            status: Status::Error,
            error: Some(error),
            ..Self::success(Bindings::new())
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// Binding of a variable.
    pub fn get(&self, var: &str) -> Option<&Term> {
        self.answer.get(var)
    }

    /// Wire representation, the same shape the engine produces.
    pub fn to_json_value(&self) -> Result<Value, EncodingError> {
        let mut out = Map::new();
        out.insert("status".into(), Value::from(self.status.as_str()));
        if self.status == Status::Success {
            let mut bindings = Map::new();
            for (k, v) in &self.answer {
                bindings.insert(k.clone(), to_json_value(v)?);
            }
            out.insert("answer".into(), Value::Object(bindings));
        }
        if let Some(error) = &self.error {
            out.insert("error".into(), to_json_value(error)?);
        }
        if let Some(goal) = &self.goal {
            out.insert("goal".into(), to_json_value(goal)?);
        }
        if let Some(stdout) = &self.stdout {
            out.insert("stdout".into(), Value::from(stdout.as_str()));
        }
        if let Some(stderr) = &self.stderr {
            out.insert("stderr".into(), Value::from(stderr.as_str()));
        }
        Ok(Value::Object(out))
    }
}

/// Decode an answer pushed by the engine.
pub fn parse_answer(text: &str, opts: &DecodeOptions) -> Result<Answer, Error> {
    let bad = || ProtocolError::BadAnswer(text.to_string());
    let msg: Value = serde_json::from_str(text).map_err(|_| bad())?;
    let status = match msg.get("status").and_then(Value::as_str) {
        Some("success") => Status::Success,
        Some("failure") => Status::Failure,
        Some("error") => Status::Error,
        _ => return Err(bad().into()),
    };

    let mut answer = Bindings::new();
    if let Some(bindings) = msg.get("answer").and_then(Value::as_object) {
        for (name, value) in bindings {
            answer.insert(name.clone(), from_json_value(value, opts)?);
        }
    }
    let error = match msg.get("error") {
        Some(v) => Some(from_json_value(v, opts)?),
        None if status == Status::Error => Some(Term::atom("unknown_error")),
        None => None,
    };
    let goal = match answer.remove("__GOAL") {
        Some(goal) if goal.is_callable() => Some(goal),
        Some(other) => {
            answer.insert("__GOAL".into(), other);
            None
        }
        None => None,
    };

    Ok(Answer {
        status,
        answer,
        error,
        goal,
        stdout: None,
        stderr: None,
    })
}

fn text(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Structured answers decoded from the engine's JSON toplevel.
#[derive(Debug, Clone, Default)]
pub struct Json {
    pub decode: DecodeOptions,
}

impl Json {
    pub fn new(decode: DecodeOptions) -> Self {
        Self { decode }
    }
}

impl Toplevel for Json {
    type Output = Answer;

    fn query(&self, goal: &str, bind: &Bindings) -> Result<String, Error> {
        let goal = bind_vars(goal, bind)?;
        Ok(format!("wasm:js_ask({}).", escape_string(&goal)))
    }

    fn parse(&self, _status: bool, stdout: &[u8], stderr: &[u8], answer: Option<&str>) -> Result<Answer, Error> {
        let raw = answer.ok_or_else(|| ProtocolError::BadAnswer("no answer pushed".into()))?;
        let mut msg = parse_answer(raw, &self.decode).inspect_err(|_| {
            log::error!("bad answer payload: {raw}");
            if !stderr.is_empty() {
                log::warn!("stderr: {}", String::from_utf8_lossy(stderr));
            }
        })?;
        msg.stdout = text(stdout);
        msg.stderr = text(stderr);
        Ok(msg)
    }

    fn truth(&self, _status: bool, _stderr: &[u8]) -> Option<Answer> {
        None
    }

    fn structured(&self) -> bool {
        true
    }
}

/// Raw toplevel text, e.g. `X = 1.`
#[derive(Debug, Clone)]
pub struct PrologText {
    /// Keep the trailing full stop.
    pub dot: bool,
}

impl Default for PrologText {
    fn default() -> Self {
        Self { dot: true }
    }
}

impl Toplevel for PrologText {
    type Output = String;

    fn query(&self, goal: &str, bind: &Bindings) -> Result<String, Error> {
        Ok(bind_vars(goal, bind)?)
    }

    fn parse(&self, _status: bool, stdout: &[u8], stderr: &[u8], _answer: Option<&str>) -> Result<String, Error> {
        if !stderr.is_empty() {
            log::info!("{}", String::from_utf8_lossy(stderr));
        }
        let out = match stdout.last() {
            Some(b'.') if !self.dot => &stdout[..stdout.len() - 1],
            _ => stdout,
        };
        Ok(String::from_utf8_lossy(out).into_owned())
    }

    fn truth(&self, status: bool, stderr: &[u8]) -> Option<String> {
        if !stderr.is_empty() {
            log::info!("{}", String::from_utf8_lossy(stderr));
        }
        let word = if status { "true" } else { "false" };
        Some(if self.dot { format!("{word}.") } else { word.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::Number;

    #[test]
    fn binding_prefix() {
        let mut bind = Bindings::new();
        assert_eq!(bind_vars("foo(X)", &bind).unwrap(), "foo(X)");
        bind.insert("X".into(), Term::atom("hello world"));
        bind.insert("R".into(), Term::rational(1, 3));
        assert_eq!(
            bind_vars("foo(X, R)", &bind).unwrap(),
            "R is 1 rdiv 3, X = 'hello world', foo(X, R)"
        );
    }

    #[test]
    fn json_wraps_goal() {
        let json = Json::default();
        let q = json.query("write(\"hi\"), X = 'a'", &Bindings::new()).unwrap();
        assert_eq!(q, "wasm:js_ask(\"write(\\\"hi\\\"), X = 'a'\").");
    }

    #[test]
    fn json_parse_lifts_goal_and_output() {
        let json = Json::default();
        let raw = r#"{"status":"success","answer":{"X":1,"__GOAL":{"functor":"foo","args":[1]}}}"#;
        let answer = json.parse(true, b"hello", b"", Some(raw)).unwrap();
        assert!(answer.is_success());
        assert_eq!(answer.get("X"), Some(&Term::Number(Number::Int(1))));
        assert_eq!(answer.get("__GOAL"), None);
        assert_eq!(answer.goal, Some(Term::compound("foo", vec![Term::int(1)])));
        assert_eq!(answer.stdout.as_deref(), Some("hello"));
        assert_eq!(answer.stderr, None);
    }

    #[test]
    fn json_errors_and_failures() {
        let json = Json::default();
        let failure = json.parse(false, b"", b"", Some(r#"{"status":"failure"}"#)).unwrap();
        assert_eq!(failure, Answer::failure());

        let raw = r#"{"status":"error","error":{"functor":"oops"}}"#;
        let error = json.parse(false, b"", b"warn", Some(raw)).unwrap();
        assert_eq!(error.status, Status::Error);
        assert_eq!(error.error, Some(Term::atom("oops")));
        assert_eq!(error.stderr.as_deref(), Some("warn"));

        assert!(json.parse(true, b"", b"", Some("{not json")).is_err());
        assert!(json.parse(true, b"", b"", Some(r#"{"status":"maybe"}"#)).is_err());
        assert!(json.parse(true, b"", b"", None).is_err());
        assert_eq!(json.truth(true, b""), None);
    }

    #[test]
    fn prolog_text_dot() {
        let with = PrologText::default();
        let without = PrologText { dot: false };
        assert_eq!(with.parse(true, b"X = 1.", b"", None).unwrap(), "X = 1.");
        assert_eq!(without.parse(true, b"X = 1.", b"", None).unwrap(), "X = 1");
        assert_eq!(with.truth(true, b"").as_deref(), Some("true."));
        assert_eq!(without.truth(false, b"").as_deref(), Some("false"));
        assert!(!with.structured());
    }

    #[test]
    fn answers_serialize_to_wire_shape() {
        let mut bind = Bindings::new();
        bind.insert("Y".into(), Term::int(42));
        let mut answer = Answer::success(bind);
        answer.stdout = Some("out".into());
        let v = answer.to_json_value().unwrap();
        assert_eq!(
            v,
            serde_json::json!({"status":"success","answer":{"Y":42},"stdout":"out"})
        );
    }
}
