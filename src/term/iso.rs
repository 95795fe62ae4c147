//! ISO error terms.
//!
//! All builders produce `error(Kind, Context)`; wrap with [`throw_term`] to
//! hand one back to the engine as a replacement goal.

use super::Term;

fn error(kind: &str, type_name: &str, culprit: Term, context: Term) -> Term {
    Term::compound(
        "error",
        vec![
            Term::compound(kind, vec![Term::atom(type_name), culprit]),
            context,
        ],
    )
}

/// `error(type_error(Type, Culprit), Context)`
pub fn type_error(type_name: &str, culprit: Term, context: Term) -> Term {
    error("type_error", type_name, culprit, context)
}

/// `error(domain_error(Domain, Culprit), Context)`
pub fn domain_error(domain: &str, culprit: Term, context: Term) -> Term {
    error("domain_error", domain, culprit, context)
}

/// `error(existence_error(Kind, Culprit), Context)`
pub fn existence_error(kind: &str, culprit: Term, context: Term) -> Term {
    error("existence_error", kind, culprit, context)
}

/// `error(system_error(Kind, Detail), Context)`
pub fn system_error(kind: &str, detail: Term, context: Term) -> Term {
    error("system_error", kind, detail, context)
}

/// `throw(Ball)`
pub fn throw_term(ball: Term) -> Term {
    Term::compound("throw", vec![ball])
}
