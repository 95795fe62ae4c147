//! plhost: a host bridge for a sandboxed WebAssembly Prolog engine
//!
//! Runs many independent, possibly asynchronous queries against one
//! single-threaded engine instance and presents each as an ordinary
//! cancellable stream of answers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │                 Prolog                  │
//! │                                         │
//! │  runtime  - queries, host calls, tasks  │
//! │  term     - term model and wire codec   │
//! │  vfs      - program staging             │
//! │                                         │
//! ├─────────────────────────────────────────┤
//! │   guest - engine ABI over wasmtime      │
//! │   wasi  - streams and fs over vfs       │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Host predicates
//!
//! Host code becomes callable from Prolog by registering a [`Predicate`]:
//!
//! ```no_run
//! use plhost::{Continuation, Predicate, Prolog, PrologOptions, QueryOptions, Term};
//!
//! # async fn demo() -> plhost::Result<()> {
//! plhost::guest::wasm::load(&std::fs::read("tpl.wasm").unwrap_or_default())?;
//! let pl = Prolog::instantiate(PrologOptions::default())?;
//! pl.register(Predicate::sync("double", 2, |_, goal| {
//!     let x = goal.as_compound().and_then(|c| c.arg(0)).and_then(Term::as_i64).unwrap_or(0);
//!     Ok(Term::compound("double", vec![Term::int(x), Term::int(2 * x)]).into())
//! }))
//! .await?;
//! let answer = pl.query_once("double(21, Y)", QueryOptions::default()).await?;
//! assert_eq!(answer.get("Y"), Some(&Term::int(42)));
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod guest;
pub mod runtime;
pub mod term;
pub mod vfs;

pub use error::{Error, Result};
pub use runtime::{
    Answer, Continuation, HostCtx, HostResult, Json, Predicate, Prolog, PrologOptions, PrologText, Query,
    QueryOptions, Status, Toplevel,
};
pub use term::{DecodeOptions, Term};
