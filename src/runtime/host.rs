//! Host-Call Dispatcher
//!
//! The engine reaches host code through a single shim predicate,
//! `host_rpc/1`, which calls the `trealla.host-call` import with the goal
//! encoded as wire JSON. The dispatcher resolves the goal by name and arity
//! against registered [`Predicate`]s:
//!
//! - **sync** procedures run inline; their result is the reply (`OK`)
//! - **async** procedures and **streams** are parked as a [`Thunk`] keyed by
//!   subquery handle, and the reply is `YIELD`. The query controller advances
//!   the thunk one step per scheduling tick and redoes the subquery, and the
//!   engine collects the value through `trealla.host-resume`.
//!
//! Replies are Prolog text: `true`, `fail`, or a replacement goal that the
//! engine unifies with the original call (this is how output arguments are
//! bound). Resumes of a stream that has more to give reply `CHOICE`, leaving a
//! choice point; the final value replies `OK` or `FAIL`.
//!
//! Failures in host code never reach the engine as traps: they are reported
//! to the [`ErrorHandler`] and replied as `throw(error(system_error(..), PI))`.

use super::ctrl::{Ctrl, CtrlTable, QueryId};
use super::{Prolog, Shared};
use crate::error::{EncodingError, Error, HostProcedureError, ProtocolError};
use crate::guest::{read_string, write_u32, Console, GuestMemory, GuestString, HostHooks, HostStatus, Ptr, SubqueryHandle};
use crate::term::{existence_error, from_json, pi_term, system_error, throw_term, DecodeOptions, Term};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

// ============================================================================
// Procedures
// ============================================================================

/// What a host procedure hands back to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Continuation {
    True,
    Fail,
    /// Replacement goal, unified with the original call.
    Goal(Term),
}

impl From<bool> for Continuation {
    fn from(b: bool) -> Self {
        if b {
            Continuation::True
        } else {
            Continuation::Fail
        }
    }
}

impl From<Term> for Continuation {
    fn from(t: Term) -> Self {
        Continuation::Goal(t)
    }
}

pub type HostResult = Result<Continuation, HostProcedureError>;

/// Handler for host procedure failures.
///
/// Called whenever a procedure returns an error or panics, before the
/// failure is converted into a thrown term for the engine.
pub type ErrorHandler = Arc<dyn Fn(&HostProcedureError) + Send + Sync>;

/// Default error handler that logs a warning.
pub fn default_error_handler() -> ErrorHandler {
    Arc::new(|err: &HostProcedureError| log::warn!("{err}"))
}

type SyncFn = dyn Fn(&HostCtx, &Term) -> HostResult + Send + Sync;
type AsyncFn = dyn Fn(HostCtx, Term) -> BoxFuture<'static, HostResult> + Send + Sync;
type StreamFn = dyn Fn(HostCtx, Term) -> BoxStream<'static, HostResult> + Send + Sync;

/// A host procedure, resolved once at registration.
#[derive(Clone)]
pub enum Procedure {
    Sync(Arc<SyncFn>),
    /// Produces exactly one value after suspending the guest.
    Async(Arc<AsyncFn>),
    /// Produces a value per item; each item after the first is a new
    /// solution on backtracking.
    Stream(Arc<StreamFn>),
}

/// A host-registered predicate.
#[derive(Clone)]
pub struct Predicate {
    name: String,
    arity: usize,
    proc: Procedure,
}

impl Predicate {
    pub fn new(name: impl Into<String>, arity: usize, proc: Procedure) -> Self {
        Self {
            name: name.into(),
            arity,
            proc,
        }
    }

    pub fn sync<F>(name: impl Into<String>, arity: usize, f: F) -> Self
    where
        F: Fn(&HostCtx, &Term) -> HostResult + Send + Sync + 'static,
    {
        Self::new(name, arity, Procedure::Sync(Arc::new(f)))
    }

    pub fn future<F, Fut>(name: impl Into<String>, arity: usize, f: F) -> Self
    where
        F: Fn(HostCtx, Term) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HostResult> + Send + 'static,
    {
        Self::new(
            name,
            arity,
            Procedure::Async(Arc::new(move |ctx, goal| f(ctx, goal).boxed())),
        )
    }

    pub fn stream<F, S>(name: impl Into<String>, arity: usize, f: F) -> Self
    where
        F: Fn(HostCtx, Term) -> S + Send + Sync + 'static,
        S: Stream<Item = HostResult> + Send + 'static,
    {
        Self::new(
            name,
            arity,
            Procedure::Stream(Arc::new(move |ctx, goal| f(ctx, goal).boxed())),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn procedure(&self) -> &Procedure {
        &self.proc
    }

    pub fn is_sync(&self) -> bool {
        matches!(self.proc, Procedure::Sync(_))
    }

    pub fn pi(&self) -> String {
        format!("{}/{}", self.name, self.arity)
    }

    pub fn pi_term(&self) -> Term {
        pi_term(&self.name, self.arity)
    }

    /// Clause routing calls of this predicate to the host:
    /// `name(_0, ..) :- host_rpc(name(_0, ..)).`
    pub fn shim(&self) -> Result<String, EncodingError> {
        let args = (0..self.arity)
            .map(|i| Term::var(format!("_{i}")))
            .collect::<Result<Vec<_>, _>>()?;
        let head = Term::atomic(self.name.clone(), args).to_prolog()?;
        Ok(format!("{head} :- host_rpc({head}). "))
    }
}

impl std::fmt::Debug for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.proc {
            Procedure::Sync(_) => "sync",
            Procedure::Async(_) => "async",
            Procedure::Stream(_) => "stream",
        };
        write!(f, "Predicate({}, {kind})", self.pi())
    }
}

/// Context handed to host procedures.
///
/// Parked continuations own their context, so it refers to the interpreter
/// weakly; dropping the last `Prolog` releases them.
#[derive(Clone)]
pub struct HostCtx {
    shared: Weak<Shared>,
    query: QueryId,
    subquery: Option<SubqueryHandle>,
}

impl HostCtx {
    /// The interpreter that made the call, unless it has been dropped.
    /// Queries started from here are lazy and may only be driven from async
    /// procedures.
    pub fn prolog(&self) -> Result<Prolog, Error> {
        self.shared
            .upgrade()
            .map(Prolog::from_shared)
            .ok_or_else(|| ProtocolError::Finalized.into())
    }

    pub fn query_id(&self) -> QueryId {
        self.query
    }

    pub fn subquery(&self) -> Option<SubqueryHandle> {
        self.subquery
    }

    /// Append to the calling query's captured stdout.
    pub fn stdout(&self, text: &str) {
        self.write(Sink::Stdout, text);
    }

    /// Append to the calling query's captured stderr.
    pub fn stderr(&self, text: &str) {
        self.write(Sink::Stderr, text);
    }

    fn write(&self, sink: Sink, text: &str) {
        if text.is_empty() {
            return;
        }
        let Ok(prolog) = self.prolog() else {
            log::debug!("{} output after interpreter drop: {text}", self.query);
            return;
        };
        let bridge = prolog.bridge();
        // inside this query's engine call, pending console text came first;
        // outside one, the console belongs to whichever query is running
        if super::in_guest() {
            bridge.capture(self.query, prolog.console());
        }
        bridge.write_output(self.query, sink, text.as_bytes());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Sink {
    Stdout,
    Stderr,
}

// ============================================================================
// Thunks
// ============================================================================

pub(crate) enum Cont {
    Once(BoxFuture<'static, HostResult>),
    Stream(BoxStream<'static, HostResult>),
}

/// Pending continuation of an async host call.
pub(crate) struct Thunk {
    pi: String,
    /// `None` while a step is being driven, or once exhausted.
    cont: Option<Cont>,
    /// Value produced by the last step; `None` means fail.
    value: Option<Continuation>,
    done: bool,
}

// ============================================================================
// Bridge
// ============================================================================

#[derive(Default)]
struct BridgeState {
    procs: HashMap<(String, usize), Predicate>,
    ctrls: CtrlTable,
    thunks: HashMap<SubqueryHandle, Thunk>,
}

/// Engine callbacks plus the tables they consult.
pub(crate) struct Bridge {
    prolog: Weak<Shared>,
    state: Mutex<BridgeState>,
    on_error: ErrorHandler,
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

impl Bridge {
    pub fn new(prolog: Weak<Shared>, on_error: ErrorHandler) -> Self {
        Self {
            prolog,
            state: Mutex::new(BridgeState::default()),
            on_error,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, pred: Predicate) {
        log::debug!("registering host predicate {}", pred.pi());
        let key = (pred.name.clone(), pred.arity);
        let old = self.lock().procs.insert(key, pred);
        drop(old);
    }

    pub fn is_registered(&self, name: &str, arity: usize) -> bool {
        self.lock().procs.contains_key(&(name.to_string(), arity))
    }

    pub fn spawn(&self, id: QueryId, slot: Ptr) {
        self.lock().ctrls.spawn(id, slot);
    }

    pub fn resolve(&self, id: QueryId, handle: Option<SubqueryHandle>) {
        let mut state = self.lock();
        match handle {
            Some(handle) => state.ctrls.resolve(id, handle),
            None => state.ctrls.settle(id),
        }
    }

    pub fn pop_answer(&self, id: QueryId) -> Option<String> {
        self.lock().ctrls.get_mut(id)?.answers.pop_front()
    }

    pub fn live_queries(&self) -> usize {
        self.lock().ctrls.len()
    }

    /// Append host-produced output to a query's sinks. Output for a query
    /// that has already finished is dropped.
    pub fn write_output(&self, id: QueryId, sink: Sink, data: &[u8]) {
        let mut state = self.lock();
        let Some(ctrl) = state.ctrls.get_mut(id) else {
            log::trace!("dropping output for finished query {id}");
            return;
        };
        match sink {
            Sink::Stdout => ctrl.stdout.extend_from_slice(data),
            Sink::Stderr => ctrl.stderr.extend_from_slice(data),
        }
    }

    /// Move whatever the engine has written so far into a query's sinks.
    ///
    /// The console only ever holds output of the engine call in progress,
    /// so this is only correct while `id` is the query being run.
    pub fn capture(&self, id: QueryId, console: &Console) {
        let stdout = console.take_stdout();
        let stderr = console.take_stderr();
        if !stdout.is_empty() {
            self.write_output(id, Sink::Stdout, &stdout);
        }
        if !stderr.is_empty() {
            self.write_output(id, Sink::Stderr, &stderr);
        }
    }

    /// Drain a query's sinks as `(stdout, stderr)`.
    pub fn take_output(&self, id: QueryId) -> (Vec<u8>, Vec<u8>) {
        let mut state = self.lock();
        match state.ctrls.get_mut(id) {
            Some(ctrl) => (std::mem::take(&mut ctrl.stdout), std::mem::take(&mut ctrl.stderr)),
            None => (Vec::new(), Vec::new()),
        }
    }

    pub fn pending_thunks(&self) -> usize {
        self.lock().thunks.len()
    }

    /// Unregister a finished query and drop any continuation it left behind.
    pub fn forget(&self, id: QueryId, handle: Option<SubqueryHandle>) {
        let (ctrl, thunk): (Option<Ctrl>, Option<Thunk>) = {
            let mut state = self.lock();
            let ctrl = state.ctrls.remove(id);
            let thunk = handle.and_then(|h| state.thunks.remove(&h));
            (ctrl, thunk)
        };
        // continuations may own other queries; drop them unlocked
        drop(thunk);
        drop(ctrl);
    }

    fn report(&self, err: HostProcedureError) -> Continuation {
        (self.on_error)(&err);
        let context = pi_term_from(&err.predicate);
        Continuation::Goal(throw_term(system_error(
            "host_exception",
            Term::string(err.message),
            context,
        )))
    }

    fn settle(&self, pi: &str, result: HostResult) -> Continuation {
        match result {
            Ok(cont) => cont,
            Err(mut err) => {
                if err.predicate.is_empty() {
                    err.predicate = pi.to_string();
                }
                self.report(err)
            }
        }
    }

    fn panicked(&self, pi: &str, panic: Box<dyn Any + Send>) -> Continuation {
        self.report(HostProcedureError {
            predicate: pi.to_string(),
            message: panic_message(panic),
        })
    }

    /// Advance the thunk parked for `handle` by one step.
    ///
    /// Returns `false` when there is no thunk, i.e. the guest yielded on its
    /// own. No locks are held while the step runs.
    pub async fn advance(&self, handle: SubqueryHandle) -> bool {
        let taken = {
            let mut state = self.lock();
            match state.thunks.get_mut(&handle) {
                Some(thunk) => Some((thunk.pi.clone(), thunk.cont.take())),
                None => None,
            }
        };
        let Some((pi, cont)) = taken else {
            return false;
        };
        log::trace!("advancing {pi} for subquery {:#x}", handle.raw());

        let (cont, value, done) = match cont {
            None => (None, None, true),
            Some(Cont::Once(fut)) => {
                let value = match AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(result) => self.settle(&pi, result),
                    Err(panic) => self.panicked(&pi, panic),
                };
                (None, Some(value), true)
            }
            Some(Cont::Stream(mut stream)) => {
                match AssertUnwindSafe(stream.next()).catch_unwind().await {
                    Ok(Some(result)) => {
                        let value = self.settle(&pi, result);
                        (Some(Cont::Stream(stream)), Some(value), false)
                    }
                    Ok(None) => (None, None, true),
                    Err(panic) => (None, Some(self.panicked(&pi, panic)), true),
                }
            }
        };

        let mut state = self.lock();
        match state.thunks.get_mut(&handle) {
            Some(thunk) => {
                thunk.cont = cont;
                thunk.value = value;
                thunk.done = done;
                drop(state);
            }
            None => {
                // query finalized while the step ran
                drop(state);
                drop(cont);
            }
        }
        true
    }

    fn park(&self, handle: SubqueryHandle, pi: String, cont: Cont) {
        let thunk = Thunk {
            pi,
            cont: Some(cont),
            value: None,
            done: false,
        };
        let old = self.lock().thunks.insert(handle, thunk);
        drop(old);
    }

    fn prolog(&self) -> Result<Prolog, Error> {
        self.prolog
            .upgrade()
            .map(Prolog::from_shared)
            .ok_or_else(|| ProtocolError::Finalized.into())
    }

    fn render(&self, pi: &str, cont: &Continuation) -> String {
        match cont {
            Continuation::True => "true".to_string(),
            Continuation::Fail => "fail".to_string(),
            Continuation::Goal(goal) => goal.to_prolog().unwrap_or_else(|e| {
                log::warn!("invalid return value from host predicate {pi}: {e}");
                throw_term(system_error("encoding_error", Term::string(e.to_string()), pi_term_from(pi)))
                    .to_prolog()
                    .unwrap_or_else(|_| "fail".to_string())
            }),
        }
    }

    fn dispatch(&self, mem: &mut dyn GuestMemory, subquery: u32, msg: Ptr, msg_size: u32) -> Result<(String, HostStatus), Error> {
        let raw = read_string(mem, msg, Some(msg_size))?;
        let goal = from_json(&raw, &DecodeOptions::default())?;
        let (Some(name), Some(arity)) = (goal.functor().map(str::to_string), goal.arity()) else {
            return Err(EncodingError::Malformed(format!("host call with non-callable goal: {raw}")).into());
        };
        let pi = format!("{name}/{arity}");

        let (id, pred) = {
            let mut state = self.lock();
            let id = state
                .ctrls
                .lookup(mem, subquery)
                .ok_or(ProtocolError::UnknownSubquery(subquery))?;
            (id, state.procs.get(&(name.clone(), arity)).cloned())
        };
        log::trace!("host call {pi} from {id}");

        let Some(pred) = pred else {
            log::debug!("host call to unknown predicate {pi}");
            let err = throw_term(existence_error(
                "procedure",
                pi_term(&name, arity),
                pi_term("host_rpc", 1),
            ));
            return Ok((err.to_prolog()?, HostStatus::Ok));
        };

        let handle = SubqueryHandle::from_raw(subquery);
        let prolog = self.prolog()?;
        let ctx = HostCtx {
            shared: Arc::downgrade(&prolog.shared),
            query: id,
            subquery: handle,
        };

        let cont = match &pred.proc {
            Procedure::Sync(f) => {
                let value = match std::panic::catch_unwind(AssertUnwindSafe(|| f(&ctx, &goal))) {
                    Ok(result) => self.settle(&pi, result),
                    Err(panic) => self.panicked(&pi, panic),
                };
                return Ok((self.render(&pi, &value), HostStatus::Ok));
            }
            Procedure::Async(f) => Cont::Once(f(ctx, goal)),
            Procedure::Stream(f) => Cont::Stream(f(ctx, goal)),
        };
        let handle = handle.ok_or(ProtocolError::UnknownSubquery(subquery))?;
        self.park(handle, pi, cont);
        Ok(("true".to_string(), HostStatus::Yield))
    }
}

/// Best-effort `Name/Arity` term from indicator text.
fn pi_term_from(pi: &str) -> Term {
    match pi.rsplit_once('/') {
        Some((name, arity)) => match arity.parse::<usize>() {
            Ok(arity) => pi_term(name, arity),
            Err(_) => Term::atom(pi),
        },
        None => Term::atom(pi),
    }
}

/// Hand a reply string to the guest; the guest owns the buffer afterwards.
fn reply(mem: &mut dyn GuestMemory, text: &str, reply_ptr: Ptr, reply_size_ptr: Ptr) -> Result<(), Error> {
    let (ptr, len) = GuestString::alloc(mem, text)?.leak();
    write_u32(mem, reply_size_ptr, len)?;
    write_u32(mem, reply_ptr, ptr)?;
    Ok(())
}

impl HostHooks for Bridge {
    fn host_call(
        &self,
        mem: &mut dyn GuestMemory,
        subquery: u32,
        msg: Ptr,
        msg_size: u32,
        reply_ptr: Ptr,
        reply_size_ptr: Ptr,
    ) -> HostStatus {
        let (text, status) = match self.dispatch(mem, subquery, msg, msg_size) {
            Ok(out) => out,
            Err(e) => {
                log::error!("host-call failed: {e}");
                return HostStatus::Error;
            }
        };
        match reply(mem, &text, reply_ptr, reply_size_ptr) {
            Ok(()) => status,
            Err(e) => {
                log::error!("host-call reply failed: {e}");
                HostStatus::Error
            }
        }
    }

    fn host_resume(
        &self,
        mem: &mut dyn GuestMemory,
        subquery: u32,
        reply_ptr: Ptr,
        reply_size_ptr: Ptr,
    ) -> HostStatus {
        let Some(handle) = SubqueryHandle::from_raw(subquery) else {
            return HostStatus::Error;
        };
        let (pi, value, done, finished) = {
            let mut state = self.lock();
            let Some(thunk) = state.thunks.get_mut(&handle) else {
                log::error!("{}", ProtocolError::MissingThunk(subquery));
                return HostStatus::Error;
            };
            let out = (thunk.pi.clone(), thunk.value.take(), thunk.done);
            let finished = if out.2 { state.thunks.remove(&handle) } else { None };
            (out.0, out.1, out.2, finished)
        };
        drop(finished);

        let text = match value {
            None => "fail".to_string(),
            Some(cont) => self.render(&pi, &cont),
        };
        if let Err(e) = reply(mem, &text, reply_ptr, reply_size_ptr) {
            log::error!("host-resume reply failed: {e}");
            return HostStatus::Error;
        }

        if !done {
            HostStatus::Choice
        } else if text == "fail" {
            HostStatus::Fail
        } else {
            HostStatus::Ok
        }
    }

    fn host_push_answer(&self, mem: &mut dyn GuestMemory, subquery: u32, msg: Ptr, size: u32) {
        let raw = match read_string(mem, msg, Some(size)) {
            Ok(raw) => raw,
            Err(e) => {
                log::error!("host-push-answer: {e}");
                return;
            }
        };
        let mut state = self.lock();
        let Some(id) = state.ctrls.lookup(mem, subquery) else {
            log::error!("host-push-answer: {}", ProtocolError::UnknownSubquery(subquery));
            return;
        };
        if let Some(ctrl) = state.ctrls.get_mut(id) {
            ctrl.answers.push_back(raw);
        }
    }
}
