//! Built-in host predicates.
//!
//! Timers, logging and the future combinators used by the engine-side
//! `future/2`, `await/1` and friends. A promise is the guest-visible term
//! `'$promise'(TaskId, Goal)`; awaiting it replaces `Goal` with the solved
//! goal of the task's next answer.

use super::host::{Continuation, HostCtx, HostResult, Predicate};
use super::query::QueryOptions;
use super::tasks::{AwaitAll, TaskId, TaskTable, Tick};
use super::toplevel::{Answer, Status};
use crate::error::{HostProcedureError, TaskError};
use crate::term::{domain_error, pi_term, system_error, throw_term, type_error, Term};
use futures::stream::{self, StreamExt};
use std::time::Duration;

/// Every built-in predicate.
pub fn library() -> Vec<Predicate> {
    vec![
        Predicate::future("sleep", 1, |_, goal| wait(goal, Duration::from_secs(1))),
        Predicate::future("delay", 1, |_, goal| wait(goal, Duration::from_millis(1))),
        Predicate::sync("console_log", 1, console_log),
        Predicate::sync("future", 2, future),
        Predicate::future("$await", 1, await_promise),
        Predicate::future("await_any", 3, await_any),
        Predicate::future("$await_all", 1, await_all),
        Predicate::future("$await_some", 3, await_some),
        Predicate::sync("future_cancel", 1, future_cancel),
        Predicate::stream("host_between", 3, host_between),
    ]
}

fn arg(goal: &Term, i: usize) -> Term {
    goal.as_compound()
        .and_then(|c| c.arg(i))
        .cloned()
        .unwrap_or(Term::Undefined)
}

fn context(goal: &Term) -> Term {
    goal.pi_term().unwrap_or(Term::Undefined)
}

fn throw(ball: Term) -> Continuation {
    Continuation::Goal(throw_term(ball))
}

fn failed(e: impl std::fmt::Display) -> HostProcedureError {
    HostProcedureError {
        predicate: String::new(),
        message: e.to_string(),
    }
}

/// Task table of the calling interpreter. Not held across awaits: a parked
/// procedure may live inside the table it waits on.
fn tasks(ctx: &HostCtx) -> Result<TaskTable, HostProcedureError> {
    ctx.prolog().map(|pl| pl.tasks().clone()).map_err(failed)
}

// ============================================================================
// Timers and logging
// ============================================================================

fn wait_time(goal: &Term, unit: Duration) -> Result<Duration, Continuation> {
    let time = arg(goal, 0);
    let Some(n) = time.as_f64() else {
        return Err(throw(type_error("number", time, context(goal))));
    };
    if n < 0.0 {
        return Err(throw(domain_error("not_less_than_zero", time, context(goal))));
    }
    Duration::try_from_secs_f64(n * unit.as_secs_f64())
        .map_err(|_| throw(domain_error("duration", time, context(goal))))
}

async fn wait(goal: Term, unit: Duration) -> HostResult {
    match wait_time(&goal, unit) {
        Ok(d) => {
            tokio::time::sleep(d).await;
            Ok(Continuation::True)
        }
        Err(thrown) => Ok(thrown),
    }
}

fn console_log(_: &HostCtx, goal: &Term) -> HostResult {
    match arg(goal, 0) {
        Term::String(s) => log::info!(target: "console", "{s}"),
        other => log::info!(target: "console", "{}", other.to_prolog().map_err(failed)?),
    }
    Ok(Continuation::True)
}

// ============================================================================
// Futures
// ============================================================================

/// `future(Goal, Promise)`: start `Goal` as a background task.
fn future(ctx: &HostCtx, goal: &Term) -> HostResult {
    let call = arg(goal, 0);
    if !call.is_callable() {
        return Ok(throw(type_error("callable", call, context(goal))));
    }
    let var = Term::var("__GOAL").map_err(failed)?;
    let ask = Term::compound(
        ",",
        vec![Term::compound("=", vec![var.clone(), call.clone()]), var],
    );
    let text = ask.to_prolog().map_err(failed)?;

    let prolog = ctx.prolog().map_err(failed)?;
    let answers = prolog.query_detached(&text, QueryOptions::default()).map(|result| {
        result.unwrap_or_else(|e| {
            Answer::error(system_error("bridge_error", Term::string(e.to_string()), pi_term("future", 2)))
        })
    });
    let id = prolog.tasks().spawn(answers);
    log::debug!("{} spawned task {id}", ctx.query_id());

    let promise = Term::compound("$promise", vec![Term::int(id as i64), call.clone()]);
    Ok(Term::compound("future", vec![call, promise]).into())
}

/// Task id of a `'$promise'/2` token, or the error to throw.
fn promise_id(token: &Term, goal: &Term) -> Result<TaskId, Continuation> {
    if !token.is_compound("$promise", Some(2)) {
        return Err(throw(type_error("promise", token.clone(), context(goal))));
    }
    arg(token, 0)
        .as_i64()
        .and_then(|id| TaskId::try_from(id).ok())
        .ok_or_else(|| throw(type_error("integer", token.clone(), context(goal))))
}

fn promise_ids(tokens: &Term, goal: &Term) -> Result<(Vec<Term>, Vec<TaskId>), Continuation> {
    let Some(list) = tokens.as_list() else {
        return Err(throw(type_error("list", tokens.clone(), context(goal))));
    };
    let ids = list
        .iter()
        .map(|token| promise_id(token, goal))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((list.to_vec(), ids))
}

/// `token` with its goal replaced by the solved one.
fn resolved(token: &Term, solved: Term) -> Term {
    match token.as_compound() {
        Some(c) => c.with_arg(1, solved).into(),
        None => token.clone(),
    }
}

/// Pass a task's captured output on to the awaiting query.
fn forward(ctx: &HostCtx, answer: &Answer) {
    if let Some(out) = &answer.stdout {
        ctx.stdout(out);
    }
    if let Some(err) = &answer.stderr {
        ctx.stderr(err);
    }
}

fn rethrow(answer: &Answer) -> Continuation {
    throw(answer.error.clone().unwrap_or_else(|| Term::atom("unknown_error")))
}

/// `'$await'(Promise)`: next answer of one task.
async fn await_promise(ctx: HostCtx, goal: Term) -> HostResult {
    let token = arg(&goal, 0);
    let id = match promise_id(&token, &goal) {
        Ok(id) => id,
        Err(thrown) => return Ok(thrown),
    };
    let Ok(tick) = tasks(&ctx)?.tick(id) else {
        return Ok(Continuation::Fail);
    };
    let Some(tick) = tick.await else {
        return Ok(Continuation::Fail);
    };
    forward(&ctx, &tick.answer);
    Ok(match (tick.answer.status, tick.answer.goal.clone()) {
        (Status::Error, _) => rethrow(&tick.answer),
        (Status::Success, Some(solved)) => {
            Term::compound("$await", vec![resolved(&token, solved)]).into()
        }
        _ => Continuation::Fail,
    })
}

/// `await_any(Promises, Winner, Rest)`: first task to succeed.
async fn await_any(ctx: HostCtx, goal: Term) -> HostResult {
    let (tokens, ids) = match promise_ids(&arg(&goal, 0), &goal) {
        Ok(parsed) => parsed,
        Err(thrown) => return Ok(thrown),
    };
    let waiting = tasks(&ctx)?.await_one(&ids);
    let out = match waiting.await {
        Ok(out) => out,
        Err(TaskError::Unknown(id)) => {
            let token = ids
                .iter()
                .position(|i| *i == id)
                .map(|i| tokens[i].clone())
                .unwrap_or(Term::int(id as i64));
            return Ok(throw(type_error("promise", token, context(&goal))));
        }
    };
    let Some((win, tick)) = out.winner else {
        return Ok(Continuation::Fail);
    };
    forward(&ctx, &tick.answer);
    if tick.answer.status == Status::Error {
        return Ok(rethrow(&tick.answer));
    }
    let Some(solved) = tick.answer.goal else {
        return Ok(Continuation::Fail);
    };
    let rest = tokens
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != win && !out.dropped.contains(i))
        .map(|(_, t)| t.clone())
        .collect();
    Ok(Term::compound(
        "await_any",
        vec![
            Term::List(tokens.clone()),
            resolved(&tokens[win], solved),
            Term::List(rest),
        ],
    )
    .into())
}

/// `'$await_all'(Promises)`: one answer from every task.
async fn await_all(ctx: HostCtx, goal: Term) -> HostResult {
    let (tokens, ids) = match promise_ids(&arg(&goal, 0), &goal) {
        Ok(parsed) => parsed,
        Err(thrown) => return Ok(thrown),
    };
    let waiting = tasks(&ctx)?.await_all(&ids);
    let ticks = match waiting.await {
        AwaitAll::Ready(ticks) => ticks,
        AwaitAll::Stopped(None) => return Ok(Continuation::Fail),
        AwaitAll::Stopped(Some(tick)) => {
            forward(&ctx, &tick.answer);
            return Ok(match tick.answer.status {
                Status::Error => rethrow(&tick.answer),
                _ => Continuation::Fail,
            });
        }
    };
    let mut solved = Vec::with_capacity(tokens.len());
    for (token, tick) in tokens.iter().zip(ticks) {
        forward(&ctx, &tick.answer);
        match tick.answer.goal {
            Some(g) => solved.push(resolved(token, g)),
            None => return Ok(Continuation::Fail),
        }
    }
    Ok(Term::compound("$await_all", vec![Term::List(solved)]).into())
}

/// `'$await_some'(Promises, Ok, Done)`: partition tasks by their next answer.
///
/// Fails when none succeeded. Errors count as done.
async fn await_some(ctx: HostCtx, goal: Term) -> HostResult {
    let (tokens, ids) = match promise_ids(&arg(&goal, 0), &goal) {
        Ok(parsed) => parsed,
        Err(thrown) => return Ok(thrown),
    };
    if tokens.is_empty() {
        return Ok(Continuation::Fail);
    }
    let waiting = tasks(&ctx)?.await_some(&ids);
    let parts = waiting.await;

    let mut replies: Vec<(usize, Option<Tick>, bool)> = parts
        .ok
        .into_iter()
        .map(|(i, t)| (i, Some(t), true))
        .chain(parts.done.into_iter().map(|(i, t)| (i, t, false)))
        .collect();
    replies.sort_by_key(|(i, _, _)| *i);

    let mut ok = Vec::new();
    let mut done = Vec::new();
    for (i, tick, succeeded) in replies {
        let token = &tokens[i];
        let Some(tick) = tick else {
            done.push(token.clone());
            continue;
        };
        forward(&ctx, &tick.answer);
        match (succeeded, tick.answer.goal) {
            (true, Some(g)) => ok.push(resolved(token, g)),
            _ => done.push(token.clone()),
        }
    }
    if ok.is_empty() {
        return Ok(Continuation::Fail);
    }
    Ok(Term::compound(
        "$await_some",
        vec![Term::List(tokens), Term::List(ok), Term::List(done)],
    )
    .into())
}

/// `future_cancel(Promise)`: always succeeds, even for finished tasks.
fn future_cancel(ctx: &HostCtx, goal: &Term) -> HostResult {
    match promise_id(&arg(goal, 0), goal) {
        Ok(id) => {
            tasks(ctx)?.cancel(id);
            Ok(Continuation::True)
        }
        Err(thrown) => Ok(thrown),
    }
}

// ============================================================================
// Generators
// ============================================================================

/// Iterator state for `host_between/3`.
#[derive(Debug, Clone)]
struct Between {
    low: i64,
    high: i64,
    next: Option<i64>,
}

impl Between {
    fn new(low: i64, high: i64) -> Self {
        Self {
            low,
            high,
            next: (low <= high).then_some(low),
        }
    }
}

impl Iterator for Between {
    type Item = Term;

    fn next(&mut self) -> Option<Term> {
        let n = self.next?;
        self.next = n.checked_add(1).filter(|m| *m <= self.high);
        Some(Term::compound(
            "host_between",
            vec![Term::int(self.low), Term::int(self.high), Term::int(n)],
        ))
    }
}

/// `host_between(Low, High, X)`: one solution per integer, produced lazily.
fn host_between(_: HostCtx, goal: Term) -> stream::BoxStream<'static, HostResult> {
    let bounds = [arg(&goal, 0), arg(&goal, 1)];
    for bound in &bounds {
        if bound.as_i64().is_none() {
            let thrown = throw(type_error("integer", bound.clone(), context(&goal)));
            return stream::once(async move { Ok(thrown) }).boxed();
        }
    }
    let low = bounds[0].as_i64().unwrap_or_default();
    let high = bounds[1].as_i64().unwrap_or_default();
    stream::iter(Between::new(low, high).map(|t| Ok(Continuation::Goal(t)))).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_time_validation() {
        let goal = Term::compound("sleep", vec![Term::float(0.5)]);
        assert_eq!(wait_time(&goal, Duration::from_secs(1)), Ok(Duration::from_millis(500)));

        let goal = Term::compound("delay", vec![Term::atom("soon")]);
        assert_eq!(
            wait_time(&goal, Duration::from_millis(1)),
            Err(throw(type_error("number", Term::atom("soon"), pi_term("delay", 1))))
        );

        let goal = Term::compound("delay", vec![Term::int(-3)]);
        assert_eq!(
            wait_time(&goal, Duration::from_millis(1)),
            Err(throw(domain_error("not_less_than_zero", Term::int(-3), pi_term("delay", 1))))
        );
    }

    #[test]
    fn promise_tokens() {
        let goal = Term::compound("$await", vec![Term::atom("x")]);
        let ok = Term::compound("$promise", vec![Term::int(4), Term::atom("true")]);
        assert_eq!(promise_id(&ok, &goal), Ok(4));

        let err = promise_id(&Term::atom("x"), &goal).unwrap_err();
        assert_eq!(err, throw(type_error("promise", Term::atom("x"), pi_term("$await", 1))));

        let bad_id = Term::compound("$promise", vec![Term::atom("a"), Term::atom("true")]);
        assert!(promise_id(&bad_id, &goal).is_err());

        let solved = resolved(&ok, Term::compound("foo", vec![Term::int(1)]));
        assert_eq!(solved.to_string(), "'$promise'(4,foo(1))");
    }

    #[test]
    fn promise_lists() {
        let goal = Term::compound("$await_all", vec![Term::atom("nope")]);
        assert!(promise_ids(&Term::atom("nope"), &goal).is_err());

        let list = Term::List(vec![
            Term::compound("$promise", vec![Term::int(0), Term::atom("a")]),
            Term::compound("$promise", vec![Term::int(1), Term::atom("b")]),
        ]);
        let (tokens, ids) = promise_ids(&list, &goal).unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn between_state() {
        let xs: Vec<_> = Between::new(1, 3).map(|t| arg(&t, 2)).collect();
        assert_eq!(xs, vec![Term::int(1), Term::int(2), Term::int(3)]);
        assert_eq!(Between::new(2, 1).count(), 0);
        assert_eq!(Between::new(i64::MAX, i64::MAX).count(), 1);
    }

    #[test]
    fn library_contents() {
        let lib = library();
        let pis: Vec<_> = lib.iter().map(Predicate::pi).collect();
        assert!(pis.contains(&"future/2".to_string()));
        assert!(pis.contains(&"$await_some/3".to_string()));
        assert!(lib.iter().find(|p| p.name() == "future").unwrap().is_sync());
        assert!(!lib.iter().find(|p| p.name() == "sleep").unwrap().is_sync());
    }
}
