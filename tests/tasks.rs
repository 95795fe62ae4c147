//! Background tasks started with `future/2` and the await combinators, run
//! end to end through the scripted engine.

mod common;

use common::{answer, call, print, solved, task_goal, MockEngine, Step};
use futures::StreamExt;
use plhost::runtime::Status;
use plhost::{Continuation, Predicate, QueryOptions, Term};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn t(n: i64) -> Term {
    Term::compound("t", vec![Term::int(n)])
}

fn promise(id: i64, goal: Term) -> Term {
    Term::compound("$promise", vec![Term::int(id), goal])
}

fn future(goal: Term) -> Step {
    let promise = Term::var("P").expect("valid variable");
    call(Term::compound("future", vec![goal, promise]), |_| Vec::new())
}

/// Main query that awaits `goal` and binds `R` to the reply text.
fn reply_as_answer(goal: Term) -> Step {
    call(goal, |reply| vec![answer(json!({ "R": reply }))])
}

fn script_tasks(mock: &MockEngine) {
    for n in 1..=3 {
        mock.script(&task_goal(t(n)), move || {
            vec![solved(json!({ "functor": "t", "args": [n] }))]
        });
    }
}

#[tokio::test]
async fn test_await_all_returns_solutions_in_task_order() {
    let mock = MockEngine::new();
    script_tasks(&mock);
    mock.script("main", || {
        let tokens = Term::List((0..3).map(|i| promise(i, t(i + 1))).collect());
        vec![
            future(t(1)),
            future(t(2)),
            future(t(3)),
            reply_as_answer(Term::compound("$await_all", vec![tokens])),
        ]
    });
    let pl = mock.prolog();

    let answer = pl.query_once("main", QueryOptions::default()).await.expect("answer");
    assert_eq!(
        answer.get("R"),
        Some(&Term::string(
            "'$await_all'(['$promise'(0,t(1)),'$promise'(1,t(2)),'$promise'(2,t(3))])"
        ))
    );
    assert!(mock.goals().contains(&task_goal(t(2))));
    // each task stays registered, idle after its first answer
    assert_eq!(pl.tasks().len(), 3);
}

#[tokio::test]
async fn test_future_reply_carries_a_promise() {
    let mock = MockEngine::new();
    mock.script("start", || {
        let promise = Term::var("P").expect("var");
        vec![reply_as_answer(Term::compound("future", vec![t(1), promise]))]
    });
    let pl = mock.prolog();

    let answer = pl.query_once("start", QueryOptions::default()).await.expect("answer");
    assert_eq!(
        answer.get("R"),
        Some(&Term::string("future(t(1),'$promise'(0,t(1)))"))
    );
    // nothing awaited the task, so its query never started
    assert_eq!(pl.tasks().len(), 1);
    assert!(!mock.goals().contains(&task_goal(t(1))));
}

#[tokio::test]
async fn test_await_any_picks_first_success() {
    let mock = MockEngine::new();
    mock.script(&task_goal(Term::atom("slow")), || {
        vec![call(Term::compound("sleep", vec![Term::int(3600)]), |_| {
            vec![solved(json!({ "functor": "slow" }))]
        })]
    });
    mock.script(&task_goal(Term::atom("fast")), || vec![solved(json!({ "functor": "fast" }))]);
    mock.script("race", || {
        let tokens = Term::List(vec![promise(0, Term::atom("slow")), promise(1, Term::atom("fast"))]);
        let winner = Term::var("W").expect("var");
        let rest = Term::var("Rest").expect("var");
        vec![
            future(Term::atom("slow")),
            future(Term::atom("fast")),
            reply_as_answer(Term::compound("await_any", vec![tokens, winner, rest])),
        ]
    });
    let pl = mock.prolog();

    let answer = pl.query_once("race", QueryOptions::default()).await.expect("answer");
    assert_eq!(
        answer.get("R"),
        Some(&Term::string(
            "await_any(['$promise'(0,slow),'$promise'(1,fast)],'$promise'(1,fast),['$promise'(0,slow)])"
        ))
    );

    // the loser is still parked in its sleep until cancelled
    assert_eq!(pl.pending_thunks(), 1);
    assert!(pl.tasks().cancel(0));
    assert_eq!(pl.pending_thunks(), 0);
    // the winner's query is idle between answers
    assert!(pl.tasks().cancel(1));
    assert_eq!(mock.live(), 0);
    assert!(mock.violations().is_empty(), "{:?}", mock.violations());
}

#[tokio::test]
async fn test_await_rethrows_task_errors() {
    let mock = MockEngine::new();
    mock.script(&task_goal(Term::atom("bad")), || vec![Step::Error(json!({ "functor": "oops" }))]);
    mock.script("main", || {
        vec![
            future(Term::atom("bad")),
            reply_as_answer(Term::compound("$await", vec![promise(0, Term::atom("bad"))])),
        ]
    });
    let pl = mock.prolog();

    let answer = pl.query_once("main", QueryOptions::default()).await.expect("answer");
    assert_eq!(answer.get("R"), Some(&Term::string("throw(oops)")));
}

#[tokio::test]
async fn test_await_on_finished_task_fails() {
    let mock = MockEngine::new();
    script_tasks(&mock);
    mock.script("twice", || {
        let token = promise(0, t(1));
        vec![
            future(t(1)),
            call(Term::compound("$await", vec![token.clone()]), |_| Vec::new()),
            call(Term::compound("$await", vec![token]), |_| vec![answer(json!({}))]),
        ]
    });
    let pl = mock.prolog();

    let answers: Vec<_> = pl
        .query("twice", QueryOptions::default())
        .map(|a| a.expect("answer"))
        .collect()
        .await;
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].status, Status::Failure);
    assert!(pl.tasks().is_empty());
}

#[tokio::test]
async fn test_await_some_partitions_results() {
    let mock = MockEngine::new();
    script_tasks(&mock);
    mock.script(&task_goal(Term::atom("no")), || vec![Step::Fail]);
    mock.script("some", || {
        let tokens = Term::List(vec![promise(0, t(1)), promise(1, Term::atom("no"))]);
        let ok = Term::var("Ok").expect("var");
        let done = Term::var("Done").expect("var");
        vec![
            future(t(1)),
            future(Term::atom("no")),
            reply_as_answer(Term::compound("$await_some", vec![tokens, ok, done])),
        ]
    });
    let pl = mock.prolog();

    let answer = pl.query_once("some", QueryOptions::default()).await.expect("answer");
    assert_eq!(
        answer.get("R"),
        Some(&Term::string(
            "'$await_some'(['$promise'(0,t(1)),'$promise'(1,no)],['$promise'(0,t(1))],['$promise'(1,no)])"
        ))
    );
}

#[tokio::test]
async fn test_cancelling_a_running_task_releases_its_query() {
    let mock = MockEngine::new();
    mock.script("slow", || {
        vec![call(Term::compound("sleep", vec![Term::int(3600)]), |_| vec![answer(json!({}))])]
    });
    let pl = mock.prolog();
    pl.init().await.expect("init");

    let id = pl.tasks().spawn(pl.query("slow", QueryOptions::default()).map(|a| a.expect("answer")));
    let mut tick = pl.tasks().tick(id).expect("known task");
    assert!(futures::poll!(&mut tick).is_pending());
    assert_eq!(pl.pending_thunks(), 1);

    assert!(pl.tasks().cancel(id));
    assert!(tick.await.is_none());
    assert_eq!(pl.pending_thunks(), 0);
    assert_eq!(pl.live_queries(), 0);
    assert_eq!(mock.live(), 0);
}

#[tokio::test]
async fn test_await_any_drops_failed_tasks_from_rest() {
    let mock = MockEngine::new();
    script_tasks(&mock);
    mock.script(&task_goal(Term::atom("no")), || vec![Step::Fail]);
    mock.script("any", || {
        let tokens = Term::List(vec![promise(0, Term::atom("no")), promise(1, t(1))]);
        let winner = Term::var("W").expect("var");
        let rest = Term::var("Rest").expect("var");
        vec![
            future(Term::atom("no")),
            future(t(1)),
            reply_as_answer(Term::compound("await_any", vec![tokens, winner, rest])),
        ]
    });
    let pl = mock.prolog();

    let answer = pl.query_once("any", QueryOptions::default()).await.expect("answer");
    assert_eq!(
        answer.get("R"),
        Some(&Term::string(
            "await_any(['$promise'(0,no),'$promise'(1,t(1))],'$promise'(1,t(1)),[])"
        ))
    );
}

#[tokio::test]
async fn test_await_any_success_first_still_drops_ready_failures() {
    let mock = MockEngine::new();
    script_tasks(&mock);
    mock.script(&task_goal(Term::atom("no")), || vec![Step::Fail]);
    mock.script("any", || {
        let tokens = Term::List(vec![promise(0, t(1)), promise(1, Term::atom("no"))]);
        let winner = Term::var("W").expect("var");
        let rest = Term::var("Rest").expect("var");
        vec![
            future(t(1)),
            future(Term::atom("no")),
            reply_as_answer(Term::compound("await_any", vec![tokens, winner, rest])),
        ]
    });
    let pl = mock.prolog();

    let answer = pl.query_once("any", QueryOptions::default()).await.expect("answer");
    assert_eq!(
        answer.get("R"),
        Some(&Term::string(
            "await_any(['$promise'(0,t(1)),'$promise'(1,no)],'$promise'(0,t(1)),[])"
        ))
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_task_never_resumes_in_the_engine() {
    let mock = MockEngine::new();
    mock.script(&task_goal(Term::atom("slow")), || {
        vec![call(Term::compound("sleep", vec![Term::int(1)]), |_| {
            vec![print("woke"), solved(json!({ "functor": "slow" }))]
        })]
    });
    mock.script("main", || {
        vec![
            future(Term::atom("slow")),
            call(
                Term::compound("$await", vec![promise(0, Term::atom("slow"))]),
                |_| vec![answer(json!({}))],
            ),
        ]
    });
    let pl = mock.prolog();

    let mut main = Box::pin(pl.query_once("main", QueryOptions::default()));
    assert!(futures::poll!(&mut main).is_pending());
    // the main query's await and the task's sleep
    assert_eq!(pl.pending_thunks(), 2);

    assert!(pl.tasks().cancel(0));
    tokio::time::sleep(Duration::from_secs(2)).await;
    let answer = main.await.expect("answer");

    assert_eq!(answer.status, Status::Failure);
    assert!(!mock.trace().iter().any(|line| line == "woke"));
    assert_eq!(pl.pending_thunks(), 0);
    assert_eq!(mock.live(), 0);
    assert!(mock.violations().is_empty(), "{:?}", mock.violations());
}

/// Sets its flag when dropped.
struct Released(Arc<AtomicBool>);

impl Drop for Released {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_dropping_the_interpreter_releases_a_parked_task() {
    let mock = MockEngine::new();
    mock.script(&task_goal(Term::atom("hang")), || {
        vec![call(Term::atom("hang"), |_| vec![solved(json!({ "functor": "hang" }))])]
    });
    mock.script("main", || vec![future(Term::atom("hang")), answer(json!({}))]);
    let pl = mock.prolog();

    let released = Arc::new(AtomicBool::new(false));
    let flag = released.clone();
    pl.register(Predicate::future("hang", 0, move |ctx, _| {
        let guard = Released(flag.clone());
        async move {
            let _held = (ctx, guard);
            futures::future::pending::<()>().await;
            Ok(Continuation::True)
        }
    }))
    .await
    .expect("register");

    let answer = pl.query_once("main", QueryOptions::default()).await.expect("answer");
    assert!(answer.is_success());
    assert_eq!(pl.tasks().len(), 1);

    // start the task's first step; it parks on hang/0 for good
    let mut tick = Box::pin(pl.tasks().tick(0).expect("task"));
    assert!(futures::poll!(&mut tick).is_pending());
    assert!(!released.load(Ordering::SeqCst));

    drop(tick);
    drop(pl);
    assert!(released.load(Ordering::SeqCst), "parked call kept the interpreter alive");
}
