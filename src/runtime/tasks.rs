//! Background tasks and await combinators.
//!
//! A task wraps an independent query's answer stream. Each `tick` pulls one
//! answer; concurrent awaiters of the same task share a single in-flight
//! step instead of racing to pull separate answers. A task leaves the table
//! when its stream is exhausted or it is cancelled.

use super::toplevel::{Answer, Status};
use crate::error::TaskError;
use futures::future::{self, AbortHandle, BoxFuture, FutureExt, Shared};
use futures::stream::{BoxStream, FuturesUnordered, Stream, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::SystemTime;

pub type TaskId = u64;

/// One answer delivered by a task.
#[derive(Debug, Clone)]
pub struct Tick {
    pub task_id: TaskId,
    pub answer: Answer,
    pub time: SystemTime,
    /// Position of this answer in the task's sequence, from 0.
    pub depth: usize,
}

impl Tick {
    pub fn is_success(&self) -> bool {
        self.answer.status == Status::Success
    }
}

pub type TickFuture = Shared<BoxFuture<'static, Option<Tick>>>;

struct TaskEntry {
    /// Present while idle; moved into the step future while ticking.
    stream: Option<BoxStream<'static, Answer>>,
    ticking: Option<TickFuture>,
    /// Answer pulled by a combinator that didn't use it; the next tick
    /// hands it out before pulling again.
    held: Option<Tick>,
    abort: Option<AbortHandle>,
    depth: usize,
}

#[derive(Default)]
struct TaskMap {
    tasks: HashMap<TaskId, TaskEntry>,
    next_id: TaskId,
}

/// Outcome of [`TaskTable::await_one`]; indexes refer to the requested ids.
#[derive(Debug, Default)]
pub struct AwaitOne {
    pub winner: Option<(usize, Tick)>,
    pub dropped: Vec<usize>,
}

/// Outcome of [`TaskTable::await_all`].
#[derive(Debug)]
pub enum AwaitAll {
    /// Every task produced a successful answer, in request order.
    Ready(Vec<Tick>),
    /// Stopped at a failure or error answer, or an exhausted task (`None`).
    Stopped(Option<Tick>),
}

/// Outcome of [`TaskTable::await_some`]; indexes refer to the requested ids.
#[derive(Debug, Default)]
pub struct Partition {
    pub ok: Vec<(usize, Tick)>,
    pub done: Vec<(usize, Option<Tick>)>,
}

#[derive(Clone, Default)]
pub struct TaskTable {
    inner: Arc<Mutex<TaskMap>>,
}

fn lock(map: &Mutex<TaskMap>) -> MutexGuard<'_, TaskMap> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn step(map: Weak<Mutex<TaskMap>>, id: TaskId, mut stream: BoxStream<'static, Answer>) -> Option<Tick> {
    let next = stream.next().await;
    let map = map.upgrade()?;
    let mut tasks = lock(&map);
    match next {
        Some(answer) => {
            // cancelled while the step ran: the stream drops here
            let entry = tasks.tasks.get_mut(&id)?;
            let depth = entry.depth;
            entry.depth += 1;
            entry.stream = Some(stream);
            entry.ticking = None;
            entry.abort = None;
            Some(Tick {
                task_id: id,
                answer,
                time: SystemTime::now(),
                depth,
            })
        }
        None => {
            let removed = tasks.tasks.remove(&id);
            drop(tasks);
            drop(removed);
            log::trace!("task {id} exhausted");
            None
        }
    }
}

fn wins(tick: &Tick) -> bool {
    tick.answer.status != Status::Failure
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an answer stream as a task.
    pub fn spawn<S>(&self, answers: S) -> TaskId
    where
        S: Stream<Item = Answer> + Send + 'static,
    {
        let mut map = lock(&self.inner);
        let id = map.next_id;
        map.next_id += 1;
        map.tasks.insert(
            id,
            TaskEntry {
                stream: Some(answers.boxed()),
                ticking: None,
                held: None,
                abort: None,
                depth: 0,
            },
        );
        log::debug!("spawned task {id}");
        id
    }

    pub fn contains(&self, id: TaskId) -> bool {
        lock(&self.inner).tasks.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pull the next answer of a task, joining a step already in flight.
    ///
    /// Resolves to `None` once the task is exhausted or cancelled.
    pub fn tick(&self, id: TaskId) -> Result<TickFuture, TaskError> {
        let mut map = lock(&self.inner);
        let entry = map.tasks.get_mut(&id).ok_or(TaskError::Unknown(id))?;
        if let Some(ticking) = &entry.ticking {
            return Ok(ticking.clone());
        }
        if let Some(held) = entry.held.take() {
            return Ok(future::ready(Some(held)).boxed().shared());
        }
        let Some(stream) = entry.stream.take() else {
            return Err(TaskError::Unknown(id));
        };
        let (fut, abort) = future::abortable(step(Arc::downgrade(&self.inner), id, stream));
        let shared = fut.map(|r| r.ok().flatten()).boxed().shared();
        entry.ticking = Some(shared.clone());
        entry.abort = Some(abort);
        Ok(shared)
    }

    /// Cancel a task: abort its in-flight step, or abandon its query if idle.
    ///
    /// Returns `false` for unknown ids.
    pub fn cancel(&self, id: TaskId) -> bool {
        let entry = lock(&self.inner).tasks.remove(&id);
        match entry {
            Some(entry) => {
                if let Some(abort) = &entry.abort {
                    abort.abort();
                }
                log::debug!("cancelled task {id}");
                drop(entry);
                true
            }
            None => false,
        }
    }

    /// First successful (or erroring) answer among `ids`.
    ///
    /// Failures and exhausted tasks never win; every one that has finished
    /// by the time a winner is picked is reported in `dropped`, whatever its
    /// position. Other ready answers are held for their task's next tick.
    /// Unknown ids are rejected up front.
    ///
    /// The returned future refers to the table weakly.
    pub fn await_one(&self, ids: &[TaskId]) -> impl Future<Output = Result<AwaitOne, TaskError>> + Send + 'static {
        let ticks = ids.iter().map(|id| self.tick(*id)).collect::<Result<Vec<_>, _>>();
        let map = Arc::downgrade(&self.inner);
        async move {
            let mut pending: FuturesUnordered<_> = ticks?
                .into_iter()
                .enumerate()
                .map(|(i, tick)| async move { (i, tick.await) })
                .collect();
            let mut out = AwaitOne::default();
            while let Some((i, tick)) = pending.next().await {
                match tick {
                    Some(t) if wins(&t) => {
                        out.winner = Some((i, t));
                        break;
                    }
                    _ => out.dropped.push(i),
                }
            }
            if out.winner.is_none() {
                return Ok(out);
            }
            // settle everything that is already finished
            while let Some(Some((i, tick))) = pending.next().now_or_never() {
                match tick {
                    Some(t) if wins(&t) => hold(&map, t),
                    _ => out.dropped.push(i),
                }
            }
            out.dropped.sort_unstable();
            Ok(out)
        }
    }

    /// One answer from every task, stopping at the first that isn't a success.
    pub fn await_all(&self, ids: &[TaskId]) -> impl Future<Output = AwaitAll> + Send + 'static {
        let ticks: Option<Vec<_>> = ids.iter().map(|id| self.tick(*id).ok()).collect();
        async move {
            let Some(ticks) = ticks else {
                return AwaitAll::Stopped(None);
            };
            let all = future::try_join_all(ticks.into_iter().map(|tick| async move {
                match tick.await {
                    Some(t) if t.is_success() => Ok(t),
                    other => Err(other),
                }
            }))
            .await;
            match all {
                Ok(ticks) => AwaitAll::Ready(ticks),
                Err(stopped) => AwaitAll::Stopped(stopped),
            }
        }
    }

    /// One answer from every task, partitioned into successes and the rest.
    pub fn await_some(&self, ids: &[TaskId]) -> impl Future<Output = Partition> + Send + 'static {
        let ticks: Vec<_> = ids.iter().map(|id| self.tick(*id).ok()).collect();
        async move {
            let pending = ticks.into_iter().map(|tick| async move {
                match tick {
                    Some(t) => t.await,
                    None => None,
                }
            });
            let results = future::join_all(pending).await;
            let mut out = Partition::default();
            for (i, result) in results.into_iter().enumerate() {
                match result {
                    Some(t) if t.is_success() => out.ok.push((i, t)),
                    other => out.done.push((i, other)),
                }
            }
            out
        }
    }
}

/// Keep an unused answer for the task's next tick.
fn hold(map: &Weak<Mutex<TaskMap>>, tick: Tick) {
    let Some(map) = map.upgrade() else {
        return;
    };
    let mut tasks = lock(&map);
    if let Some(entry) = tasks.tasks.get_mut(&tick.task_id) {
        entry.held = Some(tick);
    }
}
