//! Subquery controller.
//!
//! A [`Query`] is a lazy stream over the answers of one engine subquery.
//! Nothing touches the engine until it is first polled. Each poll runs the
//! engine until it produces a result, suspending only to advance a parked
//! host continuation or to give the executor a turn after a spontaneous
//! (autoyield) suspension of the engine.
//!
//! Dropping a query at any point finalizes its subquery. If the engine is
//! busy at that moment (the query was dropped from inside a host call), the
//! handle is queued and released on the next engine access.

use super::ctrl::QueryId;
use super::host::Bridge;
use super::toplevel::{Bindings, Toplevel};
use super::{Prolog, Shared};
use crate::error::{Error, ProtocolError};
use crate::guest::{alloc_cell, free_cell, indirect, Guest, GuestString, SubqueryHandle};
use crate::term::DecodeOptions;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Per-query settings.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Variables bound before the goal runs.
    pub bind: Bindings,
    /// Program text consulted before the query starts.
    pub program: Option<String>,
    /// Decoding policy for structured answers.
    pub encode: DecodeOptions,
    /// Interval after which the engine suspends itself so other work can
    /// run. `None` uses the interpreter default; zero disables it.
    pub autoyield: Option<Duration>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, var: impl Into<String>, value: impl Into<crate::term::Term>) -> Self {
        self.bind.insert(var.into(), value.into());
        self
    }

    pub fn program(mut self, text: impl Into<String>) -> Self {
        self.program = Some(text.into());
        self
    }

    pub fn encode(mut self, encode: DecodeOptions) -> Self {
        self.encode = encode;
        self
    }

    pub fn autoyield(mut self, interval: Duration) -> Self {
        self.autoyield = Some(interval);
        self
    }
}

/// Lazy stream of answers. Engine errors end the stream after being yielded.
pub struct Query<O> {
    id: QueryId,
    inner: BoxStream<'static, Result<O, Error>>,
}

impl<O> Query<O> {
    pub fn id(&self) -> QueryId {
        self.id
    }
}

impl<O> Stream for Query<O> {
    type Item = Result<O, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl<O> std::fmt::Debug for Query<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query").field("id", &self.id).finish()
    }
}

/// Which stage the driver is in between polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Fresh,
    /// An answer was delivered; the next poll redoes.
    Delivered,
    /// An answer was delivered and no redo may follow.
    Last,
    Finished,
}

struct Driver<T: Toplevel> {
    shared: Weak<Shared>,
    /// Strong reference for queries owned by callers; background tasks
    /// hold only the weak one so they don't keep the interpreter alive.
    _keep: Option<Prolog>,
    id: QueryId,
    toplevel: T,
    goal: String,
    options: QueryOptions,
    /// Registration queries run before the library is loaded.
    internal: bool,
    stage: Stage,
    handle: Option<SubqueryHandle>,
    alive: bool,
    ok: bool,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    last_yield: Instant,
}

pub(crate) struct Launch<T> {
    pub goal: String,
    pub options: QueryOptions,
    pub toplevel: T,
    pub internal: bool,
    pub detached: bool,
}

pub(crate) fn spawn<T: Toplevel>(prolog: &Prolog, launch: Launch<T>) -> Query<T::Output> {
    let id = prolog.next_query_id();
    let goal = launch.goal.replace(['\n', '\t'], " ");
    let driver = Driver {
        shared: Arc::downgrade(prolog.shared()),
        _keep: if launch.detached { None } else { Some(prolog.clone()) },
        id,
        toplevel: launch.toplevel,
        goal,
        options: launch.options,
        internal: launch.internal,
        stage: Stage::Fresh,
        handle: None,
        alive: false,
        ok: false,
        stdout: Vec::new(),
        stderr: Vec::new(),
        last_yield: Instant::now(),
    };
    let inner = stream::unfold(driver, |mut driver| async move {
        let item = driver.next().await?;
        Some((item, driver))
    })
    .boxed();
    Query { id, inner }
}

impl<T: Toplevel> Driver<T> {
    fn prolog(&self) -> Result<Prolog, Error> {
        self.shared
            .upgrade()
            .map(Prolog::from_shared)
            .ok_or_else(|| ProtocolError::Finalized.into())
    }

    async fn next(&mut self) -> Option<Result<T::Output, Error>> {
        if self.stage == Stage::Finished {
            return None;
        }
        match self.step().await {
            Ok(Some(out)) => Some(Ok(out)),
            Ok(None) => {
                self.finish();
                None
            }
            Err(e) => {
                log::debug!("{} aborted: {e}", self.id);
                self.finish();
                Some(Err(e))
            }
        }
    }

    async fn step(&mut self) -> Result<Option<T::Output>, Error> {
        match self.stage {
            Stage::Fresh => {
                let prolog = self.prolog()?;
                self.start(&prolog).await?;
            }
            Stage::Delivered => {
                let prolog = self.prolog()?;
                if !self.redo(&prolog)? {
                    return Ok(None);
                }
            }
            Stage::Last | Stage::Finished => return Ok(None),
        }

        loop {
            let prolog = self.prolog()?;
            self.read_output(&prolog);
            if let Some(handle) = self.handle {
                if prolog.with_guest_for(self.id, |g| Ok(g.did_yield(handle)?))? {
                    let bridge = prolog.bridge().clone();
                    let interval = self.autoyield(&prolog);
                    // a parked host call may never finish; only the weak
                    // reference is held while it runs
                    drop(prolog);
                    self.suspended(&bridge, interval, handle).await?;
                    let prolog = self.prolog()?;
                    if !self.redo(&prolog)? {
                        return Ok(None);
                    }
                    continue;
                }
            }
            return self.frame(&prolog);
        }
    }

    async fn start(&mut self, prolog: &Prolog) -> Result<(), Error> {
        if !self.internal {
            prolog.init().await?;
        }
        if let Some(program) = self.options.program.take() {
            prolog.consult_text(&program).await?;
        }
        let text = self.toplevel.query(&self.goal, &self.options.bind)?;
        let autoyield = self.autoyield(prolog).as_millis().min(u32::MAX as u128) as u32;
        log::debug!("{} issuing {text}", self.id);

        let id = self.id;
        let bridge = prolog.bridge().clone();
        self.last_yield = Instant::now();
        let (issued, handle) = prolog.with_guest_for(id, |g| {
            let slot = alloc_cell(&mut *g)?;
            bridge.spawn(id, slot);
            let issued = issue(&mut *g, &text, slot, autoyield);
            let handle = indirect(&mut *g, slot).ok().and_then(SubqueryHandle::from_raw);
            bridge.resolve(id, handle);
            free_cell(g, slot)?;
            Ok((issued, handle))
        })?;
        self.handle = handle;
        self.alive = handle.is_some();
        self.stage = Stage::Delivered;
        self.ok = issued?;
        if handle.is_none() {
            return Err(ProtocolError::UnresolvedHandle.into());
        }
        Ok(())
    }

    fn autoyield(&self, prolog: &Prolog) -> Duration {
        self.options.autoyield.unwrap_or(prolog.options().autoyield)
    }

    /// The engine suspended: advance the parked host call, or let the
    /// executor run something else if the engine yielded on its own.
    async fn suspended(&mut self, bridge: &Bridge, interval: Duration, handle: SubqueryHandle) -> Result<(), Error> {
        if bridge.advance(handle).await {
            let prolog = self.prolog()?;
            self.read_output(&prolog);
            self.last_yield = Instant::now();
            return Ok(());
        }
        if !interval.is_zero() && self.last_yield.elapsed() > interval {
            log::trace!("{} spontaneous yield", self.id);
            self.last_yield = Instant::now();
            tokio::task::yield_now().await;
            let prolog = self.prolog()?;
            let ms = interval.as_millis().min(u32::MAX as u128) as u32;
            prolog.with_guest_for(self.id, |g| Ok(g.yield_at(handle, ms)?))?;
            self.read_output(&prolog);
        }
        Ok(())
    }

    fn redo(&mut self, prolog: &Prolog) -> Result<bool, Error> {
        let Some(handle) = self.handle.filter(|_| self.alive) else {
            self.alive = false;
            return Ok(false);
        };
        self.alive = prolog.with_guest_for(self.id, |g| Ok(g.redo(handle)?))?;
        Ok(self.alive)
    }

    /// Turn the engine's current result into a caller-visible value.
    fn frame(&mut self, prolog: &Prolog) -> Result<Option<T::Output>, Error> {
        let structured = self.toplevel.structured();
        let (status, errored) = prolog.with_guest_for(self.id, |g| {
            let status = g.status()?;
            let errored = if structured { false } else { g.error()? };
            Ok((status, errored))
        })?;
        let stdout = std::mem::take(&mut self.stdout);
        let stderr = std::mem::take(&mut self.stderr);
        let queued = prolog.bridge().pop_answer(self.id);

        let empty = if structured { queued.is_none() } else { stdout.is_empty() };
        let out = if empty {
            match self.toplevel.truth(status, &stderr) {
                Some(out) => out,
                None => return Ok(None),
            }
        } else {
            self.toplevel.parse(status, &stdout, &stderr, queued.as_deref())?
        };

        if errored {
            self.alive = false;
            self.stage = Stage::Last;
        } else if !self.ok {
            self.stage = Stage::Last;
        } else {
            self.stage = Stage::Delivered;
        }
        Ok(Some(out))
    }

    /// Collect what engine calls and host procedures wrote for this query.
    fn read_output(&mut self, prolog: &Prolog) {
        let (stdout, stderr) = prolog.bridge().take_output(self.id);
        self.stdout.extend(stdout);
        self.stderr.extend(stderr);
    }

    fn finish(&mut self) {
        if self.stage == Stage::Finished {
            return;
        }
        self.stage = Stage::Finished;
        let handle = self.handle;
        let alive = std::mem::replace(&mut self.alive, false);
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let prolog = Prolog::from_shared(shared);
        if let (true, Some(handle)) = (alive, handle) {
            prolog.finalize(handle);
        }
        prolog.bridge().forget(self.id, handle);
        log::debug!("{} finalized", self.id);
    }
}

impl<T: Toplevel> Drop for Driver<T> {
    fn drop(&mut self) {
        self.finish();
    }
}

fn issue(g: &mut dyn Guest, text: &str, slot: u32, autoyield_ms: u32) -> Result<bool, Error> {
    let goal = GuestString::alloc(&mut *g, text)?;
    let ok = g.query(goal.ptr(), slot, autoyield_ms);
    goal.free(g)?;
    Ok(ok?)
}
