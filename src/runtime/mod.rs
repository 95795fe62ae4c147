//! Interpreter Runtime
//!
//! [`Prolog`] owns one engine instance and everything that multiplexes it:
//! the host-call bridge, the background task table and the staging
//! filesystem. Handles are cheap to clone and share the same instance.
//!
//! The engine is single-threaded. Every engine call goes through
//! [`Prolog::with_guest`], which serializes access and refuses re-entrant
//! calls from host code already running inside the engine.

mod ctrl;
mod host;
pub mod library;
mod query;
pub mod tasks;
pub mod toplevel;

pub use ctrl::QueryId;
pub use host::{default_error_handler, Continuation, ErrorHandler, HostCtx, HostResult, Predicate, Procedure};
pub use query::{Query, QueryOptions};
pub use tasks::{TaskId, TaskTable, Tick};
pub use toplevel::{Answer, Bindings, Json, PrologText, Status, Toplevel};

use crate::error::{Error, ProtocolError};
use crate::guest::wasi::WasiConfig;
use crate::guest::wasm::WasmGuest;
use crate::guest::{Console, Guest, GuestString, SubqueryHandle};
use crate::term::Term;
use crate::vfs::MemoryFs;
use futures::StreamExt;
use host::Bridge;
use query::Launch;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::time::Duration;
use tokio::sync::OnceCell;

// ============================================================================
// Options
// ============================================================================

/// Interpreter-wide settings.
#[derive(Clone)]
pub struct PrologOptions {
    /// Default autoyield interval for queries.
    pub autoyield: Duration,
    /// Module the built-in library shims are loaded into.
    pub module: String,
    /// Staging directory for `consult_text`.
    pub scratch_dir: String,
    pub on_error: ErrorHandler,
    /// Register the built-in host library on first use.
    pub library: bool,
    /// Staging filesystem; a fresh one when `None`.
    pub fs: Option<MemoryFs>,
    /// Directory the engine searches for `use_module(library(...))`.
    pub library_dir: Option<String>,
    /// Environment variables visible to the engine.
    pub env: BTreeMap<String, String>,
    /// Suppress the engine's own warnings.
    pub quiet: bool,
}

impl Default for PrologOptions {
    fn default() -> Self {
        Self {
            autoyield: Duration::from_millis(20),
            module: "user".to_string(),
            scratch_dir: "/tmp".to_string(),
            on_error: default_error_handler(),
            library: true,
            fs: None,
            library_dir: None,
            env: BTreeMap::new(),
            quiet: false,
        }
    }
}

impl PrologOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn autoyield(mut self, interval: Duration) -> Self {
        self.autoyield = interval;
        self
    }

    pub fn module(mut self, module: impl Into<String>) -> Self {
        self.module = module.into();
        self
    }

    pub fn scratch_dir(mut self, dir: impl Into<String>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn on_error(mut self, handler: ErrorHandler) -> Self {
        self.on_error = handler;
        self
    }

    pub fn library(mut self, yes: bool) -> Self {
        self.library = yes;
        self
    }

    pub fn fs(mut self, fs: MemoryFs) -> Self {
        self.fs = Some(fs);
        self
    }

    pub fn library_dir(mut self, dir: impl Into<String>) -> Self {
        self.library_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn quiet(mut self, yes: bool) -> Self {
        self.quiet = yes;
        self
    }

    /// Command line the engine is started with.
    pub fn guest_args(&self) -> Vec<String> {
        let mut args = vec!["tpl".to_string(), "--ns".to_string()];
        if let Some(dir) = &self.library_dir {
            args.push("--library".to_string());
            args.push(dir.clone());
        }
        if self.quiet {
            args.push("-q".to_string());
        }
        args
    }
}

impl std::fmt::Debug for PrologOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrologOptions")
            .field("autoyield", &self.autoyield)
            .field("module", &self.module)
            .field("scratch_dir", &self.scratch_dir)
            .field("library", &self.library)
            .field("library_dir", &self.library_dir)
            .field("env", &self.env)
            .field("quiet", &self.quiet)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Interpreter
// ============================================================================

thread_local! {
    static IN_GUEST: Cell<bool> = const { Cell::new(false) };
}

/// Whether this thread is inside an engine call.
pub(crate) fn in_guest() -> bool {
    IN_GUEST.with(Cell::get)
}

/// Marks the current thread as inside an engine call until dropped.
struct Entered;

impl Entered {
    fn enter() -> Self {
        IN_GUEST.with(|c| c.set(true));
        Entered
    }
}

impl Drop for Entered {
    fn drop(&mut self) {
        IN_GUEST.with(|c| c.set(false));
    }
}

pub(crate) struct Shared {
    guest: Mutex<Box<dyn Guest>>,
    console: Console,
    bridge: Arc<Bridge>,
    tasks: TaskTable,
    fs: MemoryFs,
    options: PrologOptions,
    next_query: AtomicU64,
    scratch: AtomicU64,
    /// Subqueries dropped while the engine was busy.
    orphans: Mutex<Vec<SubqueryHandle>>,
    ready: OnceCell<()>,
}

/// A logic interpreter backed by one engine instance.
#[derive(Clone)]
pub struct Prolog {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Prolog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prolog")
            .field("options", &self.shared.options)
            .field("live_queries", &self.live_queries())
            .finish()
    }
}

impl Prolog {
    /// Wrap an engine instance. Host imports are attached here.
    pub fn new(mut guest: Box<dyn Guest>, options: PrologOptions) -> Result<Self, Error> {
        let fs = options.fs.clone().unwrap_or_default();
        fs.create_dir_all(&options.scratch_dir)?;
        let console = guest.console().clone();
        let shared = Arc::new_cyclic(|weak| {
            let bridge = Arc::new(Bridge::new(weak.clone(), options.on_error.clone()));
            guest.attach(bridge.clone());
            Shared {
                guest: Mutex::new(guest),
                console,
                bridge,
                tasks: TaskTable::new(),
                fs,
                options,
                next_query: AtomicU64::new(0),
                scratch: AtomicU64::new(0),
                orphans: Mutex::new(Vec::new()),
                ready: OnceCell::new(),
            }
        });
        Ok(Self { shared })
    }

    /// New instance of the process-wide engine module
    /// (see [`crate::guest::wasm::load`]).
    ///
    /// The engine sees the staging filesystem preopened at `/`, so files
    /// written through [`Prolog::fs`] are visible to `consult/1`.
    pub fn instantiate(mut options: PrologOptions) -> Result<Self, Error> {
        let fs = options.fs.get_or_insert_with(MemoryFs::new).clone();
        let mut wasi = WasiConfig::new(fs).args(options.guest_args());
        wasi.env = options.env.clone();
        let guest = WasmGuest::instantiate(wasi)?;
        Self::new(Box::new(guest), options)
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn bridge(&self) -> &Arc<Bridge> {
        &self.shared.bridge
    }

    pub(crate) fn console(&self) -> &Console {
        &self.shared.console
    }

    pub(crate) fn next_query_id(&self) -> QueryId {
        QueryId(self.shared.next_query.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn options(&self) -> &PrologOptions {
        &self.shared.options
    }

    /// Staging filesystem used by `consult_text`.
    pub fn fs(&self) -> &MemoryFs {
        &self.shared.fs
    }

    pub fn tasks(&self) -> &TaskTable {
        &self.shared.tasks
    }

    /// Queries started and not yet finalized.
    pub fn live_queries(&self) -> usize {
        self.shared.bridge.live_queries()
    }

    /// Host continuations parked on a suspended subquery.
    pub fn pending_thunks(&self) -> usize {
        self.shared.bridge.pending_thunks()
    }

    pub fn is_registered(&self, name: &str, arity: usize) -> bool {
        self.shared.bridge.is_registered(name, arity)
    }

    /// Run `f` with exclusive access to the engine.
    ///
    /// Fails with [`ProtocolError::Reentrant`] when called from code that is
    /// itself running inside an engine call on this thread.
    pub(crate) fn with_guest<R>(&self, f: impl FnOnce(&mut dyn Guest) -> Result<R, Error>) -> Result<R, Error> {
        if in_guest() {
            return Err(ProtocolError::Reentrant.into());
        }
        let mut guest = self.shared.guest.lock().unwrap_or_else(PoisonError::into_inner);
        let _entered = Entered::enter();
        self.reap(&mut **guest);
        f(&mut **guest)
    }

    /// Engine call on behalf of query `id`. Console output produced during
    /// the call is moved into that query's sinks before the engine is
    /// released.
    pub(crate) fn with_guest_for<R>(
        &self,
        id: QueryId,
        f: impl FnOnce(&mut dyn Guest) -> Result<R, Error>,
    ) -> Result<R, Error> {
        self.with_guest(|g| {
            let out = f(g);
            self.shared.bridge.capture(id, &self.shared.console);
            out
        })
    }

    fn reap(&self, guest: &mut dyn Guest) {
        let orphans = std::mem::take(&mut *self.shared.orphans.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in orphans {
            log::debug!("reaping orphaned subquery {:#x}", handle.raw());
            if let Err(e) = guest.done(handle) {
                log::warn!("pl_done({:#x}): {e}", handle.raw());
            }
        }
    }

    /// Release an engine subquery now, or on the next engine access if the
    /// engine is busy.
    pub(crate) fn finalize(&self, handle: SubqueryHandle) {
        let busy = in_guest();
        let guest = if busy {
            None
        } else {
            match self.shared.guest.try_lock() {
                Ok(guest) => Some(guest),
                Err(TryLockError::Poisoned(p)) => Some(p.into_inner()),
                Err(TryLockError::WouldBlock) => None,
            }
        };
        match guest {
            Some(mut guest) => {
                let _entered = Entered::enter();
                self.reap(&mut **guest);
                if let Err(e) = guest.done(handle) {
                    log::warn!("pl_done({:#x}): {e}", handle.raw());
                }
            }
            None => {
                log::trace!("engine busy, deferring release of {:#x}", handle.raw());
                self.shared
                    .orphans
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(handle);
            }
        }
    }

    /// Register the built-in library. Runs once; later calls are no-ops.
    pub async fn init(&self) -> Result<(), Error> {
        self.shared
            .ready
            .get_or_try_init(|| async {
                if self.shared.options.library {
                    let module = self.shared.options.module.clone();
                    self.load_predicates(library::library(), &module).await?;
                }
                Ok::<(), Error>(())
            })
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Run a goal, yielding structured answers.
    pub fn query(&self, goal: &str, options: QueryOptions) -> Query<Answer> {
        let toplevel = Json::new(options.encode.clone());
        self.query_with(goal, options, toplevel)
    }

    /// Run a goal with a custom answer framing.
    pub fn query_with<T: Toplevel>(&self, goal: &str, options: QueryOptions, toplevel: T) -> Query<T::Output> {
        query::spawn(
            self,
            Launch {
                goal: goal.to_string(),
                options,
                toplevel,
                internal: false,
                detached: false,
            },
        )
    }

    /// Query whose driver doesn't keep this interpreter alive.
    pub(crate) fn query_detached(&self, goal: &str, options: QueryOptions) -> Query<Answer> {
        let toplevel = Json::new(options.encode.clone());
        query::spawn(
            self,
            Launch {
                goal: goal.to_string(),
                options,
                toplevel,
                internal: false,
                detached: true,
            },
        )
    }

    /// First answer of a goal; the rest of the query is abandoned.
    ///
    /// A query that ends without answering counts as a failure.
    pub async fn query_once(&self, goal: &str, options: QueryOptions) -> Result<Answer, Error> {
        let mut q = self.query(goal, options);
        let first = q.next().await;
        drop(q);
        first.unwrap_or_else(|| Ok(Answer::failure()))
    }

    async fn query_once_internal(&self, goal: &str) -> Result<Answer, Error> {
        let mut q = query::spawn(
            self,
            Launch {
                goal: goal.to_string(),
                options: QueryOptions::default(),
                toplevel: Json::default(),
                internal: true,
                detached: false,
            },
        );
        let first = q.next().await;
        drop(q);
        first.unwrap_or_else(|| Ok(Answer::failure()))
    }

    // ------------------------------------------------------------------------
    // Consulting
    // ------------------------------------------------------------------------

    /// Load a file the engine can see.
    pub async fn consult(&self, filename: &str) -> Result<(), Error> {
        self.init().await?;
        self.consult_file(filename)
    }

    fn consult_file(&self, filename: &str) -> Result<(), Error> {
        if filename == "user" {
            return Err(Error::ConsultUser);
        }
        let console = &self.shared.console;
        let (ok, stdout, stderr) = self.with_guest(|g| {
            let name = GuestString::alloc(&mut *g, filename)?;
            let ok = g.consult(name.ptr());
            name.free(g)?;
            // warnings printed while loading belong to no query
            Ok((ok?, console.take_stdout(), console.take_stderr()))
        })?;
        if !stdout.is_empty() {
            log::info!("{filename}: {}", String::from_utf8_lossy(&stdout).trim_end());
        }
        if !stderr.is_empty() {
            log::warn!("{filename}: {}", String::from_utf8_lossy(&stderr).trim_end());
        }
        if !ok {
            return Err(Error::Consult(filename.to_string()));
        }
        log::debug!("consulted {filename}");
        Ok(())
    }

    /// Stage program text in the scratch directory and consult it.
    pub async fn consult_text(&self, text: &str) -> Result<(), Error> {
        self.init().await?;
        let path = self.write_scratch(text)?;
        self.consult_file(&path)
    }

    fn write_scratch(&self, text: &str) -> Result<String, Error> {
        let n = self.shared.scratch.fetch_add(1, Ordering::Relaxed) + 1;
        let dir = self.shared.options.scratch_dir.trim_end_matches('/');
        let path = format!("{dir}/scratch{n}.pl");
        self.shared.fs.write(&path, text)?;
        Ok(path)
    }

    /// Load program text into a module via `load_text/2`.
    pub async fn consult_text_into(&self, text: &str, module: &str) -> Result<(), Error> {
        self.init().await?;
        self.load_text(text, module).await
    }

    async fn load_text(&self, text: &str, module: &str) -> Result<(), Error> {
        let goal = Term::compound(
            "load_text",
            vec![
                Term::string(text),
                Term::List(vec![Term::compound("module", vec![Term::atom(module)])]),
            ],
        );
        let answer = self.query_once_internal(&goal.to_prolog()?).await?;
        if !answer.is_success() {
            return Err(Error::Consult(format!("load_text into {module}")));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Host predicates
    // ------------------------------------------------------------------------

    /// Make a host predicate callable from the default module.
    pub async fn register(&self, pred: Predicate) -> Result<(), Error> {
        let module = self.shared.options.module.clone();
        self.register_in(vec![pred], &module).await
    }

    /// Make host predicates callable from `module`.
    pub async fn register_in(&self, preds: Vec<Predicate>, module: &str) -> Result<(), Error> {
        self.init().await?;
        self.load_predicates(preds, module).await
    }

    async fn load_predicates(&self, preds: Vec<Predicate>, module: &str) -> Result<(), Error> {
        let mut shim = String::new();
        for pred in &preds {
            shim.push_str(&pred.shim()?);
        }
        for pred in preds {
            self.shared.bridge.register(pred);
        }
        self.load_text(&shim, module).await
    }
}
