//! Scripted in-process engine for driving the bridge without wasm.
//!
//! Each goal maps to a script of steps. Host calls go through the real
//! [`HostHooks`] attached by `Prolog::new`, so dispatch, thunks and answer
//! queues are exercised exactly as with the wasm engine.

#![allow(dead_code)]

use plhost::error::GuestError;
use plhost::guest::{
    alloc_cell, free_cell, indirect, read_string, write_u32, Console, Guest, GuestMemory, GuestString, HeapMemory,
    HostHooks, HostStatus, Ptr, SubqueryHandle, ALIGN,
};
use plhost::term::{parse_quoted, to_json, Term};
use plhost::vfs::MemoryFs;
use plhost::{Prolog, PrologOptions};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub type Then = Arc<dyn Fn(&str) -> Vec<Step> + Send + Sync>;
type Script = Arc<dyn Fn() -> Vec<Step> + Send + Sync>;

#[derive(Clone)]
pub enum Step {
    /// Push an answer object.
    Answer(Value),
    /// Push a failure; nothing runs afterwards.
    Fail,
    /// Push an error with this term; nothing runs afterwards.
    Error(Value),
    /// Write to the engine's stdout.
    Print(String),
    /// Suspend on our own (autoyield).
    Yield,
    /// Burn wall-clock time inside the engine.
    Busy(Duration),
    /// `host_rpc(Goal)`; `then` turns the reply into further steps.
    Call { goal: Term, then: Then },
    /// Backtrack into a host choice point.
    Resume(Then),
}

pub fn answer(bindings: Value) -> Step {
    Step::Answer(json!({ "status": "success", "answer": bindings }))
}

pub fn print(text: &str) -> Step {
    Step::Print(text.to_string())
}

pub fn call(goal: Term, then: impl Fn(&str) -> Vec<Step> + Send + Sync + 'static) -> Step {
    Step::Call {
        goal,
        then: Arc::new(then),
    }
}

/// Text the library sends for a task's goal.
pub fn task_goal(goal: Term) -> String {
    let var = Term::var("__GOAL").expect("valid variable");
    Term::compound(",", vec![Term::compound("=", vec![var.clone(), goal]), var])
        .to_prolog()
        .expect("renderable goal")
}

/// Success answer for a task, carrying the solved goal.
pub fn solved(goal: Value) -> Step {
    answer(json!({ "__GOAL": goal }))
}

enum Outcome {
    Answered(bool),
    Suspended,
    Exhausted,
}

struct Waiting {
    then: Then,
    /// Backtracking into a choice point; running out is silent.
    retry: bool,
}

struct Sub {
    steps: VecDeque<Step>,
    yielded: bool,
    waiting: Option<Waiting>,
    closed: bool,
}

struct MockState {
    mem: HeapMemory,
    hooks: Option<Arc<dyn HostHooks>>,
    console: Console,
    fs: MemoryFs,
    scripts: HashMap<String, Script>,
    subs: HashMap<u32, Sub>,
    next_handle: u32,
    status: bool,
    goals: Vec<String>,
    replies: Vec<String>,
    trace: Vec<String>,
    consulted: Vec<String>,
    violations: Vec<String>,
    done_calls: usize,
    yield_at_calls: usize,
    /// Leave the next query's handle slot untouched.
    skip_handle: bool,
}

#[derive(Clone)]
pub struct MockEngine {
    state: Arc<Mutex<MockState>>,
    console: Console,
}

impl MockEngine {
    pub fn new() -> Self {
        let console = Console::new();
        let state = MockState {
            mem: HeapMemory::new(1 << 20),
            hooks: None,
            console: console.clone(),
            fs: MemoryFs::new(),
            scripts: HashMap::new(),
            subs: HashMap::new(),
            next_handle: 1000,
            status: false,
            goals: Vec::new(),
            replies: Vec::new(),
            trace: Vec::new(),
            consulted: Vec::new(),
            violations: Vec::new(),
            done_calls: 0,
            yield_at_calls: 0,
            skip_handle: false,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            console,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }

    /// Interpreter over a clone of this engine, sharing its filesystem.
    pub fn prolog(&self) -> Prolog {
        self.prolog_with(PrologOptions::default())
    }

    pub fn prolog_with(&self, options: PrologOptions) -> Prolog {
        let options = options.fs(self.fs());
        Prolog::new(Box::new(self.clone()), options).expect("interpreter")
    }

    pub fn script(&self, goal: &str, steps: impl Fn() -> Vec<Step> + Send + Sync + 'static) {
        self.lock().scripts.insert(goal.to_string(), Arc::new(steps));
    }

    pub fn fs(&self) -> MemoryFs {
        self.lock().fs.clone()
    }

    /// Subqueries neither exhausted nor released.
    pub fn live(&self) -> usize {
        self.lock().subs.values().filter(|s| !s.closed).count()
    }

    pub fn allocations(&self) -> usize {
        self.lock().mem.live_allocations()
    }

    pub fn goals(&self) -> Vec<String> {
        self.lock().goals.clone()
    }

    pub fn replies(&self) -> Vec<String> {
        self.lock().replies.clone()
    }

    pub fn trace(&self) -> Vec<String> {
        self.lock().trace.clone()
    }

    pub fn consulted(&self) -> Vec<String> {
        self.lock().consulted.clone()
    }

    pub fn violations(&self) -> Vec<String> {
        self.lock().violations.clone()
    }

    pub fn done_calls(&self) -> usize {
        self.lock().done_calls
    }

    pub fn yield_at_calls(&self) -> usize {
        self.lock().yield_at_calls
    }

    /// The next `pl_query` returns without writing its subquery handle.
    pub fn skip_next_handle(&self) {
        self.lock().skip_handle = true;
    }
}

/// The goal inside `wasm:js_ask("...").`, or the raw text otherwise.
fn goal_key(text: &str) -> String {
    text.strip_prefix("wasm:js_ask(")
        .and_then(|t| t.strip_suffix(")."))
        .and_then(|t| parse_quoted(t).ok())
        .unwrap_or_else(|| text.trim_end_matches('.').to_string())
}

impl MockState {
    fn hooks(&self) -> Arc<dyn HostHooks> {
        self.hooks.clone().expect("hooks attached")
    }

    fn sub(&mut self, handle: u32) -> &mut Sub {
        self.subs.get_mut(&handle).expect("known subquery")
    }

    fn prepend(&mut self, handle: u32, steps: Vec<Step>) {
        let sub = self.sub(handle);
        for step in steps.into_iter().rev() {
            sub.steps.push_front(step);
        }
    }

    fn push(&mut self, handle: u32, msg: &Value) {
        let hooks = self.hooks();
        let text = GuestString::alloc(&mut self.mem, &msg.to_string()).expect("alloc answer");
        hooks.host_push_answer(&mut self.mem, handle, text.ptr(), text.len());
        text.free(&mut self.mem).expect("free answer");
    }

    fn take_reply(&mut self, reply_ptr: Ptr, size_ptr: Ptr) -> String {
        let ptr = indirect(&mut self.mem, reply_ptr).expect("reply cell");
        let len = indirect(&mut self.mem, size_ptr).expect("size cell");
        free_cell(&mut self.mem, reply_ptr).expect("free cell");
        free_cell(&mut self.mem, size_ptr).expect("free cell");
        if ptr == 0 {
            return String::new();
        }
        let text = read_string(&mut self.mem, ptr, Some(len)).expect("reply text");
        self.mem.free(ptr, len + 1, ALIGN).expect("free reply");
        self.replies.push(text.clone());
        text
    }

    fn host_call(&mut self, handle: u32, goal: &Term) -> (HostStatus, String) {
        let hooks = self.hooks();
        let msg = GuestString::alloc(&mut self.mem, &to_json(goal).expect("encode goal")).expect("alloc goal");
        let reply_ptr = alloc_cell(&mut self.mem).expect("reply cell");
        let size_ptr = alloc_cell(&mut self.mem).expect("size cell");
        let status = hooks.host_call(&mut self.mem, handle, msg.ptr(), msg.len(), reply_ptr, size_ptr);
        msg.free(&mut self.mem).expect("free goal");
        (status, self.take_reply(reply_ptr, size_ptr))
    }

    fn host_resume(&mut self, handle: u32, waiting: Waiting) {
        let hooks = self.hooks();
        let reply_ptr = alloc_cell(&mut self.mem).expect("reply cell");
        let size_ptr = alloc_cell(&mut self.mem).expect("size cell");
        let status = hooks.host_resume(&mut self.mem, handle, reply_ptr, size_ptr);
        let reply = self.take_reply(reply_ptr, size_ptr);
        let then = waiting.then;
        match status {
            HostStatus::Choice => {
                let mut steps = then(&reply);
                steps.push(Step::Resume(then.clone()));
                self.prepend(handle, steps);
            }
            HostStatus::Ok => self.prepend(handle, then(&reply)),
            HostStatus::Fail if waiting.retry => {}
            HostStatus::Fail => self.prepend(handle, vec![Step::Fail]),
            other => self.prepend(handle, vec![Step::Error(json!(format!("host_resume: {other:?}")))]),
        }
    }

    fn run(&mut self, handle: u32) -> Outcome {
        loop {
            let Some(step) = self.sub(handle).steps.pop_front() else {
                return Outcome::Exhausted;
            };
            match step {
                Step::Answer(msg) => {
                    self.push(handle, &msg);
                    self.status = true;
                    return Outcome::Answered(true);
                }
                Step::Fail => {
                    self.push(handle, &json!({ "status": "failure" }));
                    self.status = false;
                    self.sub(handle).steps.clear();
                    return Outcome::Answered(false);
                }
                Step::Error(error) => {
                    self.push(handle, &json!({ "status": "error", "error": error }));
                    self.status = true;
                    self.sub(handle).steps.clear();
                    return Outcome::Answered(true);
                }
                Step::Print(text) => {
                    self.console.write_stdout(text.as_bytes());
                    self.trace.push(text);
                }
                Step::Yield => {
                    self.sub(handle).yielded = true;
                    return Outcome::Suspended;
                }
                Step::Busy(d) => std::thread::sleep(d),
                Step::Call { goal, then } => {
                    let (status, reply) = self.host_call(handle, &goal);
                    match status {
                        HostStatus::Ok if reply == "fail" => self.prepend(handle, vec![Step::Fail]),
                        HostStatus::Ok => self.prepend(handle, then(&reply)),
                        HostStatus::Yield => {
                            let sub = self.sub(handle);
                            sub.yielded = true;
                            sub.waiting = Some(Waiting { then, retry: false });
                            return Outcome::Suspended;
                        }
                        other => self.prepend(handle, vec![Step::Error(json!(format!("host_call: {other:?}")))]),
                    }
                }
                Step::Resume(then) => {
                    let sub = self.sub(handle);
                    sub.yielded = true;
                    sub.waiting = Some(Waiting { then, retry: true });
                    return Outcome::Suspended;
                }
            }
        }
    }

    /// Look up a subquery the host may legitimately touch.
    fn open(&mut self, op: &str, handle: SubqueryHandle) -> bool {
        match self.subs.get(&handle.raw()) {
            Some(sub) if !sub.closed => true,
            Some(_) => {
                self.violations.push(format!("{op} on closed subquery {:#x}", handle.raw()));
                false
            }
            None => {
                self.violations.push(format!("{op} on unknown subquery {:#x}", handle.raw()));
                false
            }
        }
    }
}

impl GuestMemory for MockEngine {
    fn realloc(&mut self, ptr: Ptr, old_size: u32, align: u32, new_size: u32) -> Result<Ptr, GuestError> {
        self.lock().mem.realloc(ptr, old_size, align, new_size)
    }

    fn free(&mut self, ptr: Ptr, size: u32, align: u32) -> Result<(), GuestError> {
        self.lock().mem.free(ptr, size, align)
    }

    fn read(&mut self, ptr: Ptr, buf: &mut [u8]) -> Result<(), GuestError> {
        self.lock().mem.read(ptr, buf)
    }

    fn write(&mut self, ptr: Ptr, data: &[u8]) -> Result<(), GuestError> {
        self.lock().mem.write(ptr, data)
    }

    fn memory_size(&mut self) -> usize {
        self.lock().mem.memory_size()
    }
}

impl Guest for MockEngine {
    fn attach(&mut self, hooks: Arc<dyn HostHooks>) {
        self.lock().hooks = Some(hooks);
    }

    fn query(&mut self, goal: Ptr, subquery_out: Ptr, _autoyield_ms: u32) -> Result<bool, GuestError> {
        let mut st = self.lock();
        let text = read_string(&mut st.mem, goal, None)?;
        let key = goal_key(&text);
        let steps = match st.scripts.get(&key) {
            Some(script) => script(),
            None => vec![answer(json!({}))],
        };
        st.goals.push(key);
        if std::mem::take(&mut st.skip_handle) {
            return Ok(true);
        }

        let handle = st.next_handle;
        st.next_handle += 1;
        write_u32(&mut st.mem, subquery_out, handle)?;
        st.subs.insert(
            handle,
            Sub {
                steps: steps.into(),
                yielded: false,
                waiting: None,
                closed: false,
            },
        );
        Ok(match st.run(handle) {
            Outcome::Answered(ok) => ok,
            Outcome::Suspended => true,
            Outcome::Exhausted => false,
        })
    }

    fn redo(&mut self, subquery: SubqueryHandle) -> Result<bool, GuestError> {
        let mut st = self.lock();
        if !st.open("redo", subquery) {
            return Ok(false);
        }
        let handle = subquery.raw();
        let sub = st.sub(handle);
        if std::mem::take(&mut sub.yielded) {
            if let Some(waiting) = sub.waiting.take() {
                st.host_resume(handle, waiting);
            }
        }
        match st.run(handle) {
            Outcome::Answered(_) | Outcome::Suspended => Ok(true),
            Outcome::Exhausted => {
                st.sub(handle).closed = true;
                Ok(false)
            }
        }
    }

    fn done(&mut self, subquery: SubqueryHandle) -> Result<(), GuestError> {
        let mut st = self.lock();
        if st.open("done", subquery) {
            st.sub(subquery.raw()).closed = true;
            st.done_calls += 1;
        }
        Ok(())
    }

    fn status(&mut self) -> Result<bool, GuestError> {
        Ok(self.lock().status)
    }

    fn error(&mut self) -> Result<bool, GuestError> {
        Ok(false)
    }

    fn did_yield(&mut self, subquery: SubqueryHandle) -> Result<bool, GuestError> {
        let mut st = self.lock();
        if !st.open("did_yield", subquery) {
            return Ok(false);
        }
        Ok(st.sub(subquery.raw()).yielded)
    }

    fn yield_at(&mut self, subquery: SubqueryHandle, _ms: u32) -> Result<(), GuestError> {
        let mut st = self.lock();
        if st.open("yield_at", subquery) {
            st.yield_at_calls += 1;
        }
        Ok(())
    }

    fn consult(&mut self, filename: Ptr) -> Result<bool, GuestError> {
        let mut st = self.lock();
        let name = read_string(&mut st.mem, filename, None)?;
        let found = st.fs.exists(&name);
        st.consulted.push(name);
        Ok(found)
    }

    fn console(&self) -> &Console {
        &self.console
    }
}
