//! Per-subquery control blocks.
//!
//! The engine names subqueries by handle, but a handle only exists once
//! `pl_query` has written it to its out-parameter. Host calls made while the
//! first engine call is still running therefore arrive for a handle the host
//! has never seen; those are matched by reading the pending out-parameter
//! slots of queries that are still spawning.

use crate::guest::{indirect, GuestMemory, Ptr, SubqueryHandle};
use std::collections::{HashMap, VecDeque};

/// Host-side identity of a query, assigned before the engine knows about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub(crate) u64);

impl std::fmt::Display for QueryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "q{}", self.0)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Ctrl {
    pub handle: Option<SubqueryHandle>,
    /// Out-parameter slot while spawning.
    pub slot: Option<Ptr>,
    /// Structured answers pushed by the engine via `host-push-answer`.
    pub answers: VecDeque<String>,
    /// Output written on behalf of this query by host procedures, plus any
    /// engine output that preceded it.
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Debug, Default)]
pub(crate) struct CtrlTable {
    ctrls: HashMap<QueryId, Ctrl>,
    by_handle: HashMap<SubqueryHandle, QueryId>,
    spawning: HashMap<Ptr, QueryId>,
}

impl CtrlTable {
    pub fn spawn(&mut self, id: QueryId, slot: Ptr) {
        self.spawning.insert(slot, id);
        self.ctrls.insert(
            id,
            Ctrl {
                slot: Some(slot),
                ..Ctrl::default()
            },
        );
    }

    /// Record the handle read back from the out-parameter.
    pub fn resolve(&mut self, id: QueryId, handle: SubqueryHandle) {
        if let Some(ctrl) = self.ctrls.get_mut(&id) {
            if let Some(slot) = ctrl.slot.take() {
                self.spawning.remove(&slot);
            }
            ctrl.handle = Some(handle);
            self.by_handle.insert(handle, id);
        }
    }

    /// Drop the spawning slot (it is about to be freed).
    pub fn settle(&mut self, id: QueryId) {
        if let Some(ctrl) = self.ctrls.get_mut(&id) {
            if let Some(slot) = ctrl.slot.take() {
                self.spawning.remove(&slot);
            }
        }
    }

    /// Find the query owning `raw`, promoting a spawning query if its slot
    /// now holds that handle.
    pub fn lookup(&mut self, mem: &mut dyn GuestMemory, raw: u32) -> Option<QueryId> {
        let handle = SubqueryHandle::from_raw(raw)?;
        if let Some(id) = self.by_handle.get(&handle) {
            return Some(*id);
        }
        let found = self
            .spawning
            .iter()
            .find(|(slot, _)| matches!(indirect(&mut *mem, **slot), Ok(h) if h == raw))
            .map(|(_, id)| *id)?;
        self.resolve(found, handle);
        Some(found)
    }

    pub fn get_mut(&mut self, id: QueryId) -> Option<&mut Ctrl> {
        self.ctrls.get_mut(&id)
    }

    pub fn remove(&mut self, id: QueryId) -> Option<Ctrl> {
        let ctrl = self.ctrls.remove(&id)?;
        if let Some(slot) = ctrl.slot {
            self.spawning.remove(&slot);
        }
        if let Some(handle) = ctrl.handle {
            self.by_handle.remove(&handle);
        }
        Some(ctrl)
    }

    pub fn len(&self) -> usize {
        self.ctrls.len()
    }
}
