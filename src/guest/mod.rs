//! Guest Transport
//!
//! The only layer that touches guest linear memory. Everything above it works
//! with host strings and [`Term`](crate::term::Term)s; everything here works
//! with pointers into a single-threaded guest instance.
//!
//! ```text
//! ┌───────────────────────────────┐
//! │ runtime (queries, dispatcher) │
//! ├───────────────────────────────┤
//! │ guest: GuestString, read_string, indirect, write_u32
//! │        Guest (engine exports)  HostHooks (engine imports)
//! ├───────────────────────────────┤
//! │ wasm: wasmtime store/instance │
//! │ wasi: fds over the staging fs │
//! └───────────────────────────────┘
//! ```
//!
//! The transport performs no caching and assumes strictly sequential access:
//! logically concurrent subqueries interleave their calls but never run them
//! in parallel.

pub mod linker;
pub mod wasi;
pub mod wasm;

use crate::error::{AllocationError, Error, GuestError};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, PoisonError};

/// Guest pointer.
pub type Ptr = u32;

pub const NULL: Ptr = 0;
pub const PTRSIZE: u32 = 4;
pub const ALIGN: u32 = 1;

/// Engine-side identifier of one resolution state machine.
///
/// Zero is never a valid handle; code that may not know the handle yet holds
/// an `Option<SubqueryHandle>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubqueryHandle(NonZeroU32);

impl SubqueryHandle {
    pub fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub fn raw(self) -> u32 {
        self.0.get()
    }
}

/// Status codes returned from the host-call imports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum HostStatus {
    Error = 0,
    Ok = 1,
    /// Host work is pending; the guest must suspend and resume later.
    Yield = 2,
    /// A value is ready and more will follow (leaves a choice point).
    Choice = 3,
    Fail = 4,
}

impl HostStatus {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Self::Error,
            1 => Self::Ok,
            2 => Self::Yield,
            3 => Self::Choice,
            4 => Self::Fail,
            _ => return None,
        })
    }
}

/// Raw access to guest linear memory and its allocator.
pub trait GuestMemory {
    /// `canonical_abi_realloc(ptr, old_size, align, new_size)`
    fn realloc(&mut self, ptr: Ptr, old_size: u32, align: u32, new_size: u32) -> Result<Ptr, GuestError>;

    /// `canonical_abi_free(ptr, size, align)`
    fn free(&mut self, ptr: Ptr, size: u32, align: u32) -> Result<(), GuestError>;

    fn read(&mut self, ptr: Ptr, buf: &mut [u8]) -> Result<(), GuestError>;

    fn write(&mut self, ptr: Ptr, data: &[u8]) -> Result<(), GuestError>;

    /// Current size of linear memory in bytes.
    fn memory_size(&mut self) -> usize;
}

/// Imports the engine calls back into while running a query.
///
/// Implemented by the dispatcher. `subquery` is passed raw because it comes
/// straight from the guest.
pub trait HostHooks: Send + Sync {
    fn host_call(
        &self,
        mem: &mut dyn GuestMemory,
        subquery: u32,
        msg: Ptr,
        msg_size: u32,
        reply_ptr: Ptr,
        reply_size_ptr: Ptr,
    ) -> HostStatus;

    fn host_resume(
        &self,
        mem: &mut dyn GuestMemory,
        subquery: u32,
        reply_ptr: Ptr,
        reply_size_ptr: Ptr,
    ) -> HostStatus;

    fn host_push_answer(&self, mem: &mut dyn GuestMemory, subquery: u32, msg: Ptr, size: u32);
}

/// Exports of the logic engine.
///
/// All methods are plain engine calls; none of them suspend. Host imports
/// registered through [`Guest::attach`] run inside `query`, `redo` and
/// `consult`.
pub trait Guest: GuestMemory + Send {
    fn attach(&mut self, hooks: Arc<dyn HostHooks>);

    /// `pl_query(pl, goal, subq_out, autoyield)`
    fn query(&mut self, goal: Ptr, subquery_out: Ptr, autoyield_ms: u32) -> Result<bool, GuestError>;

    /// `pl_redo(subq)`
    fn redo(&mut self, subquery: SubqueryHandle) -> Result<bool, GuestError>;

    /// `pl_done(subq)`
    fn done(&mut self, subquery: SubqueryHandle) -> Result<(), GuestError>;

    /// `get_status(pl)`
    fn status(&mut self) -> Result<bool, GuestError>;

    /// `get_error(pl)`
    fn error(&mut self) -> Result<bool, GuestError>;

    /// `pl_did_yield(subq)`
    fn did_yield(&mut self, subquery: SubqueryHandle) -> Result<bool, GuestError>;

    /// `pl_yield_at(subq, msec)`
    fn yield_at(&mut self, subquery: SubqueryHandle, ms: u32) -> Result<(), GuestError>;

    /// `pl_consult(pl, filename)`
    fn consult(&mut self, filename: Ptr) -> Result<bool, GuestError>;

    /// Text the engine wrote to its standard streams.
    fn console(&self) -> &Console;
}

/// Shared stdout/stderr sinks for the engine's console.
#[derive(Debug, Clone, Default)]
pub struct Console {
    stdout: Arc<Mutex<Vec<u8>>>,
    stderr: Arc<Mutex<Vec<u8>>>,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_stdout(&self, data: &[u8]) {
        self.stdout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
    }

    pub fn write_stderr(&self, data: &[u8]) {
        self.stderr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
    }

    /// Drain everything written to stdout so far.
    pub fn take_stdout(&self) -> Vec<u8> {
        std::mem::take(&mut *self.stdout.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Drain everything written to stderr so far.
    pub fn take_stderr(&self) -> Vec<u8> {
        std::mem::take(&mut *self.stderr.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// A NUL-terminated copy of host text living in guest memory.
///
/// Must be released with [`GuestString::free`] on the same guest.
#[derive(Debug)]
pub struct GuestString {
    ptr: Ptr,
    size: u32,
}

impl GuestString {
    pub fn alloc<M: GuestMemory + ?Sized>(mem: &mut M, text: &str) -> Result<Self, Error> {
        let bytes = text.as_bytes();
        let size = bytes.len() as u32 + 1;
        let ptr = mem.realloc(NULL, 0, ALIGN, size)?;
        if ptr == NULL {
            return Err(AllocationError { size }.into());
        }
        let mut buf = Vec::with_capacity(size as usize);
        buf.extend_from_slice(bytes);
        buf.push(0);
        if let Err(e) = mem.write(ptr, &buf) {
            mem.free(ptr, size, ALIGN)?;
            return Err(e.into());
        }
        Ok(Self { ptr, size })
    }

    pub fn ptr(&self) -> Ptr {
        self.ptr
    }

    /// Length without the terminator.
    pub fn len(&self) -> u32 {
        self.size - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn free<M: GuestMemory + ?Sized>(self, mem: &mut M) -> Result<(), GuestError> {
        mem.free(self.ptr, self.size, ALIGN)
    }

    /// Hand ownership to the guest; it frees the buffer itself.
    pub fn leak(self) -> (Ptr, u32) {
        (self.ptr, self.len())
    }
}

/// Allocate a pointer-sized out-parameter cell, zeroed.
pub fn alloc_cell<M: GuestMemory + ?Sized>(mem: &mut M) -> Result<Ptr, Error> {
    let ptr = mem.realloc(NULL, 0, ALIGN, PTRSIZE)?;
    if ptr == NULL {
        return Err(AllocationError { size: PTRSIZE }.into());
    }
    write_u32(mem, ptr, 0)?;
    Ok(ptr)
}

pub fn free_cell<M: GuestMemory + ?Sized>(mem: &mut M, ptr: Ptr) -> Result<(), GuestError> {
    mem.free(ptr, PTRSIZE, ALIGN)
}

/// Read a string from guest memory, either `len` bytes or up to the first NUL.
pub fn read_string<M: GuestMemory + ?Sized>(
    mem: &mut M,
    ptr: Ptr,
    len: Option<u32>,
) -> Result<String, GuestError> {
    let bytes = match len {
        Some(len) => {
            let mut buf = vec![0u8; len as usize];
            mem.read(ptr, &mut buf)?;
            buf
        }
        None => read_until_nul(mem, ptr)?,
    };
    String::from_utf8(bytes).map_err(|_| GuestError::InvalidUtf8(ptr))
}

fn read_until_nul<M: GuestMemory + ?Sized>(mem: &mut M, ptr: Ptr) -> Result<Vec<u8>, GuestError> {
    const CHUNK: usize = 256;
    let end = mem.memory_size();
    let mut out = Vec::new();
    let mut at = ptr as usize;
    while at < end {
        let n = CHUNK.min(end - at);
        let mut buf = vec![0u8; n];
        mem.read(at as Ptr, &mut buf)?;
        if let Some(idx) = buf.iter().position(|&b| b == 0) {
            out.extend_from_slice(&buf[..idx]);
            return Ok(out);
        }
        out.extend_from_slice(&buf);
        at += n;
    }
    Err(GuestError::Unterminated(ptr))
}

/// Dereference a pointer-to-pointer cell once.
pub fn indirect<M: GuestMemory + ?Sized>(mem: &mut M, ptr: Ptr) -> Result<u32, GuestError> {
    let mut buf = [0u8; 4];
    mem.read(ptr, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn write_u32<M: GuestMemory + ?Sized>(mem: &mut M, ptr: Ptr, value: u32) -> Result<(), GuestError> {
    mem.write(ptr, &value.to_le_bytes())
}

/// Flat linear memory with a first-fit allocator, for exercising the
/// transport without a wasm engine.
#[derive(Debug)]
pub struct HeapMemory {
    bytes: Vec<u8>,
    /// (ptr, size) of live allocations, sorted by ptr
    live: Vec<(Ptr, u32)>,
}

impl HeapMemory {
    /// Addresses below this are never handed out.
    const BASE: u32 = 8;

    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
            live: Vec::new(),
        }
    }

    /// Number of allocations not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }

    fn find_gap(&self, size: u32) -> Option<Ptr> {
        let mut at = Self::BASE;
        for &(ptr, len) in &self.live {
            if ptr >= at && ptr - at >= size {
                return Some(at);
            }
            at = at.max(ptr + len);
        }
        if (at as usize) + (size as usize) <= self.bytes.len() {
            Some(at)
        } else {
            None
        }
    }

    fn check(&self, ptr: Ptr, len: usize) -> Result<std::ops::Range<usize>, GuestError> {
        let start = ptr as usize;
        let end = start.checked_add(len).filter(|&end| end <= self.bytes.len());
        match end {
            Some(end) => Ok(start..end),
            None => Err(GuestError::OutOfBounds { ptr, len }),
        }
    }
}

impl GuestMemory for HeapMemory {
    fn realloc(&mut self, ptr: Ptr, old_size: u32, _align: u32, new_size: u32) -> Result<Ptr, GuestError> {
        let old = if ptr != NULL {
            let range = self.check(ptr, old_size as usize)?;
            let data = self.bytes[range].to_vec();
            self.live.retain(|&(p, _)| p != ptr);
            Some(data)
        } else {
            None
        };
        let size = new_size.max(1);
        let Some(new_ptr) = self.find_gap(size) else {
            return Ok(NULL);
        };
        let idx = self.live.partition_point(|&(p, _)| p < new_ptr);
        self.live.insert(idx, (new_ptr, size));
        if let Some(data) = old {
            let n = data.len().min(new_size as usize);
            self.write(new_ptr, &data[..n])?;
        }
        Ok(new_ptr)
    }

    fn free(&mut self, ptr: Ptr, _size: u32, _align: u32) -> Result<(), GuestError> {
        let before = self.live.len();
        self.live.retain(|&(p, _)| p != ptr);
        if self.live.len() == before {
            return Err(GuestError::Trap {
                context: "canonical_abi_free".into(),
                message: format!("double free of {ptr:#x}"),
            });
        }
        Ok(())
    }

    fn read(&mut self, ptr: Ptr, buf: &mut [u8]) -> Result<(), GuestError> {
        let range = self.check(ptr, buf.len())?;
        buf.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn write(&mut self, ptr: Ptr, data: &[u8]) -> Result<(), GuestError> {
        let range = self.check(ptr, data.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    fn memory_size(&mut self) -> usize {
        self.bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_roundtrip() {
        let mut mem = HeapMemory::new(1024);
        let s = GuestString::alloc(&mut mem, "hello 世界").unwrap();
        assert_eq!(s.len(), "hello 世界".len() as u32);
        assert_eq!(read_string(&mut mem, s.ptr(), None).unwrap(), "hello 世界");
        assert_eq!(read_string(&mut mem, s.ptr(), Some(5)).unwrap(), "hello");
        s.free(&mut mem).unwrap();
        assert_eq!(mem.live_allocations(), 0);
    }

    #[test]
    fn allocation_failure_is_fatal() {
        let mut mem = HeapMemory::new(16);
        let err = GuestString::alloc(&mut mem, "this is far too long for the heap").unwrap_err();
        assert!(matches!(err, Error::Allocation(AllocationError { size: 34 })));
    }

    #[test]
    fn unterminated_string() {
        let mut mem = HeapMemory::new(32);
        mem.write(20, &[b'x'; 12]).unwrap();
        assert!(matches!(
            read_string(&mut mem, 20, None),
            Err(GuestError::Unterminated(20))
        ));
    }

    #[test]
    fn out_parameter_cells() {
        let mut mem = HeapMemory::new(64);
        let cell = alloc_cell(&mut mem).unwrap();
        assert_eq!(indirect(&mut mem, cell).unwrap(), 0);
        write_u32(&mut mem, cell, 0xdead_beef).unwrap();
        assert_eq!(indirect(&mut mem, cell).unwrap(), 0xdead_beef);
        free_cell(&mut mem, cell).unwrap();
        assert!(free_cell(&mut mem, cell).is_err());
    }

    #[test]
    fn freed_space_is_reused() {
        let mut mem = HeapMemory::new(64);
        let a = GuestString::alloc(&mut mem, "aaaa").unwrap();
        let b = GuestString::alloc(&mut mem, "bbbb").unwrap();
        let a_ptr = a.ptr();
        a.free(&mut mem).unwrap();
        let c = GuestString::alloc(&mut mem, "cc").unwrap();
        assert_eq!(c.ptr(), a_ptr);
        assert_eq!(read_string(&mut mem, b.ptr(), None).unwrap(), "bbbb");
    }

    #[test]
    fn handles_are_never_zero() {
        assert!(SubqueryHandle::from_raw(0).is_none());
        assert_eq!(SubqueryHandle::from_raw(7).map(SubqueryHandle::raw), Some(7));
        assert_eq!(HostStatus::from_code(3), Some(HostStatus::Choice));
        assert_eq!(HostStatus::Fail.code(), 4);
        assert_eq!(HostStatus::from_code(9), None);
    }
}
