//! Error types shared across the bridge.
//!
//! Errors that originate from guest-supplied data (bad terms, unknown host
//! predicates, exceptions in host procedures) are normally turned into Prolog
//! terms and handed back to the guest. The types here cover what escapes to
//! the host: bridge inconsistencies and misuse of the API.

use thiserror::Error;

/// A Term could not be converted to or from text.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodingError {
    #[error("can't convert value to Prolog text: {0}")]
    Unrepresentable(String),

    #[error("invalid variable name: {0:?}")]
    InvalidVariable(String),

    #[error("malformed wire text: {0}")]
    Malformed(String),

    #[error("malformed quoted literal: {0}")]
    BadLiteral(String),
}

/// An engine export failed or trapped.
#[derive(Error, Debug, Clone)]
pub enum GuestError {
    #[error("{context}: engine returned error code {code}")]
    Code { context: String, code: i32 },

    #[error("{context}: {message}")]
    Trap { context: String, message: String },

    #[error("missing engine export: {0}")]
    MissingExport(String),

    #[error("memory access out of bounds: {ptr:#x}+{len}")]
    OutOfBounds { ptr: u32, len: usize },

    #[error("unterminated string at address {0:#x}")]
    Unterminated(u32),

    #[error("invalid utf-8 in guest string at {0:#x}")]
    InvalidUtf8(u32),

    #[error("module not loaded: call guest::wasm::load first")]
    NotLoaded,

    #[error("link error: {0}")]
    Link(String),
}

/// The guest allocator returned the null sentinel.
#[derive(Error, Debug, Clone)]
#[error("could not allocate {size} bytes in guest memory")]
pub struct AllocationError {
    pub size: u32,
}

/// The guest broke the expected handshake.
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("couldn't find control block for subquery {0:#x}")]
    UnknownSubquery(u32),

    #[error("subquery handle was never written by the engine")]
    UnresolvedHandle,

    #[error("engine resumed subquery {0:#x} without a pending continuation")]
    MissingThunk(u32),

    #[error("guest is busy: re-entrant engine call")]
    Reentrant,

    #[error("query used after finalization")]
    Finalized,

    #[error("unexpected answer payload: {0}")]
    BadAnswer(String),
}

/// A host-registered procedure failed.
#[derive(Error, Debug, Clone)]
#[error("host procedure {predicate} failed: {message}")]
pub struct HostProcedureError {
    /// Predicate indicator, e.g. `sleep/1`.
    pub predicate: String,
    pub message: String,
}

/// Errors from the virtual filesystem.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("file exists: {0}")]
    Exists(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("file not opened for {0}")]
    Access(&'static str),

    #[error("invalid seek in {0}")]
    InvalidSeek(String),
}

/// Errors from the task table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("no such task: {0}")]
    Unknown(u64),
}

/// Top-level error for bridge operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Guest(#[from] GuestError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    HostProcedure(#[from] HostProcedureError),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("failed to consult file: {0}")]
    Consult(String),

    #[error("consulting from 'user' is unsupported")]
    ConsultUser,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
