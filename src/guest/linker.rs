//! Host Import Registration
//!
//! Builder and provider pattern for wiring the engine's imports into a
//! wasmtime [`Linker`]. Two providers ship with the crate:
//!
//! - [`BridgeProvider`]: the `trealla` host-call imports, forwarded to the
//!   [`HostHooks`] attached to the store
//! - [`WasiProvider`](super::wasi::WasiProvider): the WASI preview 1 subset
//!   backed by the staging filesystem and the guest [`Console`]
//!
//! Embedders can register their own functions after these; the linker allows
//! shadowing.

use super::wasi::{WasiConfig, WasiCtx};
use super::{Console, GuestMemory, HostHooks, Ptr};
use crate::error::GuestError;
use std::sync::Arc;
use thiserror::Error;
use wasmtime::{Caller, Extern, Linker, Memory};

/// Module name of the engine's host-call imports.
pub const BRIDGE_MODULE: &str = "trealla";

/// Errors from linker operations
#[derive(Error, Debug)]
pub enum LinkerError {
    #[error("Function registration failed: {0}")]
    FunctionRegistration(String),
}

impl From<LinkerError> for GuestError {
    fn from(e: LinkerError) -> Self {
        GuestError::Link(e.to_string())
    }
}

/// Per-store data visible to import implementations.
pub struct GuestState {
    pub(crate) hooks: Option<Arc<dyn HostHooks>>,
    pub(crate) wasi: WasiCtx,
}

impl GuestState {
    pub fn new(config: WasiConfig, console: Console) -> Self {
        Self {
            hooks: None,
            wasi: WasiCtx::new(config, console),
        }
    }

    pub fn console(&self) -> &Console {
        self.wasi.console()
    }

    pub fn wasi(&self) -> &WasiCtx {
        &self.wasi
    }
}

/// [`GuestMemory`] view over a [`Caller`], for use inside imports.
///
/// Calls back into the guest allocator exports, so it is only valid while the
/// import is running.
pub struct CallerMemory<'a, 'b, T> {
    caller: &'a mut Caller<'b, T>,
}

impl<'a, 'b, T> CallerMemory<'a, 'b, T> {
    pub fn new(caller: &'a mut Caller<'b, T>) -> Self {
        Self { caller }
    }

    fn memory(&mut self) -> Result<Memory, GuestError> {
        self.caller
            .get_export("memory")
            .and_then(Extern::into_memory)
            .ok_or_else(|| GuestError::MissingExport("memory".into()))
    }

    fn func(&mut self, name: &str) -> Result<wasmtime::Func, GuestError> {
        self.caller
            .get_export(name)
            .and_then(Extern::into_func)
            .ok_or_else(|| GuestError::MissingExport(name.into()))
    }
}

impl<T> GuestMemory for CallerMemory<'_, '_, T> {
    fn realloc(&mut self, ptr: Ptr, old_size: u32, align: u32, new_size: u32) -> Result<Ptr, GuestError> {
        let func = self
            .func("canonical_abi_realloc")?
            .typed::<(i32, i32, i32, i32), i32>(&*self.caller)
            .map_err(|e| trap("canonical_abi_realloc", e))?;
        let out = func
            .call(
                &mut *self.caller,
                (ptr as i32, old_size as i32, align as i32, new_size as i32),
            )
            .map_err(|e| trap("canonical_abi_realloc", e))?;
        Ok(out as Ptr)
    }

    fn free(&mut self, ptr: Ptr, size: u32, align: u32) -> Result<(), GuestError> {
        let func = self
            .func("canonical_abi_free")?
            .typed::<(i32, i32, i32), ()>(&*self.caller)
            .map_err(|e| trap("canonical_abi_free", e))?;
        func.call(&mut *self.caller, (ptr as i32, size as i32, align as i32))
            .map_err(|e| trap("canonical_abi_free", e))
    }

    fn read(&mut self, ptr: Ptr, buf: &mut [u8]) -> Result<(), GuestError> {
        let memory = self.memory()?;
        memory
            .read(&*self.caller, ptr as usize, buf)
            .map_err(|_| GuestError::OutOfBounds { ptr, len: buf.len() })
    }

    fn write(&mut self, ptr: Ptr, data: &[u8]) -> Result<(), GuestError> {
        let memory = self.memory()?;
        memory
            .write(&mut *self.caller, ptr as usize, data)
            .map_err(|_| GuestError::OutOfBounds { ptr, len: data.len() })
    }

    fn memory_size(&mut self) -> usize {
        match self.memory() {
            Ok(memory) => memory.data_size(&*self.caller),
            Err(_) => 0,
        }
    }
}

pub(crate) fn trap(context: &str, e: impl std::fmt::Display) -> GuestError {
    GuestError::Trap {
        context: context.to_string(),
        message: e.to_string(),
    }
}

/// Builder for registering host functions with a Linker.
pub struct HostLinkerBuilder<'a, T> {
    linker: &'a mut Linker<T>,
}

impl<'a, T> HostLinkerBuilder<'a, T> {
    pub fn new(linker: &'a mut Linker<T>) -> Self {
        Self { linker }
    }

    /// Start defining functions under an import module name.
    pub fn interface(&mut self, name: &str) -> Result<InterfaceBuilder<'_, 'a, T>, LinkerError> {
        Ok(InterfaceBuilder {
            linker: self,
            module_name: name.to_string(),
        })
    }

    pub fn register_provider<P: HostFunctionProvider<T>>(
        &mut self,
        provider: &P,
    ) -> Result<&mut Self, LinkerError> {
        provider.register(self)?;
        Ok(self)
    }
}

/// Builder for registering functions within one import module.
pub struct InterfaceBuilder<'a, 'b, T> {
    linker: &'a mut HostLinkerBuilder<'b, T>,
    module_name: String,
}

impl<'a, 'b, T: 'static> InterfaceBuilder<'a, 'b, T> {
    /// Register a host function with direct WASM-level parameters.
    pub fn func_raw<Params, Results>(
        &mut self,
        name: &str,
        func: impl wasmtime::IntoFunc<T, Params, Results>,
    ) -> Result<&mut Self, LinkerError> {
        self.linker
            .linker
            .func_wrap(&self.module_name, name, func)
            .map_err(|e| LinkerError::FunctionRegistration(e.to_string()))?;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.module_name
    }
}

/// A set of host functions that can be registered on any linker.
pub trait HostFunctionProvider<T> {
    fn register(&self, builder: &mut HostLinkerBuilder<'_, T>) -> Result<(), LinkerError>;
}

// ============================================================================
// Engine bridge imports
// ============================================================================

/// Registers `trealla.host-call`, `trealla.host-resume` and
/// `trealla.host-push-answer`.
pub struct BridgeProvider;

fn hooks(caller: &Caller<'_, GuestState>, name: &str) -> wasmtime::Result<Arc<dyn HostHooks>> {
    caller
        .data()
        .hooks
        .clone()
        .ok_or_else(|| wasmtime::Error::msg(format!("{name}: no host attached to this guest")))
}

impl HostFunctionProvider<GuestState> for BridgeProvider {
    fn register(&self, builder: &mut HostLinkerBuilder<'_, GuestState>) -> Result<(), LinkerError> {
        builder
            .interface(BRIDGE_MODULE)?
            .func_raw(
                "host-call",
                |mut caller: Caller<'_, GuestState>,
                 subquery: i32,
                 msg: i32,
                 msg_size: i32,
                 reply_ptr: i32,
                 reply_size_ptr: i32|
                 -> wasmtime::Result<i32> {
                    let hooks = hooks(&caller, "host-call")?;
                    let mut mem = CallerMemory::new(&mut caller);
                    let status = hooks.host_call(
                        &mut mem,
                        subquery as u32,
                        msg as Ptr,
                        msg_size as u32,
                        reply_ptr as Ptr,
                        reply_size_ptr as Ptr,
                    );
                    Ok(status.code())
                },
            )?
            .func_raw(
                "host-resume",
                |mut caller: Caller<'_, GuestState>,
                 subquery: i32,
                 reply_ptr: i32,
                 reply_size_ptr: i32|
                 -> wasmtime::Result<i32> {
                    let hooks = hooks(&caller, "host-resume")?;
                    let mut mem = CallerMemory::new(&mut caller);
                    let status = hooks.host_resume(
                        &mut mem,
                        subquery as u32,
                        reply_ptr as Ptr,
                        reply_size_ptr as Ptr,
                    );
                    Ok(status.code())
                },
            )?
            .func_raw(
                "host-push-answer",
                |mut caller: Caller<'_, GuestState>,
                 subquery: i32,
                 msg: i32,
                 size: i32|
                 -> wasmtime::Result<()> {
                    let hooks = hooks(&caller, "host-push-answer")?;
                    let mut mem = CallerMemory::new(&mut caller);
                    hooks.host_push_answer(&mut mem, subquery as u32, msg as Ptr, size as u32);
                    Ok(())
                },
            )?;
        Ok(())
    }
}
