//! Wasmtime-backed engine instances.
//!
//! Compiling the engine image is expensive, so it happens once per process
//! through [`load`]. Each [`WasmGuest`] is then an independent instance with
//! its own store, linear memory, console and WASI descriptor table.

use super::linker::{trap, BridgeProvider, GuestState, HostLinkerBuilder, LinkerError};
use super::wasi::{ProcExit, WasiConfig, WasiCtx, WasiProvider};
use super::{Console, Guest, GuestMemory, HostHooks, Ptr, SubqueryHandle};
use crate::error::GuestError;
use std::sync::{Arc, OnceLock};
use wasmtime::{Engine, Extern, Linker, Memory, Module, Store, TypedFunc};

static IMAGE: OnceLock<WasmModule> = OnceLock::new();

/// Compile the engine image for this process.
///
/// Later calls return the image compiled by the first one.
pub fn load(bytes: &[u8]) -> Result<&'static WasmModule, GuestError> {
    if let Some(image) = IMAGE.get() {
        return Ok(image);
    }
    let compiled = WasmModule::compile(bytes)?;
    Ok(IMAGE.get_or_init(|| compiled))
}

/// The process-wide image, if [`load`] has run.
pub fn loaded() -> Option<&'static WasmModule> {
    IMAGE.get()
}

/// A compiled engine module.
#[derive(Clone)]
pub struct WasmModule {
    engine: Engine,
    module: Module,
}

impl WasmModule {
    /// Compile a module from wasm or wat bytes.
    pub fn compile(bytes: &[u8]) -> Result<Self, GuestError> {
        let engine = Engine::default();
        let module = Module::new(&engine, bytes).map_err(|e| trap("compile", e))?;
        Ok(Self { engine, module })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn instantiate(&self, wasi: WasiConfig) -> Result<WasmGuest, GuestError> {
        self.instantiate_with(wasi, |_| Ok(()))
    }

    /// Instantiate, letting `configure` add or shadow imports after the
    /// built-in providers. Imports still unresolved after that trap when
    /// called.
    pub fn instantiate_with<F>(&self, wasi: WasiConfig, configure: F) -> Result<WasmGuest, GuestError>
    where
        F: FnOnce(&mut HostLinkerBuilder<'_, GuestState>) -> Result<(), LinkerError>,
    {
        let mut linker = Linker::<GuestState>::new(&self.engine);
        linker.allow_shadowing(true);
        let mut builder = HostLinkerBuilder::new(&mut linker);
        builder
            .register_provider(&BridgeProvider)?
            .register_provider(&WasiProvider)?;
        configure(&mut builder)?;
        linker
            .define_unknown_imports_as_traps(&self.module)
            .map_err(|e| trap("link", e))?;

        let console = Console::new();
        let mut store = Store::new(&self.engine, GuestState::new(wasi, console.clone()));
        let instance = linker
            .instantiate(&mut store, &self.module)
            .map_err(|e| trap("instantiate", e))?;

        if let Some(start) = instance.get_func(&mut store, "_start") {
            let start = start
                .typed::<(), ()>(&store)
                .map_err(|e| trap("_start", e))?;
            match start.call(&mut store, ()) {
                Ok(()) => {}
                Err(e) => match e.downcast_ref::<ProcExit>() {
                    Some(ProcExit(0)) => {}
                    Some(ProcExit(code)) => {
                        return Err(GuestError::Code {
                            context: "_start".into(),
                            code: *code,
                        })
                    }
                    None => return Err(trap("_start", e)),
                },
            }
        }

        let memory = match instance.get_export(&mut store, "memory") {
            Some(Extern::Memory(memory)) => memory,
            _ => return Err(GuestError::MissingExport("memory".into())),
        };

        macro_rules! export {
            ($name:literal) => {
                instance
                    .get_typed_func(&mut store, $name)
                    .map_err(|_| GuestError::MissingExport($name.into()))?
            };
        }

        let exports = Exports {
            realloc: export!("canonical_abi_realloc"),
            free: export!("canonical_abi_free"),
            global: export!("pl_global"),
            query: export!("pl_query"),
            redo: export!("pl_redo"),
            done: export!("pl_done"),
            status: export!("get_status"),
            error: export!("get_error"),
            did_yield: export!("pl_did_yield"),
            yield_at: export!("pl_yield_at"),
            consult: export!("pl_consult"),
        };

        let pl = exports
            .global
            .call(&mut store, ())
            .map_err(|e| trap("pl_global", e))?;
        log::debug!("engine instantiated, pl={pl:#x}");

        Ok(WasmGuest {
            store,
            memory,
            pl,
            exports,
            console,
        })
    }
}

struct Exports {
    realloc: TypedFunc<(i32, i32, i32, i32), i32>,
    free: TypedFunc<(i32, i32, i32), ()>,
    global: TypedFunc<(), i32>,
    query: TypedFunc<(i32, i32, i32, i32), i32>,
    redo: TypedFunc<i32, i32>,
    done: TypedFunc<i32, ()>,
    status: TypedFunc<i32, i32>,
    error: TypedFunc<i32, i32>,
    did_yield: TypedFunc<i32, i32>,
    yield_at: TypedFunc<(i32, i32), ()>,
    consult: TypedFunc<(i32, i32), i32>,
}

/// One engine instance.
pub struct WasmGuest {
    store: Store<GuestState>,
    memory: Memory,
    /// Engine pointer from `pl_global`.
    pl: i32,
    exports: Exports,
    console: Console,
}

impl WasmGuest {
    /// Instantiate the process-wide image from [`load`].
    pub fn instantiate(wasi: WasiConfig) -> Result<Self, GuestError> {
        loaded().ok_or(GuestError::NotLoaded)?.instantiate(wasi)
    }

    pub fn wasi(&self) -> &WasiCtx {
        self.store.data().wasi()
    }
}

impl GuestMemory for WasmGuest {
    fn realloc(&mut self, ptr: Ptr, old_size: u32, align: u32, new_size: u32) -> Result<Ptr, GuestError> {
        let out = self
            .exports
            .realloc
            .call(
                &mut self.store,
                (ptr as i32, old_size as i32, align as i32, new_size as i32),
            )
            .map_err(|e| trap("canonical_abi_realloc", e))?;
        Ok(out as Ptr)
    }

    fn free(&mut self, ptr: Ptr, size: u32, align: u32) -> Result<(), GuestError> {
        self.exports
            .free
            .call(&mut self.store, (ptr as i32, size as i32, align as i32))
            .map_err(|e| trap("canonical_abi_free", e))
    }

    fn read(&mut self, ptr: Ptr, buf: &mut [u8]) -> Result<(), GuestError> {
        self.memory
            .read(&self.store, ptr as usize, buf)
            .map_err(|_| GuestError::OutOfBounds { ptr, len: buf.len() })
    }

    fn write(&mut self, ptr: Ptr, data: &[u8]) -> Result<(), GuestError> {
        self.memory
            .write(&mut self.store, ptr as usize, data)
            .map_err(|_| GuestError::OutOfBounds { ptr, len: data.len() })
    }

    fn memory_size(&mut self) -> usize {
        self.memory.data_size(&self.store)
    }
}

impl Guest for WasmGuest {
    fn attach(&mut self, hooks: Arc<dyn HostHooks>) {
        self.store.data_mut().hooks = Some(hooks);
    }

    fn query(&mut self, goal: Ptr, subquery_out: Ptr, autoyield_ms: u32) -> Result<bool, GuestError> {
        let ok = self
            .exports
            .query
            .call(
                &mut self.store,
                (self.pl, goal as i32, subquery_out as i32, autoyield_ms as i32),
            )
            .map_err(|e| trap("pl_query", e))?;
        Ok(ok != 0)
    }

    fn redo(&mut self, subquery: SubqueryHandle) -> Result<bool, GuestError> {
        let ok = self
            .exports
            .redo
            .call(&mut self.store, subquery.raw() as i32)
            .map_err(|e| trap("pl_redo", e))?;
        Ok(ok != 0)
    }

    fn done(&mut self, subquery: SubqueryHandle) -> Result<(), GuestError> {
        self.exports
            .done
            .call(&mut self.store, subquery.raw() as i32)
            .map_err(|e| trap("pl_done", e))
    }

    fn status(&mut self) -> Result<bool, GuestError> {
        let ok = self
            .exports
            .status
            .call(&mut self.store, self.pl)
            .map_err(|e| trap("get_status", e))?;
        Ok(ok != 0)
    }

    fn error(&mut self) -> Result<bool, GuestError> {
        let err = self
            .exports
            .error
            .call(&mut self.store, self.pl)
            .map_err(|e| trap("get_error", e))?;
        Ok(err != 0)
    }

    fn did_yield(&mut self, subquery: SubqueryHandle) -> Result<bool, GuestError> {
        let yielded = self
            .exports
            .did_yield
            .call(&mut self.store, subquery.raw() as i32)
            .map_err(|e| trap("pl_did_yield", e))?;
        Ok(yielded != 0)
    }

    fn yield_at(&mut self, subquery: SubqueryHandle, ms: u32) -> Result<(), GuestError> {
        self.exports
            .yield_at
            .call(&mut self.store, (subquery.raw() as i32, ms as i32))
            .map_err(|e| trap("pl_yield_at", e))
    }

    fn consult(&mut self, filename: Ptr) -> Result<bool, GuestError> {
        let ok = self
            .exports
            .consult
            .call(&mut self.store, (self.pl, filename as i32))
            .map_err(|e| trap("pl_consult", e))?;
        Ok(ok != 0)
    }

    fn console(&self) -> &Console {
        &self.console
    }
}
