//! WASM plugin runtime.
//!
//! Manages the Wasmtime engine and linker, and turns plugin definitions into
//! long-lived instances. Each instance owns its store; calls are serialized
//! through a mutex and metered with a per-call fuel budget.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ingestion_sdk::protocol::{self, EXPORT_ALLOC, EXPORT_DEALLOC, EXPORT_MEMORY, ErrorReply};
use tokio::sync::Mutex;
use tracing::debug;
use wasmtime::{
    Config, Engine, Instance, Linker, Memory, Module, Store, StoreLimits, StoreLimitsBuilder,
    Trap, TypedFunc,
};

use super::error::{InvocationError, PluginError};
use super::handle::{EntryPoint, MethodTable, Sandbox, SandboxInstance};
use super::manifest::PluginManifest;
use crate::host::{read_string_from_memory, write_string_to_memory};
use crate::models::ExtensionDefinition;

/// Per-store state visible to host functions.
pub struct PluginState {
    /// Plugin name, attached to forwarded log lines.
    pub plugin: String,
    limits: StoreLimits,
}

impl PluginState {
    /// Create a new plugin state.
    pub fn new(plugin: impl Into<String>, max_memory_pages: u64) -> Self {
        Self {
            plugin: plugin.into(),
            limits: StoreLimitsBuilder::new()
                .memory_size(max_memory_pages as usize * 65536)
                .instances(1)
                .build(),
        }
    }
}

/// Configuration for the plugin runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Maximum memory pages per instance (64KB per page).
    pub max_memory_pages: u64,
    /// Fuel available to each call.
    pub fuel_per_call: u64,
    /// Fuel consumed between cooperative yields to the executor.
    pub yield_interval: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_memory_pages: 1024, // 64MB max per instance
            fuel_per_call: 1_000_000_000,
            yield_interval: 100_000,
        }
    }
}

/// Sandbox backed by Wasmtime.
pub struct WasmSandbox {
    engine: Engine,
    linker: Arc<Linker<PluginState>>,
    config: RuntimeConfig,
}

impl WasmSandbox {
    /// Create a new runtime with the given configuration.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let engine = create_engine()?;
        let linker = create_linker(&engine)?;

        Ok(Self {
            engine,
            linker: Arc::new(linker),
            config,
        })
    }

    /// Get the Wasmtime engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

#[async_trait]
impl Sandbox for WasmSandbox {
    async fn instantiate(
        &self,
        definition: &ExtensionDefinition,
        manifest: Option<&PluginManifest>,
    ) -> Result<Arc<dyn SandboxInstance>, PluginError> {
        let plugin = definition.name.as_str();
        if definition.source.wasm.is_empty() {
            return Err(PluginError::missing_wasm(plugin));
        }

        let module = Module::new(&self.engine, &definition.source.wasm).map_err(|e| {
            PluginError::CompilationFailed {
                plugin: plugin.to_string(),
                details: format!("{e:#}"),
            }
        })?;

        let methods =
            MethodTable::from_exports(plugin, module.exports().map(|e| e.name()), manifest)?;

        let mut store = Store::new(
            &self.engine,
            PluginState::new(plugin, self.config.max_memory_pages),
        );
        store.limiter(|state| &mut state.limits);
        store
            .set_fuel(self.config.fuel_per_call)
            .map_err(|e| PluginError::instantiation(plugin, e))?;
        store
            .fuel_async_yield_interval(Some(self.config.yield_interval))
            .map_err(|e| PluginError::instantiation(plugin, e))?;

        let instance = self
            .linker
            .instantiate_async(&mut store, &module)
            .await
            .map_err(|e| PluginError::instantiation(plugin, e))?;

        let memory = instance
            .get_memory(&mut store, EXPORT_MEMORY)
            .ok_or_else(|| PluginError::instantiation(plugin, "module does not export memory"))?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, EXPORT_ALLOC)
            .map_err(|e| PluginError::instantiation(plugin, e))?;
        let dealloc = instance
            .get_typed_func::<(i32, i32), ()>(&mut store, EXPORT_DEALLOC)
            .ok();

        debug!(plugin = %plugin, methods = ?methods, "instantiated plugin");

        Ok(Arc::new(WasmInstance {
            methods,
            fuel_per_call: self.config.fuel_per_call,
            loaded: Mutex::new(Some(Loaded {
                store,
                instance,
                memory,
                alloc,
                dealloc,
            })),
        }))
    }
}

struct Loaded {
    store: Store<PluginState>,
    instance: Instance,
    memory: Memory,
    alloc: TypedFunc<i32, i32>,
    dealloc: Option<TypedFunc<(i32, i32), ()>>,
}

/// One instantiated plugin module.
pub struct WasmInstance {
    methods: MethodTable,
    fuel_per_call: u64,
    loaded: Mutex<Option<Loaded>>,
}

impl WasmInstance {
    fn trap(&self, e: impl Into<anyhow::Error>) -> InvocationError {
        let e: anyhow::Error = e.into();
        if e.downcast_ref::<Trap>() == Some(&Trap::OutOfFuel) {
            InvocationError::OutOfFuel {
                fuel: self.fuel_per_call,
            }
        } else {
            InvocationError::Trapped(format!("{e:#}"))
        }
    }
}

#[async_trait]
impl SandboxInstance for WasmInstance {
    fn methods(&self) -> &MethodTable {
        &self.methods
    }

    async fn call(
        &self,
        entry: &EntryPoint,
        input: Option<String>,
    ) -> Result<Option<String>, InvocationError> {
        let mut guard = self.loaded.lock().await;
        let loaded = guard.as_mut().ok_or(InvocationError::PoolClosed)?;
        let Loaded {
            store,
            instance,
            memory,
            alloc,
            dealloc,
        } = loaded;

        store
            .set_fuel(self.fuel_per_call)
            .map_err(|e| self.trap(e))?;

        let func = instance
            .get_typed_func::<(i32, i32), i64>(&mut *store, &entry.export)
            .map_err(|_| InvocationError::MissingEntryPoint {
                name: entry.export.clone(),
            })?;

        let (in_ptr, in_len) = match input.as_deref() {
            Some(json) if !json.is_empty() => {
                let len = i32::try_from(json.len())
                    .map_err(|_| InvocationError::Malformed("input too large".to_string()))?;
                let ptr = alloc
                    .call_async(&mut *store, len)
                    .await
                    .map_err(|e| self.trap(e))?;
                write_string_to_memory(memory, &mut *store, ptr, len, json)
                    .map_err(|e| self.trap(e))?;
                (ptr, len)
            }
            _ => (0, 0),
        };

        let packed = func
            .call_async(&mut *store, (in_ptr, in_len))
            .await
            .map_err(|e| self.trap(e))?;

        if in_len > 0 {
            free(dealloc, store, in_ptr, in_len)
                .await
                .map_err(|e| self.trap(e))?;
        }

        let (out_ptr, out_len) = protocol::unpack(packed);
        if out_len == 0 {
            return Ok(None);
        }

        let out_ptr = out_ptr as i32;
        let byte_len = out_len.checked_abs().unwrap_or(i32::MAX);
        let reply = read_string_from_memory(memory, &*store, out_ptr, byte_len)
            .map_err(|e| InvocationError::Malformed(format!("{e:#}")))?;

        free(dealloc, store, out_ptr, byte_len)
            .await
            .map_err(|e| self.trap(e))?;

        if out_len < 0 {
            let error: ErrorReply = serde_json::from_str(&reply)
                .map_err(|e| InvocationError::Malformed(format!("error reply: {e}")))?;
            return Err(InvocationError::Raised {
                message: error.error,
                retriable: error.retriable,
            });
        }

        Ok(Some(reply))
    }

    async fn dispose(&self) {
        self.loaded.lock().await.take();
    }
}

async fn free(
    dealloc: &Option<TypedFunc<(i32, i32), ()>>,
    store: &mut Store<PluginState>,
    ptr: i32,
    len: i32,
) -> wasmtime::Result<()> {
    match dealloc {
        Some(dealloc) => dealloc.call_async(store, (ptr, len)).await,
        None => Ok(()),
    }
}

/// Creates a Wasmtime Engine with async support and fuel metering.
fn create_engine() -> Result<Engine> {
    let mut wasmtime_config = Config::new();

    // Host calls and fuel yields run on the tokio executor.
    wasmtime_config.async_support(true);
    wasmtime_config.consume_fuel(true);

    // Optimize for speed
    wasmtime_config.cranelift_opt_level(wasmtime::OptLevel::Speed);

    Engine::new(&wasmtime_config)
        .map_err(anyhow::Error::from)
        .context("failed to create wasmtime engine")
}

/// Creates a Linker with host function bindings and WASI stubs.
fn create_linker(engine: &Engine) -> Result<Linker<PluginState>> {
    let mut linker = Linker::new(engine);

    add_wasi_stubs(&mut linker)?;
    crate::host::register_all(&mut linker)?;

    Ok(linker)
}

/// Add minimal WASI stubs for wasi_snapshot_preview1.
///
/// Plugins compiled for wasm32-wasip1 import a handful of these even when
/// they never touch files or the environment.
fn add_wasi_stubs(linker: &mut Linker<PluginState>) -> Result<()> {
    // fd_write(fd, iovs, iovs_len, nwritten) -> errno
    linker.func_wrap(
        "wasi_snapshot_preview1",
        "fd_write",
        |_fd: i32, _iovs: i32, _iovs_len: i32, _nwritten: i32| -> i32 {
            52 // ENOSYS
        },
    )?;

    // random_get(buf, buf_len) -> errno
    linker.func_wrap(
        "wasi_snapshot_preview1",
        "random_get",
        |mut caller: wasmtime::Caller<'_, PluginState>, buf: i32, buf_len: i32| -> i32 {
            let Some(wasmtime::Extern::Memory(memory)) = caller.get_export(EXPORT_MEMORY) else {
                return 8; // EBADF
            };
            let data = memory.data_mut(&mut caller);
            let buf = buf as usize;
            let len = buf_len as usize;
            if buf + len > data.len() {
                return 21; // EFAULT
            }
            let seed = uuid::Uuid::now_v7();
            let seed = seed.as_bytes();
            for i in 0..len {
                data[buf + i] = seed[i % seed.len()] ^ ((i as u8).wrapping_mul(31));
            }
            0
        },
    )?;

    // clock_time_get(clock_id, precision, time) -> errno
    linker.func_wrap(
        "wasi_snapshot_preview1",
        "clock_time_get",
        |mut caller: wasmtime::Caller<'_, PluginState>,
         _clock_id: i32,
         _precision: i64,
         time_ptr: i32|
         -> i32 {
            let Some(wasmtime::Extern::Memory(memory)) = caller.get_export(EXPORT_MEMORY) else {
                return 8; // EBADF
            };
            let nanos = chrono::Utc::now()
                .timestamp_nanos_opt()
                .unwrap_or_default()
                .max(0) as u64;
            let data = memory.data_mut(&mut caller);
            let ptr = time_ptr as usize;
            if ptr + 8 > data.len() {
                return 21; // EFAULT
            }
            data[ptr..ptr + 8].copy_from_slice(&nanos.to_le_bytes());
            0
        },
    )?;

    // environ_get(environ, environ_buf) -> errno
    linker.func_wrap(
        "wasi_snapshot_preview1",
        "environ_get",
        |_environ: i32, _environ_buf: i32| -> i32 { 0 },
    )?;

    // environ_sizes_get(environ_count, environ_buf_size) -> errno
    linker.func_wrap(
        "wasi_snapshot_preview1",
        "environ_sizes_get",
        |mut caller: wasmtime::Caller<'_, PluginState>, count_ptr: i32, size_ptr: i32| -> i32 {
            let Some(wasmtime::Extern::Memory(memory)) = caller.get_export(EXPORT_MEMORY) else {
                return 8; // EBADF
            };
            let data = memory.data_mut(&mut caller);
            let count_ptr = count_ptr as usize;
            let size_ptr = size_ptr as usize;
            if count_ptr + 4 > data.len() || size_ptr + 4 > data.len() {
                return 21; // EFAULT
            }
            data[count_ptr..count_ptr + 4].copy_from_slice(&0u32.to_le_bytes());
            data[size_ptr..size_ptr + 4].copy_from_slice(&0u32.to_le_bytes());
            0
        },
    )?;

    // Plugins cannot exit the host process.
    linker.func_wrap("wasi_snapshot_preview1", "proc_exit", |_code: i32| {})?;

    Ok(())
}
