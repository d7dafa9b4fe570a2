use std::path::{Path, PathBuf};

use wasmtime::{Config, Engine, Linker, Module, OptLevel, Store};

use crate::cache::ModuleCache;
use crate::config::JqWasmConfig;
use crate::error::RuntimeError;
use crate::instance::WasmEngine;
use crate::state::EngineState;

/// Name the loader asks the locate callback for.
pub const MODULE_FILE_NAME: &str = "jq.wasm";

/// Compiles and instantiates the engine module.
///
/// The wasmtime `Engine` and the linker are built once and shared by every
/// instance created from this loader. The linker carries WASI preview1 host
/// functions; any other import the module declares becomes a trap.
pub struct ModuleLoader {
    engine: Engine,
    linker: Linker<EngineState>,
    cache: Option<ModuleCache>,
}

impl ModuleLoader {
    pub fn new(cache: Option<ModuleCache>) -> Result<Self, RuntimeError> {
        let mut config = Config::new();
        config.cranelift_opt_level(OptLevel::Speed);

        let engine = Engine::new(&config)
            .map_err(|e| RuntimeError::InstantiationFailed(format!("wasmtime engine: {e:#}")))?;
        let mut linker: Linker<EngineState> = Linker::new(&engine);

        wasmtime_wasi::preview1::add_to_linker_sync(&mut linker, |state: &mut EngineState| {
            &mut state.wasi
        })
        .map_err(|e| RuntimeError::InstantiationFailed(format!("WASI linker: {e:#}")))?;

        // Emscripten notifies the host after growing memory; nothing to do,
        // memory views are taken fresh on every access.
        linker
            .func_wrap("env", "emscripten_notify_memory_growth", |_index: i32| {})
            .map_err(|e| RuntimeError::InstantiationFailed(format!("env linker: {e:#}")))?;

        if let Some(cache) = &cache {
            cache.init()?;
        }

        tracing::debug!(cached = cache.is_some(), "ModuleLoader initialized (WASI p1)");

        Ok(Self {
            engine,
            linker,
            cache,
        })
    }

    pub fn from_config(config: &JqWasmConfig) -> Result<Self, RuntimeError> {
        Self::new(config.module_cache())
    }

    /// Compile a module from binary or text form.
    pub fn compile(&self, bytes: &[u8]) -> Result<Module, RuntimeError> {
        match &self.cache {
            Some(cache) => cache.load_or_compile(&self.engine, bytes),
            None => Module::new(&self.engine, bytes)
                .map_err(|e| RuntimeError::CompilationFailed(format!("{e:#}"))),
        }
    }

    pub fn load_path(&self, path: &Path) -> Result<Module, RuntimeError> {
        let bytes = std::fs::read(path).map_err(|e| {
            RuntimeError::ModuleNotFound(format!("Cannot read {}: {e}", path.display()))
        })?;
        tracing::info!(path = %path.display(), bytes = bytes.len(), "Loading engine module");
        self.compile(&bytes)
    }

    /// Load the engine, asking `locate_file` where [`MODULE_FILE_NAME`] lives.
    pub fn load<F>(&self, locate_file: F) -> Result<Module, RuntimeError>
    where
        F: Fn(&str) -> PathBuf,
    {
        self.load_path(&locate_file(MODULE_FILE_NAME))
    }

    /// Create a fresh, independent engine instance.
    pub fn instantiate(&self, module: &Module) -> Result<WasmEngine, RuntimeError> {
        let mut store = Store::new(&self.engine, EngineState::new());

        let mut linker = self.linker.clone();
        linker
            .define_unknown_imports_as_traps(module)
            .map_err(|e| RuntimeError::InstantiationFailed(format!("{e:#}")))?;

        let instance = linker
            .instantiate(&mut store, module)
            .map_err(|e| RuntimeError::InstantiationFailed(format!("{e:#}")))?;

        let engine = WasmEngine::new(store, instance)?;
        tracing::debug!(memory_bytes = engine.memory_size(), "Engine instance ready");
        Ok(engine)
    }
}
