use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use wasmtime::{Engine, Module};

use crate::error::RuntimeError;

const PRECOMPILED_EXT: &str = "cwasm";

/// Disk cache of compiled engine modules.
///
/// Layout under `base_dir`:
/// ```text
/// {base_dir}/
///   {sha256 of module bytes}.cwasm   - precompiled (Wasmtime serialized)
/// ```
pub struct ModuleCache {
    base_dir: PathBuf,
}

impl ModuleCache {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn default_path() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("jqwasm")
            .join("modules")
    }

    pub fn init(&self) -> Result<(), RuntimeError> {
        std::fs::create_dir_all(&self.base_dir)?;
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn cwasm_path(&self, module_hash: &str) -> PathBuf {
        self.base_dir.join(format!("{module_hash}.{PRECOMPILED_EXT}"))
    }

    /// Load a module, using the precompiled cache when it is valid.
    pub fn load_or_compile(&self, engine: &Engine, bytes: &[u8]) -> Result<Module, RuntimeError> {
        let module_hash = hash_module(bytes);
        let cwasm_path = self.cwasm_path(&module_hash);

        if cwasm_path.exists() {
            match self.load_precompiled(&cwasm_path, engine) {
                Ok(cached) => {
                    tracing::debug!(module_hash, "Loaded from precompiled cache");
                    return Ok(cached);
                }
                Err(e) => {
                    tracing::debug!(module_hash, "Precompiled cache invalid, recompiling: {e}");
                }
            }
        }

        let module = Module::new(engine, bytes)
            .map_err(|e| RuntimeError::CompilationFailed(format!("{e:#}")))?;

        match module.serialize() {
            Ok(serialized) => match std::fs::write(&cwasm_path, serialized) {
                Ok(()) => tracing::debug!(module_hash, "Saved precompiled cache"),
                Err(e) => tracing::warn!(module_hash, "Cannot write precompiled cache: {e}"),
            },
            Err(e) => tracing::warn!(module_hash, "Cannot serialize module: {e}"),
        }

        Ok(module)
    }

    fn load_precompiled(&self, path: &Path, engine: &Engine) -> wasmtime::Result<Module> {
        // SAFETY: cwasm files in this directory are only written by
        // `load_or_compile`, from `Module::serialize`. Wasmtime rejects files
        // produced by another version or an incompatible engine config.
        unsafe { Module::deserialize_file(engine, path) }
    }
}

/// SHA-256 hex of a module's bytes.
pub fn hash_module(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
