use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::cache::ModuleCache;
use crate::error::RuntimeError;
use crate::loader::MODULE_FILE_NAME;

/// Overrides the configured module location when set.
pub const MODULE_ENV: &str = "JQWASM_MODULE";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JqWasmConfig {
    #[serde(default)]
    pub module: ModuleConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModuleConfig {
    /// Directory the engine's files are located in.
    #[serde(default = "default_module_dir")]
    pub dir: PathBuf,
    /// File name of the engine module inside `dir`.
    #[serde(default = "default_module_file")]
    pub file: String,
}

fn default_module_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_module_file() -> String {
    MODULE_FILE_NAME.into()
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            dir: default_module_dir(),
            file: default_module_file(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    pub dir: Option<PathBuf>,
}

fn default_cache_enabled() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Number of independent engine instances.
    #[serde(default = "default_pool_size")]
    pub size: usize,
}

fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
        }
    }
}

impl JqWasmConfig {
    pub fn from_file(path: &Path) -> Result<Self, RuntimeError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, RuntimeError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| RuntimeError::InvalidConfig(format!("Failed to parse config: {e}")))?;
        if config.pool.size == 0 {
            return Err(RuntimeError::InvalidConfig(
                "pool.size must be at least 1".into(),
            ));
        }
        Ok(config)
    }

    /// Resolve a file the loader asks for, the way a `locateFile` hook
    /// would. The engine module itself honours `JQWASM_MODULE`.
    pub fn locate_file(&self, name: &str) -> PathBuf {
        if name == MODULE_FILE_NAME {
            if let Some(path) = std::env::var_os(MODULE_ENV) {
                return PathBuf::from(path);
            }
            return self.module.dir.join(&self.module.file);
        }
        self.module.dir.join(name)
    }

    /// The module cache to use, if caching is on.
    pub fn module_cache(&self) -> Option<ModuleCache> {
        if !self.cache.enabled {
            return None;
        }
        let dir = self
            .cache
            .dir
            .clone()
            .unwrap_or_else(ModuleCache::default_path);
        Some(ModuleCache::new(dir))
    }
}
