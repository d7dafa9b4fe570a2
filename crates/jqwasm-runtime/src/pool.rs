use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use wasmtime::Module;

use crate::abi::EngineAbi;
use crate::config::JqWasmConfig;
use crate::error::{FilterError, RuntimeError};
use crate::filter::Jq;
use crate::instance::WasmEngine;
use crate::loader::ModuleLoader;

/// A fixed set of independent engine instances.
///
/// Each instance sits behind its own mutex, so calls into one instance are
/// serialized while different instances run in parallel. There is no
/// timeout: a call holds its instance until the engine returns.
pub struct JqPool<A: EngineAbi = WasmEngine> {
    instances: Vec<Mutex<Jq<A>>>,
    next: AtomicUsize,
}

impl<A: EngineAbi> JqPool<A> {
    pub fn new(instances: Vec<Jq<A>>) -> Result<Self, RuntimeError> {
        if instances.is_empty() {
            return Err(RuntimeError::EmptyPool);
        }
        Ok(Self {
            instances: instances.into_iter().map(Mutex::new).collect(),
            next: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Run `f` with exclusive access to one instance.
    ///
    /// Takes the first idle instance, starting from a rotating index. When
    /// all are busy, waits for the first one that is not poisoned.
    pub fn with_instance<T>(&self, f: impl FnOnce(&mut Jq<A>) -> T) -> Result<T, RuntimeError> {
        let mut guard = self.checkout()?;
        Ok(f(&mut *guard))
    }

    pub fn run(&self, input: &str, filter: &str) -> Result<String, FilterError> {
        self.with_instance(|jq| jq.run(input, filter))?
    }

    pub fn run_all(&self, input: &str, filter: &str) -> Result<String, FilterError> {
        self.with_instance(|jq| jq.run_all(input, filter))?
    }

    pub fn is_valid_filter(&self, filter: &str) -> Result<bool, RuntimeError> {
        self.with_instance(|jq| jq.is_valid_filter(filter))?
    }

    pub fn engine_version(&self) -> Result<String, RuntimeError> {
        self.with_instance(|jq| jq.engine_version())?
    }

    fn checkout(&self) -> Result<MutexGuard<'_, Jq<A>>, RuntimeError> {
        let len = self.instances.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed) % len;

        for offset in 0..len {
            let index = (start + offset) % len;
            match self.instances[index].try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::WouldBlock) => continue,
                Err(TryLockError::Poisoned(_)) => {
                    tracing::warn!(index, "skipping poisoned engine instance");
                    continue;
                }
            }
        }

        // Everything is busy or poisoned: wait on the first healthy one.
        let index = (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&index| !self.instances[index].is_poisoned())
            .ok_or(RuntimeError::InstancePoisoned(start))?;
        tracing::trace!(index, "all engine instances busy, waiting");
        self.instances[index]
            .lock()
            .map_err(|_| RuntimeError::InstancePoisoned(index))
    }
}

impl<A: EngineAbi + Send + 'static> JqPool<A> {
    /// Run a filter on the blocking thread pool.
    pub async fn run_async(
        self: Arc<Self>,
        input: String,
        filter: String,
    ) -> Result<String, FilterError> {
        self.spawn_blocking(move |pool| pool.run(&input, &filter)).await
    }

    pub async fn run_all_async(
        self: Arc<Self>,
        input: String,
        filter: String,
    ) -> Result<String, FilterError> {
        self.spawn_blocking(move |pool| pool.run_all(&input, &filter)).await
    }

    async fn spawn_blocking<F>(self: Arc<Self>, f: F) -> Result<String, FilterError>
    where
        F: FnOnce(&Self) -> Result<String, FilterError> + Send + 'static,
    {
        tokio::task::spawn_blocking(move || f(&self))
            .await
            .map_err(|e| RuntimeError::TaskFailed(e.to_string()))?
    }
}

impl JqPool<WasmEngine> {
    /// Compile the configured module once and instantiate `pool.size`
    /// independent instances of it.
    pub fn from_config(config: &JqWasmConfig) -> Result<Self, RuntimeError> {
        let loader = ModuleLoader::from_config(config)?;
        let module = loader.load(|name| config.locate_file(name))?;
        Self::instantiate(&loader, &module, config.pool.size)
    }

    /// Instantiate `size` independent instances of an already compiled module.
    pub fn instantiate(
        loader: &ModuleLoader,
        module: &Module,
        size: usize,
    ) -> Result<Self, RuntimeError> {
        let instances = (0..size.max(1))
            .map(|_| loader.instantiate(module).map(Jq::new))
            .collect::<Result<Vec<_>, _>>()?;
        tracing::info!(instances = instances.len(), "Engine pool ready");
        Self::new(instances)
    }
}
