use wasmtime::{AsContextMut, Func, Instance, Memory, Store, TypedFunc};

use crate::abi::{self, EngineAbi, MemoryAddress};
use crate::error::RuntimeError;
use crate::state::EngineState;

/// `jq_exec` is built either as `(input, filter)` or with a trailing
/// `timeout_sec` the engine does not act on.
enum ExecFunc {
    Plain(TypedFunc<(i32, i32), i32>),
    WithTimeout(TypedFunc<(i32, i32, i32), i32>),
}

impl ExecFunc {
    fn resolve(
        instance: &Instance,
        store: &mut Store<EngineState>,
        name: &'static str,
    ) -> Result<Option<Self>, RuntimeError> {
        let Some(func) = instance.get_func(&mut *store, name) else {
            return Ok(None);
        };
        let arity = func.ty(&*store).params().len();
        match arity {
            2 => Ok(Some(Self::Plain(typed(&func, store, name)?))),
            3 => Ok(Some(Self::WithTimeout(typed(&func, store, name)?))),
            n => Err(RuntimeError::SignatureMismatch {
                export: name,
                reason: format!("expected 2 or 3 parameters, found {n}"),
            }),
        }
    }

    fn call(
        &self,
        store: &mut Store<EngineState>,
        name: &'static str,
        input: MemoryAddress,
        filter: MemoryAddress,
    ) -> Result<i32, RuntimeError> {
        let outcome = match self {
            Self::Plain(f) => f.call(store, (input.as_raw(), filter.as_raw())),
            // No timeout: the call runs to completion.
            Self::WithTimeout(f) => f.call(store, (input.as_raw(), filter.as_raw(), 0)),
        };
        outcome.map_err(|e| trap(name, e))
    }
}

fn typed<P, R>(
    func: &Func,
    store: &Store<EngineState>,
    name: &'static str,
) -> Result<TypedFunc<P, R>, RuntimeError>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
{
    func.typed(store).map_err(|e| RuntimeError::SignatureMismatch {
        export: name,
        reason: e.to_string(),
    })
}

fn required<P, R>(
    instance: &Instance,
    store: &mut Store<EngineState>,
    name: &'static str,
) -> Result<TypedFunc<P, R>, RuntimeError>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
{
    let func = instance
        .get_func(&mut *store, name)
        .ok_or(RuntimeError::MissingExport(name))?;
    typed(&func, store, name)
}

fn optional<P, R>(
    instance: &Instance,
    store: &mut Store<EngineState>,
    name: &'static str,
) -> Result<Option<TypedFunc<P, R>>, RuntimeError>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
{
    match instance.get_func(&mut *store, name) {
        Some(func) => typed(&func, store, name).map(Some),
        None => Ok(None),
    }
}

fn trap(export: &'static str, err: wasmtime::Error) -> RuntimeError {
    RuntimeError::Trap {
        export,
        reason: format!("{err:#}"),
    }
}

/// Typed bindings for every export the host calls.
struct BoundaryExports {
    exec: ExecFunc,
    exec_all: Option<ExecFunc>,
    get_error: TypedFunc<(), i32>,
    free_result: TypedFunc<i32, ()>,
    has_error: TypedFunc<(), i32>,
    validate_filter: TypedFunc<i32, i32>,
    validate_json: Option<TypedFunc<i32, i32>>,
    version: TypedFunc<(), i32>,
    malloc: TypedFunc<i32, i32>,
    free: TypedFunc<i32, ()>,
}

impl BoundaryExports {
    fn resolve(instance: &Instance, store: &mut Store<EngineState>) -> Result<Self, RuntimeError> {
        Ok(Self {
            exec: ExecFunc::resolve(instance, store, abi::EXEC)?
                .ok_or(RuntimeError::MissingExport(abi::EXEC))?,
            exec_all: ExecFunc::resolve(instance, store, abi::EXEC_ALL)?,
            get_error: required(instance, store, abi::GET_ERROR)?,
            free_result: required(instance, store, abi::FREE_RESULT)?,
            has_error: required(instance, store, abi::HAS_ERROR)?,
            validate_filter: required(instance, store, abi::VALIDATE_FILTER)?,
            validate_json: optional(instance, store, abi::VALIDATE_JSON)?,
            version: required(instance, store, abi::VERSION)?,
            malloc: required(instance, store, abi::MALLOC)?,
            free: required(instance, store, abi::FREE)?,
        })
    }
}

/// One instantiated engine module with its own store and linear memory.
///
/// Created by [`crate::ModuleLoader::instantiate`]. Instances share nothing,
/// so several of them can run in parallel on different threads.
pub struct WasmEngine {
    store: Store<EngineState>,
    instance: Instance,
    memory: Memory,
    exports: BoundaryExports,
}

impl WasmEngine {
    pub(crate) fn new(
        mut store: Store<EngineState>,
        instance: Instance,
    ) -> Result<Self, RuntimeError> {
        let memory = instance
            .get_memory(&mut store, abi::MEMORY)
            .ok_or(RuntimeError::MissingExport(abi::MEMORY))?;
        let exports = BoundaryExports::resolve(&instance, &mut store)?;

        for name in abi::INITIALIZERS {
            if let Some(init) = optional::<(), ()>(&instance, &mut store, name)? {
                tracing::debug!(export = name, "running module initializer");
                init.call(store.as_context_mut(), ())
                    .map_err(|e| RuntimeError::InstantiationFailed(format!("{name}: {e:#}")))?;
                break;
            }
        }

        Ok(Self {
            store,
            instance,
            memory,
            exports,
        })
    }

    /// Current size of the engine's linear memory in bytes.
    pub fn memory_size(&self) -> usize {
        self.memory.data_size(&self.store)
    }

    /// Call a `() -> i32` export by name. Some engine builds export
    /// diagnostic counters this way.
    pub fn read_counter(&mut self, export: &'static str) -> Result<i32, RuntimeError> {
        let counter: TypedFunc<(), i32> = required(&self.instance, &mut self.store, export)?;
        counter
            .call(&mut self.store, ())
            .map_err(|e| trap(export, e))
    }

    fn out_of_bounds(addr: MemoryAddress, reason: impl Into<String>) -> RuntimeError {
        RuntimeError::OutOfBounds {
            address: addr.offset(),
            reason: reason.into(),
        }
    }
}

impl EngineAbi for WasmEngine {
    fn alloc(&mut self, len: u32) -> Result<MemoryAddress, RuntimeError> {
        let size = i32::try_from(len).map_err(|_| RuntimeError::OutOfMemory { requested: len })?;
        let raw = self
            .exports
            .malloc
            .call(&mut self.store, size)
            .map_err(|e| trap(abi::MALLOC, e))?;
        MemoryAddress::from_raw(raw).ok_or(RuntimeError::OutOfMemory { requested: len })
    }

    fn dealloc(&mut self, addr: MemoryAddress) -> Result<(), RuntimeError> {
        self.exports
            .free
            .call(&mut self.store, addr.as_raw())
            .map_err(|e| trap(abi::FREE, e))
    }

    fn write_bytes(&mut self, addr: MemoryAddress, bytes: &[u8]) -> Result<(), RuntimeError> {
        self.memory
            .write(&mut self.store, addr.offset() as usize, bytes)
            .map_err(|e| Self::out_of_bounds(addr, e.to_string()))
    }

    fn read_c_string(&self, addr: MemoryAddress) -> Result<Vec<u8>, RuntimeError> {
        let data = self.memory.data(&self.store);
        let tail = data
            .get(addr.offset() as usize..)
            .ok_or_else(|| Self::out_of_bounds(addr, format!("memory is {} bytes", data.len())))?;
        let len = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Self::out_of_bounds(addr, "string is not NUL-terminated"))?;
        Ok(tail[..len].to_vec())
    }

    fn exec(&mut self, input: MemoryAddress, filter: MemoryAddress) -> Result<i32, RuntimeError> {
        self.exports.exec.call(&mut self.store, abi::EXEC, input, filter)
    }

    fn exec_all(
        &mut self,
        input: MemoryAddress,
        filter: MemoryAddress,
    ) -> Result<i32, RuntimeError> {
        self.exports
            .exec_all
            .as_ref()
            .ok_or(RuntimeError::MissingExport(abi::EXEC_ALL))?
            .call(&mut self.store, abi::EXEC_ALL, input, filter)
    }

    fn get_error(&mut self) -> Result<i32, RuntimeError> {
        self.exports
            .get_error
            .call(&mut self.store, ())
            .map_err(|e| trap(abi::GET_ERROR, e))
    }

    fn free_result(&mut self, addr: MemoryAddress) -> Result<(), RuntimeError> {
        self.exports
            .free_result
            .call(&mut self.store, addr.as_raw())
            .map_err(|e| trap(abi::FREE_RESULT, e))
    }

    fn has_error(&mut self) -> Result<i32, RuntimeError> {
        self.exports
            .has_error
            .call(&mut self.store, ())
            .map_err(|e| trap(abi::HAS_ERROR, e))
    }

    fn validate_filter(&mut self, filter: MemoryAddress) -> Result<i32, RuntimeError> {
        self.exports
            .validate_filter
            .call(&mut self.store, filter.as_raw())
            .map_err(|e| trap(abi::VALIDATE_FILTER, e))
    }

    fn validate_json(&mut self, json: MemoryAddress) -> Result<i32, RuntimeError> {
        self.exports
            .validate_json
            .as_ref()
            .ok_or(RuntimeError::MissingExport(abi::VALIDATE_JSON))?
            .call(&mut self.store, json.as_raw())
            .map_err(|e| trap(abi::VALIDATE_JSON, e))
    }

    fn version(&mut self) -> Result<i32, RuntimeError> {
        self.exports
            .version
            .call(&mut self.store, ())
            .map_err(|e| trap(abi::VERSION, e))
    }
}
