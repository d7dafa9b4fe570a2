//! The boundary contract of the compiled filter engine.
//!
//! Every export the host may call is named here, and [`EngineAbi`] is the
//! seam between the marshaling code and whatever actually hosts the module.
//! [`crate::instance::WasmEngine`] is the wasmtime implementation; tests use
//! an in-memory fake.

use std::fmt;

use crate::error::RuntimeError;

pub const EXEC: &str = "jq_exec";
pub const EXEC_ALL: &str = "jq_exec_all";
pub const GET_ERROR: &str = "jq_get_error";
pub const FREE_RESULT: &str = "jq_free_result";
pub const HAS_ERROR: &str = "jq_has_error";
pub const VALIDATE_FILTER: &str = "jq_validate_filter";
pub const VALIDATE_JSON: &str = "jq_validate_json";
pub const VERSION: &str = "jq_wasm_version";

pub const MALLOC: &str = "malloc";
pub const FREE: &str = "free";
pub const MEMORY: &str = "memory";

/// Initializer exports, tried in order; only the first one found is called.
pub const INITIALIZERS: [&str; 2] = ["_initialize", "__wasm_call_ctors"];

/// An offset into the engine's linear memory. Never null.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryAddress(u32);

impl MemoryAddress {
    /// Interpret a raw wasm32 pointer. `0` is the null sentinel.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw as u32 {
            0 => None,
            addr => Some(Self(addr)),
        }
    }

    pub fn offset(self) -> u32 {
        self.0
    }

    pub fn as_raw(self) -> i32 {
        self.0 as i32
    }
}

impl fmt::Debug for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryAddress({:#x})", self.0)
    }
}

/// Raw calls into one engine instance.
///
/// Pointer-returning calls hand back the raw `i32` so the caller decides
/// what kind of address it is. Implementations are single-threaded: nothing
/// here may be called while another call on the same value is in flight,
/// which `&mut self` already guarantees.
pub trait EngineAbi {
    /// Allocate `len` bytes with the engine's own allocator.
    fn alloc(&mut self, len: u32) -> Result<MemoryAddress, RuntimeError>;

    /// Return an [`EngineAbi::alloc`] block to the engine allocator.
    fn dealloc(&mut self, addr: MemoryAddress) -> Result<(), RuntimeError>;

    fn write_bytes(&mut self, addr: MemoryAddress, bytes: &[u8]) -> Result<(), RuntimeError>;

    /// Copy the NUL-terminated byte sequence at `addr`, terminator excluded.
    fn read_c_string(&self, addr: MemoryAddress) -> Result<Vec<u8>, RuntimeError>;

    fn exec(&mut self, input: MemoryAddress, filter: MemoryAddress) -> Result<i32, RuntimeError>;

    fn exec_all(
        &mut self,
        _input: MemoryAddress,
        _filter: MemoryAddress,
    ) -> Result<i32, RuntimeError> {
        Err(RuntimeError::MissingExport(EXEC_ALL))
    }

    fn get_error(&mut self) -> Result<i32, RuntimeError>;

    fn free_result(&mut self, addr: MemoryAddress) -> Result<(), RuntimeError>;

    fn has_error(&mut self) -> Result<i32, RuntimeError>;

    fn validate_filter(&mut self, filter: MemoryAddress) -> Result<i32, RuntimeError>;

    fn validate_json(&mut self, _json: MemoryAddress) -> Result<i32, RuntimeError> {
        Err(RuntimeError::MissingExport(VALIDATE_JSON))
    }

    fn version(&mut self) -> Result<i32, RuntimeError>;
}
