//! Moving text across the engine boundary.
//!
//! Host strings are copied into engine memory as NUL-terminated UTF-8 for
//! the duration of one call and freed afterwards. Results come back as
//! addresses and are copied out into owned `String`s.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::abi::{self, EngineAbi, MemoryAddress};
use crate::error::RuntimeError;
use crate::lifecycle::{LifecycleStats, ResultHandle};

/// An address of a string the engine owns (version text, error buffer).
///
/// There is no way to hand one of these to the release path.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EngineStr(MemoryAddress);

impl EngineStr {
    pub(crate) fn address(self) -> MemoryAddress {
        self.0
    }
}

/// One snapshot of the engine's shared error slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ErrorState {
    pub flagged: bool,
    pub message: String,
}

static NEXT_MARSHALER_ID: AtomicU64 = AtomicU64::new(1);

/// Typed, string-level access to one engine instance.
///
/// Result handles remember the marshaler that produced them and are refused
/// by any other one.
pub struct Marshaler<A: EngineAbi> {
    pub(crate) id: u64,
    pub(crate) abi: A,
    pub(crate) stats: LifecycleStats,
}

impl<A: EngineAbi> Marshaler<A> {
    pub fn new(abi: A) -> Self {
        Self {
            id: NEXT_MARSHALER_ID.fetch_add(1, Ordering::Relaxed),
            abi,
            stats: LifecycleStats::default(),
        }
    }

    pub fn engine(&self) -> &A {
        &self.abi
    }

    pub fn into_engine(self) -> A {
        self.abi
    }

    pub fn stats(&self) -> LifecycleStats {
        self.stats
    }

    /// Run `jq_exec`. `None` means the engine produced no result and its
    /// error slot says why.
    pub fn execute(
        &mut self,
        input: &str,
        filter: &str,
    ) -> Result<Option<ResultHandle>, RuntimeError> {
        let raw = self.with_guest_strings(&[input, filter], |abi, addrs| {
            abi.exec(addrs[0], addrs[1])
        })?;
        Ok(self.acquire(raw))
    }

    /// Run `jq_exec_all`, which always yields a JSON array of every output.
    pub fn execute_all(
        &mut self,
        input: &str,
        filter: &str,
    ) -> Result<Option<ResultHandle>, RuntimeError> {
        let raw = self.with_guest_strings(&[input, filter], |abi, addrs| {
            abi.exec_all(addrs[0], addrs[1])
        })?;
        Ok(self.acquire(raw))
    }

    /// Copy a result out of engine memory. The handle stays owned by the
    /// caller and must still be released.
    pub fn decode(&self, handle: &ResultHandle) -> Result<String, RuntimeError> {
        self.check_owner(handle)?;
        self.read_string(handle.address())
    }

    pub(crate) fn check_owner(&self, handle: &ResultHandle) -> Result<(), RuntimeError> {
        if handle.owner() == self.id {
            Ok(())
        } else {
            Err(RuntimeError::ForeignHandle {
                address: handle.address().offset(),
            })
        }
    }

    pub fn validate_filter(&mut self, filter: &str) -> Result<bool, RuntimeError> {
        let raw = self.with_guest_strings(&[filter], |abi, addrs| {
            abi.validate_filter(addrs[0])
        })?;
        Ok(raw != 0)
    }

    pub fn validate_json(&mut self, json: &str) -> Result<bool, RuntimeError> {
        let raw = self.with_guest_strings(&[json], |abi, addrs| abi.validate_json(addrs[0]))?;
        Ok(raw != 0)
    }

    pub fn version(&mut self) -> Result<String, RuntimeError> {
        let raw = self.abi.version()?;
        let version = EngineStr(
            MemoryAddress::from_raw(raw).ok_or(RuntimeError::NullString(abi::VERSION))?,
        );
        self.read_string(version.address())
    }

    pub(crate) fn has_error(&mut self) -> Result<bool, RuntimeError> {
        Ok(self.abi.has_error()? != 0)
    }

    pub(crate) fn read_error_message(&mut self) -> Result<String, RuntimeError> {
        match MemoryAddress::from_raw(self.abi.get_error()?) {
            Some(addr) => self.read_string(EngineStr(addr).address()),
            None => Ok(String::new()),
        }
    }

    /// Read flag and message together. Only valid directly after a call
    /// that returned null.
    pub(crate) fn error_state(&mut self) -> Result<ErrorState, RuntimeError> {
        let flagged = self.has_error()?;
        let message = self.read_error_message()?;
        Ok(ErrorState { flagged, message })
    }

    fn acquire(&mut self, raw: i32) -> Option<ResultHandle> {
        match MemoryAddress::from_raw(raw) {
            Some(addr) => {
                self.stats.acquired += 1;
                tracing::trace!(address = ?addr, "result acquired");
                Some(ResultHandle::new(self.id, addr))
            }
            None => {
                self.stats.failed += 1;
                None
            }
        }
    }

    fn read_string(&self, addr: MemoryAddress) -> Result<String, RuntimeError> {
        let bytes = self.abi.read_c_string(addr)?;
        match String::from_utf8(bytes) {
            Ok(text) => Ok(text),
            Err(e) => {
                tracing::warn!(address = ?addr, "engine string is not valid UTF-8, decoding lossily");
                Ok(String::from_utf8_lossy(e.as_bytes()).into_owned())
            }
        }
    }

    /// Copy `values` into engine memory, run `call` with their addresses,
    /// then free them whatever `call` returned.
    fn with_guest_strings<T>(
        &mut self,
        values: &[&str],
        call: impl FnOnce(&mut A, &[MemoryAddress]) -> Result<T, RuntimeError>,
    ) -> Result<T, RuntimeError> {
        let mut addrs = Vec::with_capacity(values.len());
        let mut written = Ok(());
        for value in values {
            match write_c_string(&mut self.abi, value) {
                Ok(addr) => addrs.push(addr),
                Err(e) => {
                    written = Err(e);
                    break;
                }
            }
        }

        let result = written.and_then(|()| call(&mut self.abi, &addrs));

        for addr in addrs {
            if let Err(e) = self.abi.dealloc(addr) {
                tracing::warn!(address = ?addr, "failed to free input string: {e}");
            }
        }
        result
    }
}

fn write_c_string<A: EngineAbi>(abi: &mut A, value: &str) -> Result<MemoryAddress, RuntimeError> {
    if let Some(position) = value.bytes().position(|b| b == 0) {
        return Err(RuntimeError::InteriorNul { position });
    }
    let len = u32::try_from(value.len() + 1).map_err(|_| RuntimeError::OutOfMemory {
        requested: u32::MAX,
    })?;

    let addr = abi.alloc(len)?;
    let mut bytes = Vec::with_capacity(len as usize);
    bytes.extend_from_slice(value.as_bytes());
    bytes.push(0);
    if let Err(e) = abi.write_bytes(addr, &bytes) {
        if let Err(free_err) = abi.dealloc(addr) {
            tracing::warn!(address = ?addr, "failed to free input string: {free_err}");
        }
        return Err(e);
    }
    Ok(addr)
}
