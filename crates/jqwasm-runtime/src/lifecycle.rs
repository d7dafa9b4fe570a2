//! Exactly-once release of engine result buffers.
//!
//! Every non-null address returned by `jq_exec` / `jq_exec_all` is wrapped in
//! a [`ResultHandle`]. A handle can only be released by value, so releasing
//! twice does not compile, and [`ScopedResult`] releases on every exit path
//! including `?` returns and unwinding.

use std::mem::ManuallyDrop;

use crate::abi::{EngineAbi, MemoryAddress};
use crate::error::{FilterError, RuntimeError};
use crate::marshal::Marshaler;

/// A caller-owned result buffer inside engine memory.
#[must_use = "result handles must be released back to the engine"]
#[derive(Debug)]
pub struct ResultHandle {
    owner: u64,
    addr: MemoryAddress,
}

impl ResultHandle {
    pub(crate) fn new(owner: u64, addr: MemoryAddress) -> Self {
        Self { owner, addr }
    }

    pub fn address(&self) -> MemoryAddress {
        self.addr
    }

    pub(crate) fn owner(&self) -> u64 {
        self.owner
    }

    fn into_address(self) -> MemoryAddress {
        let addr = self.addr;
        std::mem::forget(self);
        addr
    }
}

impl Drop for ResultHandle {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        tracing::error!(address = ?self.addr, "result handle dropped without release, engine memory leaked");
        debug_assert!(false, "result handle {:?} leaked", self.addr);
    }
}

/// Counters for result buffers handed out by one engine instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleStats {
    /// Non-null results returned by the engine.
    pub acquired: u64,
    pub released: u64,
    /// Calls that returned the null sentinel.
    pub failed: u64,
}

impl LifecycleStats {
    pub fn outstanding(&self) -> u64 {
        self.acquired.saturating_sub(self.released)
    }
}

/// Hand a result buffer back to the engine.
pub fn release<A: EngineAbi>(
    marshaler: &mut Marshaler<A>,
    handle: ResultHandle,
) -> Result<(), RuntimeError> {
    marshaler.release(handle)
}

impl<A: EngineAbi> Marshaler<A> {
    /// A handle from another instance is never freed here: its address
    /// means nothing in this engine's heap. It is leaked and reported.
    pub(crate) fn release(&mut self, handle: ResultHandle) -> Result<(), RuntimeError> {
        if let Err(e) = self.check_owner(&handle) {
            return Err(leak_foreign(handle, e));
        }
        let addr = handle.into_address();
        // Counted before the call: a trapping free must not be retried.
        self.stats.released += 1;
        tracing::trace!(address = ?addr, "result released");
        self.abi.free_result(addr)
    }
}

fn leak_foreign(handle: ResultHandle, err: RuntimeError) -> RuntimeError {
    tracing::error!(
        address = ?handle.address(),
        "result handle used with another engine instance, leaking it"
    );
    handle.into_address();
    err
}

/// A result handle bound to the instance that produced it.
pub struct ScopedResult<'m, A: EngineAbi> {
    marshaler: &'m mut Marshaler<A>,
    handle: ManuallyDrop<ResultHandle>,
}

impl<'m, A: EngineAbi> ScopedResult<'m, A> {
    pub fn address(&self) -> MemoryAddress {
        self.handle.address()
    }

    /// Copy the result text out. Must happen before the release.
    pub fn decode(&self) -> Result<String, RuntimeError> {
        self.marshaler.decode(&self.handle)
    }

    /// Release now and report failure, instead of logging it on drop.
    pub fn release(self) -> Result<(), RuntimeError> {
        let mut this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so the handle is taken exactly once.
        let handle = unsafe { ManuallyDrop::take(&mut this.handle) };
        this.marshaler.release(handle)
    }
}

impl<A: EngineAbi> Drop for ScopedResult<'_, A> {
    fn drop(&mut self) {
        // SAFETY: `release` bypasses this drop, so the handle is still here
        // and is not touched again after this point.
        let handle = unsafe { ManuallyDrop::take(&mut self.handle) };
        if let Err(e) = self.marshaler.release(handle) {
            tracing::error!("failed to release result buffer: {e}");
        }
    }
}

/// Run `body` against the outcome of an execute call.
///
/// A non-null handle arrives as a [`ScopedResult`] that is released however
/// `body` exits. A null handle never reaches the release path: the engine's
/// error slot is read right here, before anything else can overwrite it,
/// and handed to `body` as a [`FilterError`].
pub fn with_result<A, T>(
    marshaler: &mut Marshaler<A>,
    handle: Option<ResultHandle>,
    body: impl FnOnce(Result<ScopedResult<'_, A>, FilterError>) -> T,
) -> T
where
    A: EngineAbi,
{
    match handle {
        Some(handle) => {
            if let Err(e) = marshaler.check_owner(&handle) {
                return body(Err(FilterError::Runtime(leak_foreign(handle, e))));
            }
            body(Ok(ScopedResult {
                marshaler,
                handle: ManuallyDrop::new(handle),
            }))
        }
        None => {
            let err = match marshaler.error_state() {
                Ok(state) => {
                    if !state.flagged {
                        tracing::warn!(
                            message = %state.message,
                            "engine returned null without raising its error flag"
                        );
                    }
                    FilterError::from_engine_message(state.message)
                }
                Err(e) => FilterError::Runtime(e),
            };
            tracing::debug!(error = %err, "filter call failed");
            body(Err(err))
        }
    }
}
