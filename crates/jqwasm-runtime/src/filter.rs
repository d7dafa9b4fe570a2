use crate::abi::EngineAbi;
use crate::error::{FilterError, RuntimeError};
use crate::instance::WasmEngine;
use crate::lifecycle::{self, LifecycleStats, ResultHandle};
use crate::marshal::Marshaler;

/// A jq filter engine instance.
///
/// Every operation takes `&mut self`, so one instance serves one caller at a
/// time. Use [`crate::JqPool`] to filter from several threads.
///
/// A `run` call goes `Idle -> Invoked -> Succeeded | Failed -> Idle`: the
/// result is decoded and released, or the error slot is read, before the
/// call returns. Nothing reads the error slot after a successful call.
pub struct Jq<A: EngineAbi = WasmEngine> {
    marshaler: Marshaler<A>,
}

impl<A: EngineAbi> Jq<A> {
    pub fn new(engine: A) -> Self {
        Self {
            marshaler: Marshaler::new(engine),
        }
    }

    /// Apply `filter` to `input`.
    ///
    /// Zero outputs come back as `null`, one output as itself, several as a
    /// JSON array (the engine's own folding).
    pub fn run(&mut self, input: &str, filter: &str) -> Result<String, FilterError> {
        tracing::debug!(filter, input_len = input.len(), "running filter");
        let handle = self.marshaler.execute(input, filter)?;
        self.finish(handle)
    }

    /// Like [`Jq::run`], but always returns a JSON array of every output.
    pub fn run_all(&mut self, input: &str, filter: &str) -> Result<String, FilterError> {
        tracing::debug!(
            filter,
            input_len = input.len(),
            "running filter, collecting all outputs"
        );
        let handle = self.marshaler.execute_all(input, filter)?;
        self.finish(handle)
    }

    /// Whether `filter` compiles. A bad filter is `Ok(false)`, not an error.
    pub fn is_valid_filter(&mut self, filter: &str) -> Result<bool, RuntimeError> {
        self.marshaler.validate_filter(filter)
    }

    pub fn is_valid_json(&mut self, json: &str) -> Result<bool, RuntimeError> {
        self.marshaler.validate_json(json)
    }

    pub fn engine_version(&mut self) -> Result<String, RuntimeError> {
        self.marshaler.version()
    }

    pub fn stats(&self) -> LifecycleStats {
        self.marshaler.stats()
    }

    pub fn engine(&self) -> &A {
        self.marshaler.engine()
    }

    /// Tear the wrapper down and hand back the engine instance.
    pub fn into_engine(self) -> A {
        self.marshaler.into_engine()
    }

    fn finish(&mut self, handle: Option<ResultHandle>) -> Result<String, FilterError> {
        lifecycle::with_result(
            &mut self.marshaler,
            handle,
            |outcome| -> Result<String, FilterError> {
                let result = outcome?;
                let text = result.decode()?;
                result.release()?;
                Ok(text)
            },
        )
    }
}
