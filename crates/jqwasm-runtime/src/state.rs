use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::preview1::WasiP1Ctx;

/// Host state stored in each engine `Store`.
///
/// The engine is built against WASI preview1 for its libc, but filtering is
/// pure computation, so the sandbox is deny-default:
/// - No filesystem preopens
/// - No host environment variables or arguments
/// - stdio not connected
pub struct EngineState {
    pub(crate) wasi: WasiP1Ctx,
}

impl EngineState {
    pub fn new() -> Self {
        Self {
            wasi: WasiCtxBuilder::new().build_p1(),
        }
    }
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new()
    }
}
