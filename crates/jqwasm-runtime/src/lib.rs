//! Safe embedding layer for a jq filter engine compiled to WebAssembly.
//!
//! The engine exports a handful of C-style functions that take and return
//! pointers into its own linear memory, and report errors through one
//! shared flag/message slot. This crate wraps that contract so callers only
//! see owned strings and typed errors:
//!
//! - [`ModuleLoader`] compiles and instantiates the module ([`WasmEngine`]).
//! - [`Marshaler`] copies strings in and out of engine memory.
//! - [`lifecycle`] makes sure every result buffer is freed exactly once.
//! - [`Jq`] is the typed API; [`JqPool`] spreads work over independent
//!   instances.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use jqwasm_runtime::{Jq, ModuleLoader};
//!
//! # fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let loader = ModuleLoader::new(None)?;
//! let module = loader.load(|name| format!("./dist/{name}").into())?;
//! let mut jq = Jq::new(loader.instantiate(&module)?);
//!
//! assert_eq!(jq.run(r#"{"a":1}"#, ".a")?, "1");
//! assert!(!jq.is_valid_filter(".a +")?);
//! println!("{}", jq.engine_version()?);
//! # Ok(())
//! # }
//! ```

pub mod abi;
pub mod cache;
pub mod config;
pub mod error;
pub mod filter;
pub mod instance;
pub mod lifecycle;
pub mod loader;
pub mod marshal;
pub mod pool;
pub mod state;

#[cfg(test)]
mod fake;

pub use abi::{EngineAbi, MemoryAddress};
pub use config::JqWasmConfig;
pub use error::{FilterError, RuntimeError};
pub use filter::Jq;
pub use instance::WasmEngine;
pub use lifecycle::{LifecycleStats, ResultHandle, ScopedResult};
pub use loader::{MODULE_FILE_NAME, ModuleLoader};
pub use marshal::Marshaler;
pub use pool::JqPool;
