use thiserror::Error;

/// Faults of the embedding layer itself: loading, instantiation, traps and
/// marshaling. Filter failures reported by the engine are [`FilterError`].
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Compilation failed: {0}")]
    CompilationFailed(String),

    #[error("Instantiation failed: {0}")]
    InstantiationFailed(String),

    #[error("Module does not export '{0}'")]
    MissingExport(&'static str),

    #[error("Export '{export}' has an unexpected signature: {reason}")]
    SignatureMismatch { export: &'static str, reason: String },

    #[error("Engine trapped in '{export}': {reason}")]
    Trap { export: &'static str, reason: String },

    #[error("'{0}' returned a null string")]
    NullString(&'static str),

    #[error("Engine allocator returned null for {requested} bytes")]
    OutOfMemory { requested: u32 },

    #[error("Address {address:#x} is outside engine memory: {reason}")]
    OutOfBounds { address: u32, reason: String },

    #[error("Result handle {address:#x} belongs to another engine instance")]
    ForeignHandle { address: u32 },

    #[error("Host string contains a NUL byte at offset {position}")]
    InteriorNul { position: usize },

    #[error("Engine instance {0} is poisoned by an earlier panic")]
    InstancePoisoned(usize),

    #[error("Instance pool is empty")]
    EmptyPool,

    #[error("Background task failed: {0}")]
    TaskFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The outcome of a failed filter call, surfaced as a value rather than a
/// fault.
#[derive(Debug, Error)]
pub enum FilterError {
    /// The input text is not valid JSON.
    #[error("{0}")]
    InvalidInput(String),

    /// The filter does not compile, or raised an error while evaluating.
    #[error("{0}")]
    Filter(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Prefix the engine puts on messages about unparsable input.
const INVALID_INPUT_PREFIX: &str = "Invalid JSON input";

/// Used when the engine returns null without leaving a message behind.
pub(crate) const UNREPORTED_FAILURE: &str = "filter engine returned no result and reported no error";

impl FilterError {
    /// Classify an engine error message.
    pub fn from_engine_message(message: String) -> Self {
        let message = if message.trim().is_empty() {
            UNREPORTED_FAILURE.to_string()
        } else {
            message
        };
        if message.starts_with(INVALID_INPUT_PREFIX) {
            FilterError::InvalidInput(message)
        } else {
            FilterError::Filter(message)
        }
    }

    /// The engine's message, or the runtime fault rendered as text.
    pub fn message(&self) -> String {
        match self {
            FilterError::InvalidInput(m) | FilterError::Filter(m) => m.clone(),
            FilterError::Runtime(e) => e.to_string(),
        }
    }

    /// True for failures caused by the input or filter, false for faults of
    /// the embedding itself.
    pub fn is_engine_reported(&self) -> bool {
        !matches!(self, FilterError::Runtime(_))
    }
}
