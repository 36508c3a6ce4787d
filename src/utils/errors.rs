use thiserror::Error;

/// Errors raised at the inference engine boundary
///
/// Cloneable so a coalesced load can hand the same failure to every waiter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Model not served by engine: {0}")]
    ModelUnavailable(String),

    #[error("Engine connection error: {0}")]
    Connection(String),

    #[error("Engine returned an error: {0}")]
    Api(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Warm-up generation failed: {0}")]
    Warmup(String),

    #[error("Worker task failed: {0}")]
    Worker(String),
}

/// Errors from lifecycle operations (initialize, switch, unload)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Runtime is busy with another operation")]
    Busy,

    #[error("No model is loaded")]
    NotLoaded,
}

/// Terminal outcomes of a generation call other than success
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    #[error("No model is loaded")]
    NotLoaded,

    #[error("A generation is already running")]
    Busy,

    #[error("Invalid generation request: {0}")]
    InvalidRequest(String),

    #[error("Engine failure: {0}")]
    EngineFailure(String),

    /// Not a failure: the caller stopped the stream. Text produced before the
    /// stop is handed back so the UI can keep it.
    #[error("Generation cancelled")]
    Cancelled { partial: String },
}

impl GenerationError {
    /// Whether this outcome is the expected result of a stop request
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Partial text surfaced by a cancelled generation
    pub fn partial_text(&self) -> Option<&str> {
        match self {
            Self::Cancelled { partial } => Some(partial),
            _ => None,
        }
    }
}

impl From<EngineError> for GenerationError {
    fn from(e: EngineError) -> Self {
        GenerationError::EngineFailure(e.to_string())
    }
}
