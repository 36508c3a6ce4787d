pub mod app;
pub mod cli;
pub mod constants;
pub mod engine;
pub mod privacy;
pub mod prompt;
pub mod runtime;
pub mod services;
pub mod utils;

pub use app::{load_config, AppState, Config};
pub use engine::{EngineHandle, InferenceEngine, OpenAiCompatEngine};
pub use privacy::{NetworkAccessGate, NetworkGuard, NetworkMode};
pub use prompt::PromptEnhancer;
pub use runtime::{GenerationRequest, ModelDescriptor, ModelRuntime, ModelSize, RuntimeState};
pub use utils::{EngineError, GenerationError, RuntimeError};
