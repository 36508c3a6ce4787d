// Gateway module for the inference engine boundary - follows the Train Station Pattern
// All external access must go through this gateway

// Private submodules - not directly accessible from outside
mod openai;
mod traits;
mod types;

#[cfg(test)]
pub(crate) mod testing;

// Public re-exports - the ONLY way to access engine functionality
pub use openai::OpenAiCompatEngine;
pub use traits::{EngineHandle, InferenceEngine};
pub use types::{
    ChatMessage, MessageRole, ProgressCallback, SamplingParams, StreamCallback, TokenDelta,
    TokenStream,
};
