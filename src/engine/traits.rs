use async_trait::async_trait;

use super::types::{ChatMessage, ProgressCallback, SamplingParams, TokenStream};
use crate::runtime::ModelDescriptor;
use crate::utils::EngineError;

/// A local inference library able to load model variants
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Load the weights and library named by `descriptor`
    ///
    /// Progress is reported through `progress` as a fraction in [0, 1]; the
    /// runtime smooths it, so engines may report coarse or repeated values.
    async fn reload(
        &self,
        descriptor: &ModelDescriptor,
        progress: ProgressCallback,
    ) -> Result<Box<dyn EngineHandle>, EngineError>;

    /// Get the name of the engine backend
    fn name(&self) -> &str;
}

/// A loaded model, exclusively owned by the model runtime
#[async_trait]
pub trait EngineHandle: Send + Sync {
    /// Start a streamed completion
    async fn generate_stream(
        &self,
        messages: Vec<ChatMessage>,
        params: SamplingParams,
    ) -> Result<TokenStream, EngineError>;

    /// Free the resources held by this model
    async fn release(&self) {}
}
