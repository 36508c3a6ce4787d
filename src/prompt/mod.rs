// Gateway module for prompt enhancement - follows the Train Station Pattern
// All external access must go through this gateway

mod enhancer;

pub use enhancer::PromptEnhancer;
