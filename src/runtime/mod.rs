// Gateway module for the model runtime - follows the Train Station Pattern
// All external access must go through this gateway

// Private submodules - not directly accessible from outside
mod descriptor;
mod model_runtime;
mod request;
mod session;
mod state;

// Public re-exports - the ONLY way to access runtime functionality
pub use descriptor::{ModelDescriptor, ModelSize};
pub use model_runtime::{ModelRuntime, RuntimeOptions};
pub use request::{CancelHandle, GenerationRequest};
pub use session::{estimate_tokens_per_second, GenerationSession};
pub use state::{LoadFailure, RuntimePhase, RuntimeState};
