// Gateway module for external services - follows the Train Station Pattern
// All external access must go through this gateway

mod search;

pub use search::{DisabledSearch, SearchDepth, SearchProvider, WebSearch};

#[cfg(test)]
pub(crate) use search::MockSearchProvider;
