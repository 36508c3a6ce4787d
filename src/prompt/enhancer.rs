use std::sync::Arc;
use tracing::{debug, warn};

use crate::privacy::{NetworkAccessGate, NetworkMode};
use crate::services::SearchProvider;

/// Holds a gate grant and gives it back on drop
struct AccessLease<'a> {
    gate: &'a dyn NetworkAccessGate,
    purpose: &'static str,
}

impl<'a> AccessLease<'a> {
    fn acquire(gate: &'a dyn NetworkAccessGate, purpose: &'static str) -> Option<Self> {
        gate.request_access(purpose)
            .then(|| Self { gate, purpose })
    }
}

impl Drop for AccessLease<'_> {
    fn drop(&mut self) {
        self.gate.release_access(self.purpose);
    }
}

/// Adds search context to prompts in the network modes that allow it
///
/// Never fails: a denied gate, a failing provider or an empty result all
/// leave the prompt as typed.
pub struct PromptEnhancer {
    gate: Arc<dyn NetworkAccessGate>,
    quick: Arc<dyn SearchProvider>,
    deep: Arc<dyn SearchProvider>,
}

impl PromptEnhancer {
    pub fn new(
        gate: Arc<dyn NetworkAccessGate>,
        quick: Arc<dyn SearchProvider>,
        deep: Arc<dyn SearchProvider>,
    ) -> Self {
        Self { gate, quick, deep }
    }

    pub async fn enhance(&self, prompt: &str, mode: NetworkMode) -> String {
        let Some(purpose) = mode.search_purpose() else {
            return prompt.to_string();
        };
        let (provider, header) = match mode {
            NetworkMode::DeepResearch => (&self.deep, "Detailed research context"),
            _ => (&self.quick, "Context from search"),
        };

        let Some(_lease) = AccessLease::acquire(self.gate.as_ref(), purpose) else {
            debug!(purpose, "network access denied, prompt left unchanged");
            return prompt.to_string();
        };

        match provider.search(prompt).await {
            Ok(Some(context)) if !context.trim().is_empty() => {
                debug!(provider = provider.name(), chars = context.len(), "prompt augmented");
                format!(
                    "{}\n\n--- {} ---\n{}\n--- End context ---",
                    prompt,
                    header,
                    context.trim()
                )
            }
            Ok(_) => {
                debug!(provider = provider.name(), "search returned nothing");
                prompt.to_string()
            }
            Err(e) => {
                warn!(provider = provider.name(), error = %e, "search failed, prompt left unchanged");
                prompt.to_string()
            }
        }
    }
}
