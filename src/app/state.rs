use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::app::Config;
use crate::engine::{InferenceEngine, OpenAiCompatEngine};
use crate::privacy::{AuditLog, NetworkAccessGate, NetworkGuard, NetworkMode};
use crate::prompt::PromptEnhancer;
use crate::runtime::{GenerationRequest, ModelRuntime, ModelSize};
use crate::services::{DisabledSearch, SearchDepth, SearchProvider, WebSearch};
use crate::utils::{GenerationError, RuntimeError};

/// Application state: the one place where components are built and wired
pub struct AppState {
    config: Config,
    runtime: ModelRuntime,
    gate: Arc<NetworkGuard>,
    enhancer: PromptEnhancer,
    mode: RwLock<NetworkMode>,
    selected_model: RwLock<ModelSize>,
}

impl AppState {
    /// Wire everything against the configured engine server
    pub fn new(config: Config) -> Result<Self> {
        let engine = OpenAiCompatEngine::with_timeout(
            &config.engine.base_url,
            config.engine.api_key(),
            config.engine.request_timeout(),
        )
        .context("Failed to create engine client")?;
        Self::with_engine(config, Arc::new(engine))
    }

    /// Wire everything against a caller-provided engine
    ///
    /// Search requests only go out to hosts on `network.allowed_hosts`.
    pub fn with_engine(config: Config, engine: Arc<dyn InferenceEngine>) -> Result<Self> {
        let gate = build_gate(&config);
        let (quick, deep): (Arc<dyn SearchProvider>, Arc<dyn SearchProvider>) =
            match &config.search.endpoint {
                Some(endpoint) => {
                    let timeout = Duration::from_secs(config.search.timeout_secs);
                    (
                        Arc::new(
                            WebSearch::new(endpoint, SearchDepth::Quick, timeout)?
                                .with_max_results(config.search.quick_results)
                                .with_host_check(gate.clone()),
                        ),
                        Arc::new(
                            WebSearch::new(endpoint, SearchDepth::Deep, timeout)?
                                .with_max_results(config.search.deep_results)
                                .with_host_check(gate.clone()),
                        ),
                    )
                }
                None => (Arc::new(DisabledSearch), Arc::new(DisabledSearch)),
            };
        Ok(Self::assemble(config, engine, gate, quick, deep))
    }

    pub fn with_components(
        config: Config,
        engine: Arc<dyn InferenceEngine>,
        quick: Arc<dyn SearchProvider>,
        deep: Arc<dyn SearchProvider>,
    ) -> Self {
        let gate = build_gate(&config);
        Self::assemble(config, engine, gate, quick, deep)
    }

    fn assemble(
        config: Config,
        engine: Arc<dyn InferenceEngine>,
        gate: Arc<NetworkGuard>,
        quick: Arc<dyn SearchProvider>,
        deep: Arc<dyn SearchProvider>,
    ) -> Self {
        let mode = gate.current_mode();
        let enhancer = PromptEnhancer::new(gate.clone(), quick, deep);
        let runtime = ModelRuntime::new(engine, config.runtime_options());
        let selected_model = config.runtime.default_model;

        Self {
            config,
            runtime,
            gate,
            enhancer,
            mode: RwLock::new(mode),
            selected_model: RwLock::new(selected_model),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn runtime(&self) -> &ModelRuntime {
        &self.runtime
    }

    pub fn gate(&self) -> &Arc<NetworkGuard> {
        &self.gate
    }

    pub fn audit_log(&self) -> &Arc<AuditLog> {
        self.gate.audit_log()
    }

    pub fn mode(&self) -> NetworkMode {
        *self.mode.read()
    }

    pub fn selected_model(&self) -> ModelSize {
        *self.selected_model.read()
    }

    /// Change the network mode and tell the gate
    pub fn set_mode(&self, mode: NetworkMode) {
        *self.mode.write() = mode;
        self.gate.on_mode_changed(mode);
        info!(mode = %mode, "network mode set");
    }

    /// Load the model of the given size, making it the selected one on success
    pub async fn select_model(&self, size: ModelSize) -> Result<(), RuntimeError> {
        self.runtime.switch_model(self.config.descriptor(size)).await?;
        *self.selected_model.write() = size;
        Ok(())
    }

    /// Load the selected model if nothing is loaded yet
    pub async fn ensure_loaded(&self) -> Result<(), RuntimeError> {
        let size = self.selected_model();
        if size == self.config.runtime.default_model {
            self.runtime.initialize_models().await
        } else {
            self.select_model(size).await
        }
    }

    /// Build a request for `prompt`, enhanced according to the current mode
    pub async fn prepare(&self, prompt: &str) -> GenerationRequest {
        let enhanced = self.enhancer.enhance(prompt, self.mode()).await;
        self.runtime
            .request(enhanced)
            .with_max_tokens(self.config.generation.max_tokens)
    }

    /// Enhance then generate a complete answer
    pub async fn ask(&self, prompt: &str) -> Result<String, GenerationError> {
        let request = self.prepare(prompt).await;
        self.runtime.generate(request).await
    }
}

fn build_gate(config: &Config) -> Arc<NetworkGuard> {
    let audit = Arc::new(AuditLog::new(config.network.audit_capacity));
    Arc::new(NetworkGuard::new(
        config.network.default_mode,
        config.network.allowed_hosts.clone(),
        audit,
    ))
}
