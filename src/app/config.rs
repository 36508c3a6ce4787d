use anyhow::{Context, Result};
use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{
    DEEP_RESEARCH_RESULTS, DEFAULT_ALLOWED_HOSTS, DEFAULT_AUDIT_CAPACITY,
    DEFAULT_ENGINE_API_KEY_ENV, DEFAULT_ENGINE_URL, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE,
    DEFAULT_TOP_P, HTTP_REQUEST_TIMEOUT_SECS, QUICK_SEARCH_RESULTS, SEARCH_TIMEOUT_SECS,
};
use crate::privacy::NetworkMode;
use crate::runtime::{ModelDescriptor, ModelSize, RuntimeOptions};

const ENV_PREFIX: &str = "JARVIS_";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Model lifecycle behaviour
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Per-size artifact overrides
    #[serde(default)]
    pub models: ModelsConfig,

    /// Inference engine connection
    #[serde(default)]
    pub engine: EngineConfig,

    /// Default sampling parameters
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Network gate policy
    #[serde(default)]
    pub network: NetworkConfig,

    /// Search providers used for prompt enhancement
    #[serde(default)]
    pub search: SearchConfig,
}

impl Config {
    /// Descriptor for `size`, with any configured overrides applied
    pub fn descriptor(&self, size: ModelSize) -> ModelDescriptor {
        let base = ModelDescriptor::for_size(size);
        let overrides = match size {
            ModelSize::Lite => &self.models.lite,
            ModelSize::Max => &self.models.max,
        };

        let weights_path = overrides.weights_path.clone().unwrap_or(base.weights_path);
        let library_path = overrides.library_path.clone().unwrap_or(base.library_path);
        ModelDescriptor::new(size, weights_path, library_path)
    }

    pub fn runtime_options(&self) -> RuntimeOptions {
        RuntimeOptions {
            default_descriptor: self.descriptor(self.runtime.default_model),
            retain_previous_on_switch: self.runtime.retain_previous_on_switch,
            warmup_on_load: self.runtime.warmup_on_load,
            system_prompt: self.generation.system_prompt.clone(),
            temperature: self.generation.temperature,
            top_p: self.generation.top_p,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Model loaded at startup
    pub default_model: ModelSize,
    /// Keep the current model while a switch loads the next one
    pub retain_previous_on_switch: bool,
    /// Run a short test generation after each load
    pub warmup_on_load: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_model: ModelSize::Lite,
            retain_previous_on_switch: true,
            warmup_on_load: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub lite: ModelOverride,
    pub max: ModelOverride,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOverride {
    pub weights_path: Option<String>,
    pub library_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base URL of the OpenAI-compatible engine server
    pub base_url: String,
    /// Environment variable containing the API key, if the server wants one
    pub api_key_env: String,
    pub request_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_ENGINE_URL.to_string(),
            api_key_env: DEFAULT_ENGINE_API_KEY_ENV.to_string(),
            request_timeout_secs: HTTP_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl EngineConfig {
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.is_empty())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub system_prompt: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Mode at startup
    pub default_mode: NetworkMode,
    /// Hosts outbound requests may target (subdomains included)
    pub allowed_hosts: Vec<String>,
    /// Entries kept in the in-memory audit log
    pub audit_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            default_mode: NetworkMode::Offline,
            allowed_hosts: DEFAULT_ALLOWED_HOSTS.iter().map(|h| h.to_string()).collect(),
            audit_capacity: DEFAULT_AUDIT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// JSON search endpoint; search is disabled when unset
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
    pub quick_results: usize,
    pub deep_results: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: SEARCH_TIMEOUT_SECS,
            quick_results: QUICK_SEARCH_RESULTS,
            deep_results: DEEP_RESEARCH_RESULTS,
        }
    }
}

/// Layer defaults, the optional config files and environment overrides
fn build_figment(global_config: Option<&Path>, local_config: &Path, env_prefix: &str) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(Config::default()));

    if let Some(global) = global_config.filter(|p| p.exists()) {
        figment = figment.merge(Toml::file(global));
    }

    if local_config.exists() {
        figment = figment.merge(Toml::file(local_config));
    }

    // Nested keys use a double underscore: JARVIS_ENGINE__BASE_URL
    figment.merge(Env::prefixed(env_prefix).split("__"))
}

/// Load configuration from multiple sources
pub fn load_config() -> Result<Config> {
    let global_config = get_config_dir()?.join("config.toml");
    let local_config = PathBuf::from(".jarvis/config.toml");

    build_figment(Some(&global_config), &local_config, ENV_PREFIX)
        .extract()
        .context("Failed to load configuration")
}

/// Load configuration from an explicit file, still honouring env overrides
pub fn load_config_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        anyhow::bail!("Config file not found: {}", path.display());
    }
    build_figment(None, path, ENV_PREFIX)
        .extract()
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    if let Some(proj_dirs) = ProjectDirs::from("", "", "jarvis") {
        let config_dir = proj_dirs.config_dir();
        std::fs::create_dir_all(config_dir)?;
        Ok(config_dir.to_path_buf())
    } else {
        // Fallback to home directory
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .context("Could not determine home directory")?;
        let config_dir = PathBuf::from(home).join(".config").join("jarvis");
        std::fs::create_dir_all(&config_dir)?;
        Ok(config_dir)
    }
}

/// Save configuration to file
pub fn save_config(config: &Config, path: Option<PathBuf>) -> Result<()> {
    let path = if let Some(p) = path {
        p
    } else {
        get_config_dir()?.join("config.toml")
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_string = toml::to_string_pretty(config)?;
    std::fs::write(&path, toml_string)
        .with_context(|| format!("Failed to write config to {}", path.display()))?;

    Ok(())
}

/// Create the global config file and a local example if missing
///
/// Returns the paths that were created.
pub fn init_config() -> Result<Vec<PathBuf>> {
    let mut created = Vec::new();
    let config_file = get_config_dir()?.join("config.toml");

    if !config_file.exists() {
        save_config(&Config::default(), Some(config_file.clone()))?;
        created.push(config_file);
    }

    let local_example = PathBuf::from(".jarvis/config.toml.example");
    if !local_example.exists() {
        if let Some(parent) = local_example.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let example_config = r#"# Jarvis Project Configuration
# This file overrides global settings for this directory

[runtime]
default_model = "max"
retain_previous_on_switch = true

[engine]
base_url = "http://localhost:8000"

[network]
default_mode = "quick_search"

[search]
endpoint = "http://localhost:8888/search"
"#;
        std::fs::write(&local_example, example_config)?;
        created.push(local_example);
    }

    Ok(created)
}
