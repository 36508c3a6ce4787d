use serde::Serialize;

use super::descriptor::ModelDescriptor;

/// Lifecycle phase of the model runtime
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum RuntimePhase {
    Unloaded,
    Loading {
        target: ModelDescriptor,
    },
    Loaded {
        descriptor: ModelDescriptor,
    },
    Switching {
        from: ModelDescriptor,
        to: ModelDescriptor,
    },
    Failed {
        descriptor: ModelDescriptor,
        error: String,
    },
}

impl RuntimePhase {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded { .. })
    }

    /// Loading or switching: the UI should show progress
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Loading { .. } | Self::Switching { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Short label for status lines
    pub fn label(&self) -> &str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loading { .. } => "loading",
            Self::Loaded { .. } => "loaded",
            Self::Switching { .. } => "switching",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Most recent load failure, kept even when the runtime fell back to a
/// previously loaded model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadFailure {
    pub descriptor: ModelDescriptor,
    pub error: String,
}

/// Observable runtime state
///
/// Written only by the runtime. Readers get snapshots and must not assume two
/// snapshots were taken atomically.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeState {
    pub phase: RuntimePhase,
    /// Descriptor whose engine can serve generation right now
    pub active_descriptor: Option<ModelDescriptor>,
    /// Progress of the current (or last) load, in [0, 1]
    pub load_progress: f64,
    /// Throughput estimate of the most recent session
    pub tokens_per_second: f64,
    pub last_failure: Option<LoadFailure>,
    /// Id of the generation session that currently owns the runtime
    pub active_session: Option<u64>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            phase: RuntimePhase::Unloaded,
            active_descriptor: None,
            load_progress: 0.0,
            tokens_per_second: 0.0,
            last_failure: None,
            active_session: None,
        }
    }
}

impl RuntimeState {
    pub fn is_loaded(&self) -> bool {
        self.phase.is_loaded()
    }

    /// Check the documented invariants; used by tests and debug assertions
    pub fn is_consistent(&self) -> bool {
        let loaded_ok = !self.phase.is_loaded() || self.active_descriptor.is_some();
        let unloaded_ok = self.phase != RuntimePhase::Unloaded || self.load_progress == 0.0;
        let progress_ok = (0.0..=1.0).contains(&self.load_progress);
        loaded_ok && unloaded_ok && progress_ok && self.tokens_per_second >= 0.0
    }
}
