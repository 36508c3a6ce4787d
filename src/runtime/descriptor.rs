use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::constants::{LITE_WEIGHTS, MAX_WEIGHTS, MODEL_LIB_PREFIX};

/// The model variants the assistant ships with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSize {
    /// Smaller, faster variant
    Lite,
    /// Larger variant with better answers
    Max,
}

impl Default for ModelSize {
    fn default() -> Self {
        Self::Lite
    }
}

impl ModelSize {
    pub const ALL: [ModelSize; 2] = [ModelSize::Lite, ModelSize::Max];

    /// Get the display name shown in model pickers
    pub fn display_name(&self) -> &str {
        match self {
            Self::Lite => "Lite (3B)",
            Self::Max => "Max (4B)",
        }
    }

    /// Convert size to string (for config files)
    pub fn as_str(&self) -> &str {
        match self {
            Self::Lite => "lite",
            Self::Max => "max",
        }
    }

    /// Default weights identifier for this size
    pub fn default_weights(&self) -> &'static str {
        match self {
            Self::Lite => LITE_WEIGHTS,
            Self::Max => MAX_WEIGHTS,
        }
    }
}

impl fmt::Display for ModelSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "lite" | "3b" => Ok(Self::Lite),
            "max" | "4b" => Ok(Self::Max),
            other => Err(format!("unknown model size '{}' (expected lite or max)", other)),
        }
    }
}

/// Identifies one loadable model variant
///
/// Immutable; two descriptors are the same model iff every field matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub size: ModelSize,
    pub weights_path: String,
    pub library_path: String,
}

impl ModelDescriptor {
    pub fn new(
        size: ModelSize,
        weights_path: impl Into<String>,
        library_path: impl Into<String>,
    ) -> Self {
        Self {
            size,
            weights_path: weights_path.into(),
            library_path: library_path.into(),
        }
    }

    /// Descriptor using the bundled artifact names for a size
    pub fn for_size(size: ModelSize) -> Self {
        let weights = size.default_weights();
        Self::new(size, weights, format!("{}/{}", MODEL_LIB_PREFIX, weights))
    }
}

impl fmt::Display for ModelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.size, self.weights_path)
    }
}
