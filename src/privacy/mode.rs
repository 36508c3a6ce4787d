use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The four connectivity modes the assistant can run in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// Default mode - nothing leaves the device
    #[default]
    Offline,
    /// Short web lookups to ground answers
    QuickSearch,
    /// Multi-source research with a larger result budget
    DeepResearch,
    /// Network allowed for voice features; prompts are never augmented
    VoiceControl,
}

impl NetworkMode {
    pub const ALL: [NetworkMode; 4] = [
        Self::Offline,
        Self::QuickSearch,
        Self::DeepResearch,
        Self::VoiceControl,
    ];

    /// Get the display name for the mode
    pub fn display_name(&self) -> &str {
        match self {
            Self::Offline => "Offline",
            Self::QuickSearch => "Quick Search",
            Self::DeepResearch => "Deep Research",
            Self::VoiceControl => "Voice Control",
        }
    }

    /// Get a description of what this mode does
    pub fn description(&self) -> &str {
        match self {
            Self::Offline => "All processing stays on device",
            Self::QuickSearch => "Adds a few web results to each prompt",
            Self::DeepResearch => "Adds detailed research context to each prompt",
            Self::VoiceControl => "Network enabled for voice, prompts sent as typed",
        }
    }

    /// Whether the gate grants access at all in this mode
    pub fn allows_network(&self) -> bool {
        !matches!(self, Self::Offline)
    }

    /// Purpose string used when this mode asks the gate for access, if it
    /// augments prompts at all
    pub fn search_purpose(&self) -> Option<&'static str> {
        match self {
            Self::QuickSearch => Some("quick_search"),
            Self::DeepResearch => Some("deep_research"),
            Self::Offline | Self::VoiceControl => None,
        }
    }

    /// Convert mode to string (for config files)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::QuickSearch => "quick_search",
            Self::DeepResearch => "deep_research",
            Self::VoiceControl => "voice_control",
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for NetworkMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "offline" => Ok(Self::Offline),
            "quick_search" | "quick-search" | "quicksearch" | "quick" => Ok(Self::QuickSearch),
            "deep_research" | "deep-research" | "deepresearch" | "deep" => Ok(Self::DeepResearch),
            "voice_control" | "voice-control" | "voicecontrol" | "voice" => Ok(Self::VoiceControl),
            other => Err(format!(
                "unknown network mode '{}' (expected offline, quick, deep or voice)",
                other
            )),
        }
    }
}
