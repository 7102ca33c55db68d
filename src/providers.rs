//! The three logical providers and their built-in presets.
//!
//! Each provider speaks exactly one protocol, so [`Provider`] doubles as the
//! protocol tag for entry points, converters and stream framing.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "gemini")]
    Gemini,
}

/// Built-in defaults for a provider; config can override both fields.
#[derive(Debug, Clone)]
pub struct ProviderPreset {
    pub provider: Provider,
    pub name: &'static str,
    pub base_url: &'static str,
    pub default_api_key_env: &'static str,
}

const PRESETS: &[ProviderPreset] = &[
    ProviderPreset {
        provider: Provider::OpenAi,
        name: "openai",
        base_url: "https://api.openai.com/v1",
        default_api_key_env: "OPENAI_API_KEY",
    },
    ProviderPreset {
        provider: Provider::Anthropic,
        name: "anthropic",
        base_url: "https://api.anthropic.com",
        default_api_key_env: "ANTHROPIC_API_KEY",
    },
    ProviderPreset {
        provider: Provider::Gemini,
        name: "gemini",
        base_url: "https://generativelanguage.googleapis.com/v1beta",
        default_api_key_env: "GEMINI_API_KEY",
    },
];

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::OpenAi, Provider::Anthropic, Provider::Gemini];

    #[must_use]
    pub fn from_name(name: &str) -> Option<Provider> {
        let name = name.to_lowercase();
        PRESETS.iter().find(|p| p.name == name).map(|p| p.provider)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        self.preset().name
    }

    #[must_use]
    pub fn preset(self) -> &'static ProviderPreset {
        match self {
            Provider::OpenAi => &PRESETS[0],
            Provider::Anthropic => &PRESETS[1],
            Provider::Gemini => &PRESETS[2],
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
