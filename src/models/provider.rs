use serde::{ Serialize, Deserialize };
use std::str::FromStr;

/// Wire-protocol family a configured model endpoint speaks. Closed set:
/// anything else in a config file is rejected at load time instead of
/// silently no-oping at dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    LocalCompletion,
    OpenAiCompatible,
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local-completion" | "ollama" => Ok(ProviderKind::LocalCompletion),
            "openai-compatible" | "openai" | "custom" => Ok(ProviderKind::OpenAiCompatible),
            other => Err(format!("Unsupported provider kind: {}", other)),
        }
    }
}

/// One reachable model endpoint. Owned by administrative configuration;
/// the orchestrator treats it as an immutable snapshot for one request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub model: String,
    pub kind: ProviderKind,
    pub base_url: String,
    #[serde(default)]
    pub encrypted_api_key: Option<String>,
    #[serde(default = "default_context_window")]
    pub context_window: u32,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

pub fn default_context_window() -> u32 {
    16384
}

fn default_true() -> bool {
    true
}
