use crate::models::provider::{ default_context_window, ProviderConfig, ProviderKind };
use log::{ info, warn };
use std::collections::HashMap;
use std::error::Error;
use std::fs;

/// Repository of configured model endpoints, loaded once at startup from a
/// JSON file. Injected into the orchestrator rather than living in a
/// process-wide singleton.
pub struct ModelRegistry {
    configs: HashMap<String, ProviderConfig>,
    default_base_url: String,
}

impl ModelRegistry {
    pub fn load(
        path: &str,
        default_base_url: String
    ) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let file_content = fs
            ::read_to_string(path)
            .map_err(|e| format!("Failed to read model config file '{}': {}", path, e))?;
        let entries: Vec<ProviderConfig> = serde_json
            ::from_str(&file_content)
            .map_err(|e| format!("Failed to parse model config file '{}': {}", path, e))?;

        let mut configs = HashMap::new();
        for entry in entries {
            if !entry.is_active {
                info!("Skipping inactive model config: {}", entry.model);
                continue;
            }
            configs.insert(entry.model.clone(), entry);
        }
        info!("Loaded {} model configs from {}", configs.len(), path);

        Ok(Self { configs, default_base_url })
    }

    /// Registry with no configured models; every lookup synthesizes the
    /// local default.
    pub fn empty(default_base_url: String) -> Self {
        Self { configs: HashMap::new(), default_base_url }
    }

    #[cfg(test)]
    pub fn with_configs(entries: Vec<ProviderConfig>, default_base_url: String) -> Self {
        let configs = entries
            .into_iter()
            .map(|c| (c.model.clone(), c))
            .collect();
        Self { configs, default_base_url }
    }

    /// Resolve connection details for a model identifier. Unknown models
    /// fall back to the local-completion daemon rather than failing, so a
    /// freshly pulled model works without an admin config entry.
    pub fn resolve(&self, model: &str) -> ProviderConfig {
        if let Some(config) = self.configs.get(model) {
            return config.clone();
        }

        warn!("No config for model '{}', falling back to local provider", model);
        ProviderConfig {
            name: model.to_string(),
            model: model.to_string(),
            kind: ProviderKind::LocalCompletion,
            base_url: self.default_base_url.clone(),
            encrypted_api_key: None,
            context_window: default_context_window(),
            is_active: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn resolves_configured_model() {
        let registry = ModelRegistry::with_configs(
            vec![ProviderConfig {
                name: "GPT-4o".into(),
                model: "gpt-4o".into(),
                kind: ProviderKind::OpenAiCompatible,
                base_url: "https://api.openai.com".into(),
                encrypted_api_key: Some("cipher".into()),
                context_window: 128000,
                is_active: true,
            }],
            "http://localhost:11434".into()
        );

        let cfg = registry.resolve("gpt-4o");
        assert_eq!(cfg.kind, ProviderKind::OpenAiCompatible);
        assert_eq!(cfg.context_window, 128000);
    }

    #[test]
    fn unknown_model_synthesizes_local_default() {
        let registry = ModelRegistry::empty("http://localhost:11434".into());
        let cfg = registry.resolve("mistral:7b");
        assert_eq!(cfg.kind, ProviderKind::LocalCompletion);
        assert_eq!(cfg.base_url, "http://localhost:11434");
        assert_eq!(cfg.context_window, 16384);
        assert!(cfg.encrypted_api_key.is_none());
    }

    #[test]
    fn load_skips_inactive_and_rejects_unknown_kind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.json");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(
            br#"[
                {"name":"Llama","model":"llama3","kind":"local-completion","base_url":"http://localhost:11434"},
                {"name":"Old","model":"old","kind":"local-completion","base_url":"http://localhost:11434","is_active":false}
            ]"#
        ).unwrap();

        let registry = ModelRegistry::load(
            path.to_str().unwrap(),
            "http://localhost:11434".into()
        ).unwrap();
        assert_eq!(registry.resolve("llama3").name, "Llama");
        // Inactive entry falls back to the synthesized default.
        assert_eq!(registry.resolve("old").name, "old");

        let bad = dir.path().join("bad.json");
        let mut f = fs::File::create(&bad).unwrap();
        f.write_all(br#"[{"name":"X","model":"x","kind":"bedrock","base_url":"http://x"}]"#).unwrap();
        assert!(ModelRegistry::load(bad.to_str().unwrap(), "http://localhost:11434".into()).is_err());
    }
}
