//! Layered configuration system
//!
//! Config is loaded with three layers of precedence (highest wins):
//! 1. Environment variables: `KILN_{PROVIDER}_API_KEY`
//! 2. Project-local: `.kiln/config.toml`
//! 3. Global: `~/.kiln/config.toml`
//!
//! The resolved `KilnConfig` is assembled once at process start and passed
//! by reference into the scheduler and evaluator; nothing below this module
//! reads the environment.

use crate::adapter::AdapterEndpoint;
use crate::provider::ProviderCapabilities;
use kiln_core::{KilnError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Provider-specific configuration, including capability overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Capability overrides applied on top of the provider's declared set
    #[serde(default)]
    pub max_candidates: Option<u32>,
    #[serde(default)]
    pub default_concurrency: Option<usize>,
    #[serde(default)]
    pub min_delay_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

/// Generation defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_provider")]
    pub default_provider: String,
    #[serde(default)]
    pub default_model: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            default_model: None,
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

/// Top-level config file structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KilnConfigFile {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub generation: GenerationConfig,
    /// Soft perceptual adapters, keyed by name
    #[serde(default)]
    pub adapters: HashMap<String, AdapterEndpoint>,
    /// VLM rubric grader endpoint, if configured
    #[serde(default)]
    pub vlm: Option<AdapterEndpoint>,
}

/// Resolved configuration with environment variable overrides applied
#[derive(Debug, Clone, Default)]
pub struct KilnConfig {
    pub providers: HashMap<String, ProviderConfig>,
    pub generation: GenerationConfig,
    pub adapters: HashMap<String, AdapterEndpoint>,
    pub vlm: Option<AdapterEndpoint>,
}

impl KilnConfig {
    /// Load config with layered precedence: global < project < env vars
    pub fn load() -> Result<Self> {
        let mut config = KilnConfigFile::default();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                let global = Self::load_file(&global_path)?;
                Self::merge_into(&mut config, global);
            }
        }

        let local_path = PathBuf::from(".kiln/config.toml");
        if local_path.exists() {
            let local = Self::load_file(&local_path)?;
            Self::merge_into(&mut config, local);
        }

        Self::apply_env_overrides(&mut config);

        Ok(Self::from_file_struct(config))
    }

    /// Load config from a specific file path only (for testing)
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let mut config = Self::load_file(path)?;
        Self::apply_env_overrides(&mut config);
        Ok(Self::from_file_struct(config))
    }

    fn from_file_struct(file: KilnConfigFile) -> Self {
        KilnConfig {
            providers: file.providers,
            generation: file.generation,
            adapters: file.adapters,
            vlm: file.vlm,
        }
    }

    /// Get API key for a provider
    pub fn api_key(&self, provider_name: &str) -> Option<&str> {
        self.providers
            .get(provider_name)
            .and_then(|p| p.api_key.as_deref())
    }

    /// Get API URL for a provider (or its default)
    pub fn api_url(&self, provider_name: &str) -> Option<&str> {
        self.providers
            .get(provider_name)
            .and_then(|p| p.api_url.as_deref())
    }

    /// Check if a provider is enabled
    pub fn is_enabled(&self, provider_name: &str) -> bool {
        self.providers
            .get(provider_name)
            .map(|p| p.enabled)
            .unwrap_or(true)
    }

    /// Apply this config's capability overrides on top of a provider's
    /// declared capability set.
    pub fn capabilities_for(
        &self,
        provider_name: &str,
        declared: &ProviderCapabilities,
    ) -> ProviderCapabilities {
        let mut caps = declared.clone();
        if let Some(overrides) = self.providers.get(provider_name) {
            if let Some(max) = overrides.max_candidates {
                caps.max_candidates = max.max(1);
            }
            if let Some(conc) = overrides.default_concurrency {
                caps.default_concurrency = conc.max(1);
            }
            if let Some(delay) = overrides.min_delay_ms {
                caps.min_delay_ms = delay;
            }
        }
        caps
    }

    /// Look up a configured soft adapter endpoint by name
    pub fn adapter(&self, name: &str) -> Option<&AdapterEndpoint> {
        self.adapters.get(name)
    }

    /// The VLM gate endpoint, if any
    pub fn vlm_endpoint(&self) -> Option<&AdapterEndpoint> {
        self.vlm.as_ref()
    }

    fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".kiln").join("config.toml"))
    }

    fn load_file(path: &Path) -> Result<KilnConfigFile> {
        let content = std::fs::read_to_string(path)?;
        let config: KilnConfigFile = toml::from_str(&content).map_err(|e| {
            KilnError::Config(format!("Failed to parse config {}: {}", path.display(), e))
        })?;
        Ok(config)
    }

    fn merge_into(base: &mut KilnConfigFile, overlay: KilnConfigFile) {
        for (name, provider) in overlay.providers {
            let entry = base.providers.entry(name).or_default();
            if provider.api_key.is_some() {
                entry.api_key = provider.api_key;
            }
            if provider.api_url.is_some() {
                entry.api_url = provider.api_url;
            }
            if provider.max_candidates.is_some() {
                entry.max_candidates = provider.max_candidates;
            }
            if provider.default_concurrency.is_some() {
                entry.default_concurrency = provider.default_concurrency;
            }
            if provider.min_delay_ms.is_some() {
                entry.min_delay_ms = provider.min_delay_ms;
            }
            entry.enabled = provider.enabled;
        }

        if overlay.generation.default_provider != default_provider() {
            base.generation.default_provider = overlay.generation.default_provider;
        }
        if overlay.generation.default_model.is_some() {
            base.generation.default_model = overlay.generation.default_model;
        }
        for (name, endpoint) in overlay.adapters {
            base.adapters.insert(name, endpoint);
        }
        if overlay.vlm.is_some() {
            base.vlm = overlay.vlm;
        }
    }

    fn apply_env_overrides(config: &mut KilnConfigFile) {
        let provider_names = ["openai", "flux"];
        for name in &provider_names {
            let env_key = format!("KILN_{}_API_KEY", name.to_uppercase());
            if let Ok(key) = std::env::var(&env_key) {
                let entry = config.providers.entry(name.to_string()).or_default();
                entry.api_key = Some(key);
            }
        }
    }
}
