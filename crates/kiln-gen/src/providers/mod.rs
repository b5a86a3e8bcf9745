//! Provider registry
//!
//! Maps provider names to concrete implementations, with config-level
//! capability overrides applied at construction time.

pub mod flux;
pub mod mock;
pub mod openai;

use crate::config::KilnConfig;
use crate::provider::ImageProvider;
use kiln_core::{KilnError, Result};

/// Create a provider by name with configuration
pub fn create_provider(name: &str, config: &KilnConfig) -> Result<Box<dyn ImageProvider>> {
    if !config.is_enabled(name) {
        return Err(KilnError::Config(format!(
            "Provider '{}' is disabled in config",
            name
        )));
    }
    match name {
        "mock" => Ok(Box::new(mock::MockProvider::from_config(config))),
        "openai" => Ok(Box::new(openai::OpenAiProvider::from_config(config)?)),
        "flux" => Ok(Box::new(flux::FluxProvider::from_config(config)?)),
        _ => Err(KilnError::Config(format!(
            "Unknown provider '{}'. Available: mock, openai, flux",
            name
        ))),
    }
}

/// List all available provider names
pub fn available_providers() -> Vec<&'static str> {
    vec!["mock", "openai", "flux"]
}
