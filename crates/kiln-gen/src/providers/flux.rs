//! Flux image generation provider (fal.ai)
//!
//! Generates opaque images via the Flux API. The endpoint returns hosted
//! URLs rather than inline payloads, so each candidate is downloaded after
//! the generation call completes. No transparency and no edit support.

use crate::config::KilnConfig;
use crate::provider::{
    normalize_error, ImageProvider, Job, ProviderCapabilities, ProviderError, ProviderErrorCode,
    ProviderStatus, RunResult,
};
use crate::target::OutputFormat;
use kiln_core::{KilnError, Result};
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const DEFAULT_FLUX_URL: &str = "https://queue.fal.run/fal-ai/flux/dev";
const REQUEST_TIMEOUT_SECS: u64 = 120;

pub struct FluxProvider {
    api_key: String,
    api_url: String,
    caps: ProviderCapabilities,
}

impl FluxProvider {
    pub fn from_config(config: &KilnConfig) -> Result<Self> {
        let api_key = config
            .api_key("flux")
            .ok_or_else(|| {
                KilnError::Config(
                    "Flux API key not configured. Set KILN_FLUX_API_KEY or add to .kiln/config.toml".to_string(),
                )
            })?
            .to_string();

        let api_url = config
            .api_url("flux")
            .unwrap_or(DEFAULT_FLUX_URL)
            .to_string();

        let declared = ProviderCapabilities {
            formats: vec![OutputFormat::Png, OutputFormat::Jpeg],
            transparency: false,
            edits: false,
            controlnet: false,
            max_candidates: 4,
            default_concurrency: 2,
            min_delay_ms: 250,
        };
        Ok(Self {
            api_key,
            api_url,
            caps: config.capabilities_for("flux", &declared),
        })
    }

    fn submit_and_wait(&self, job: &Job) -> std::result::Result<serde_json::Value, ProviderError> {
        let payload = serde_json::json!({
            "prompt": job.prompt(),
            "image_size": {
                "width": job.policy.size.width,
                "height": job.policy.size.height
            },
            "num_images": job.policy.candidates,
            "output_format": job.policy.format.extension(),
            "enable_safety_checker": false
        });

        debug!(url = %self.api_url, job = %job.id, "submitting flux request");
        let mut reply = build_agent()
            .post(&self.api_url)
            .header("Authorization", &format!("Key {}", self.api_key))
            .header("Content-Type", "application/json")
            .send_json(&payload)
            .map_err(|e| normalize_error("flux", &e))?;

        reply.body_mut().read_json().map_err(|e| {
            ProviderError::new(
                "flux",
                ProviderErrorCode::BadPayload,
                format!("unparseable response: {}", e),
            )
        })
    }

    fn download(&self, url: &str) -> std::result::Result<Vec<u8>, ProviderError> {
        let reply = build_agent()
            .get(url)
            .call()
            .map_err(|e| normalize_error("flux", &e))?;
        let mut reader = reply.into_body().into_reader();
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).map_err(|e| {
            ProviderError::new("flux", ProviderErrorCode::Connection, e.to_string())
        })?;
        Ok(bytes)
    }
}

fn build_agent() -> ureq::Agent {
    let config = ureq::Agent::config_builder()
        .timeout_global(Some(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
        .build();
    config.into()
}

/// Pull every hosted image URL out of a Flux response
fn image_urls(response: &serde_json::Value) -> std::result::Result<Vec<String>, ProviderError> {
    let urls: Vec<String> = response
        .get("images")
        .and_then(|imgs| imgs.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|img| img.get("url").and_then(|u| u.as_str()))
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();

    if urls.is_empty() {
        return Err(ProviderError::new(
            "flux",
            ProviderErrorCode::BadPayload,
            format!(
                "no image urls in response: {}",
                serde_json::to_string(response).unwrap_or_default()
            ),
        ));
    }
    Ok(urls)
}

impl ImageProvider for FluxProvider {
    fn name(&self) -> &str {
        "flux"
    }

    fn capabilities(&self) -> &ProviderCapabilities {
        &self.caps
    }

    fn health_check(&self) -> Result<ProviderStatus> {
        if self.api_key.is_empty() {
            return Ok(ProviderStatus::NoApiKey);
        }
        Ok(ProviderStatus::Available)
    }

    fn run_job(
        &self,
        job: &Job,
        _output_root: &Path,
    ) -> std::result::Result<RunResult, ProviderError> {
        let response = self.submit_and_wait(job)?;
        let urls = image_urls(&response)?;

        if let Some(parent) = job.out_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ProviderError::new("flux", ProviderErrorCode::Io, e.to_string()))?;
        }

        let mut bytes_written = 0u64;
        let mut candidate_paths = Vec::with_capacity(urls.len());
        for (index, url) in urls.iter().enumerate() {
            let bytes = self.download(url)?;
            let path = job.candidate_path(index as u32);
            std::fs::write(&path, &bytes)
                .map_err(|e| ProviderError::new("flux", ProviderErrorCode::Io, e.to_string()))?;
            bytes_written += bytes.len() as u64;
            candidate_paths.push(path);
        }

        Ok(RunResult {
            bytes_written,
            candidate_paths,
        })
    }
}
