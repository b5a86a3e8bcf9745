//! OpenAI image generation provider
//!
//! Text-to-image via the images/generations endpoint and edit-first
//! refinement via images/edits (multipart). Responses carry base64 image
//! payloads. The provider makes exactly one attempt per call; retry and
//! fallback decisions belong to the scheduler.

use crate::config::KilnConfig;
use crate::provider::{
    normalize_error, ImageProvider, Job, ProviderCapabilities, ProviderError, ProviderErrorCode,
    ProviderStatus, RunResult,
};
use crate::target::{BackgroundMode, OutputFormat};
use base64::Engine;
use kiln_core::{KilnError, Result};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";
const REQUEST_TIMEOUT_SECS: u64 = 120;

pub struct OpenAiProvider {
    api_key: String,
    api_url: String,
    caps: ProviderCapabilities,
}

impl OpenAiProvider {
    pub fn from_config(config: &KilnConfig) -> Result<Self> {
        let api_key = config
            .api_key("openai")
            .ok_or_else(|| {
                KilnError::Config(
                    "OpenAI API key not configured. Set KILN_OPENAI_API_KEY or add to .kiln/config.toml".to_string(),
                )
            })?
            .to_string();

        let api_url = config
            .api_url("openai")
            .unwrap_or(DEFAULT_OPENAI_URL)
            .trim_end_matches('/')
            .to_string();

        let declared = ProviderCapabilities {
            formats: vec![OutputFormat::Png, OutputFormat::Webp, OutputFormat::Jpeg],
            transparency: true,
            edits: true,
            controlnet: false,
            max_candidates: 10,
            default_concurrency: 4,
            min_delay_ms: 0,
        };
        Ok(Self {
            api_key,
            api_url,
            caps: config.capabilities_for("openai", &declared),
        })
    }

    fn generate(&self, job: &Job) -> std::result::Result<Vec<Vec<u8>>, ProviderError> {
        let mut payload = serde_json::json!({
            "model": job.model,
            "prompt": job.prompt(),
            "n": job.policy.candidates,
            "size": job.policy.size.to_string(),
            "quality": job.policy.quality.to_string(),
            "output_format": job.policy.format.extension(),
        });
        if job.policy.background == BackgroundMode::Transparent {
            payload["background"] = serde_json::json!("transparent");
        }

        let url = format!("{}/images/generations", self.api_url);
        debug!(%url, job = %job.id, "submitting generation request");
        let mut reply = build_agent()
            .post(&url)
            .header("Authorization", &format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .send_json(&payload)
            .map_err(|e| normalize_error("openai", &e))?;

        let body: serde_json::Value = reply
            .body_mut()
            .read_json()
            .map_err(|e| bad_payload(format!("unparseable response: {}", e)))?;
        decode_images(&body)
    }

    fn edit(&self, job: &Job, base: &Path) -> std::result::Result<Vec<Vec<u8>>, ProviderError> {
        let image_bytes = std::fs::read(base).map_err(|e| {
            ProviderError::new(
                "openai",
                ProviderErrorCode::Io,
                format!("edit base {}: {}", base.display(), e),
            )
        })?;

        // The edits endpoint only speaks multipart/form-data.
        let boundary = format!("kiln-{}", uuid::Uuid::new_v4());
        let body = multipart_body(
            &boundary,
            &[
                ("model", job.model.as_str()),
                ("prompt", &job.prompt()),
                ("n", &job.policy.candidates.to_string()),
                ("size", &job.policy.size.to_string()),
                ("quality", &job.policy.quality.to_string()),
            ],
            ("image", "base.png", &image_bytes),
        );

        let url = format!("{}/images/edits", self.api_url);
        debug!(%url, job = %job.id, base = %base.display(), "submitting edit request");
        let mut reply = build_agent()
            .post(&url)
            .header("Authorization", &format!("Bearer {}", self.api_key))
            .header(
                "Content-Type",
                &format!("multipart/form-data; boundary={}", boundary),
            )
            .send(body.as_slice())
            .map_err(|e| normalize_error("openai", &e))?;

        let parsed: serde_json::Value = reply
            .body_mut()
            .read_json()
            .map_err(|e| bad_payload(format!("unparseable response: {}", e)))?;
        decode_images(&parsed)
    }
}

fn build_agent() -> ureq::Agent {
    let config = ureq::Agent::config_builder()
        .timeout_global(Some(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
        .build();
    config.into()
}

fn bad_payload(message: String) -> ProviderError {
    ProviderError::new("openai", ProviderErrorCode::BadPayload, message)
}

/// Extract and decode every `data[].b64_json` entry
fn decode_images(body: &serde_json::Value) -> std::result::Result<Vec<Vec<u8>>, ProviderError> {
    let data = body
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| bad_payload(format!("no data array in response: {}", body)))?;

    let mut images = Vec::with_capacity(data.len());
    for entry in data {
        let encoded = entry
            .get("b64_json")
            .and_then(|b| b.as_str())
            .ok_or_else(|| bad_payload("data entry missing b64_json".to_string()))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| bad_payload(format!("invalid base64 image: {}", e)))?;
        images.push(bytes);
    }

    if images.is_empty() {
        return Err(bad_payload("response contained no images".to_string()));
    }
    Ok(images)
}

/// Hand-built multipart body: text fields plus one file part
fn multipart_body(boundary: &str, fields: &[(&str, &str)], file: (&str, &str, &[u8])) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
        );
        body.extend_from_slice(value.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    let (name, filename, bytes) = file;
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
            name, filename
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: image/png\r\n\r\n");
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}

impl ImageProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
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
        let images = match &job.edit_base {
            Some(base) => self.edit(job, base)?,
            None => self.generate(job)?,
        };

        if let Some(parent) = job.out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ProviderError::new("openai", ProviderErrorCode::Io, e.to_string())
            })?;
        }

        let mut bytes_written = 0u64;
        let mut candidate_paths = Vec::with_capacity(images.len());
        for (index, bytes) in images.iter().enumerate() {
            let path = job.candidate_path(index as u32);
            std::fs::write(&path, bytes).map_err(|e| {
                ProviderError::new("openai", ProviderErrorCode::Io, e.to_string())
            })?;
            bytes_written += bytes.len() as u64;
            candidate_paths.push(path);
        }

        Ok(RunResult {
            bytes_written,
            candidate_paths,
        })
    }
}
