//! Mock provider for testing
//!
//! Synthesizes deterministic PNGs locally without any network calls. Output
//! pixels derive from the job id, so repeated runs of the same job produce
//! identical candidates. Transparent-background jobs get a real alpha
//! border; edit jobs tint the base image instead of starting fresh.

use crate::provider::{
    ImageProvider, Job, ProviderCapabilities, ProviderError, ProviderErrorCode, ProviderStatus,
    RunResult,
};
use crate::target::{BackgroundMode, OutputFormat};
use image::{Rgba, RgbaImage};
use kiln_core::Result;
use std::path::Path;
use tracing::debug;

pub struct MockProvider {
    caps: ProviderCapabilities,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            caps: ProviderCapabilities {
                formats: vec![OutputFormat::Png, OutputFormat::Webp, OutputFormat::Jpeg],
                transparency: true,
                edits: true,
                controlnet: true,
                max_candidates: 8,
                default_concurrency: 4,
                min_delay_ms: 0,
            },
        }
    }

    pub fn from_config(config: &crate::config::KilnConfig) -> Self {
        let declared = Self::new();
        Self {
            caps: config.capabilities_for("mock", &declared.caps),
        }
    }
}

impl ImageProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn capabilities(&self) -> &ProviderCapabilities {
        &self.caps
    }

    fn health_check(&self) -> Result<ProviderStatus> {
        Ok(ProviderStatus::Available)
    }

    fn run_job(
        &self,
        job: &Job,
        _output_root: &Path,
    ) -> std::result::Result<RunResult, ProviderError> {
        let io_err =
            |e: std::io::Error| ProviderError::new("mock", ProviderErrorCode::Io, e.to_string());

        if let Some(parent) = job.out_path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let base = match &job.edit_base {
            Some(path) => Some(image::open(path).map_err(|e| {
                ProviderError::new(
                    "mock",
                    ProviderErrorCode::BadPayload,
                    format!("edit base {}: {}", path.display(), e),
                )
            })?),
            None => None,
        };

        let mut bytes_written = 0u64;
        let mut candidate_paths = Vec::with_capacity(job.policy.candidates as usize);

        for index in 0..job.policy.candidates {
            let img = match &base {
                Some(b) => tint_base(&b.to_rgba8(), &job.id, index),
                None => synthesize(job, index),
            };
            let path = job.candidate_path(index);
            img.save(&path).map_err(|e| {
                ProviderError::new("mock", ProviderErrorCode::Io, e.to_string())
            })?;
            bytes_written += std::fs::metadata(&path).map_err(io_err)?.len();
            candidate_paths.push(path);
        }

        debug!(job = %job.id, candidates = candidate_paths.len(), "mock generation done");
        Ok(RunResult {
            bytes_written,
            candidate_paths,
        })
    }
}

/// Cheap deterministic byte stream from the job id and candidate index
fn seed_from(job_id: &str, index: u32) -> u64 {
    let mut seed = 0xcbf2_9ce4_8422_2325u64 ^ u64::from(index).wrapping_mul(0x100_0000_01b3);
    for b in job_id.bytes() {
        seed ^= u64::from(b);
        seed = seed.wrapping_mul(0x100_0000_01b3);
    }
    seed
}

fn next(state: &mut u64) -> u8 {
    *state = state
        .wrapping_mul(6364136223846793005)
        .wrapping_add(1442695040888963407);
    (*state >> 33) as u8
}

fn synthesize(job: &Job, index: u32) -> RgbaImage {
    let size = job.policy.size;
    let mut state = seed_from(&job.id, index);
    let base = [next(&mut state), next(&mut state), next(&mut state)];
    let transparent = job.policy.background == BackgroundMode::Transparent;
    // One eighth of each side stays transparent so alpha gates see a subject
    // with a real boundary.
    let margin_x = (size.width / 8).max(1);
    let margin_y = (size.height / 8).max(1);

    let mut img = RgbaImage::new(size.width, size.height);
    for y in 0..size.height {
        for x in 0..size.width {
            let outside = x < margin_x
                || y < margin_y
                || x >= size.width - margin_x
                || y >= size.height - margin_y;
            if transparent && outside {
                img.put_pixel(x, y, Rgba([0, 0, 0, 0]));
                continue;
            }
            let jitter = next(&mut state) / 16;
            img.put_pixel(
                x,
                y,
                Rgba([
                    base[0].wrapping_add(jitter),
                    base[1].wrapping_add(jitter),
                    base[2].wrapping_add(jitter),
                    255,
                ]),
            );
        }
    }
    img
}

/// Edit mode: shift the base image's channels by a candidate-specific delta,
/// preserving alpha so refine passes keep the draft's silhouette.
fn tint_base(base: &RgbaImage, job_id: &str, index: u32) -> RgbaImage {
    let mut state = seed_from(job_id, index);
    let delta = next(&mut state) / 8;
    let mut img = base.clone();
    for pixel in img.pixels_mut() {
        pixel.0[0] = pixel.0[0].saturating_add(delta);
        pixel.0[1] = pixel.0[1].saturating_add(delta);
        pixel.0[2] = pixel.0[2].saturating_add(delta);
    }
    img
}
