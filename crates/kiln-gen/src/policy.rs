//! Policy normalization
//!
//! Resolves a target's raw `GenerationPolicy` against a provider's declared
//! capabilities: applies defaults, clamps the candidate count, forces an
//! alpha-capable format for transparent backgrounds, and rejects targets
//! that depend on capabilities the provider lacks.

use crate::provider::{Feature, ProviderCapabilities};
use crate::target::{
    BackgroundMode, CoarseToFinePolicy, GenerationPolicy, ImageSize, OutputFormat, Quality,
    Target, VlmGateSpec,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Severity of a normalization issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Warning,
    Error,
}

/// A single issue raised while normalizing a policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyIssue {
    pub severity: IssueSeverity,
    pub message: String,
}

impl PolicyIssue {
    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Warning,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Error,
            message: message.into(),
        }
    }
}

/// A fully resolved generation policy. Every field a provider or the
/// scheduler consults is concrete; the raw policy's options are gone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPolicy {
    pub size: ImageSize,
    pub quality: Quality,
    pub background: BackgroundMode,
    pub format: OutputFormat,
    pub candidates: u32,
    pub max_retries: u32,
    pub fallback_providers: Vec<String>,
    pub min_delay_ms: u64,
    pub rate_limit_per_minute: Option<u32>,
    pub concurrency: Option<usize>,
    pub vlm_gate: Option<VlmGateSpec>,
    pub coarse_to_fine: Option<CoarseToFinePolicy>,
}

impl NormalizedPolicy {
    /// Minimum spacing between job starts on the owning provider:
    /// max of the explicit delay and the rate-limit interval.
    pub fn start_spacing(&self) -> Duration {
        let rate_ms = self
            .rate_limit_per_minute
            .filter(|&rpm| rpm > 0)
            .map(|rpm| 60_000 / rpm as u64)
            .unwrap_or(0);
        Duration::from_millis(self.min_delay_ms.max(rate_ms))
    }
}

/// Normalize a target's policy against the given provider capabilities.
///
/// Pure: no I/O, no side effects. Returns the resolved policy together with
/// all issues found; callers decide whether an `Error` issue is fatal.
pub fn normalize_policy(
    target: &Target,
    capabilities: &ProviderCapabilities,
) -> (NormalizedPolicy, Vec<PolicyIssue>) {
    let raw = &target.policy;
    let mut issues = Vec::new();

    let size = raw.size.unwrap_or_default();
    let quality = raw.quality.unwrap_or(Quality::High);
    let background = raw.background.unwrap_or(BackgroundMode::Opaque);
    let mut format = raw.format.unwrap_or(OutputFormat::Png);

    if background == BackgroundMode::Transparent && !format.supports_alpha() {
        issues.push(PolicyIssue::warning(format!(
            "target '{}': format {} cannot carry alpha, forcing png for transparent background",
            target.id, format
        )));
        format = OutputFormat::Png;
    }

    let requested = raw.candidates.unwrap_or(1).max(1);
    let candidates = if requested > capabilities.max_candidates {
        issues.push(PolicyIssue::warning(format!(
            "target '{}': candidate count {} clamped to provider maximum {}",
            target.id, requested, capabilities.max_candidates
        )));
        capabilities.max_candidates
    } else {
        requested
    };

    if background == BackgroundMode::Transparent && !capabilities.transparency {
        issues.push(PolicyIssue::error(format!(
            "target '{}' requires a transparent background but provider lacks {}",
            target.id,
            Feature::Transparency
        )));
    }
    if target.needs_edits() && !capabilities.edits {
        issues.push(PolicyIssue::error(format!(
            "target '{}' requires edit-first generation but provider lacks {}",
            target.id,
            Feature::Edits
        )));
    }
    if target.needs_controlnet() && !capabilities.controlnet {
        issues.push(PolicyIssue::error(format!(
            "target '{}' requires controlnet conditioning but provider lacks {}",
            target.id,
            Feature::Controlnet
        )));
    }

    let policy = NormalizedPolicy {
        size,
        quality,
        background,
        format,
        candidates,
        max_retries: raw.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        fallback_providers: raw.fallback_providers.clone(),
        min_delay_ms: raw.min_delay_ms.unwrap_or(capabilities.min_delay_ms),
        rate_limit_per_minute: raw.rate_limit_per_minute,
        concurrency: raw.concurrency,
        vlm_gate: raw.vlm_gate.clone(),
        coarse_to_fine: raw.coarse_to_fine.clone(),
    };

    (policy, issues)
}

/// True when any issue is an error (the target cannot run on this provider)
pub fn has_errors(issues: &[PolicyIssue]) -> bool {
    issues.iter().any(|i| i.severity == IssueSeverity::Error)
}
