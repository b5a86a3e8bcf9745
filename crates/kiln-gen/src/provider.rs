//! Provider abstraction
//!
//! A uniform interface over N image-generation backends. Each backend
//! declares a static capability set, executes Jobs under a bounded timeout,
//! and maps its raw failures into one error taxonomy so the scheduler can
//! make retry/fallback decisions without knowing who it is talking to.

use crate::identity::{compute_input_hash, job_id};
use crate::pathsafe::resolve_within_root;
use crate::policy::{has_errors, normalize_policy, NormalizedPolicy};
use crate::target::{OutputFormat, Target};
use kiln_core::{ContentHash, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

/// A provider capability a target may depend on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Feature {
    Transparency,
    Edits,
    Controlnet,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Feature::Transparency => write!(f, "transparency"),
            Feature::Edits => write!(f, "image-edits"),
            Feature::Controlnet => write!(f, "controlnet"),
        }
    }
}

/// Static per-provider capability descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub formats: Vec<OutputFormat>,
    pub transparency: bool,
    pub edits: bool,
    pub controlnet: bool,
    pub max_candidates: u32,
    pub default_concurrency: usize,
    pub min_delay_ms: u64,
}

impl Default for ProviderCapabilities {
    fn default() -> Self {
        Self {
            formats: vec![OutputFormat::Png],
            transparency: false,
            edits: false,
            controlnet: false,
            max_candidates: 1,
            default_concurrency: 1,
            min_delay_ms: 0,
        }
    }
}

impl ProviderCapabilities {
    pub fn supports(&self, feature: Feature) -> bool {
        match feature {
            Feature::Transparency => self.transparency,
            Feature::Edits => self.edits,
            Feature::Controlnet => self.controlnet,
        }
    }
}

/// Error code taxonomy shared by all providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorCode {
    Timeout,
    Connection,
    RateLimited,
    ServerError,
    BadRequest,
    Auth,
    UnsupportedFeature,
    BadPayload,
    Io,
}

impl ProviderErrorCode {
    /// Whether the scheduler should retry on this code
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderErrorCode::Timeout
                | ProviderErrorCode::Connection
                | ProviderErrorCode::RateLimited
                | ProviderErrorCode::ServerError
        )
    }
}

/// A normalized provider failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderError {
    pub provider: String,
    pub code: ProviderErrorCode,
    pub message: String,
    /// Whether the user can act on this (bad key, unsupported feature, ...)
    pub actionable: bool,
    #[serde(default)]
    pub status: Option<u16>,
}

impl ProviderError {
    pub fn new(provider: &str, code: ProviderErrorCode, message: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            code,
            message: message.into(),
            actionable: !code.is_retryable(),
            status: None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {:?}: {}", self.provider, self.code, self.message)
    }
}

impl std::error::Error for ProviderError {}

/// Map a raw `ureq` failure into the shared taxonomy
pub fn normalize_error(provider: &str, err: &ureq::Error) -> ProviderError {
    let (code, status) = match err {
        ureq::Error::Timeout(_) => (ProviderErrorCode::Timeout, None),
        ureq::Error::Io(_) => (ProviderErrorCode::Connection, None),
        ureq::Error::ConnectionFailed | ureq::Error::HostNotFound => {
            (ProviderErrorCode::Connection, None)
        }
        ureq::Error::StatusCode(code) => {
            let mapped = match code {
                401 | 403 => ProviderErrorCode::Auth,
                429 => ProviderErrorCode::RateLimited,
                500 | 502 | 503 | 504 => ProviderErrorCode::ServerError,
                _ => ProviderErrorCode::BadRequest,
            };
            (mapped, Some(*code))
        }
        _ => (ProviderErrorCode::BadRequest, None),
    };

    ProviderError {
        provider: provider.to_string(),
        code,
        message: err.to_string(),
        actionable: !code.is_retryable(),
        status,
    }
}

/// Status returned by a provider health check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStatus {
    Available,
    Unavailable(String),
    NoApiKey,
}

/// One schedulable execution unit binding a target to a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Deterministic id from `identity::job_id`
    pub id: String,
    pub provider: String,
    pub model: String,
    pub target: Target,
    pub policy: NormalizedPolicy,
    /// Resolved absolute output path inside the run's output root
    pub out_path: PathBuf,
    pub input_hash: ContentHash,
    /// Override for the edit-first base image (resolved, inside the root);
    /// defaults to the target's own `edit_from`.
    #[serde(default)]
    pub edit_base: Option<PathBuf>,
}

impl Job {
    /// Final prompt string sent to the provider
    pub fn prompt(&self) -> String {
        self.target.prompt.assemble()
    }

    /// Path for the Nth candidate (0-based). The first candidate is the
    /// primary output path; later ones get a `.candidate-N` suffix.
    pub fn candidate_path(&self, index: u32) -> PathBuf {
        candidate_path(&self.out_path, index)
    }
}

/// Candidate file naming: `hero.png`, `hero.candidate-2.png`, ...
pub fn candidate_path(out_path: &Path, index: u32) -> PathBuf {
    if index == 0 {
        return out_path.to_path_buf();
    }
    let stem = out_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("candidate");
    let ext = out_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("png");
    out_path.with_file_name(format!("{}.candidate-{}.{}", stem, index + 1, ext))
}

/// Result of one successful provider run
#[derive(Debug, Clone)]
pub struct RunResult {
    pub bytes_written: u64,
    /// All candidate files written, primary path first
    pub candidate_paths: Vec<PathBuf>,
}

/// Trait implemented by each generation backend (openai, flux, mock)
pub trait ImageProvider: Send + Sync {
    /// Provider name (e.g. "openai", "flux", "mock")
    fn name(&self) -> &str;

    /// Static capability set, before config overrides
    fn capabilities(&self) -> &ProviderCapabilities;

    /// Check if the provider is usable (API key set, service reachable)
    fn health_check(&self) -> Result<ProviderStatus>;

    /// Execute one job: issue the request under a bounded timeout and write
    /// 1..candidates files at the job's candidate paths.
    fn run_job(&self, job: &Job, output_root: &Path)
        -> std::result::Result<RunResult, ProviderError>;

    fn supports(&self, feature: Feature) -> bool {
        self.capabilities().supports(feature)
    }
}

/// A target rejected at plan time, before any provider call
#[derive(Debug, Clone)]
pub struct RejectedTarget {
    pub target_id: String,
    pub reason: String,
}

/// Jobs ready for the scheduler plus the targets that failed planning
#[derive(Debug, Default)]
pub struct PreparedBatch {
    pub jobs: Vec<Job>,
    pub rejected: Vec<RejectedTarget>,
}

/// Build Jobs for a batch of targets against one provider.
///
/// Policy errors and path-safety violations reject only the affected target;
/// the rest of the batch still plans. Edit/controlnet reference paths are
/// containment-checked here, before any I/O.
pub fn prepare_jobs(
    provider: &dyn ImageProvider,
    targets: &[Target],
    model: &str,
    output_root: &Path,
) -> PreparedBatch {
    let mut batch = PreparedBatch::default();

    for target in targets {
        match plan_one(provider, target, model, output_root) {
            Ok(job) => batch.jobs.push(job),
            Err(reason) => {
                warn!(target = %target.id, %reason, "target rejected at plan time");
                batch.rejected.push(RejectedTarget {
                    target_id: target.id.clone(),
                    reason,
                });
            }
        }
    }

    batch
}

fn plan_one(
    provider: &dyn ImageProvider,
    target: &Target,
    model: &str,
    output_root: &Path,
) -> std::result::Result<Job, String> {
    let (policy, issues) = normalize_policy(target, provider.capabilities());
    for issue in &issues {
        match issue.severity {
            crate::policy::IssueSeverity::Warning => warn!("{}", issue.message),
            crate::policy::IssueSeverity::Error => {}
        }
    }
    if has_errors(&issues) {
        let joined = issues
            .iter()
            .filter(|i| i.severity == crate::policy::IssueSeverity::Error)
            .map(|i| i.message.clone())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(joined);
    }

    let out_path = resolve_within_root(output_root, &target.out).map_err(|e| e.to_string())?;

    let edit_base = match &target.edit_from {
        Some(base) => Some(resolve_within_root(output_root, base).map_err(|e| e.to_string())?),
        None => None,
    };
    for reference in &target.control_images {
        resolve_within_root(output_root, reference).map_err(|e| e.to_string())?;
    }

    let input_hash = compute_input_hash(target, None).map_err(|e| e.to_string())?;
    let id = job_id(provider.name(), target, model, &input_hash, &policy)
        .map_err(|e| e.to_string())?;

    Ok(Job {
        id,
        provider: provider.name().to_string(),
        model: model.to_string(),
        target: target.clone(),
        policy,
        out_path,
        input_hash,
        edit_base,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{AcceptanceSpec, AssetKind, GenerationPolicy, PromptSpec};

    struct NullProvider {
        caps: ProviderCapabilities,
    }

    impl ImageProvider for NullProvider {
        fn name(&self) -> &str {
            "null"
        }
        fn capabilities(&self) -> &ProviderCapabilities {
            &self.caps
        }
        fn health_check(&self) -> Result<ProviderStatus> {
            Ok(ProviderStatus::Available)
        }
        fn run_job(
            &self,
            _job: &Job,
            _output_root: &Path,
        ) -> std::result::Result<RunResult, ProviderError> {
            Err(ProviderError::new(
                "null",
                ProviderErrorCode::Connection,
                "null provider never runs",
            ))
        }
    }

    fn target(id: &str, out: &str) -> Target {
        Target {
            id: id.to_string(),
            kind: AssetKind::Sprite,
            out: PathBuf::from(out),
            prompt: PromptSpec {
                description: format!("sprite {}", id),
                ..Default::default()
            },
            policy: GenerationPolicy::default(),
            acceptance: AcceptanceSpec::default(),
            edit_from: None,
            control_images: vec![],
            style_kit_id: None,
            consistency_group: None,
            evaluation_profile_id: None,
            hints: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_candidate_path_naming() {
        let out = PathBuf::from("/out/sprites/hero.png");
        assert_eq!(candidate_path(&out, 0), out);
        assert_eq!(
            candidate_path(&out, 1),
            PathBuf::from("/out/sprites/hero.candidate-2.png")
        );
        assert_eq!(
            candidate_path(&out, 2),
            PathBuf::from("/out/sprites/hero.candidate-3.png")
        );
    }

    #[test]
    fn test_prepare_jobs_plans_valid_targets() {
        let provider = NullProvider {
            caps: ProviderCapabilities {
                max_candidates: 4,
                ..Default::default()
            },
        };
        let targets = vec![target("a", "sprites/a.png"), target("b", "sprites/b.png")];
        let batch = prepare_jobs(&provider, &targets, "m1", Path::new("/out"));
        assert_eq!(batch.jobs.len(), 2);
        assert!(batch.rejected.is_empty());
        assert_ne!(batch.jobs[0].id, batch.jobs[1].id);
        assert_eq!(batch.jobs[0].out_path, PathBuf::from("/out/sprites/a.png"));
    }

    #[test]
    fn test_prepare_jobs_rejects_escaping_path_only() {
        let provider = NullProvider {
            caps: ProviderCapabilities::default(),
        };
        let targets = vec![target("ok", "sprites/ok.png"), target("evil", "../evil.png")];
        let batch = prepare_jobs(&provider, &targets, "m1", Path::new("/out"));
        assert_eq!(batch.jobs.len(), 1);
        assert_eq!(batch.rejected.len(), 1);
        assert_eq!(batch.rejected[0].target_id, "evil");
    }

    #[test]
    fn test_prepare_jobs_rejects_missing_capability() {
        let provider = NullProvider {
            caps: ProviderCapabilities::default(), // no edits
        };
        let mut t = target("edit", "sprites/edit.png");
        t.edit_from = Some(PathBuf::from("sprites/base.png"));
        let batch = prepare_jobs(&provider, &[t], "m1", Path::new("/out"));
        assert!(batch.jobs.is_empty());
        assert!(batch.rejected[0].reason.contains("image-edits"));
    }

    #[test]
    fn test_error_code_retryability() {
        assert!(ProviderErrorCode::Timeout.is_retryable());
        assert!(ProviderErrorCode::RateLimited.is_retryable());
        assert!(ProviderErrorCode::ServerError.is_retryable());
        assert!(!ProviderErrorCode::Auth.is_retryable());
        assert!(!ProviderErrorCode::BadRequest.is_retryable());
        assert!(!ProviderErrorCode::UnsupportedFeature.is_retryable());
    }
}
