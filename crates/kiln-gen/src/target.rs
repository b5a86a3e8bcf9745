//! Target data model
//!
//! A `Target` is the immutable declarative spec for one asset, produced by
//! external manifest normalization. Everything here is plain data: it is
//! serialized canonically for input hashing, so field set and serde shape
//! are part of the caching contract.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// The kind of art asset a target describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Sprite,
    Tile,
    Icon,
    Background,
    Spritesheet,
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetKind::Sprite => write!(f, "sprite"),
            AssetKind::Tile => write!(f, "tile"),
            AssetKind::Icon => write!(f, "icon"),
            AssetKind::Background => write!(f, "background"),
            AssetKind::Spritesheet => write!(f, "spritesheet"),
        }
    }
}

/// Requested generation quality tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    Medium,
    High,
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quality::Low => write!(f, "low"),
            Quality::Medium => write!(f, "medium"),
            Quality::High => write!(f, "high"),
        }
    }
}

/// Background mode for the generated image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundMode {
    Opaque,
    Transparent,
}

/// Output image format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Png,
    Webp,
    Jpeg,
}

impl OutputFormat {
    /// Whether the format can carry an alpha channel
    pub fn supports_alpha(&self) -> bool {
        matches!(self, OutputFormat::Png | OutputFormat::Webp)
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Webp => "webp",
            OutputFormat::Jpeg => "jpg",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Png => write!(f, "png"),
            OutputFormat::Webp => write!(f, "webp"),
            OutputFormat::Jpeg => write!(f, "jpeg"),
        }
    }
}

/// Pixel dimensions of a generated image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for ImageSize {
    fn default() -> Self {
        Self::new(1024, 1024)
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Prompt specification assembled into the final provider prompt
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptSpec {
    /// Base description of the asset
    #[serde(default)]
    pub description: String,
    /// Style prefix prepended to the description (from a style kit)
    #[serde(default)]
    pub style_prefix: Option<String>,
    /// Style suffix appended after the description
    #[serde(default)]
    pub style_suffix: Option<String>,
    /// Negative prompt (things to avoid), passed to providers that support it
    #[serde(default)]
    pub negative: Option<String>,
}

impl PromptSpec {
    /// Flatten the spec into the prompt string sent to a provider
    pub fn assemble(&self) -> String {
        let mut parts = Vec::new();
        if let Some(ref prefix) = self.style_prefix {
            parts.push(prefix.clone());
        }
        parts.push(self.description.clone());
        if let Some(ref suffix) = self.style_suffix {
            parts.push(suffix.clone());
        }
        parts.retain(|p| !p.is_empty());
        parts.join(". ")
    }
}

/// Two-stage coarse-to-fine generation policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoarseToFinePolicy {
    #[serde(default = "default_draft_quality")]
    pub draft_quality: Quality,
    #[serde(default = "default_final_quality")]
    pub final_quality: Quality,
    /// Number of draft candidates to generate
    #[serde(default = "default_draft_candidates")]
    pub draft_candidates: u32,
    /// How many accepted drafts are promoted to the refine pass
    #[serde(default = "default_promote_top_k")]
    pub promote_top_k: usize,
    /// Discard drafts that fail hard-gate acceptance before promotion
    #[serde(default)]
    pub require_draft_acceptance: bool,
}

fn default_draft_quality() -> Quality {
    Quality::Low
}
fn default_final_quality() -> Quality {
    Quality::High
}
fn default_draft_candidates() -> u32 {
    3
}
fn default_promote_top_k() -> usize {
    1
}

/// VLM rubric gate configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VlmGateSpec {
    /// Minimum rubric score in [0, 5] to pass
    pub threshold: f64,
    /// Optional rubric text forwarded to the grader
    #[serde(default)]
    pub rubric: Option<String>,
}

/// Raw, pre-normalization generation policy. All fields optional;
/// `normalize_policy` applies defaults and provider clamps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationPolicy {
    #[serde(default)]
    pub size: Option<ImageSize>,
    #[serde(default)]
    pub quality: Option<Quality>,
    #[serde(default)]
    pub background: Option<BackgroundMode>,
    #[serde(default)]
    pub format: Option<OutputFormat>,
    /// Number of candidate images to request per job
    #[serde(default)]
    pub candidates: Option<u32>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Providers to try, in order, after the primary provider is exhausted
    #[serde(default)]
    pub fallback_providers: Vec<String>,
    /// Minimum delay between job starts on the same provider
    #[serde(default)]
    pub min_delay_ms: Option<u64>,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    /// Per-provider concurrency override
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub vlm_gate: Option<VlmGateSpec>,
    #[serde(default)]
    pub coarse_to_fine: Option<CoarseToFinePolicy>,
}

/// Palette compliance mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "mode")]
pub enum PaletteSpec {
    /// Require at least `min_fraction` of visible pixels to match `colors` exactly
    Exact {
        /// Allowed colors as "#rrggbb" hex strings
        colors: Vec<String>,
        #[serde(default = "default_palette_fraction")]
        min_fraction: f64,
    },
    /// Hard-fail when distinct visible colors exceed the cap
    #[serde(rename = "max-colors")]
    MaxColors { max: usize },
}

fn default_palette_fraction() -> f64 {
    0.95
}

/// Weights for the soft-score components. Defaults to 1.0, negatives are
/// clamped to 0 at evaluation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreWeights {
    #[serde(default = "default_weight")]
    pub readability: f64,
    #[serde(default = "default_weight")]
    pub consistency: f64,
    #[serde(default = "default_weight")]
    pub adapters: f64,
    #[serde(default = "default_weight")]
    pub vlm: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            readability: 1.0,
            consistency: 1.0,
            adapters: 1.0,
            vlm: 1.0,
        }
    }
}

/// Acceptance constraints evaluated against each candidate
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcceptanceSpec {
    /// Expected output size; deviation scores a proportional penalty
    #[serde(default)]
    pub size: Option<ImageSize>,
    /// Fractional size tolerance. `Some(0.0)` turns deviation into a hard failure.
    #[serde(default)]
    pub size_tolerance: Option<f64>,
    /// Require an alpha channel with at least one transparent pixel
    #[serde(default)]
    pub require_alpha: bool,
    /// Hard cap on output file size
    #[serde(default)]
    pub max_file_size_kb: Option<u64>,
    /// Require opposing edges to match within `seam_threshold`
    #[serde(default)]
    pub tileable: bool,
    #[serde(default)]
    pub seam_threshold: Option<f64>,
    /// Width of the edge strips compared for tileability
    #[serde(default)]
    pub seam_strip_px: Option<u32>,
    /// Max fraction of boundary pixels showing light fringing
    #[serde(default)]
    pub halo_risk_max: Option<f64>,
    /// Max fraction of opaque pixels that are fully isolated
    #[serde(default)]
    pub stray_noise_max: Option<f64>,
    /// Min mean normalized alpha at boundary pixels
    #[serde(default)]
    pub edge_sharpness_min: Option<f64>,
    #[serde(default)]
    pub palette: Option<PaletteSpec>,
    #[serde(default)]
    pub weights: ScoreWeights,
    /// Names of configured soft adapters to invoke for this target
    #[serde(default)]
    pub adapters: Vec<String>,
}

/// Declarative spec for one asset to generate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    /// Stable target identifier from the manifest
    pub id: String,
    pub kind: AssetKind,
    /// Output path relative to the run's output root
    pub out: PathBuf,
    pub prompt: PromptSpec,
    #[serde(default)]
    pub policy: GenerationPolicy,
    #[serde(default)]
    pub acceptance: AcceptanceSpec,
    /// Edit-first base image, relative to the output root
    #[serde(default)]
    pub edit_from: Option<PathBuf>,
    /// Controlnet conditioning images, relative to the output root
    #[serde(default)]
    pub control_images: Vec<PathBuf>,
    #[serde(default)]
    pub style_kit_id: Option<String>,
    /// Targets sharing a group are scored for cross-candidate consistency
    #[serde(default)]
    pub consistency_group: Option<String>,
    #[serde(default)]
    pub evaluation_profile_id: Option<String>,
    /// Opaque runtime hints passed through to emitters; hashed as-is
    #[serde(default)]
    pub hints: serde_json::Value,
}

impl Target {
    /// Whether this target depends on edit-first generation
    pub fn needs_edits(&self) -> bool {
        self.edit_from.is_some()
    }

    /// Whether this target depends on controlnet conditioning
    pub fn needs_controlnet(&self) -> bool {
        !self.control_images.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_assembly() {
        let prompt = PromptSpec {
            description: "a weathered stone golem".to_string(),
            style_prefix: Some("16-bit pixel art".to_string()),
            style_suffix: Some("clean silhouette".to_string()),
            negative: Some("photorealism".to_string()),
        };
        let assembled = prompt.assemble();
        assert_eq!(
            assembled,
            "16-bit pixel art. a weathered stone golem. clean silhouette"
        );
    }

    #[test]
    fn test_prompt_assembly_minimal() {
        let prompt = PromptSpec {
            description: "a torch".to_string(),
            ..Default::default()
        };
        assert_eq!(prompt.assemble(), "a torch");
    }

    #[test]
    fn test_format_alpha_support() {
        assert!(OutputFormat::Png.supports_alpha());
        assert!(OutputFormat::Webp.supports_alpha());
        assert!(!OutputFormat::Jpeg.supports_alpha());
    }

    #[test]
    fn test_palette_spec_serde() {
        let toml_like = serde_json::json!({
            "mode": "exact",
            "colors": ["#ff0000", "#00ff00"],
        });
        let spec: PaletteSpec = serde_json::from_value(toml_like).unwrap();
        match spec {
            PaletteSpec::Exact {
                colors,
                min_fraction,
            } => {
                assert_eq!(colors.len(), 2);
                assert_eq!(min_fraction, 0.95);
            }
            _ => panic!("expected exact palette"),
        }
    }

    #[test]
    fn test_target_feature_needs() {
        let mut target = Target {
            id: "golem".to_string(),
            kind: AssetKind::Sprite,
            out: PathBuf::from("sprites/golem.png"),
            prompt: PromptSpec::default(),
            policy: GenerationPolicy::default(),
            acceptance: AcceptanceSpec::default(),
            edit_from: None,
            control_images: vec![],
            style_kit_id: None,
            consistency_group: None,
            evaluation_profile_id: None,
            hints: serde_json::Value::Null,
        };
        assert!(!target.needs_edits());
        assert!(!target.needs_controlnet());

        target.edit_from = Some(PathBuf::from("sprites/golem_draft.png"));
        target.control_images.push(PathBuf::from("poses/stand.png"));
        assert!(target.needs_edits());
        assert!(target.needs_controlnet());
    }
}
