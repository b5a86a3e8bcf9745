//! Candidate evaluation and winner selection
//!
//! Every candidate runs through every check: hard gates flip `passed` and
//! append a reason, soft metrics accumulate into a weighted score, and the
//! final ranking is fully deterministic (pass first, score descending, path
//! ascending). External adapter and VLM calls degrade to warnings on
//! failure; they can never block an otherwise valid candidate.

pub mod gates;
pub mod soft;

use crate::adapter::{invoke_adapter, vlm_verdict, AdapterPayload, VlmVerdict, VLM_MAX_SCORE};
use crate::config::KilnConfig;
use crate::policy::NormalizedPolicy;
use crate::target::{BackgroundMode, PaletteSpec, Target};
use image::RgbaImage;
use kiln_core::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default edge-strip width for the tileability seam check
pub const DEFAULT_SEAM_STRIP_PX: u32 = 4;
/// Default seam threshold on the 0-255 channel scale
pub const DEFAULT_SEAM_THRESHOLD: f64 = 12.0;
/// Weight of the smaller-file reward relative to a full soft component
const FILE_SIZE_REWARD_WEIGHT: f64 = 0.25;
/// Scale applied to threshold-violation penalties
const VIOLATION_PENALTY_SCALE: f64 = 0.5;

/// Evaluation of one candidate output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateScore {
    pub path: PathBuf,
    /// Weighted soft score minus penalties
    pub score: f64,
    /// Hard-gate outcome; failures carry their reasons
    pub passed: bool,
    pub reasons: Vec<String>,
    /// Per-metric breakdown
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub vlm: Option<VlmVerdict>,
    /// Degraded external signals (adapter timeouts, parse failures, ...)
    pub warnings: Vec<String>,
    /// Exactly one candidate per job carries `true`
    pub selected: bool,
}

impl CandidateScore {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            score: 0.0,
            passed: true,
            reasons: Vec::new(),
            metrics: BTreeMap::new(),
            vlm: None,
            warnings: Vec::new(),
            selected: false,
        }
    }

    fn fail(&mut self, reason: impl Into<String>) {
        self.passed = false;
        self.reasons.push(reason.into());
    }
}

/// Result of scoring all candidates of one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    /// The selected candidate's path (always set for a non-empty batch)
    pub best_path: Option<PathBuf>,
    pub scores: Vec<CandidateScore>,
}

impl Evaluation {
    /// The selected candidate's score record
    pub fn selected(&self) -> Option<&CandidateScore> {
        self.scores.iter().find(|s| s.selected)
    }
}

/// Evaluation context assembled once per run
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    pub config: &'a KilnConfig,
    /// When false, adapters and the VLM gate are skipped entirely. Used for
    /// draft candidates to bound external evaluation cost.
    pub external_signals: bool,
}

impl<'a> EvalContext<'a> {
    pub fn new(config: &'a KilnConfig) -> Self {
        Self {
            config,
            external_signals: true,
        }
    }

    pub fn without_external_signals(config: &'a KilnConfig) -> Self {
        Self {
            config,
            external_signals: false,
        }
    }
}

struct DecodedCandidate {
    img: RgbaImage,
    has_alpha_channel: bool,
    bytes: u64,
}

/// Score all candidates of one job and select a deterministic winner.
pub fn score_candidates(
    ctx: EvalContext<'_>,
    target: &Target,
    policy: &NormalizedPolicy,
    paths: &[PathBuf],
) -> Result<Evaluation> {
    let mut scores: Vec<CandidateScore> = Vec::with_capacity(paths.len());
    let mut decoded: Vec<Option<DecodedCandidate>> = Vec::with_capacity(paths.len());

    for path in paths {
        let mut score = CandidateScore::new(path.clone());
        match decode_candidate(path) {
            Ok(candidate) => decoded.push(Some(candidate)),
            Err(reason) => {
                score.fail(format!("candidate_unreadable: {}", reason));
                decoded.push(None);
            }
        }
        scores.push(score);
    }

    // Consistency needs the full batch: histograms first, centroid second.
    let histograms: Vec<Option<Vec<f64>>> = decoded
        .iter()
        .map(|d| d.as_ref().map(|c| soft::luma_histogram(&c.img)))
        .collect();
    let present: Vec<Vec<f64>> = histograms.iter().flatten().cloned().collect();
    let centroid = soft::centroid_histogram(&present);

    for (i, score) in scores.iter_mut().enumerate() {
        let Some(candidate) = &decoded[i] else {
            continue;
        };
        evaluate_one(
            ctx,
            target,
            policy,
            candidate,
            histograms[i].as_deref().unwrap_or(&[]),
            &centroid,
            score,
        );
    }

    select_winner(&mut scores);
    let best_path = scores.iter().find(|s| s.selected).map(|s| s.path.clone());
    Ok(Evaluation { best_path, scores })
}

fn decode_candidate(path: &Path) -> std::result::Result<DecodedCandidate, String> {
    let bytes = std::fs::metadata(path).map_err(|e| e.to_string())?.len();
    let dynamic = image::open(path).map_err(|e| e.to_string())?;
    let has_alpha_channel = dynamic.color().has_alpha();
    Ok(DecodedCandidate {
        img: dynamic.to_rgba8(),
        has_alpha_channel,
        bytes,
    })
}

fn evaluate_one(
    ctx: EvalContext<'_>,
    target: &Target,
    policy: &NormalizedPolicy,
    candidate: &DecodedCandidate,
    histogram: &[f64],
    centroid: &[f64],
    score: &mut CandidateScore,
) {
    let acceptance = &target.acceptance;
    let weights = &acceptance.weights;
    let img = &candidate.img;
    let (w, h) = img.dimensions();
    let mut penalty = 0.0;

    // Size: proportional penalty, hard failure only with zero tolerance.
    let expected = acceptance.size.unwrap_or(policy.size);
    let deviation = gates::size_deviation(w, h, expected);
    score.metrics.insert("size_deviation".to_string(), deviation);
    penalty += deviation;
    if let Some(tolerance) = acceptance.size_tolerance {
        if deviation > tolerance {
            score.fail(format!(
                "size_out_of_tolerance: {}x{} vs expected {} (deviation {:.3})",
                w, h, expected, deviation
            ));
        }
    }

    // Alpha: channel presence and actual transparency are independent gates.
    let alpha_required =
        acceptance.require_alpha || policy.background == BackgroundMode::Transparent;
    if alpha_required {
        if !candidate.has_alpha_channel {
            score.fail("alpha_channel_missing");
        }
        if !gates::has_transparent_pixels(img) {
            score.fail("no_transparent_pixels");
        }
    }

    // File size: hard cap, reward below it.
    score
        .metrics
        .insert("file_size_bytes".to_string(), candidate.bytes as f64);
    if let Some(max_kb) = acceptance.max_file_size_kb {
        let cap = max_kb * 1024;
        if candidate.bytes > cap {
            score.fail(format!(
                "file_too_large: {} bytes exceeds {} KB cap",
                candidate.bytes, max_kb
            ));
        } else {
            let headroom = 1.0 - candidate.bytes as f64 / cap as f64;
            score.score += headroom * FILE_SIZE_REWARD_WEIGHT;
        }
    }

    // Tileability.
    if acceptance.tileable {
        let strip = acceptance.seam_strip_px.unwrap_or(DEFAULT_SEAM_STRIP_PX);
        let threshold = acceptance.seam_threshold.unwrap_or(DEFAULT_SEAM_THRESHOLD);
        let seam = gates::seam_score(img, strip);
        score.metrics.insert("seam_score".to_string(), seam);
        if seam > threshold {
            score.fail(format!(
                "seam_exceeds_threshold: {:.2} > {:.2}",
                seam, threshold
            ));
            penalty += ((seam - threshold) / 255.0).min(1.0) * VIOLATION_PENALTY_SCALE;
        }
    }

    // Alpha boundary quality: only meaningful with actual transparency.
    if candidate.has_alpha_channel {
        if let Some(stats) = gates::boundary_stats(img) {
            score
                .metrics
                .insert("halo_risk".to_string(), stats.halo_risk);
            score
                .metrics
                .insert("stray_noise_ratio".to_string(), stats.stray_noise_ratio);
            score
                .metrics
                .insert("edge_sharpness".to_string(), stats.edge_sharpness);

            if let Some(max) = acceptance.halo_risk_max {
                if stats.halo_risk > max {
                    score.fail(format!(
                        "halo_risk_exceeds_threshold: {:.3} > {:.3}",
                        stats.halo_risk, max
                    ));
                    penalty += (stats.halo_risk - max).min(1.0) * VIOLATION_PENALTY_SCALE;
                }
            }
            if let Some(max) = acceptance.stray_noise_max {
                if stats.stray_noise_ratio > max {
                    score.fail(format!(
                        "stray_noise_exceeds_threshold: {:.3} > {:.3}",
                        stats.stray_noise_ratio, max
                    ));
                    penalty +=
                        (stats.stray_noise_ratio - max).min(1.0) * VIOLATION_PENALTY_SCALE;
                }
            }
            if let Some(min) = acceptance.edge_sharpness_min {
                if stats.edge_sharpness < min {
                    score.fail(format!(
                        "edge_sharpness_below_threshold: {:.3} < {:.3}",
                        stats.edge_sharpness, min
                    ));
                    penalty += (min - stats.edge_sharpness).min(1.0) * VIOLATION_PENALTY_SCALE;
                }
            }
        }
    }

    // Palette compliance.
    match &acceptance.palette {
        Some(PaletteSpec::Exact {
            colors,
            min_fraction,
        }) => {
            let allowed: HashSet<[u8; 3]> = colors
                .iter()
                .filter_map(|c| gates::parse_hex_color(c))
                .collect();
            let fraction = gates::palette_match_fraction(img, &allowed);
            score
                .metrics
                .insert("palette_match_fraction".to_string(), fraction);
            if fraction < *min_fraction {
                score.fail(format!(
                    "palette_fraction_below_threshold: {:.3} < {:.3}",
                    fraction, min_fraction
                ));
            }
        }
        Some(PaletteSpec::MaxColors { max }) => {
            let distinct = gates::distinct_visible_colors(img);
            score
                .metrics
                .insert("distinct_colors".to_string(), distinct as f64);
            if distinct > *max {
                score.fail(format!(
                    "palette_too_many_colors: {} > {}",
                    distinct, max
                ));
            }
        }
        None => {}
    }

    // Soft score. Negative weights clamp to zero.
    let readability = soft::readability(img);
    score
        .metrics
        .insert("readability".to_string(), readability);
    score.score += readability * weights.readability.max(0.0);

    let consistency = soft::consistency(histogram, centroid);
    score
        .metrics
        .insert("consistency".to_string(), consistency);
    score.score += consistency * weights.consistency.max(0.0);

    if ctx.external_signals {
        run_adapters(ctx, target, score);
        run_vlm_gate(ctx, target, policy, score, &mut penalty);
    }

    score.score -= penalty;
    debug!(
        path = %score.path.display(),
        score = score.score,
        passed = score.passed,
        "candidate evaluated"
    );
}

/// Invoke each configured soft adapter; failures become warnings and the
/// surviving scores average into one weighted component.
fn run_adapters(ctx: EvalContext<'_>, target: &Target, score: &mut CandidateScore) {
    let weight = target.acceptance.weights.adapters.max(0.0);
    let mut adapter_scores = Vec::new();

    for name in &target.acceptance.adapters {
        let Some(endpoint) = ctx.config.adapter(name) else {
            score
                .warnings
                .push(format!("adapter '{}' not configured", name));
            continue;
        };
        let payload =
            AdapterPayload::new(name, &score.path, &target.prompt.assemble(), target);
        match invoke_adapter(endpoint, &payload) {
            Ok(response) => {
                for (metric, value) in &response.metrics {
                    score
                        .metrics
                        .insert(format!("adapter.{}.{}", name, metric), *value);
                }
                if let Some(s) = response.effective_score() {
                    adapter_scores.push(s);
                }
            }
            Err(e) => {
                warn!(adapter = %name, error = %e, "soft adapter failed");
                score.warnings.push(format!("adapter '{}': {}", name, e));
            }
        }
    }

    if !adapter_scores.is_empty() {
        let mean = adapter_scores.iter().sum::<f64>() / adapter_scores.len() as f64;
        score.metrics.insert("adapter_score".to_string(), mean);
        score.score += mean * weight;
    }
}

/// Run the VLM rubric gate when configured. A verdict below threshold is a
/// hard failure with a scaled penalty; a transport failure is a warning.
fn run_vlm_gate(
    ctx: EvalContext<'_>,
    target: &Target,
    policy: &NormalizedPolicy,
    score: &mut CandidateScore,
    penalty: &mut f64,
) {
    let Some(gate) = &policy.vlm_gate else {
        return;
    };
    let Some(endpoint) = ctx.config.vlm_endpoint() else {
        score
            .warnings
            .push("vlm gate requested but no endpoint configured".to_string());
        return;
    };

    let payload = AdapterPayload::new("vlm", &score.path, &target.prompt.assemble(), target)
        .with_vlm_gate(gate.threshold, gate.rubric.clone());

    match invoke_adapter(endpoint, &payload).and_then(|r| vlm_verdict(&r, gate.threshold)) {
        Ok(verdict) => {
            score
                .metrics
                .insert("vlm_score".to_string(), verdict.score);
            score.score +=
                verdict.score / VLM_MAX_SCORE * target.acceptance.weights.vlm.max(0.0);
            if !verdict.passed {
                score.fail(format!(
                    "vlm_below_threshold: {:.2} < {:.2}",
                    verdict.score, gate.threshold
                ));
                *penalty += (gate.threshold - verdict.score) / VLM_MAX_SCORE
                    * VIOLATION_PENALTY_SCALE;
            }
            score.vlm = Some(verdict);
        }
        Err(e) => {
            warn!(error = %e, "vlm gate failed, degrading to warning");
            score.warnings.push(format!("vlm: {}", e));
        }
    }
}

/// Deterministic ranking: passing candidates first, then score descending,
/// then path ascending. Exactly one candidate ends up selected.
fn select_winner(scores: &mut [CandidateScore]) {
    let Some(winner) = scores
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            b.passed
                .cmp(&a.passed)
                .then(b.score.total_cmp(&a.score))
                .then(a.path.cmp(&b.path))
        })
        .map(|(i, _)| i)
    else {
        return;
    };
    for (i, score) in scores.iter_mut().enumerate() {
        score.selected = i == winner;
    }
}
