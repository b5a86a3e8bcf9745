//! Coarse-to-fine promotion
//!
//! Two-stage generation: a cheap draft pass produces several low-quality
//! candidates, the best survivors are promoted, and each promoted draft
//! seeds an edit-first refine pass at final quality. Drafts are evaluated
//! with external signals off so adapters and VLM graders only ever see
//! refine-pass candidates.

use crate::config::KilnConfig;
use crate::evaluate::{score_candidates, EvalContext, Evaluation};
use crate::provider::{Feature, ImageProvider, Job, ProviderError};
use crate::target::CoarseToFinePolicy;
use kiln_core::{KilnError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Discard reason for drafts cut by the acceptance filter
pub const DRAFT_DISCARD_REASON: &str = "draft_failed_acceptance";

/// A draft removed before promotion
#[derive(Debug, Clone)]
pub struct DiscardedDraft {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of one coarse-to-fine execution.
///
/// `promoted` empty means every draft was discarded; the caller treats
/// that as a failed job.
#[derive(Debug)]
pub struct PromotionOutcome {
    /// Draft-pass evaluation (external signals off)
    pub drafts: Evaluation,
    pub discarded: Vec<DiscardedDraft>,
    /// Draft paths that seeded refine passes, best first
    pub promoted: Vec<PathBuf>,
    /// Final evaluation across all refine candidates
    pub evaluation: Evaluation,
    /// Provider attempts made (draft pass plus one per refine pass)
    pub attempts: u32,
}

/// Variant path for stage outputs: `hero.png` -> `hero.draft.png`
fn stage_path(out_path: &Path, stage: &str) -> PathBuf {
    let stem = out_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("candidate");
    let ext = out_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("png");
    out_path.with_file_name(format!("{}.{}.{}", stem, stage, ext))
}

fn provider_err(e: ProviderError) -> KilnError {
    KilnError::Provider {
        provider: e.provider.clone(),
        code: format!("{:?}", e.code),
        message: e.message,
    }
}

/// Run the full draft / promote / refine pipeline for one job.
///
/// The caller has already decided this job uses coarse-to-fine; retries and
/// fallbacks around the individual provider calls belong to the scheduler,
/// which passes a closure-free provider handle here.
pub fn run_coarse_to_fine(
    provider: &dyn ImageProvider,
    job: &Job,
    ctf: &CoarseToFinePolicy,
    config: &KilnConfig,
    output_root: &Path,
) -> Result<PromotionOutcome> {
    let mut attempts = 0u32;

    // Draft pass: cheap quality, its own candidate count, stage-suffixed
    // paths so drafts never clobber the final output.
    let mut draft_job = job.clone();
    draft_job.policy.quality = ctf.draft_quality;
    draft_job.policy.candidates = ctf.draft_candidates.max(1);
    draft_job.out_path = stage_path(&job.out_path, "draft");

    attempts += 1;
    let draft_run = provider
        .run_job(&draft_job, output_root)
        .map_err(provider_err)?;
    debug!(job = %job.id, drafts = draft_run.candidate_paths.len(), "draft pass complete");

    let draft_ctx = EvalContext::without_external_signals(config);
    let drafts = score_candidates(
        draft_ctx,
        &job.target,
        &draft_job.policy,
        &draft_run.candidate_paths,
    )?;

    // Promotion: optionally cut failed drafts, then take the top K by the
    // deterministic evaluation order.
    let mut discarded = Vec::new();
    let mut survivors: Vec<&crate::evaluate::CandidateScore> = Vec::new();
    for score in &drafts.scores {
        if ctf.require_draft_acceptance && !score.passed {
            discarded.push(DiscardedDraft {
                path: score.path.clone(),
                reason: DRAFT_DISCARD_REASON.to_string(),
            });
        } else {
            survivors.push(score);
        }
    }

    if survivors.is_empty() {
        warn!(job = %job.id, drafts = drafts.scores.len(), "all drafts failed acceptance");
        return Ok(PromotionOutcome {
            drafts,
            discarded,
            promoted: Vec::new(),
            evaluation: Evaluation {
                best_path: None,
                scores: Vec::new(),
            },
            attempts,
        });
    }

    survivors.sort_by(|a, b| {
        b.passed
            .cmp(&a.passed)
            .then(b.score.total_cmp(&a.score))
            .then(a.path.cmp(&b.path))
    });
    let promoted: Vec<PathBuf> = survivors
        .iter()
        .take(ctf.promote_top_k.max(1))
        .map(|s| s.path.clone())
        .collect();
    info!(job = %job.id, promoted = promoted.len(), discarded = discarded.len(), "drafts promoted");

    // Refine pass: one edit-first job per promoted draft at final quality.
    // Without edit support the refine pass degrades to a fresh generation.
    let edits = provider.supports(Feature::Edits);
    if !edits {
        warn!(provider = %provider.name(), "no edit support, refining from scratch");
    }

    let mut refine_candidates = Vec::new();
    for (k, draft_path) in promoted.iter().enumerate() {
        let mut refine_job = job.clone();
        refine_job.policy.quality = ctf.final_quality;
        refine_job.edit_base = edits.then(|| draft_path.clone());
        if promoted.len() > 1 {
            refine_job.out_path = stage_path(&job.out_path, &format!("refine-{}", k + 1));
        }

        attempts += 1;
        let run = provider
            .run_job(&refine_job, output_root)
            .map_err(provider_err)?;
        refine_candidates.extend(run.candidate_paths);
    }

    let evaluation = score_candidates(
        EvalContext::new(config),
        &job.target,
        &job.policy,
        &refine_candidates,
    )?;

    // With multiple refine passes the winner lives at a stage path; move it
    // to the job's primary output.
    let evaluation = if let Some(best) = evaluation.best_path.clone() {
        if best != job.out_path {
            std::fs::copy(&best, &job.out_path)?;
            let mut scores = evaluation.scores;
            for score in &mut scores {
                if score.selected {
                    score.path = job.out_path.clone();
                }
            }
            Evaluation {
                best_path: Some(job.out_path.clone()),
                scores,
            }
        } else {
            evaluation
        }
    } else {
        evaluation
    };

    Ok(PromotionOutcome {
        drafts,
        discarded,
        promoted,
        evaluation,
        attempts,
    })
}
