//! Job scheduler
//!
//! Runs a prepared batch on a bounded worker pool with paced starts, a
//! bounded retry budget per provider, and an ordered fallback chain. One
//! job failing never takes down the batch: every target ends the run with
//! its own JobOutcome.

use crate::config::KilnConfig;
use crate::evaluate::{score_candidates, EvalContext, Evaluation};
use crate::lock::SelectionLocks;
use crate::pathsafe::resolve_within_root;
use crate::promote::run_coarse_to_fine;
use crate::provider::{prepare_jobs, ImageProvider, Job};
use crate::providers::create_provider;
use crate::report::{JobOutcome, JobStatus, RejectedOutcome, RunReport};
use crate::target::Target;
use kiln_core::{KilnError, Result};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const RETRY_BASE_DELAY_MS: u64 = 500;

/// Provider construction hook; the default uses the registry
pub type ProviderFactory<'a> =
    &'a (dyn Fn(&str) -> Result<Box<dyn ImageProvider>> + Sync);

/// Run-level switches
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Honor valid selection locks instead of regenerating
    pub skip_locked: bool,
    /// Approve each successful selection into the lock file
    pub approve_on_success: bool,
}

/// Enforces a minimum spacing between job starts on one provider
struct PacingGate {
    next_start: Mutex<Instant>,
}

impl PacingGate {
    fn new() -> Self {
        Self {
            next_start: Mutex::new(Instant::now()),
        }
    }

    /// Block until this caller's start slot. Slots hand out strictly
    /// `spacing` apart regardless of which worker asks first.
    fn wait_turn(&self, spacing: Duration) {
        if spacing.is_zero() {
            return;
        }
        let wait = {
            let mut next = self.next_start.lock().unwrap();
            let now = Instant::now();
            let slot = (*next).max(now);
            *next = slot + spacing;
            slot.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
    }
}

/// Plan and execute a batch of targets end to end.
pub fn run_batch(
    targets: &[Target],
    config: &KilnConfig,
    output_root: &Path,
    options: &ExecutionOptions,
) -> Result<RunReport> {
    let factory: ProviderFactory = &|name| create_provider(name, config);
    run_batch_with(targets, config, output_root, options, factory)
}

/// `run_batch` with an explicit provider factory.
pub fn run_batch_with(
    targets: &[Target],
    config: &KilnConfig,
    output_root: &Path,
    options: &ExecutionOptions,
    factory: ProviderFactory<'_>,
) -> Result<RunReport> {
    let provider_name = config.generation.default_provider.clone();
    let primary = factory(&provider_name)?;
    match primary.health_check()? {
        crate::provider::ProviderStatus::Available => {}
        crate::provider::ProviderStatus::NoApiKey => {
            return Err(KilnError::Config(format!(
                "Provider '{}' has no API key configured",
                provider_name
            )));
        }
        crate::provider::ProviderStatus::Unavailable(reason) => {
            return Err(KilnError::Provider {
                provider: provider_name,
                code: "Connection".to_string(),
                message: reason,
            });
        }
    }
    let model = config
        .generation
        .default_model
        .clone()
        .unwrap_or_else(|| default_model(&provider_name).to_string());

    let batch = prepare_jobs(primary.as_ref(), targets, &model, output_root);
    let mut report = RunReport::default();
    for rejected in &batch.rejected {
        report.rejected.push(RejectedOutcome {
            target_id: rejected.target_id.clone(),
            reason: rejected.reason.clone(),
        });
    }
    if batch.jobs.is_empty() {
        return Ok(report);
    }

    let locks = Mutex::new(SelectionLocks::load(output_root)?);
    let gate = PacingGate::new();
    let pool_size = pool_size(&batch.jobs, primary.as_ref());
    info!(
        jobs = batch.jobs.len(),
        workers = pool_size,
        provider = %provider_name,
        "starting batch"
    );

    let next_job = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel::<JobOutcome>();

    std::thread::scope(|scope| {
        for _ in 0..pool_size {
            let tx = tx.clone();
            let jobs = &batch.jobs;
            let next_job = &next_job;
            let gate = &gate;
            let locks = &locks;
            let primary = primary.as_ref();
            scope.spawn(move || loop {
                let index = next_job.fetch_add(1, Ordering::SeqCst);
                let Some(job) = jobs.get(index) else {
                    break;
                };
                let outcome = run_one(
                    job,
                    primary,
                    factory,
                    config,
                    output_root,
                    gate,
                    locks,
                    options,
                );
                if tx.send(outcome).is_err() {
                    break;
                }
            });
        }
        drop(tx);
        for outcome in rx {
            report.outcomes.push(outcome);
        }
    });

    // Stable report order regardless of completion order.
    report
        .outcomes
        .sort_by(|a, b| a.target_id.cmp(&b.target_id));

    locks.into_inner().unwrap().save()?;
    Ok(report)
}

/// Per-provider default model names
pub fn default_model(provider: &str) -> &'static str {
    match provider {
        "openai" => "gpt-image-1",
        "flux" => "flux-dev",
        _ => "mock-1",
    }
}

/// Pool size: the smallest explicit per-target concurrency, falling back to
/// the provider's default.
fn pool_size(jobs: &[Job], provider: &dyn ImageProvider) -> usize {
    jobs.iter()
        .filter_map(|j| j.policy.concurrency)
        .min()
        .unwrap_or(provider.capabilities().default_concurrency)
        .max(1)
}

#[allow(clippy::too_many_arguments)]
fn run_one(
    job: &Job,
    primary: &dyn ImageProvider,
    factory: ProviderFactory<'_>,
    config: &KilnConfig,
    output_root: &Path,
    gate: &PacingGate,
    locks: &Mutex<SelectionLocks>,
    options: &ExecutionOptions,
) -> JobOutcome {
    let start = Instant::now();

    if options.skip_locked {
        let held = locks
            .lock()
            .unwrap()
            .valid_entry(&job.target.id, &job.input_hash)
            .map(|e| e.selected_output_path.clone());
        if let Some(locked_path) = held {
            match restore_locked(job, &locked_path, output_root) {
                Ok(()) => {
                    debug!(target = %job.target.id, "selection lock honored, skipping");
                    return JobOutcome {
                        job_id: job.id.clone(),
                        target_id: job.target.id.clone(),
                        provider: job.provider.clone(),
                        status: JobStatus::Skipped,
                        error: None,
                        attempts: 0,
                        duration_secs: start.elapsed().as_secs_f64(),
                        selected_path: Some(job.out_path.clone()),
                        evaluation: None,
                    };
                }
                Err(e) => {
                    warn!(target = %job.target.id, error = %e, "locked output missing, regenerating");
                }
            }
        }
    }

    let mut attempts = 0u32;
    let mut last_error: Option<String> = None;
    let mut last_provider = job.provider.clone();

    // Ordered provider chain: primary first, then each declared fallback,
    // each with its own full retry budget.
    let chain: Vec<String> = std::iter::once(job.provider.clone())
        .chain(job.policy.fallback_providers.iter().cloned())
        .collect();

    for (chain_index, name) in chain.iter().enumerate() {
        let fallback_box;
        let (provider, provider_job) = if chain_index == 0 {
            (primary, job.clone())
        } else {
            match factory(name) {
                Ok(p) => fallback_box = p,
                Err(e) => {
                    warn!(provider = %name, error = %e, "fallback provider unavailable");
                    last_error = Some(e.to_string());
                    continue;
                }
            }
            // Re-plan against the fallback's capabilities; a target the
            // fallback cannot serve skips to the next link.
            let replanned = prepare_jobs(
                fallback_box.as_ref(),
                std::slice::from_ref(&job.target),
                &job.model,
                output_root,
            );
            match replanned.jobs.into_iter().next() {
                Some(j) => (fallback_box.as_ref(), j),
                None => {
                    let reason = replanned
                        .rejected
                        .first()
                        .map(|r| r.reason.clone())
                        .unwrap_or_else(|| "fallback rejected target".to_string());
                    warn!(provider = %name, %reason, "fallback cannot serve target");
                    last_error = Some(reason);
                    continue;
                }
            }
        };
        last_provider = name.clone();

        match execute_with_retries(
            provider,
            &provider_job,
            config,
            output_root,
            gate,
            &mut attempts,
        ) {
            Ok(evaluation) => {
                let selected_path = evaluation.best_path.clone();
                let accepted = evaluation.selected().map(|s| s.passed).unwrap_or(false);
                // Locks pin accepted results only: a winner that failed
                // hard gates must be regenerated on the next run.
                if options.approve_on_success && accepted {
                    if let Some(path) = &selected_path {
                        let relative = path
                            .strip_prefix(output_root)
                            .map(|p| p.to_path_buf())
                            .unwrap_or_else(|_| path.clone());
                        locks.lock().unwrap().approve(
                            &job.target.id,
                            &job.input_hash,
                            &relative,
                        );
                    }
                } else if options.approve_on_success {
                    warn!(
                        target = %job.target.id,
                        "selected candidate failed acceptance, not locking"
                    );
                }
                return JobOutcome {
                    job_id: provider_job.id.clone(),
                    target_id: job.target.id.clone(),
                    provider: name.clone(),
                    status: JobStatus::Succeeded,
                    error: None,
                    attempts,
                    duration_secs: start.elapsed().as_secs_f64(),
                    selected_path,
                    evaluation: Some(evaluation),
                };
            }
            Err(e) => {
                last_error = Some(e.to_string());
                if !is_retryable(&e) {
                    // Non-retryable on this provider; the next chain link
                    // may still have the capability or a working key.
                    debug!(provider = %name, error = %e, "provider failed, trying next in chain");
                }
            }
        }
    }

    JobOutcome {
        job_id: job.id.clone(),
        target_id: job.target.id.clone(),
        provider: last_provider,
        status: JobStatus::Failed,
        error: last_error,
        attempts,
        duration_secs: start.elapsed().as_secs_f64(),
        selected_path: None,
        evaluation: None,
    }
}

/// Copy a locked selection's bytes to the job's output path, verbatim.
fn restore_locked(job: &Job, locked_path: &Path, output_root: &Path) -> Result<()> {
    let source = if locked_path.is_absolute() {
        resolve_within_root(output_root, locked_path.strip_prefix(output_root).map_err(
            |_| KilnError::Lock(format!("locked path {} outside root", locked_path.display())),
        )?)?
    } else {
        resolve_within_root(output_root, locked_path)?
    };
    if !source.exists() {
        return Err(KilnError::Lock(format!(
            "locked output {} does not exist",
            source.display()
        )));
    }
    if source != job.out_path {
        if let Some(parent) = job.out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&source, &job.out_path)?;
    }
    Ok(())
}

/// One provider's full attempt budget for one job: paced start, exponential
/// backoff between retryable failures, evaluation on success.
fn execute_with_retries(
    provider: &dyn ImageProvider,
    job: &Job,
    config: &KilnConfig,
    output_root: &Path,
    gate: &PacingGate,
    attempts: &mut u32,
) -> Result<Evaluation> {
    let spacing = job
        .policy
        .start_spacing()
        .max(Duration::from_millis(provider.capabilities().min_delay_ms));
    let max_attempts = job.policy.max_retries + 1;
    let mut last = None;

    for attempt in 0..max_attempts {
        gate.wait_turn(spacing);
        *attempts += 1;

        let result = execute_once(provider, job, config, output_root);
        match result {
            Ok(evaluation) => return Ok(evaluation),
            Err(e) => {
                let retry = is_retryable(&e) && attempt + 1 < max_attempts;
                warn!(
                    job = %job.id,
                    provider = %provider.name(),
                    attempt = attempt + 1,
                    error = %e,
                    retrying = retry,
                    "job attempt failed"
                );
                if !retry {
                    return Err(e);
                }
                last = Some(e);
                std::thread::sleep(Duration::from_millis(
                    RETRY_BASE_DELAY_MS.saturating_mul(1u64 << attempt.min(6)),
                ));
            }
        }
    }

    Err(last.unwrap_or_else(|| {
        KilnError::Provider {
            provider: provider.name().to_string(),
            code: "Unknown".to_string(),
            message: "retry budget exhausted".to_string(),
        }
    }))
}

/// Single generation attempt, direct or coarse-to-fine, through evaluation.
fn execute_once(
    provider: &dyn ImageProvider,
    job: &Job,
    config: &KilnConfig,
    output_root: &Path,
) -> Result<Evaluation> {
    if let Some(ctf) = &job.policy.coarse_to_fine {
        let outcome = run_coarse_to_fine(provider, job, ctf, config, output_root)?;
        if outcome.promoted.is_empty() {
            return Err(KilnError::Evaluation(format!(
                "all {} drafts failed acceptance",
                outcome.drafts.scores.len()
            )));
        }
        return Ok(outcome.evaluation);
    }

    let run = provider.run_job(job, output_root).map_err(|e| {
        KilnError::Provider {
            provider: e.provider.clone(),
            code: format!("{:?}", e.code),
            message: e.message,
        }
    })?;
    score_candidates(
        EvalContext::new(config),
        &job.target,
        &job.policy,
        &run.candidate_paths,
    )
}

/// Retryability of an error after it crossed the provider boundary
fn is_retryable(e: &KilnError) -> bool {
    match e {
        KilnError::Provider { code, .. } => {
            matches!(
                code.as_str(),
                "Timeout" | "Connection" | "RateLimited" | "ServerError"
            )
        }
        KilnError::Io(_) => true,
        _ => false,
    }
}
