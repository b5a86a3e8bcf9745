//! Kiln - game-art generation and evaluation pipeline
//!
//! Turns declarative asset targets into provider jobs with deterministic
//! identities, schedules them across pluggable image backends (OpenAI,
//! Flux, mock) with pacing, retries, and fallback chains, then scores every
//! candidate against hard acceptance gates and weighted soft metrics before
//! selecting a single winner. Approved selections pin into a lock file so
//! unchanged targets are never regenerated.

pub mod adapter;
pub mod config;
pub mod evaluate;
pub mod identity;
pub mod lock;
pub mod pathsafe;
pub mod policy;
pub mod promote;
pub mod provider;
pub mod providers;
pub mod report;
pub mod scheduler;
pub mod target;

pub use config::KilnConfig;
pub use evaluate::{score_candidates, CandidateScore, EvalContext, Evaluation};
pub use identity::{compute_input_hash, job_id};
pub use lock::SelectionLocks;
pub use policy::{normalize_policy, NormalizedPolicy, PolicyIssue};
pub use provider::{
    prepare_jobs, Feature, ImageProvider, Job, PreparedBatch, ProviderCapabilities,
    ProviderError, ProviderErrorCode, ProviderStatus, RunResult,
};
pub use report::{JobOutcome, JobStatus, RunReport};
pub use scheduler::{run_batch, ExecutionOptions};
pub use target::{AcceptanceSpec, AssetKind, GenerationPolicy, ImageSize, PromptSpec, Target};
