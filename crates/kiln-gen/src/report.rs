//! Run reporting
//!
//! Aggregated per-job outcomes for one scheduler run, plus a console
//! summary. One target failing never hides the outcomes of the rest.

use crate::evaluate::Evaluation;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Terminal status of one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Generated, evaluated, and a winner selected
    Succeeded,
    /// A valid selection lock was honored; no provider call made
    Skipped,
    /// Exhausted retries and fallbacks, or failed a non-retryable way
    Failed,
}

/// Outcome of one job after retries, fallbacks, and evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: String,
    pub target_id: String,
    /// Provider that produced the result (the last one tried, on failure)
    pub provider: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Total provider attempts across the fallback chain
    pub attempts: u32,
    pub duration_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<Evaluation>,
}

/// Aggregated result of one run
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub outcomes: Vec<JobOutcome>,
    /// Targets rejected before scheduling (policy errors, path escapes)
    pub rejected: Vec<RejectedOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedOutcome {
    pub target_id: String,
    pub reason: String,
}

impl RunReport {
    pub fn count(&self, status: JobStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(JobStatus::Succeeded)
    }

    pub fn skipped(&self) -> usize {
        self.count(JobStatus::Skipped)
    }

    pub fn failed(&self) -> usize {
        self.count(JobStatus::Failed) + self.rejected.len()
    }

    /// Whether every scheduled and rejected target came through clean
    pub fn all_ok(&self) -> bool {
        self.failed() == 0
    }

    /// Print a formatted summary
    pub fn print_summary(&self) {
        println!("Run summary:");
        println!(
            "  Jobs: {} succeeded, {} skipped, {} failed, {} rejected",
            self.succeeded(),
            self.skipped(),
            self.count(JobStatus::Failed),
            self.rejected.len()
        );
        for outcome in &self.outcomes {
            let icon = match outcome.status {
                JobStatus::Succeeded => "OK",
                JobStatus::Skipped => "SKIP",
                JobStatus::Failed => "FAIL",
            };
            match &outcome.error {
                Some(err) => println!(
                    "  {}: {} via {} ({} attempts)  {}",
                    outcome.target_id, err, outcome.provider, outcome.attempts, icon
                ),
                None => println!(
                    "  {}: {} in {:.1}s  {}",
                    outcome.target_id,
                    outcome
                        .selected_path
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    outcome.duration_secs,
                    icon
                ),
            }
        }
        for rejected in &self.rejected {
            println!("  {}: {}  REJECTED", rejected.target_id, rejected.reason);
        }
        if self.all_ok() {
            println!("  Result: PASSED");
        } else {
            println!("  Result: FAILED ({} issues)", self.failed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(target: &str, status: JobStatus) -> JobOutcome {
        JobOutcome {
            job_id: "abc123".to_string(),
            target_id: target.to_string(),
            provider: "mock".to_string(),
            status,
            error: None,
            attempts: 1,
            duration_secs: 0.5,
            selected_path: None,
            evaluation: None,
        }
    }

    #[test]
    fn test_counts_include_rejections_in_failures() {
        let report = RunReport {
            outcomes: vec![
                outcome("a", JobStatus::Succeeded),
                outcome("b", JobStatus::Skipped),
                outcome("c", JobStatus::Failed),
            ],
            rejected: vec![RejectedOutcome {
                target_id: "d".to_string(),
                reason: "output path escapes root".to_string(),
            }],
        };
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.failed(), 2);
        assert!(!report.all_ok());
    }

    #[test]
    fn test_clean_run_is_ok() {
        let report = RunReport {
            outcomes: vec![
                outcome("a", JobStatus::Succeeded),
                outcome("b", JobStatus::Skipped),
            ],
            rejected: vec![],
        };
        assert!(report.all_ok());
    }

    #[test]
    fn test_outcome_serializes_without_empty_fields() {
        let json = serde_json::to_value(outcome("a", JobStatus::Succeeded)).unwrap();
        assert_eq!(json["status"], "succeeded");
        assert!(json.get("error").is_none());
        assert!(json.get("evaluation").is_none());
    }
}
