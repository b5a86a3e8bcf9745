//! Soft adapter and VLM gate invocation
//!
//! External perceptual metrics and rubric graders are opaque services behind
//! one wire protocol: a JSON payload in, a JSON response out, over either a
//! subprocess (newline-delimited JSON on stdin/stdout) or an HTTP POST.
//! Every call runs under a bounded timeout; a timed-out subprocess is killed,
//! not abandoned. Failures here degrade scoring, they never block the run.

use crate::target::{AssetKind, Target};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_ADAPTER_TIMEOUT_MS: u64 = 30_000;
pub const VLM_MAX_SCORE: f64 = 5.0;

/// How an adapter endpoint is reached
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "transport")]
pub enum AdapterTransport {
    /// Spawn a process, write one JSON line to stdin, read one from stdout
    Subprocess { command: Vec<String> },
    /// POST the payload as JSON, parse the JSON response body
    Http { url: String },
}

/// One configured adapter or VLM endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterEndpoint {
    #[serde(flatten)]
    pub transport: AdapterTransport,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_ADAPTER_TIMEOUT_MS
}

impl AdapterEndpoint {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Transport or protocol failure while invoking an adapter.
///
/// Never escalates past the evaluator: callers convert these to warning
/// strings on the affected candidate's score record.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("adapter timed out after {0:?}")]
    Timeout(Duration),
    #[error("adapter transport failed: {0}")]
    Transport(String),
    #[error("adapter response unparseable: {0}")]
    Parse(String),
    #[error("adapter response contains no numeric value")]
    MissingScore,
}

/// Target summary forwarded to adapters
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterTargetInfo {
    pub id: String,
    pub kind: AssetKind,
    pub out: String,
    pub style_kit_id: Option<String>,
    pub consistency_group: Option<String>,
    pub evaluation_profile_id: Option<String>,
}

impl AdapterTargetInfo {
    pub fn from_target(target: &Target) -> Self {
        Self {
            id: target.id.clone(),
            kind: target.kind,
            out: target.out.to_string_lossy().to_string(),
            style_kit_id: target.style_kit_id.clone(),
            consistency_group: target.consistency_group.clone(),
            evaluation_profile_id: target.evaluation_profile_id.clone(),
        }
    }
}

/// Wire payload sent to adapters and VLM gates
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterPayload {
    pub adapter: String,
    pub image_path: String,
    pub prompt: String,
    pub reference_images: Vec<String>,
    pub target: AdapterTargetInfo,
    /// VLM-only fields; absent for plain adapters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rubric: Option<String>,
}

impl AdapterPayload {
    pub fn new(adapter: &str, image_path: &Path, prompt: &str, target: &Target) -> Self {
        Self {
            adapter: adapter.to_string(),
            image_path: image_path.to_string_lossy().to_string(),
            prompt: prompt.to_string(),
            reference_images: target
                .control_images
                .iter()
                .map(|p| p.to_string_lossy().to_string())
                .collect(),
            target: AdapterTargetInfo::from_target(target),
            threshold: None,
            max_score: None,
            rubric: None,
        }
    }

    /// Extend a payload with the VLM gate fields
    pub fn with_vlm_gate(mut self, threshold: f64, rubric: Option<String>) -> Self {
        self.threshold = Some(threshold);
        self.max_score = Some(VLM_MAX_SCORE);
        self.rubric = rubric;
        self
    }
}

/// Wire response from an adapter or VLM gate
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdapterResponse {
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl AdapterResponse {
    /// The score to use. The protocol allows both a top-level `score` and a
    /// `metrics.score`; the top-level field wins when both are present.
    /// Known protocol ambiguity, preserved for wire compatibility.
    pub fn effective_score(&self) -> Option<f64> {
        self.score.or_else(|| self.metrics.get("score").copied())
    }

    fn has_numeric_value(&self) -> bool {
        self.score.is_some() || !self.metrics.is_empty()
    }
}

/// Invoke one adapter endpoint under its timeout.
pub fn invoke_adapter(
    endpoint: &AdapterEndpoint,
    payload: &AdapterPayload,
) -> Result<AdapterResponse, AdapterError> {
    let response = match &endpoint.transport {
        AdapterTransport::Http { url } => invoke_http(url, endpoint.timeout(), payload)?,
        AdapterTransport::Subprocess { command } => {
            invoke_subprocess(command, endpoint.timeout(), payload)?
        }
    };

    if !response.has_numeric_value() {
        return Err(AdapterError::MissingScore);
    }
    Ok(response)
}

fn invoke_http(
    url: &str,
    timeout: Duration,
    payload: &AdapterPayload,
) -> Result<AdapterResponse, AdapterError> {
    let config = ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build();
    let agent: ureq::Agent = config.into();

    debug!(%url, adapter = %payload.adapter, "invoking http adapter");
    let mut reply = agent
        .post(url)
        .header("Content-Type", "application/json")
        .send_json(payload)
        .map_err(|e| match e {
            ureq::Error::Timeout(_) => AdapterError::Timeout(timeout),
            other => AdapterError::Transport(other.to_string()),
        })?;

    reply
        .body_mut()
        .read_json()
        .map_err(|e| AdapterError::Parse(e.to_string()))
}

fn invoke_subprocess(
    command: &[String],
    timeout: Duration,
    payload: &AdapterPayload,
) -> Result<AdapterResponse, AdapterError> {
    let program = command
        .first()
        .ok_or_else(|| AdapterError::Transport("empty adapter command".to_string()))?;

    debug!(%program, adapter = %payload.adapter, "invoking subprocess adapter");
    let mut child = Command::new(program)
        .args(&command[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| AdapterError::Transport(format!("spawn {}: {}", program, e)))?;

    let line = serde_json::to_string(payload)
        .map_err(|e| AdapterError::Transport(format!("serialize payload: {}", e)))?;
    {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AdapterError::Transport("no stdin handle".to_string()))?;
        writeln!(stdin, "{}", line)
            .map_err(|e| AdapterError::Transport(format!("write stdin: {}", e)))?;
        // Dropping stdin closes the pipe so line-based adapters can flush.
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AdapterError::Transport("no stdout handle".to_string()))?;

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();
        let result = reader.read_line(&mut line).map(|_| line);
        // Receiver may be gone after a timeout.
        let _ = tx.send(result);
    });

    match rx.recv_timeout(timeout) {
        Ok(Ok(line)) => {
            let _ = child.wait();
            serde_json::from_str(line.trim()).map_err(|e| AdapterError::Parse(e.to_string()))
        }
        Ok(Err(e)) => {
            let _ = child.wait();
            Err(AdapterError::Transport(format!("read stdout: {}", e)))
        }
        Err(_) => {
            // Active abort: kill the child so the process does not leak.
            let _ = child.kill();
            let _ = child.wait();
            Err(AdapterError::Timeout(timeout))
        }
    }
}

/// VLM gate verdict derived from an adapter response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VlmVerdict {
    pub score: f64,
    pub passed: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Interpret an adapter response as a VLM rubric verdict against a threshold.
pub fn vlm_verdict(
    response: &AdapterResponse,
    threshold: f64,
) -> Result<VlmVerdict, AdapterError> {
    let score = response
        .effective_score()
        .ok_or(AdapterError::MissingScore)?
        .clamp(0.0, VLM_MAX_SCORE);
    Ok(VlmVerdict {
        score,
        passed: score >= threshold,
        reason: response.reason.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{AcceptanceSpec, GenerationPolicy, PromptSpec};
    use std::path::PathBuf;

    fn test_target() -> Target {
        Target {
            id: "hero".to_string(),
            kind: AssetKind::Sprite,
            out: PathBuf::from("sprites/hero.png"),
            prompt: PromptSpec {
                description: "a hero".to_string(),
                ..Default::default()
            },
            policy: GenerationPolicy::default(),
            acceptance: AcceptanceSpec::default(),
            edit_from: None,
            control_images: vec![],
            style_kit_id: Some("kit1".to_string()),
            consistency_group: None,
            evaluation_profile_id: None,
            hints: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_payload_shape_is_camel_case() {
        let payload = AdapterPayload::new(
            "clip",
            Path::new("/out/sprites/hero.png"),
            "a hero",
            &test_target(),
        );
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["adapter"], "clip");
        assert_eq!(json["imagePath"], "/out/sprites/hero.png");
        assert!(json["referenceImages"].is_array());
        assert_eq!(json["target"]["styleKitId"], "kit1");
        assert!(json.get("threshold").is_none());
    }

    #[test]
    fn test_vlm_payload_adds_gate_fields() {
        let payload = AdapterPayload::new(
            "vlm",
            Path::new("/out/sprites/hero.png"),
            "a hero",
            &test_target(),
        )
        .with_vlm_gate(3.5, Some("judge readability".to_string()));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["threshold"], 3.5);
        assert_eq!(json["maxScore"], 5.0);
        assert_eq!(json["rubric"], "judge readability");
    }

    #[test]
    fn test_top_level_score_wins_over_metrics_score() {
        let response: AdapterResponse =
            serde_json::from_str(r#"{"score": 0.9, "metrics": {"score": 0.1, "ssim": 0.7}}"#)
                .unwrap();
        assert_eq!(response.effective_score(), Some(0.9));
    }

    #[test]
    fn test_metrics_score_used_when_top_level_absent() {
        let response: AdapterResponse =
            serde_json::from_str(r#"{"metrics": {"score": 0.4}}"#).unwrap();
        assert_eq!(response.effective_score(), Some(0.4));
    }

    #[test]
    fn test_empty_response_is_missing_score() {
        let endpoint = AdapterEndpoint {
            transport: AdapterTransport::Subprocess {
                command: vec!["true".to_string()],
            },
            timeout_ms: 2_000,
        };
        let payload = AdapterPayload::new(
            "noop",
            Path::new("/tmp/x.png"),
            "prompt",
            &test_target(),
        );
        // `true` writes nothing; an empty line parses to no numeric value.
        // The child can also exit before the payload write lands, which
        // surfaces as a broken-pipe transport error.
        let err = invoke_adapter(&endpoint, &payload).unwrap_err();
        assert!(matches!(
            err,
            AdapterError::Parse(_) | AdapterError::MissingScore | AdapterError::Transport(_)
        ));
    }

    #[test]
    fn test_subprocess_roundtrip_with_cat() {
        // `cat` echoes the payload back; it has no metrics/score fields, so
        // the protocol rejects it, but transport and parsing must succeed
        // past the JSON stage.
        let endpoint = AdapterEndpoint {
            transport: AdapterTransport::Subprocess {
                command: vec!["cat".to_string()],
            },
            timeout_ms: 2_000,
        };
        let payload = AdapterPayload::new(
            "echo",
            Path::new("/tmp/x.png"),
            "prompt",
            &test_target(),
        );
        let err = invoke_adapter(&endpoint, &payload).unwrap_err();
        assert!(matches!(err, AdapterError::MissingScore));
    }

    #[test]
    fn test_subprocess_timeout_kills_child() {
        let endpoint = AdapterEndpoint {
            transport: AdapterTransport::Subprocess {
                command: vec!["sleep".to_string(), "30".to_string()],
            },
            timeout_ms: 100,
        };
        let payload = AdapterPayload::new(
            "slow",
            Path::new("/tmp/x.png"),
            "prompt",
            &test_target(),
        );
        let start = std::time::Instant::now();
        let err = invoke_adapter(&endpoint, &payload).unwrap_err();
        assert!(matches!(err, AdapterError::Timeout(_)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_vlm_verdict_threshold() {
        let response = AdapterResponse {
            metrics: BTreeMap::new(),
            score: Some(4.2),
            reason: Some("clean silhouette".to_string()),
        };
        let verdict = vlm_verdict(&response, 3.5).unwrap();
        assert!(verdict.passed);
        assert_eq!(verdict.score, 4.2);

        let verdict = vlm_verdict(&response, 4.5).unwrap();
        assert!(!verdict.passed);
    }

    #[test]
    fn test_vlm_verdict_clamped_to_rubric_range() {
        let response = AdapterResponse {
            metrics: BTreeMap::new(),
            score: Some(11.0),
            reason: None,
        };
        let verdict = vlm_verdict(&response, 3.0).unwrap();
        assert_eq!(verdict.score, VLM_MAX_SCORE);
    }
}
