//! Deterministic job identity
//!
//! Input hashes and job ids are content hashes over canonical serializations
//! (`kiln_core::canonical`): identical inputs always yield identical ids,
//! regardless of the key order they were built in. This is what makes
//! planning idempotent and selection locks safe to honor across runs.

use crate::policy::NormalizedPolicy;
use crate::target::{GenerationPolicy, Target};
use kiln_core::{canonical, ContentHash, KilnError, Result};
use serde_json::json;

/// Compute the input hash binding a target (and optional policy override)
/// to its generated output. Any edit to the target invalidates the hash.
pub fn compute_input_hash(
    target: &Target,
    policy_override: Option<&GenerationPolicy>,
) -> Result<ContentHash> {
    let payload = json!({
        "target": target,
        "policy": policy_override.unwrap_or(&target.policy),
    });
    canonical::hash_canonical(&payload).map_err(KilnError::Json)
}

/// Derive the deterministic job id for one (provider, target, model) binding.
///
/// The id covers the prompt, the input hash, and every resolved policy field
/// a provider consults; changing any of them changes the id.
pub fn job_id(
    provider: &str,
    target: &Target,
    model: &str,
    input_hash: &ContentHash,
    policy: &NormalizedPolicy,
) -> Result<String> {
    let prompt = target.prompt.assemble();
    if prompt.is_empty() {
        return Err(KilnError::MissingRequiredField(format!(
            "target '{}': prompt",
            target.id
        )));
    }

    let tuple = json!({
        "provider": provider,
        "target_id": target.id,
        "kind": target.kind,
        "out": target.out,
        "prompt": prompt,
        "model": model,
        "input_hash": input_hash.to_prefixed_hex(),
        "size": policy.size,
        "quality": policy.quality,
        "background": policy.background,
        "format": policy.format,
        "candidates": policy.candidates,
    });
    let hash = canonical::hash_canonical(&tuple).map_err(KilnError::Json)?;
    Ok(hash.to_short_hex())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderCapabilities;
    use crate::target::{AcceptanceSpec, AssetKind, PromptSpec};
    use std::path::PathBuf;

    fn test_target(description: &str) -> Target {
        Target {
            id: "golem".to_string(),
            kind: AssetKind::Sprite,
            out: PathBuf::from("sprites/golem.png"),
            prompt: PromptSpec {
                description: description.to_string(),
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

    fn normalized(target: &Target) -> NormalizedPolicy {
        crate::policy::normalize_policy(target, &ProviderCapabilities::default()).0
    }

    #[test]
    fn test_input_hash_is_stable() {
        let target = test_target("a stone golem");
        let h1 = compute_input_hash(&target, None).unwrap();
        let h2 = compute_input_hash(&target, None).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_input_hash_changes_on_edit() {
        let a = test_target("a stone golem");
        let mut b = test_target("a stone golem");
        b.prompt.description = "a clay golem".to_string();
        assert_ne!(
            compute_input_hash(&a, None).unwrap(),
            compute_input_hash(&b, None).unwrap()
        );
    }

    #[test]
    fn test_policy_override_changes_hash() {
        let target = test_target("a stone golem");
        let override_policy = GenerationPolicy {
            candidates: Some(3),
            ..Default::default()
        };
        assert_ne!(
            compute_input_hash(&target, None).unwrap(),
            compute_input_hash(&target, Some(&override_policy)).unwrap()
        );
    }

    #[test]
    fn test_job_id_deterministic() {
        let target = test_target("a stone golem");
        let policy = normalized(&target);
        let input_hash = compute_input_hash(&target, None).unwrap();
        let a = job_id("openai", &target, "gpt-image-1", &input_hash, &policy).unwrap();
        let b = job_id("openai", &target, "gpt-image-1", &input_hash, &policy).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_job_id_sensitive_to_each_field() {
        let target = test_target("a stone golem");
        let policy = normalized(&target);
        let input_hash = compute_input_hash(&target, None).unwrap();
        let base = job_id("openai", &target, "gpt-image-1", &input_hash, &policy).unwrap();

        let other_provider =
            job_id("flux", &target, "gpt-image-1", &input_hash, &policy).unwrap();
        assert_ne!(base, other_provider);

        let other_model = job_id("openai", &target, "gpt-image-2", &input_hash, &policy).unwrap();
        assert_ne!(base, other_model);

        let mut wider = policy.clone();
        wider.size = crate::target::ImageSize::new(2048, 2048);
        let other_size = job_id("openai", &target, "gpt-image-1", &input_hash, &wider).unwrap();
        assert_ne!(base, other_size);

        let mut more = policy.clone();
        more.candidates = 4;
        let other_count = job_id("openai", &target, "gpt-image-1", &input_hash, &more).unwrap();
        assert_ne!(base, other_count);
    }

    #[test]
    fn test_empty_prompt_is_an_error() {
        let target = test_target("");
        let policy = normalized(&target);
        let input_hash = compute_input_hash(&target, None).unwrap();
        let err = job_id("openai", &target, "gpt-image-1", &input_hash, &policy);
        assert!(matches!(err, Err(KilnError::MissingRequiredField(_))));
    }
}
