use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::bucketing::normalized_hash;
use crate::context::EvaluationContext;
use crate::flag::{Flag, Rollout, Variant};
use crate::flag_value::FlagValue;

fn is_false(b: &bool) -> bool {
    !(*b)
}

/// The outcome of a flag evaluation: the variant a context was assigned to,
/// plus the exposure metadata that travels with it.
///
/// Providers hand back a caller-supplied `SelectedVariant` fallback when a
/// flag does not resolve; [SelectedVariant::fallback] builds one from a bare
/// value, with no variant key attached.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct SelectedVariant {
    /// Key of the assigned variant. None only for caller-constructed
    /// fallbacks that never resolved to a ruleset variant.
    #[serde(default)]
    pub variant_key: Option<String>,
    pub variant_value: FlagValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_experiment_active: Option<bool>,
    /// True when the variant came from a test-user override rather than
    /// bucketing.
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_qa_tester: bool,
}

impl SelectedVariant {
    /// A fallback result carrying `value`, for when a flag cannot resolve.
    pub fn fallback(value: impl Into<FlagValue>) -> Self {
        SelectedVariant {
            variant_key: None,
            variant_value: value.into(),
            experiment_id: None,
            is_experiment_active: None,
            is_qa_tester: false,
        }
    }

    fn assigned(variant: &Variant, flag: &Flag, is_qa_tester: bool) -> Self {
        SelectedVariant {
            variant_key: Some(variant.key.clone()),
            variant_value: variant.value.clone(),
            experiment_id: flag.experiment_id,
            is_experiment_active: flag.is_experiment_active,
            is_qa_tester,
        }
    }
}

/// Assigns `context` to one of `flag`'s variants, or `None` when the context
/// is not eligible for any rollout.
///
/// This is a pure function over the rule model and the deterministic hash:
/// identical inputs always produce the identical assignment, with no I/O and
/// no per-process state. The evaluator knows nothing about exposure events;
/// reporting them is the provider's responsibility.
pub fn evaluate(flag: &Flag, context: &EvaluationContext) -> Option<SelectedVariant> {
    let context_value = match context.get(&flag.context) {
        Some(value) => value,
        None => {
            warn!(
                "the rollout context {} for flag {} is not present in the supplied evaluation context",
                flag.context, flag.key
            );
            return None;
        }
    };

    if let Some(variant) = test_user_override(flag, context) {
        return Some(variant);
    }

    match assigned_rollout(flag, context_value, context) {
        Some(rollout) => assigned_variant(flag, context_value, rollout),
        None => {
            debug!(
                "{} context {} not eligible for any rollout for flag {}",
                flag.context, context_value, flag.key
            );
            None
        }
    }
}

// Full case folding rather than ASCII-only: property values may be non-ASCII
// and the comparison must agree with the other SDKs.
fn eq_ignore_case(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

fn find_variant<'a>(variants: &'a [Variant], key: &str) -> Option<&'a Variant> {
    variants.iter().find(|variant| eq_ignore_case(&variant.key, key))
}

/// QA testers listed in the ruleset get their recorded variant immediately,
/// exempt from rollout-percentage gating and hashing.
fn test_user_override(flag: &Flag, context: &EvaluationContext) -> Option<SelectedVariant> {
    let test = flag.ruleset.test.as_ref()?;
    let distinct_id = context.distinct_id()?;
    let variant_key = test.users.get(distinct_id)?;

    match find_variant(&flag.ruleset.variants, variant_key) {
        Some(variant) => Some(SelectedVariant::assigned(variant, flag, true)),
        None => {
            warn!(
                "test user {} is assigned variant {} which is not in the ruleset of flag {}",
                distinct_id, variant_key, flag.key
            );
            None
        }
    }
}

fn assigned_rollout<'a>(
    flag: &'a Flag,
    context_value: &str,
    context: &EvaluationContext,
) -> Option<&'a Rollout> {
    flag.ruleset
        .rollout
        .iter()
        .enumerate()
        .find(|(index, rollout)| {
            let bucket = normalized_hash(context_value, &flag.rollout_salt(*index));
            bucket < rollout.rollout_percentage / 100.0
                && runtime_evaluation_satisfied(rollout, context)
        })
        .map(|(_, rollout)| rollout)
}

fn runtime_evaluation_satisfied(rollout: &Rollout, context: &EvaluationContext) -> bool {
    let definition = match &rollout.runtime_evaluation_definition {
        Some(definition) if !definition.is_empty() => definition,
        _ => return true,
    };

    definition.iter().all(|(property, expected)| {
        context
            .custom_property(property)
            .map_or(false, |actual| eq_ignore_case(actual, expected))
    })
}

fn assigned_variant(
    flag: &Flag,
    context_value: &str,
    rollout: &Rollout,
) -> Option<SelectedVariant> {
    if let Some(variant_override) = &rollout.variant_override {
        match find_variant(&flag.ruleset.variants, &variant_override.key) {
            Some(variant) => return Some(SelectedVariant::assigned(variant, flag, false)),
            None => warn!(
                "variant override {} does not name a variant of flag {}",
                variant_override.key, flag.key
            ),
        }
    }

    if flag.ruleset.variants.is_empty() {
        warn!("flag {} has no variants configured", flag.key);
        return None;
    }

    let mut variants: Vec<Variant> = flag.ruleset.variants.clone();
    if let Some(splits) = &rollout.variant_splits {
        for variant in variants.iter_mut() {
            if let Some(split) = splits.get(&variant.key) {
                variant.split = *split;
            }
        }
    }

    let bucket = normalized_hash(context_value, &flag.variant_salt());
    let mut sum = 0.0;
    for variant in &variants {
        sum += variant.split / 100.0;
        if bucket < sum {
            return Some(SelectedVariant::assigned(variant, flag, false));
        }
    }
    // Splits need not sum to exactly 100; a rounding shortfall lands on the
    // last variant.
    variants
        .last()
        .map(|variant| SelectedVariant::assigned(variant, flag, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_common::FlagBuilder;
    use spectral::prelude::*;
    use test_case::test_case;

    // Bucket vectors for the default test flag (key "test_flag", no
    // hash_salt): user123 gates at 0.10 and buckets variants at 0.62,
    // test_user at 0.09 / 0.85, qa_user at 0.15 / 0.03, user789 at
    // 0.24 / 0.12.

    #[test]
    fn missing_context_attribute_is_no_match() {
        let flag = FlagBuilder::new("test_flag").context("user_id").build();
        let context = EvaluationContext::new("user123");
        assert_that!(evaluate(&flag, &context)).is_none();
    }

    #[test]
    fn full_rollout_assigns_every_context() {
        let flag = FlagBuilder::new("test_flag").rollout_percentage(100.0).build();
        for i in 0..100 {
            let context = EvaluationContext::new(format!("user{}", i));
            assert_that!(evaluate(&flag, &context)).is_some();
        }
    }

    #[test]
    fn zero_rollout_assigns_no_context() {
        let flag = FlagBuilder::new("test_flag").rollout_percentage(0.0).build();
        for i in 0..100 {
            let context = EvaluationContext::new(format!("user{}", i));
            assert_that!(evaluate(&flag, &context)).is_none();
        }
    }

    #[test_case("user123", "treatment"; "bucket 0.62 lands past control's half")]
    #[test_case("user789", "control"; "bucket 0.12 lands inside control's half")]
    fn split_assignment_is_deterministic(distinct_id: &str, expected_key: &str) {
        let flag = FlagBuilder::new("test_flag").build();
        let variant = evaluate(&flag, &EvaluationContext::new(distinct_id)).unwrap();
        assert_that!(variant.variant_key).contains_value(expected_key.to_string());
        assert_that!(variant.is_qa_tester).is_false();
    }

    #[test]
    fn partial_rollout_gates_by_bucket() {
        // user123 gates at 0.10: admitted at 11%, excluded at 10%.
        let admitted = FlagBuilder::new("test_flag").rollout_percentage(11.0).build();
        let excluded = FlagBuilder::new("test_flag").rollout_percentage(10.0).build();
        let context = EvaluationContext::new("user123");
        assert_that!(evaluate(&admitted, &context)).is_some();
        assert_that!(evaluate(&excluded, &context)).is_none();
    }

    #[test]
    fn first_matching_rollout_wins() {
        let flag = FlagBuilder::new("test_flag")
            .rollouts(vec![
                serde_json::json!({
                    "rollout_percentage": 100.0,
                    "variant_override": {"key": "control"}
                }),
                serde_json::json!({
                    "rollout_percentage": 100.0,
                    "variant_override": {"key": "treatment"}
                }),
            ])
            .build();
        let variant = evaluate(&flag, &EvaluationContext::new("user123")).unwrap();
        assert_that!(variant.variant_key).contains_value("control".to_string());
    }

    #[test]
    fn ineligible_rollout_falls_through_to_the_next() {
        let flag = FlagBuilder::new("test_flag")
            .rollouts(vec![
                serde_json::json!({
                    "rollout_percentage": 100.0,
                    "runtime_evaluation_definition": {"plan": "premium"},
                    "variant_override": {"key": "treatment"}
                }),
                serde_json::json!({
                    "rollout_percentage": 100.0,
                    "variant_override": {"key": "control"}
                }),
            ])
            .build();
        let context = EvaluationContext::new("user123");
        let variant = evaluate(&flag, &context).unwrap();
        assert_that!(variant.variant_key).contains_value("control".to_string());
    }

    #[test_case("premium", true; "exact match")]
    #[test_case("PREMIUM", true; "case insensitive match")]
    #[test_case("basic", false; "mismatch")]
    fn runtime_evaluation_compares_case_insensitively(plan: &str, eligible: bool) {
        let flag = FlagBuilder::new("test_flag")
            .rollouts(vec![serde_json::json!({
                "rollout_percentage": 100.0,
                "runtime_evaluation_definition": {"plan": "premium"}
            })])
            .build();
        let context = EvaluationContext::new("user123").with_custom_property("plan", plan);
        assert_eq!(evaluate(&flag, &context).is_some(), eligible);
    }

    #[test]
    fn runtime_evaluation_requires_every_pair() {
        let flag = FlagBuilder::new("test_flag")
            .rollouts(vec![serde_json::json!({
                "rollout_percentage": 100.0,
                "runtime_evaluation_definition": {"plan": "premium", "region": "US"}
            })])
            .build();

        let both = EvaluationContext::new("user123")
            .with_custom_property("plan", "premium")
            .with_custom_property("region", "us");
        assert_that!(evaluate(&flag, &both)).is_some();

        let one = EvaluationContext::new("user123").with_custom_property("plan", "premium");
        assert_that!(evaluate(&flag, &one)).is_none();

        let none = EvaluationContext::new("user123");
        assert_that!(evaluate(&flag, &none)).is_none();
    }

    #[test]
    fn test_user_override_bypasses_rollout_gating() {
        let flag = FlagBuilder::new("test_flag")
            .rollout_percentage(0.0)
            .test_user("qa_user", "treatment")
            .build();
        let variant = evaluate(&flag, &EvaluationContext::new("qa_user")).unwrap();
        assert_that!(variant.variant_key).contains_value("treatment".to_string());
        assert_that!(variant.is_qa_tester).is_true();
    }

    #[test]
    fn test_user_variant_key_matches_case_insensitively() {
        let flag = FlagBuilder::new("test_flag")
            .rollout_percentage(0.0)
            .test_user("qa_user", "TREATMENT")
            .build();
        let variant = evaluate(&flag, &EvaluationContext::new("qa_user")).unwrap();
        // The ruleset's spelling of the key wins.
        assert_that!(variant.variant_key).contains_value("treatment".to_string());
    }

    #[test]
    fn test_user_with_unknown_variant_falls_back_to_bucketing() {
        let flag = FlagBuilder::new("test_flag")
            .test_user("qa_user", "nonexistent")
            .build();
        // qa_user buckets variants at 0.03, which is control territory.
        let variant = evaluate(&flag, &EvaluationContext::new("qa_user")).unwrap();
        assert_that!(variant.variant_key).contains_value("control".to_string());
        assert_that!(variant.is_qa_tester).is_false();
    }

    #[test]
    fn other_users_are_not_affected_by_test_users() {
        let flag = FlagBuilder::new("test_flag")
            .test_user("qa_user", "treatment")
            .build();
        let variant = evaluate(&flag, &EvaluationContext::new("user789")).unwrap();
        assert_that!(variant.variant_key).contains_value("control".to_string());
        assert_that!(variant.is_qa_tester).is_false();
    }

    #[test]
    fn variant_override_skips_bucketing() {
        let flag = FlagBuilder::new("test_flag")
            .rollouts(vec![serde_json::json!({
                "rollout_percentage": 100.0,
                "variant_override": {"key": "control"}
            })])
            .build();
        // user123 would bucket to treatment (0.62); the override pins control.
        let variant = evaluate(&flag, &EvaluationContext::new("user123")).unwrap();
        assert_that!(variant.variant_key).contains_value("control".to_string());
    }

    #[test]
    fn variant_override_with_unknown_key_falls_back_to_bucketing() {
        let flag = FlagBuilder::new("test_flag")
            .rollouts(vec![serde_json::json!({
                "rollout_percentage": 100.0,
                "variant_override": {"key": "nonexistent"}
            })])
            .build();
        let variant = evaluate(&flag, &EvaluationContext::new("user123")).unwrap();
        assert_that!(variant.variant_key).contains_value("treatment".to_string());
    }

    #[test]
    fn variant_splits_override_base_weights() {
        // Base ruleset gives A 100%; the rollout's splits give everything
        // to B.
        let flag = FlagBuilder::new("test_flag")
            .variants(serde_json::json!([
                {"key": "A", "value": "a", "is_control": true, "split": 100.0},
                {"key": "B", "value": "b", "is_control": false, "split": 0.0}
            ]))
            .rollouts(vec![serde_json::json!({
                "rollout_percentage": 100.0,
                "variant_splits": {"A": 0.0, "B": 100.0}
            })])
            .build();
        for i in 0..50 {
            let context = EvaluationContext::new(format!("user{}", i));
            let variant = evaluate(&flag, &context).unwrap();
            assert_that!(variant.variant_key).contains_value("B".to_string());
        }
    }

    #[test]
    fn single_full_split_variant_always_wins() {
        let flag = FlagBuilder::new("test_flag")
            .single_variant("only", FlagValue::Bool(true))
            .build();
        for i in 0..50 {
            let context = EvaluationContext::new(format!("user{}", i));
            let variant = evaluate(&flag, &context).unwrap();
            assert_that!(variant.variant_key).contains_value("only".to_string());
        }
    }

    #[test]
    fn underweighted_splits_land_on_the_last_variant() {
        // Splits sum to 0.2; user123's variant bucket of 0.62 walks past
        // both and takes the final variant.
        let flag = FlagBuilder::new("test_flag")
            .variants(serde_json::json!([
                {"key": "control", "value": "control", "is_control": true, "split": 10.0},
                {"key": "treatment", "value": "treatment", "is_control": false, "split": 10.0}
            ]))
            .build();
        let variant = evaluate(&flag, &EvaluationContext::new("user123")).unwrap();
        assert_that!(variant.variant_key).contains_value("treatment".to_string());
    }

    #[test]
    fn empty_variant_list_is_no_match() {
        let flag = FlagBuilder::new("test_flag")
            .variants(serde_json::json!([]))
            .build();
        assert_that!(evaluate(&flag, &EvaluationContext::new("user123"))).is_none();
    }

    #[test]
    fn hash_salt_changes_gate_and_variant_buckets() {
        // With hash_salt "s1", flag "salted" gates user123 at 0.13 for
        // rollout 0 and 0.02 for rollout 1, and buckets variants at 0.04.
        let flag = FlagBuilder::new("salted")
            .hash_salt("s1")
            .rollouts(vec![
                serde_json::json!({"rollout_percentage": 10.0}),
                serde_json::json!({"rollout_percentage": 10.0}),
            ])
            .build();
        let variant = evaluate(&flag, &EvaluationContext::new("user123")).unwrap();
        // Excluded from rollout 0 (0.13 >= 0.10), admitted by rollout 1
        // (0.02 < 0.10); the 0.04 variant bucket is control territory.
        assert_that!(variant.variant_key).contains_value("control".to_string());
    }

    #[test]
    fn experiment_metadata_travels_with_the_variant() {
        let flag = FlagBuilder::new("test_flag").experiment(777, true).build();
        let variant = evaluate(&flag, &EvaluationContext::new("user123")).unwrap();
        assert_that!(variant.experiment_id).contains_value(777);
        assert_that!(variant.is_experiment_active).contains_value(true);
    }

    #[test]
    fn fallback_has_no_variant_key() {
        let fallback = SelectedVariant::fallback("default");
        assert_that!(fallback.variant_key).is_none();
        assert_that!(fallback.variant_value).is_equal_to(FlagValue::Str("default".to_string()));
        assert_that!(fallback.is_qa_tester).is_false();
    }

    #[test]
    fn deserializes_remote_response_entry() {
        let variant: SelectedVariant = serde_json::from_str(
            r#"{"variant_key": "treatment", "variant_value": true, "experiment_id": 9}"#,
        )
        .unwrap();
        assert_that!(variant.variant_key).contains_value("treatment".to_string());
        assert_that!(variant.variant_value).is_equal_to(FlagValue::Bool(true));
        assert_that!(variant.experiment_id).contains_value(9);
        assert_that!(variant.is_qa_tester).is_false();
    }
}
