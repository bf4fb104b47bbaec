use std::collections::HashMap;

use log::debug;
use serde::Deserialize;

use crate::flag_value::FlagValue;

/// A single feature flag or experiment definition as delivered by the
/// definitions endpoint.
///
/// Definitions are immutable once fetched; a successful fetch replaces the
/// whole definition set atomically, so a `Flag` never changes in place.
#[derive(Clone, Debug, Deserialize)]
pub struct Flag {
    #[serde(default)]
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) name: String,
    pub key: String,
    #[serde(default)]
    pub(crate) status: String,
    #[serde(default)]
    pub(crate) project_id: i64,

    pub(crate) ruleset: RuleSet,

    /// Name of the evaluation-context attribute used as the bucketing key,
    /// e.g. `"distinct_id"`.
    pub(crate) context: String,

    #[serde(default)]
    pub(crate) experiment_id: Option<i64>,
    #[serde(default)]
    pub(crate) is_experiment_active: Option<bool>,

    /// Per-flag salt override. When set, rollout salts also incorporate the
    /// rollout's index, which gives each rollout an independent bucket
    /// assignment.
    #[serde(default)]
    pub(crate) hash_salt: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct RuleSet {
    pub(crate) variants: Vec<Variant>,
    pub(crate) rollout: Vec<Rollout>,
    #[serde(default)]
    pub(crate) test: Option<FlagTestUsers>,
}

/// A gated percentage-and-condition rule. Rollouts are evaluated in list
/// order and the first match wins.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct Rollout {
    pub(crate) rollout_percentage: f64,

    /// Property name to expected value. All pairs must be present in the
    /// context's custom properties, compared case-insensitively.
    #[serde(default)]
    pub(crate) runtime_evaluation_definition: Option<HashMap<String, String>>,

    /// Forces a single variant for every context this rollout admits.
    #[serde(default)]
    pub(crate) variant_override: Option<VariantOverride>,

    /// Per-rollout replacement of variant split weights, keyed by variant key.
    #[serde(default)]
    pub(crate) variant_splits: Option<HashMap<String, f64>>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct VariantOverride {
    pub(crate) key: String,
}

/// One named, weighted outcome of a flag.
#[derive(Clone, Debug, Deserialize)]
pub struct Variant {
    pub key: String,
    pub value: FlagValue,
    #[serde(default)]
    pub is_control: bool,
    /// Relative weight on the rollout's 0-100 scale. Weights are proportions
    /// and need not sum to exactly 100.
    pub split: f64,
}

/// Forced variant assignments for specific identifiers, bypassing rollout and
/// hash logic entirely.
#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct FlagTestUsers {
    pub(crate) users: HashMap<String, String>,
}

/// Response body of the definitions endpoint.
#[derive(Debug, Deserialize)]
pub(crate) struct FlagsResponse {
    pub(crate) flags: Vec<Flag>,
}

impl FlagsResponse {
    /// Indexes the fetched definitions by flag key. Variants within each
    /// ruleset are sorted by key so that split accumulation order does not
    /// depend on the order the server happened to emit them in.
    pub(crate) fn into_flag_map(self) -> HashMap<String, Flag> {
        self.flags
            .into_iter()
            .map(|mut flag| {
                debug!(
                    "loaded flag {} (id {}, name {:?}, status {}, project {})",
                    flag.key, flag.id, flag.name, flag.status, flag.project_id
                );
                flag.ruleset.variants.sort_by(|a, b| a.key.cmp(&b.key));
                (flag.key.clone(), flag)
            })
            .collect()
    }
}

impl Flag {
    /// Salt for the rollout gate at `index`. The legacy scheme (no
    /// `hash_salt`) does not incorporate the index; every rollout of the flag
    /// shares one gate bucket.
    pub(crate) fn rollout_salt(&self, index: usize) -> String {
        match &self.hash_salt {
            Some(salt) => format!("{}{}{}", self.key, salt, index),
            None => format!("{}rollout", self.key),
        }
    }

    /// Salt for variant bucketing within a matched rollout.
    pub(crate) fn variant_salt(&self) -> String {
        match &self.hash_salt {
            Some(salt) => format!("{}{}variant", self.key, salt),
            None => format!("{}variant", self.key),
        }
    }
}
