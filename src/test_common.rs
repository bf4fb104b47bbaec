#![cfg(test)]

use std::sync::{Arc, Mutex};

use crate::exposure::Tracker;
use crate::flag::{Flag, FlagsResponse};
use crate::flag_value::FlagValue;

/// Builds a flag definition the way the definitions endpoint would deliver it.
///
/// Defaults: key `test_flag`, bucketing context `distinct_id`, a 50/50
/// control/treatment variant pair, and a single ungated rollout at the given
/// percentage.
pub struct FlagBuilder {
    key: String,
    context: String,
    hash_salt: Option<String>,
    experiment_id: Option<i64>,
    is_experiment_active: Option<bool>,
    variants: serde_json::Value,
    rollouts: Vec<serde_json::Value>,
    test_users: Option<serde_json::Value>,
}

impl FlagBuilder {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            context: "distinct_id".to_string(),
            hash_salt: None,
            experiment_id: None,
            is_experiment_active: None,
            variants: serde_json::json!([
                {"key": "control", "value": "control", "is_control": true, "split": 50.0},
                {"key": "treatment", "value": "treatment", "is_control": false, "split": 50.0}
            ]),
            rollouts: vec![serde_json::json!({"rollout_percentage": 100.0})],
            test_users: None,
        }
    }

    pub fn context(mut self, context: &str) -> Self {
        self.context = context.to_string();
        self
    }

    pub fn hash_salt(mut self, salt: &str) -> Self {
        self.hash_salt = Some(salt.to_string());
        self
    }

    pub fn experiment(mut self, id: i64, active: bool) -> Self {
        self.experiment_id = Some(id);
        self.is_experiment_active = Some(active);
        self
    }

    pub fn variants(mut self, variants: serde_json::Value) -> Self {
        self.variants = variants;
        self
    }

    pub fn single_variant(self, key: &str, value: FlagValue) -> Self {
        let value = value.as_json();
        self.variants(serde_json::json!([
            {"key": key, "value": value, "is_control": false, "split": 100.0}
        ]))
    }

    pub fn rollout_percentage(mut self, percentage: f64) -> Self {
        self.rollouts = vec![serde_json::json!({"rollout_percentage": percentage})];
        self
    }

    pub fn rollouts(mut self, rollouts: Vec<serde_json::Value>) -> Self {
        self.rollouts = rollouts;
        self
    }

    pub fn test_user(mut self, distinct_id: &str, variant_key: &str) -> Self {
        let users = self
            .test_users
            .get_or_insert_with(|| serde_json::json!({}));
        users[distinct_id] = serde_json::Value::from(variant_key);
        self
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut ruleset = serde_json::json!({
            "variants": self.variants,
            "rollout": self.rollouts,
        });
        if let Some(users) = &self.test_users {
            ruleset["test"] = serde_json::json!({ "users": users });
        }
        let mut flag = serde_json::json!({
            "id": "test-id",
            "name": "Test Flag",
            "key": self.key,
            "status": "active",
            "project_id": 123,
            "context": self.context,
            "ruleset": ruleset,
        });
        if let Some(salt) = &self.hash_salt {
            flag["hash_salt"] = serde_json::Value::from(salt.clone());
        }
        if let Some(id) = self.experiment_id {
            flag["experiment_id"] = serde_json::Value::from(id);
        }
        if let Some(active) = self.is_experiment_active {
            flag["is_experiment_active"] = serde_json::Value::from(active);
        }
        flag
    }

    /// Runs the flag through the same deserialization path a fetch uses, so
    /// tests exercise the parsed shape (sorted variants included).
    pub fn build(&self) -> Flag {
        let response: FlagsResponse =
            serde_json::from_value(serde_json::json!({ "flags": [self.to_json()] }))
                .expect("test flag should deserialize");
        response
            .into_flag_map()
            .remove(&self.key)
            .expect("built flag should be present")
    }
}

/// Body of a definitions response containing the given flags.
pub fn definitions_body(flags: &[&FlagBuilder]) -> serde_json::Value {
    serde_json::json!({
        "flags": flags.iter().map(|b| b.to_json()).collect::<Vec<_>>()
    })
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrackedEvent {
    pub distinct_id: String,
    pub event_name: String,
    pub properties: serde_json::Value,
}

/// Tracker double that records every exposure it receives.
#[derive(Clone, Default)]
pub struct RecordingTracker {
    events: Arc<Mutex<Vec<TrackedEvent>>>,
}

impl RecordingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TrackedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

impl Tracker for RecordingTracker {
    fn track(&self, distinct_id: &str, event_name: &str, properties: &serde_json::Value) {
        self.events.lock().unwrap().push(TrackedEvent {
            distinct_id: distinct_id.to_string(),
            event_name: event_name.to_string(),
            properties: properties.clone(),
        });
    }
}
