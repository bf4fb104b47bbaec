use std::collections::HashMap;

use serde::Serialize;

pub(crate) const DISTINCT_ID_ATTRIBUTE: &str = "distinct_id";

/// Caller-supplied attributes a flag is evaluated against.
///
/// The context must contain the attribute named by the flag definition's
/// bucketing context (typically `distinct_id`) for evaluation to proceed; the
/// identifier is always passed explicitly per call and is never remembered by
/// a provider between calls. `custom_properties` is a separate nested map
/// consulted only by rollout runtime-evaluation conditions.
///
/// The serialized form is the wire format the remote evaluation endpoint
/// expects in its `context` query parameter: attributes at the top level with
/// `custom_properties` nested.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EvaluationContext {
    #[serde(flatten)]
    attributes: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    custom_properties: HashMap<String, String>,
}

impl EvaluationContext {
    /// Context with the given `distinct_id`, the usual bucketing identifier.
    pub fn new(distinct_id: impl Into<String>) -> Self {
        EvaluationContext::default().with_attribute(DISTINCT_ID_ATTRIBUTE, distinct_id)
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_custom_property(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.custom_properties.insert(name.into(), value.into());
        self
    }

    /// The attribute a flag buckets on, by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn distinct_id(&self) -> Option<&str> {
        self.get(DISTINCT_ID_ATTRIBUTE)
    }

    pub(crate) fn custom_property(&self, name: &str) -> Option<&str> {
        self.custom_properties.get(name).map(String::as_str)
    }
}
