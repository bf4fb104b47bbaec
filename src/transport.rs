use std::collections::HashMap;

use rand::Rng;
use serde::Deserialize;

use crate::config::FlagsConfig;
use crate::error::FlagsError;
use crate::eval::SelectedVariant;

pub(crate) const DEFINITIONS_PATH: &str = "/flags/definitions";
pub(crate) const EVALUATION_PATH: &str = "/flags";

pub(crate) const TRACEPARENT_HEADER: &str = "traceparent";

const SDK_NAME: &str = "rust";
const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

pub(crate) fn base_url(config: &FlagsConfig) -> String {
    // A bare host gets the https scheme; a full URL (useful for proxies and
    // test servers) is taken as-is.
    if config.api_host.contains("://") {
        config.api_host.trim_end_matches('/').to_string()
    } else {
        format!("https://{}", config.api_host)
    }
}

/// Query parameters carried on every flags request: SDK metadata plus the
/// project token.
pub(crate) fn common_query_params(token: &str) -> [(&'static str, String); 3] {
    [
        ("sdk", SDK_NAME.to_string()),
        ("sdk_version", SDK_VERSION.to_string()),
        ("token", token.to_string()),
    ]
}

/// A fresh W3C Trace Context `traceparent` value: version 00, random trace
/// and span ids, sampled flag set. Generated per request, never reused.
pub(crate) fn generate_traceparent() -> String {
    let mut rng = rand::rng();
    // All-zero trace/span ids are invalid per the Trace Context spec.
    let trace_id = rng.random::<u128>() | 1;
    let span_id = rng.random::<u64>() | 1;
    format!("00-{:032x}-{:016x}-01", trace_id, span_id)
}

pub(crate) fn blocking_client(config: &FlagsConfig) -> Result<reqwest::blocking::Client, FlagsError> {
    reqwest::blocking::Client::builder()
        .timeout(config.request_timeout())
        .build()
        .map_err(FlagsError::from)
}

pub(crate) fn async_client(config: &FlagsConfig) -> Result<reqwest::Client, FlagsError> {
    reqwest::Client::builder()
        .timeout(config.request_timeout())
        .build()
        .map_err(FlagsError::from)
}

/// Response body of the remote evaluation endpoint: already-assigned variants
/// keyed by flag key.
#[derive(Debug, Deserialize)]
pub(crate) struct RemoteFlagsResponse {
    #[serde(default)]
    pub(crate) code: i64,
    pub(crate) flags: HashMap<String, SelectedVariant>,
}
