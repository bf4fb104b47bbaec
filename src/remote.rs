//! Remote flag evaluation: no local cache; every call is one round trip to
//! the server-side evaluation endpoint, which is the sole source of truth and
//! returns already-assigned variants.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info, warn};
use serde_json::json;

use crate::config::RemoteFlagsConfig;
use crate::context::EvaluationContext;
use crate::error::FlagsError;
use crate::eval::SelectedVariant;
use crate::exposure::{deliver, exposure_properties, EvaluationMode, Tracker};
use crate::flag_value::FlagValue;
use crate::transport::{self, RemoteFlagsResponse};

struct FetchTiming {
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
    latency_ms: f64,
}

fn remote_exposure_properties(
    flag_key: &str,
    variant: &SelectedVariant,
    timing: &FetchTiming,
) -> serde_json::Value {
    let mut properties =
        exposure_properties(flag_key, variant, EvaluationMode::Remote, timing.latency_ms);
    properties["Variant fetch start time"] =
        json!(timing.started_at.to_rfc3339_opts(SecondsFormat::Millis, true));
    properties["Variant fetch complete time"] =
        json!(timing.completed_at.to_rfc3339_opts(SecondsFormat::Millis, true));
    properties
}

fn take_flag(mut response: RemoteFlagsResponse, flag_key: &str) -> Option<SelectedVariant> {
    debug!("remote flags response code {}", response.code);
    response.flags.remove(flag_key)
}

/// Delegates every evaluation to the server over blocking I/O.
pub struct RemoteFlagsProvider {
    token: String,
    http: reqwest::blocking::Client,
    base_url: String,
    tracker: Arc<dyn Tracker>,
}

impl RemoteFlagsProvider {
    pub fn new(
        token: impl Into<String>,
        config: RemoteFlagsConfig,
        tracker: impl Tracker,
    ) -> Result<Self, FlagsError> {
        let http = transport::blocking_client(&config.flags)?;
        let base_url = transport::base_url(&config.flags);
        Ok(RemoteFlagsProvider {
            token: token.into(),
            http,
            base_url,
            tracker: Arc::new(tracker),
        })
    }

    /// Asks the server which variant of `flag_key` this context is assigned
    /// to. A flag missing from the response, or any transport or parse
    /// failure, yields `fallback` and reports no exposure; a present flag is
    /// reported exactly like a local resolution, in mode `"remote"`.
    pub fn get_variant(
        &self,
        flag_key: &str,
        fallback: SelectedVariant,
        context: &EvaluationContext,
    ) -> SelectedVariant {
        match self.request_flags(Some(flag_key), context) {
            Ok((response, timing)) => match take_flag(response, flag_key) {
                Some(variant) => {
                    self.report_exposure(flag_key, &variant, &timing, context);
                    variant
                }
                None => {
                    warn!(
                        "flag {} not found in remote response; returning fallback",
                        flag_key
                    );
                    fallback
                }
            },
            Err(error) => {
                warn!("failed to get remote variant for flag {}: {}", flag_key, error);
                fallback
            }
        }
    }

    pub fn get_variant_value(
        &self,
        flag_key: &str,
        fallback_value: impl Into<FlagValue>,
        context: &EvaluationContext,
    ) -> FlagValue {
        self.get_variant(flag_key, SelectedVariant::fallback(fallback_value), context)
            .variant_value
    }

    pub fn is_enabled(&self, flag_key: &str, context: &EvaluationContext) -> bool {
        self.get_variant_value(flag_key, false, context).is_truthy()
    }

    /// Fetches every variant the server assigns this context. No exposure is
    /// reported for any of them. A failed request yields an empty map.
    pub fn get_all_variants(
        &self,
        context: &EvaluationContext,
    ) -> HashMap<String, SelectedVariant> {
        match self.request_flags(None, context) {
            Ok((response, _)) => response.flags,
            Err(error) => {
                warn!("failed to get remote variants: {}", error);
                HashMap::new()
            }
        }
    }

    fn request_flags(
        &self,
        flag_key: Option<&str>,
        context: &EvaluationContext,
    ) -> Result<(RemoteFlagsResponse, FetchTiming), FlagsError> {
        let context_json = serde_json::to_string(context)?;
        let mut request = self
            .http
            .get(format!("{}{}", self.base_url, transport::EVALUATION_PATH))
            .query(&transport::common_query_params(&self.token))
            .query(&[("context", context_json.as_str())])
            .header(
                transport::TRACEPARENT_HEADER,
                transport::generate_traceparent(),
            );
        if let Some(flag_key) = flag_key {
            request = request.query(&[("flag_key", flag_key)]);
        }

        let started_at = Utc::now();
        let started = Instant::now();
        let response = request.send()?;
        let completed_at = Utc::now();
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        let status = response.status();
        if !status.is_success() {
            return Err(FlagsError::Status(status));
        }
        let body = response.text()?;
        let parsed: RemoteFlagsResponse = serde_json::from_str(&body)?;
        info!("remote flags request completed in {:.3}ms", latency_ms);
        Ok((
            parsed,
            FetchTiming {
                started_at,
                completed_at,
                latency_ms,
            },
        ))
    }

    fn report_exposure(
        &self,
        flag_key: &str,
        variant: &SelectedVariant,
        timing: &FetchTiming,
        context: &EvaluationContext,
    ) {
        if let Some(distinct_id) = context.distinct_id() {
            let properties = remote_exposure_properties(flag_key, variant, timing);
            deliver(self.tracker.as_ref(), distinct_id, &properties);
        }
    }
}

/// [RemoteFlagsProvider]'s counterpart for async hosts.
pub struct AsyncRemoteFlagsProvider {
    token: String,
    http: reqwest::Client,
    base_url: String,
    tracker: Arc<dyn Tracker>,
}

impl AsyncRemoteFlagsProvider {
    pub fn new(
        token: impl Into<String>,
        config: RemoteFlagsConfig,
        tracker: impl Tracker,
    ) -> Result<Self, FlagsError> {
        let http = transport::async_client(&config.flags)?;
        let base_url = transport::base_url(&config.flags);
        Ok(AsyncRemoteFlagsProvider {
            token: token.into(),
            http,
            base_url,
            tracker: Arc::new(tracker),
        })
    }

    /// See [RemoteFlagsProvider::get_variant]. Exposure is dispatched as a
    /// detached task so it never extends the evaluation round trip.
    pub async fn get_variant(
        &self,
        flag_key: &str,
        fallback: SelectedVariant,
        context: &EvaluationContext,
    ) -> SelectedVariant {
        match self.request_flags(Some(flag_key), context).await {
            Ok((response, timing)) => match take_flag(response, flag_key) {
                Some(variant) => {
                    self.report_exposure(flag_key, &variant, &timing, context);
                    variant
                }
                None => {
                    warn!(
                        "flag {} not found in remote response; returning fallback",
                        flag_key
                    );
                    fallback
                }
            },
            Err(error) => {
                warn!("failed to get remote variant for flag {}: {}", flag_key, error);
                fallback
            }
        }
    }

    pub async fn get_variant_value(
        &self,
        flag_key: &str,
        fallback_value: impl Into<FlagValue>,
        context: &EvaluationContext,
    ) -> FlagValue {
        self.get_variant(flag_key, SelectedVariant::fallback(fallback_value), context)
            .await
            .variant_value
    }

    pub async fn is_enabled(&self, flag_key: &str, context: &EvaluationContext) -> bool {
        self.get_variant_value(flag_key, false, context)
            .await
            .is_truthy()
    }

    /// See [RemoteFlagsProvider::get_all_variants]; never reports exposure.
    pub async fn get_all_variants(
        &self,
        context: &EvaluationContext,
    ) -> HashMap<String, SelectedVariant> {
        match self.request_flags(None, context).await {
            Ok((response, _)) => response.flags,
            Err(error) => {
                warn!("failed to get remote variants: {}", error);
                HashMap::new()
            }
        }
    }

    async fn request_flags(
        &self,
        flag_key: Option<&str>,
        context: &EvaluationContext,
    ) -> Result<(RemoteFlagsResponse, FetchTiming), FlagsError> {
        let context_json = serde_json::to_string(context)?;
        let mut request = self
            .http
            .get(format!("{}{}", self.base_url, transport::EVALUATION_PATH))
            .query(&transport::common_query_params(&self.token))
            .query(&[("context", context_json.as_str())])
            .header(
                transport::TRACEPARENT_HEADER,
                transport::generate_traceparent(),
            );
        if let Some(flag_key) = flag_key {
            request = request.query(&[("flag_key", flag_key)]);
        }

        let started_at = Utc::now();
        let started = Instant::now();
        let response = request.send().await?;
        let completed_at = Utc::now();
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        let status = response.status();
        if !status.is_success() {
            return Err(FlagsError::Status(status));
        }
        let body = response.text().await?;
        let parsed: RemoteFlagsResponse = serde_json::from_str(&body)?;
        info!("remote flags request completed in {:.3}ms", latency_ms);
        Ok((
            parsed,
            FetchTiming {
                started_at,
                completed_at,
                latency_ms,
            },
        ))
    }

    fn report_exposure(
        &self,
        flag_key: &str,
        variant: &SelectedVariant,
        timing: &FetchTiming,
        context: &EvaluationContext,
    ) {
        if let Some(distinct_id) = context.distinct_id() {
            let distinct_id = distinct_id.to_string();
            let properties = remote_exposure_properties(flag_key, variant, timing);
            let tracker = Arc::clone(&self.tracker);
            tokio::spawn(async move {
                deliver(tracker.as_ref(), &distinct_id, &properties);
            });
        }
    }
}
