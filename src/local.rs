//! Local flag evaluation: a cached copy of the project's flag definitions,
//! refreshed by one-shot fetch and optional background polling, evaluated
//! entirely in-process.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use log::{error, info, warn};

use crate::config::LocalFlagsConfig;
use crate::context::EvaluationContext;
use crate::error::FlagsError;
use crate::eval::{self, SelectedVariant};
use crate::exposure::{
    deliver, exposure_properties, EvaluationMode, ExposureDispatcher, Tracker,
};
use crate::flag::FlagsResponse;
use crate::flag_value::FlagValue;
use crate::store::FlagStore;
use crate::transport;

fn parse_definitions(body: &str) -> Result<HashMap<String, crate::flag::Flag>, FlagsError> {
    let response: FlagsResponse = serde_json::from_str(body)?;
    Ok(response.into_flag_map())
}

fn lookup_and_evaluate(
    store: &FlagStore,
    flag_key: &str,
    context: &EvaluationContext,
) -> Option<SelectedVariant> {
    let snapshot = match store.snapshot() {
        Some(snapshot) => snapshot,
        None => {
            warn!("flag definitions have not been fetched; was the provider started?");
            return None;
        }
    };
    match snapshot.get(flag_key) {
        Some(flag) => eval::evaluate(flag, context),
        None => {
            warn!("cannot find flag definition for key: {}", flag_key);
            None
        }
    }
}

fn evaluate_all(
    store: &FlagStore,
    context: &EvaluationContext,
) -> HashMap<String, SelectedVariant> {
    match store.snapshot() {
        Some(snapshot) => snapshot
            .iter()
            .filter_map(|(key, flag)| {
                eval::evaluate(flag, context).map(|variant| (key.clone(), variant))
            })
            .collect(),
        None => HashMap::new(),
    }
}

/// Evaluates flags from cached definitions using blocking I/O; polling, when
/// enabled, runs on a dedicated OS thread.
///
/// The provider must be [started](LocalFlagsProvider::start) before
/// evaluation is meaningful. Every evaluation call reads the current
/// definition snapshot without locking; a concurrent refresh swaps the
/// snapshot atomically underneath it.
pub struct LocalFlagsProvider {
    token: String,
    config: LocalFlagsConfig,
    http: reqwest::blocking::Client,
    base_url: String,
    store: Arc<FlagStore>,
    dispatcher: ExposureDispatcher,
    poller: Option<PollerHandle>,
    started: bool,
    stopped: bool,
}

struct PollerHandle {
    stop: mpsc::Sender<()>,
    thread: thread::JoinHandle<()>,
}

impl LocalFlagsProvider {
    /// Creates a provider for one project token. The `tracker` receives
    /// exposure events; pass [crate::NoOpTracker] to disable analytics.
    pub fn new(
        token: impl Into<String>,
        config: LocalFlagsConfig,
        tracker: impl Tracker,
    ) -> Result<Self, FlagsError> {
        let http = transport::blocking_client(&config.flags)?;
        let base_url = transport::base_url(&config.flags);
        Ok(LocalFlagsProvider {
            token: token.into(),
            config,
            http,
            base_url,
            store: Arc::new(FlagStore::new()),
            dispatcher: ExposureDispatcher::new(Arc::new(tracker)),
            poller: None,
            started: false,
            stopped: false,
        })
    }

    /// Fetches the definitions once and, if polling is enabled, starts the
    /// refresh thread. At most one polling loop ever runs per provider:
    /// calling this twice is a logged no-op, as is calling it after [stop](LocalFlagsProvider::stop).
    pub fn start(&mut self) {
        if self.stopped {
            warn!("local flags provider cannot be restarted after stop; construct a new provider");
            return;
        }
        if self.started {
            warn!("local flags provider is already started");
            return;
        }
        self.started = true;

        fetch_definitions(&self.http, &self.base_url, &self.token, &self.store);

        if self.config.enable_polling {
            info!(
                "polling for flag definition updates every {} seconds",
                self.config.polling_interval_in_seconds
            );
            let interval = self.config.polling_interval();
            let http = self.http.clone();
            let base_url = self.base_url.clone();
            let token = self.token.clone();
            let store = Arc::clone(&self.store);
            let (stop_tx, stop_rx) = mpsc::channel::<()>();
            let handle = thread::spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        fetch_definitions(&http, &base_url, &token, &store);
                    }
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            });
            self.poller = Some(PollerHandle {
                stop: stop_tx,
                thread: handle,
            });
        }
    }

    /// Signals the polling thread to exit and waits for it. An in-flight
    /// fetch is allowed to finish; the next iteration simply never runs.
    /// The provider cannot be restarted afterwards.
    pub fn stop(&mut self) {
        self.stopped = true;
        if let Some(poller) = self.poller.take() {
            drop(poller.stop);
            if poller.thread.join().is_err() {
                warn!("polling thread panicked");
            }
        }
    }

    /// True once any definitions fetch has succeeded, even one carrying zero
    /// flags. Later fetch failures do not unset this.
    pub fn are_flags_ready(&self) -> bool {
        self.store.ready()
    }

    /// Assigns `context` to a variant of `flag_key`, or returns `fallback`
    /// when the flag is unknown, the context lacks the flag's bucketing
    /// attribute, or no rollout admits it. A resolved variant is reported as
    /// an exposure; fallbacks are not.
    pub fn get_variant(
        &self,
        flag_key: &str,
        fallback: SelectedVariant,
        context: &EvaluationContext,
    ) -> SelectedVariant {
        let started_at = Instant::now();
        match lookup_and_evaluate(&self.store, flag_key, context) {
            Some(variant) => {
                let latency_ms = started_at.elapsed().as_secs_f64() * 1000.0;
                self.report_exposure(flag_key, &variant, latency_ms, context);
                variant
            }
            None => fallback,
        }
    }

    /// Like [get_variant](LocalFlagsProvider::get_variant), but takes and
    /// returns a bare value instead of a [SelectedVariant].
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

    /// Evaluates every cached flag against `context` and returns those that
    /// resolved. No exposure is reported for any of them; callers wanting
    /// exposure semantics report individually.
    pub fn get_all_variants(
        &self,
        context: &EvaluationContext,
    ) -> HashMap<String, SelectedVariant> {
        evaluate_all(&self.store, context)
    }

    fn report_exposure(
        &self,
        flag_key: &str,
        variant: &SelectedVariant,
        latency_ms: f64,
        context: &EvaluationContext,
    ) {
        let distinct_id = match context.distinct_id() {
            Some(distinct_id) => distinct_id,
            None => {
                error!("cannot track exposure event without a distinct_id in the context");
                return;
            }
        };
        let properties = exposure_properties(flag_key, variant, EvaluationMode::Local, latency_ms);
        self.dispatcher.dispatch(distinct_id.to_string(), properties);
    }
}

impl Drop for LocalFlagsProvider {
    fn drop(&mut self) {
        self.stop();
    }
}

fn fetch_definitions(
    http: &reqwest::blocking::Client,
    base_url: &str,
    token: &str,
    store: &FlagStore,
) {
    if let Err(error) = try_fetch_definitions(http, base_url, token, store) {
        warn!("failed to fetch feature flag definitions: {}", error);
    }
}

fn try_fetch_definitions(
    http: &reqwest::blocking::Client,
    base_url: &str,
    token: &str,
    store: &FlagStore,
) -> Result<(), FlagsError> {
    let started_at = Instant::now();
    let response = http
        .get(format!("{}{}", base_url, transport::DEFINITIONS_PATH))
        .query(&transport::common_query_params(token))
        .header(
            transport::TRACEPARENT_HEADER,
            transport::generate_traceparent(),
        )
        .send()?;
    let status = response.status();
    if !status.is_success() {
        return Err(FlagsError::Status(status));
    }
    let body = response.text()?;
    let flags = parse_definitions(&body)?;
    info!(
        "fetched {} flag definitions in {:.3}s",
        flags.len(),
        started_at.elapsed().as_secs_f64()
    );
    store.replace(flags);
    Ok(())
}

async fn fetch_definitions_async(
    http: &reqwest::Client,
    base_url: &str,
    token: &str,
    store: &FlagStore,
) {
    if let Err(error) = try_fetch_definitions_async(http, base_url, token, store).await {
        warn!("failed to fetch feature flag definitions: {}", error);
    }
}

async fn try_fetch_definitions_async(
    http: &reqwest::Client,
    base_url: &str,
    token: &str,
    store: &FlagStore,
) -> Result<(), FlagsError> {
    let started_at = Instant::now();
    let response = http
        .get(format!("{}{}", base_url, transport::DEFINITIONS_PATH))
        .query(&transport::common_query_params(token))
        .header(
            transport::TRACEPARENT_HEADER,
            transport::generate_traceparent(),
        )
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FlagsError::Status(status));
    }
    let body = response.text().await?;
    let flags = parse_definitions(&body)?;
    info!(
        "fetched {} flag definitions in {:.3}s",
        flags.len(),
        started_at.elapsed().as_secs_f64()
    );
    store.replace(flags);
    Ok(())
}

/// [LocalFlagsProvider]'s counterpart for async hosts: the same cache and
/// evaluation semantics, with the refresh loop as a cooperative tokio task.
///
/// Evaluation calls never suspend; only `start`, polling, and `stop` touch
/// the network or the runtime.
pub struct AsyncLocalFlagsProvider {
    token: String,
    config: LocalFlagsConfig,
    http: reqwest::Client,
    base_url: String,
    store: Arc<FlagStore>,
    tracker: Arc<dyn Tracker>,
    poller: Option<AsyncPollerHandle>,
    started: bool,
    stopped: bool,
}

struct AsyncPollerHandle {
    stop: tokio::sync::watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl AsyncLocalFlagsProvider {
    pub fn new(
        token: impl Into<String>,
        config: LocalFlagsConfig,
        tracker: impl Tracker,
    ) -> Result<Self, FlagsError> {
        let http = transport::async_client(&config.flags)?;
        let base_url = transport::base_url(&config.flags);
        Ok(AsyncLocalFlagsProvider {
            token: token.into(),
            config,
            http,
            base_url,
            store: Arc::new(FlagStore::new()),
            tracker: Arc::new(tracker),
            poller: None,
            started: false,
            stopped: false,
        })
    }

    /// Fetches the definitions once and, if polling is enabled, spawns the
    /// refresh task. Same single-loop lifecycle rules as the blocking
    /// provider.
    pub async fn start(&mut self) {
        if self.stopped {
            warn!("local flags provider cannot be restarted after stop; construct a new provider");
            return;
        }
        if self.started {
            warn!("local flags provider is already started");
            return;
        }
        self.started = true;

        fetch_definitions_async(&self.http, &self.base_url, &self.token, &self.store).await;

        if self.config.enable_polling {
            info!(
                "polling for flag definition updates every {} seconds",
                self.config.polling_interval_in_seconds
            );
            let interval = self.config.polling_interval();
            let http = self.http.clone();
            let base_url = self.base_url.clone();
            let token = self.token.clone();
            let store = Arc::clone(&self.store);
            let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
            let task = tokio::spawn(async move {
                loop {
                    // Checked first so stop() wins over an elapsed interval.
                    tokio::select! {
                        biased;
                        _ = stop_rx.changed() => break,
                        _ = tokio::time::sleep(interval) => {
                            fetch_definitions_async(&http, &base_url, &token, &store).await;
                        }
                    }
                }
            });
            self.poller = Some(AsyncPollerHandle {
                stop: stop_tx,
                task,
            });
        }
    }

    /// Cancels the polling task cooperatively and awaits it. The provider
    /// cannot be restarted afterwards.
    pub async fn stop(&mut self) {
        self.stopped = true;
        if let Some(poller) = self.poller.take() {
            let _ = poller.stop.send(true);
            if poller.task.await.is_err() {
                warn!("polling task panicked");
            }
        }
    }

    pub fn are_flags_ready(&self) -> bool {
        self.store.ready()
    }

    /// See [LocalFlagsProvider::get_variant]. The async form never suspends;
    /// it exists so async hosts get a uniform surface, and so exposure can be
    /// dispatched as a detached task on the caller's runtime.
    pub async fn get_variant(
        &self,
        flag_key: &str,
        fallback: SelectedVariant,
        context: &EvaluationContext,
    ) -> SelectedVariant {
        let started_at = Instant::now();
        match lookup_and_evaluate(&self.store, flag_key, context) {
            Some(variant) => {
                let latency_ms = started_at.elapsed().as_secs_f64() * 1000.0;
                self.report_exposure(flag_key, &variant, latency_ms, context);
                variant
            }
            None => fallback,
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

    /// See [LocalFlagsProvider::get_all_variants]; never reports exposure.
    pub async fn get_all_variants(
        &self,
        context: &EvaluationContext,
    ) -> HashMap<String, SelectedVariant> {
        evaluate_all(&self.store, context)
    }

    fn report_exposure(
        &self,
        flag_key: &str,
        variant: &SelectedVariant,
        latency_ms: f64,
        context: &EvaluationContext,
    ) {
        let distinct_id = match context.distinct_id() {
            Some(distinct_id) => distinct_id.to_string(),
            None => {
                error!("cannot track exposure event without a distinct_id in the context");
                return;
            }
        };
        let properties = exposure_properties(flag_key, variant, EvaluationMode::Local, latency_ms);
        let tracker = Arc::clone(&self.tracker);
        tokio::spawn(async move {
            deliver(tracker.as_ref(), &distinct_id, &properties);
        });
    }
}

impl Drop for AsyncLocalFlagsProvider {
    fn drop(&mut self) {
        // Drop cannot await a graceful join; callers wanting one use stop().
        if let Some(poller) = self.poller.take() {
            let _ = poller.stop.send(true);
            poller.task.abort();
        }
    }
}
