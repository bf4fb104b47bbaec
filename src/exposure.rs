use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use log::warn;
use serde_json::json;

use crate::eval::SelectedVariant;

/// Name of the analytics event recorded when a variant is actually served to
/// a context.
pub const EXPOSURE_EVENT: &str = "$experiment_started";

/// Exposure callback supplied by the host application.
///
/// Providers call this with the evaluated context's `distinct_id`, the
/// [EXPOSURE_EVENT] name, and the exposure properties. `track` is infallible
/// by contract: implementations swallow their own errors, and the providers
/// additionally isolate evaluation from tracker panics, so exposure reporting
/// can never change an evaluation outcome.
///
/// Any `Fn(&str, &str, &serde_json::Value)` closure is a `Tracker`.
pub trait Tracker: Send + Sync + 'static {
    fn track(&self, distinct_id: &str, event_name: &str, properties: &serde_json::Value);
}

impl<F> Tracker for F
where
    F: Fn(&str, &str, &serde_json::Value) + Send + Sync + 'static,
{
    fn track(&self, distinct_id: &str, event_name: &str, properties: &serde_json::Value) {
        self(distinct_id, event_name, properties)
    }
}

/// Discards every exposure; for hosts that do not collect analytics.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpTracker;

impl Tracker for NoOpTracker {
    fn track(&self, _distinct_id: &str, _event_name: &str, _properties: &serde_json::Value) {}
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum EvaluationMode {
    Local,
    Remote,
}

impl EvaluationMode {
    fn as_str(self) -> &'static str {
        match self {
            EvaluationMode::Local => "local",
            EvaluationMode::Remote => "remote",
        }
    }
}

/// Builds the fixed property set recorded with every exposure.
pub(crate) fn exposure_properties(
    flag_key: &str,
    variant: &SelectedVariant,
    mode: EvaluationMode,
    latency_ms: f64,
) -> serde_json::Value {
    let mut properties = json!({
        "Experiment name": flag_key,
        "Variant name": variant.variant_key,
        "$experiment_type": "feature_flag",
        "Flag evaluation mode": mode.as_str(),
        "Variant fetch latency (ms)": latency_ms,
    });
    if let Some(experiment_id) = variant.experiment_id {
        properties["Experiment ID"] = json!(experiment_id);
    }
    if let Some(active) = variant.is_experiment_active {
        properties["Is experiment active"] = json!(active);
    }
    if variant.is_qa_tester {
        properties["Is QA tester"] = json!(true);
    }
    properties
}

/// Invokes the tracker, isolating the caller from tracker panics. Exposure
/// delivery is fire-and-forget; a failure can never change an evaluation
/// outcome.
pub(crate) fn deliver(tracker: &dyn Tracker, distinct_id: &str, properties: &serde_json::Value) {
    let delivery = catch_unwind(AssertUnwindSafe(|| {
        tracker.track(distinct_id, EXPOSURE_EVENT, properties);
    }));
    if delivery.is_err() {
        warn!("exposure tracker panicked; event dropped");
    }
}

struct ExposureJob {
    distinct_id: String,
    properties: serde_json::Value,
}

/// Hands exposure events to the tracker on a dedicated worker thread so the
/// synchronous evaluation path never blocks on (or dies with) the host's
/// analytics code.
pub(crate) struct ExposureDispatcher {
    sender: Option<mpsc::Sender<ExposureJob>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl ExposureDispatcher {
    pub(crate) fn new(tracker: Arc<dyn Tracker>) -> Self {
        let (sender, receiver) = mpsc::channel::<ExposureJob>();
        let worker = thread::spawn(move || {
            for job in receiver {
                deliver(tracker.as_ref(), &job.distinct_id, &job.properties);
            }
        });
        ExposureDispatcher {
            sender: Some(sender),
            worker: Some(worker),
        }
    }

    pub(crate) fn dispatch(&self, distinct_id: String, properties: serde_json::Value) {
        if let Some(sender) = &self.sender {
            if sender
                .send(ExposureJob {
                    distinct_id,
                    properties,
                })
                .is_err()
            {
                warn!("exposure worker has exited; dropping exposure event");
            }
        }
    }

    /// Disconnects the queue and waits for the worker to drain what was
    /// already dispatched.
    pub(crate) fn shutdown(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("exposure worker panicked during shutdown");
            }
        }
    }
}

impl Drop for ExposureDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_common::RecordingTracker;
    use spectral::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn variant(key: &str) -> SelectedVariant {
        SelectedVariant {
            variant_key: Some(key.to_string()),
            variant_value: true.into(),
            experiment_id: Some(42),
            is_experiment_active: Some(true),
            is_qa_tester: false,
        }
    }

    #[test]
    fn properties_carry_the_fixed_exposure_set() {
        let properties =
            exposure_properties("checkout_redesign", &variant("treatment"), EvaluationMode::Local, 0.25);
        assert_that!(&properties["Experiment name"])
            .is_equal_to(&json!("checkout_redesign"));
        assert_that!(&properties["Variant name"]).is_equal_to(&json!("treatment"));
        assert_that!(&properties["$experiment_type"]).is_equal_to(&json!("feature_flag"));
        assert_that!(&properties["Flag evaluation mode"]).is_equal_to(&json!("local"));
        assert_that!(&properties["Variant fetch latency (ms)"]).is_equal_to(&json!(0.25));
        assert_that!(&properties["Experiment ID"]).is_equal_to(&json!(42));
        assert_that!(&properties["Is experiment active"]).is_equal_to(&json!(true));
        assert_that!(properties.get("Is QA tester")).is_none();
    }

    #[test]
    fn qa_tester_flag_is_only_present_when_set() {
        let mut qa = variant("treatment");
        qa.is_qa_tester = true;
        let properties = exposure_properties("flag", &qa, EvaluationMode::Remote, 1.0);
        assert_that!(&properties["Is QA tester"]).is_equal_to(&json!(true));
        assert_that!(&properties["Flag evaluation mode"]).is_equal_to(&json!("remote"));
    }

    #[test]
    fn dispatcher_delivers_to_the_tracker_off_thread() {
        let tracker = RecordingTracker::new();
        let mut dispatcher = ExposureDispatcher::new(Arc::new(tracker.clone()));
        dispatcher.dispatch("user123".to_string(), json!({"Experiment name": "flag"}));
        dispatcher.shutdown();

        let events = tracker.events();
        assert_that!(events).has_length(1);
        assert_that!(events[0].distinct_id).is_equal_to("user123".to_string());
        assert_that!(events[0].event_name).is_equal_to(EXPOSURE_EVENT.to_string());
    }

    #[test]
    fn tracker_panic_does_not_poison_later_events() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let panicking_then_counting =
            |_: &str, _: &str, properties: &serde_json::Value| {
                if properties["boom"].as_bool() == Some(true) {
                    panic!("tracker blew up");
                }
                CALLS.fetch_add(1, Ordering::SeqCst);
            };

        let mut dispatcher = ExposureDispatcher::new(Arc::new(panicking_then_counting));
        dispatcher.dispatch("user1".to_string(), json!({"boom": true}));
        dispatcher.dispatch("user2".to_string(), json!({"boom": false}));
        dispatcher.shutdown();

        assert_that!(CALLS.load(Ordering::SeqCst)).is_equal_to(1);
    }

    #[test]
    fn closures_are_trackers() {
        let count = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&count);
        let tracker = move |_: &str, _: &str, _: &serde_json::Value| {
            counted.fetch_add(1, Ordering::SeqCst);
        };
        tracker.track("user123", EXPOSURE_EVENT, &json!({}));
        assert_that!(count.load(Ordering::SeqCst)).is_equal_to(1);
    }
}
