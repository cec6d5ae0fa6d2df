use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use strum_macros::{Display, IntoStaticStr};

/// How an outbound call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum CallOutcome {
    Ok,
    RemoteError,
    Timeout,
    Closed,
}

/// Call counters and latency recorded through the global meter.
///
/// Without an installed meter provider these are no-ops, so connections can
/// always carry one.
#[derive(Clone)]
pub struct CallMetrics {
    calls_started: Counter<u64>,
    calls_completed: Counter<u64>,
    call_latency_ms: Histogram<f64>,
}

impl Default for CallMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CallMetrics {
    pub fn new() -> Self {
        let meter = global::meter("pubsub-rpc");
        Self {
            calls_started: meter
                .u64_counter("rpc_calls_started")
                .with_description("Outbound calls published")
                .build(),
            calls_completed: meter
                .u64_counter("rpc_calls_completed")
                .with_description("Outbound calls resolved, by outcome")
                .build(),
            call_latency_ms: meter
                .f64_histogram("rpc_call_latency_ms")
                .with_description("Time from publish to resolution")
                .with_unit("ms")
                .build(),
        }
    }

    pub fn call_started(&self, namespace: &str, method: &str) {
        self.calls_started.add(1, &attributes(namespace, method));
    }

    /// Also emits one `request` event, which the JSON event log picks up.
    pub fn call_completed(&self, namespace: &str, method: &str, outcome: CallOutcome, elapsed: Duration) {
        let latency_ms = elapsed.as_secs_f64() * 1_000.0;
        let outcome_label: &'static str = outcome.into();

        let mut attrs = attributes(namespace, method).to_vec();
        attrs.push(KeyValue::new("outcome", outcome_label));
        self.calls_completed.add(1, &attrs);
        self.call_latency_ms.record(latency_ms, &attrs);

        tracing::event!(
            target: "request",
            tracing::Level::INFO,
            namespace,
            method,
            outcome = outcome_label,
            latency_ms,
        );
    }
}

fn attributes(namespace: &str, method: &str) -> [KeyValue; 2] {
    [
        KeyValue::new("namespace", namespace.to_string()),
        KeyValue::new("method", method.to_string()),
    ]
}
