use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

use crate::errors::ErrorClass;
use crate::workload::WorkloadKind;

pub mod exporter;

#[derive(Clone, Hash, Eq, Debug, PartialEq, EncodeLabelValue, Copy)]
enum Outcome {
    Success,
    Skipped,
    Error,
}

#[derive(Clone, Hash, Eq, Debug, PartialEq, EncodeLabelSet)]
struct ReloadLabels {
    kind: String,
    outcome: Outcome,
}

#[derive(Clone, Hash, Eq, Debug, PartialEq, EncodeLabelSet)]
struct ErrorLabels {
    class: String,
}

/// Collectors for the event pipeline.
#[derive(Debug, Clone)]
pub struct Metrics {
    reloads: Family<ReloadLabels, Counter<u64>>,
    errors: Family<ErrorLabels, Counter<u64>>,
    /// Items waiting in the work queue.
    pub queue_depth: Gauge,
}

impl Metrics {
    pub(crate) fn new(registry: &mut Registry) -> Self {
        let reloads: Family<ReloadLabels, Counter<u64>> = Default::default();
        registry.register(
            "reloads",
            "Reload actions executed, by workload kind and outcome",
            reloads.clone(),
        );

        let errors: Family<ErrorLabels, Counter<u64>> = Default::default();
        registry.register(
            "errors",
            "Pipeline errors, by retry class",
            errors.clone(),
        );

        let queue_depth = Gauge::default();
        registry.register(
            "queue_depth",
            "Configuration changes waiting in the work queue",
            queue_depth.clone(),
        );

        Metrics {
            reloads,
            errors,
            queue_depth,
        }
    }

    pub fn reloaded(&self, kind: WorkloadKind) {
        self.record(kind, Outcome::Success);
    }

    pub fn reload_skipped(&self, kind: WorkloadKind) {
        self.record(kind, Outcome::Skipped);
    }

    pub fn reload_failed(&self, kind: WorkloadKind) {
        self.record(kind, Outcome::Error);
    }

    pub fn error(&self, class: ErrorClass) {
        self.errors
            .get_or_create(&ErrorLabels {
                class: class.as_str().to_string(),
            })
            .inc();
    }

    fn record(&self, kind: WorkloadKind, outcome: Outcome) {
        self.reloads
            .get_or_create(&ReloadLabels {
                kind: kind.as_str().to_string(),
                outcome,
            })
            .inc();
    }
}
