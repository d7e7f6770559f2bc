use crate::types::Phase;
use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
};
use std::sync::atomic::AtomicI64;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PhaseLabel {
    pub phase: String,
}

impl PhaseLabel {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase: phase.name().to_string(),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Dropped {
    pub reason: String,
}

impl Dropped {
    pub fn new(reason: &str) -> Self {
        Self {
            reason: reason.to_string(),
        }
    }
}

/// Metrics tracked by the engine.
#[derive(Clone)]
pub struct Metrics {
    pub current_sequence: Gauge<i64, AtomicI64>,
    pub current_round: Gauge<i64, AtomicI64>,
    pub backlog: Gauge<i64, AtomicI64>,
    pub inbound_messages: Family<PhaseLabel, Counter>,
    pub dropped_messages: Family<Dropped, Counter>,
    pub certificates: Family<PhaseLabel, Counter>,
    pub timeouts: Counter,
    pub commits: Counter,
}

impl Metrics {
    /// Create and register all metrics under `context`.
    pub fn init(context: &impl RuntimeMetrics) -> Self {
        let metrics = Self {
            current_sequence: Gauge::default(),
            current_round: Gauge::default(),
            backlog: Gauge::default(),
            inbound_messages: Family::default(),
            dropped_messages: Family::default(),
            certificates: Family::default(),
            timeouts: Counter::default(),
            commits: Counter::default(),
        };
        context.register(
            "current_sequence",
            "current sequence",
            metrics.current_sequence.clone(),
        );
        context.register("current_round", "current round", metrics.current_round.clone());
        context.register(
            "backlog",
            "number of messages held for future views",
            metrics.backlog.clone(),
        );
        context.register(
            "inbound_messages",
            "number of valid inbound messages",
            metrics.inbound_messages.clone(),
        );
        context.register(
            "dropped_messages",
            "number of inbound messages dropped",
            metrics.dropped_messages.clone(),
        );
        context.register(
            "certificates",
            "number of certificates formed",
            metrics.certificates.clone(),
        );
        context.register("timeouts", "number of round timeouts", metrics.timeouts.clone());
        context.register("commits", "number of blocks committed", metrics.commits.clone());
        metrics
    }
}
