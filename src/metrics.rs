//! # Orchestration Metrics
//!
//! OpenTelemetry counters for the remediation engine. Instruments are
//! created from the global meter provider; wiring an exporter is left to the
//! embedding process, and without one every `add` is a no-op.

use opentelemetry::metrics::{Counter, Meter};
use std::sync::OnceLock;

static REMEDIATION_METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    REMEDIATION_METER.get_or_init(|| opentelemetry::global::meter_provider().meter("remediation-core"))
}

/// Callback events consumed by a handler
///
/// Labels:
/// - task_type
/// - outcome: unreachable / ok / failed
pub fn callback_events_total() -> Counter<u64> {
    meter()
        .u64_counter("remediation.callback.events.total")
        .with_description("Runner callback events consumed")
        .build()
}

/// Task executions driven to an end state
///
/// Labels:
/// - task_type
/// - final_state: completed / fault / created
pub fn executions_total() -> Counter<u64> {
    meter()
        .u64_counter("remediation.executions.total")
        .with_description("Task executions by final state")
        .build()
}

/// Tasks corrected by the sweeper
pub fn sweeper_corrections_total() -> Counter<u64> {
    meter()
        .u64_counter("remediation.sweeper.corrections.total")
        .with_description("Stuck tasks forced out of running by the correction sweeper")
        .build()
}
