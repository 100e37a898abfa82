//! # Metrics
//!
//! Prometheus metrics for the control plane.
//!
//! ## Metrics Exposed
//!
//! - `tfstack_reconciliations_total` - Total number of reconciliations
//! - `tfstack_reconciliation_errors_total` - Total number of reconciliation errors
//! - `tfstack_queue_pushes_total` - Stacks pushed onto the work queue
//! - `tfstack_queue_polls_total` - Poll requests served by the queue
//! - `tfstack_plans_total` / `tfstack_plan_errors_total` - Plan outcomes
//! - `tfstack_applies_total` / `tfstack_apply_errors_total` - Apply outcomes
//! - `tfstack_destroys_total` - Destroy runs
//! - `tfstack_cycle_duration_seconds` - Duration of one worker cycle

use anyhow::Result;
use prometheus::{Histogram, IntCounter, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("tfstack_reconciliations_total", "Total number of reconciliations")
        .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tfstack_reconciliation_errors_total",
        "Total number of reconciliation errors",
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static QUEUE_PUSHES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("tfstack_queue_pushes_total", "Stacks pushed onto the work queue")
        .expect("Failed to create QUEUE_PUSHES_TOTAL metric - this should never happen")
});

static QUEUE_POLLS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("tfstack_queue_polls_total", "Poll requests served by the queue")
        .expect("Failed to create QUEUE_POLLS_TOTAL metric - this should never happen")
});

static PLANS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("tfstack_plans_total", "Terraform plans run")
        .expect("Failed to create PLANS_TOTAL metric - this should never happen")
});

static PLAN_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("tfstack_plan_errors_total", "Terraform plans that failed")
        .expect("Failed to create PLAN_ERRORS_TOTAL metric - this should never happen")
});

static APPLIES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("tfstack_applies_total", "Terraform applies run")
        .expect("Failed to create APPLIES_TOTAL metric - this should never happen")
});

static APPLY_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("tfstack_apply_errors_total", "Terraform applies that failed")
        .expect("Failed to create APPLY_ERRORS_TOTAL metric - this should never happen")
});

static DESTROYS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("tfstack_destroys_total", "Terraform destroy runs")
        .expect("Failed to create DESTROYS_TOTAL metric - this should never happen")
});

static CYCLE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "tfstack_cycle_duration_seconds",
            "Duration of one worker cycle in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
    )
    .expect("Failed to create CYCLE_DURATION metric - this should never happen")
});

/// Register all metrics with the process registry. Call once at startup.
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUEUE_PUSHES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUEUE_POLLS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PLANS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PLAN_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(APPLIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(APPLY_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DESTROYS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CYCLE_DURATION.clone()))?;
    Ok(())
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors() {
    RECONCILIATION_ERRORS_TOTAL.inc();
}

pub fn increment_queue_pushes() {
    QUEUE_PUSHES_TOTAL.inc();
}

pub fn increment_queue_polls() {
    QUEUE_POLLS_TOTAL.inc();
}

pub fn increment_plans() {
    PLANS_TOTAL.inc();
}

pub fn increment_plan_errors() {
    PLAN_ERRORS_TOTAL.inc();
}

pub fn increment_applies() {
    APPLIES_TOTAL.inc();
}

pub fn increment_apply_errors() {
    APPLY_ERRORS_TOTAL.inc();
}

pub fn increment_destroys() {
    DESTROYS_TOTAL.inc();
}

pub fn observe_cycle_duration(seconds: f64) {
    CYCLE_DURATION.observe(seconds);
}
