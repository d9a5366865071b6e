//! Prometheus metrics, following `rsky-ingester`/`rsky-indexer`'s
//! `lazy_static!` + `register_int_counter!` idiom, served over `warp` from
//! `bin/dispatcher.rs`.

use lazy_static::lazy_static;
use prometheus::{register_int_counter, register_int_gauge, Encoder, IntCounter, IntGauge, TextEncoder};

lazy_static! {
    pub static ref REGISTRATIONS_TOTAL: IntCounter = register_int_counter!(
        "dispatcher_registrations_total",
        "Total incomer registrations approved"
    )
    .unwrap();

    pub static ref REGISTRATIONS_REJECTED_TOTAL: IntCounter = register_int_counter!(
        "dispatcher_registrations_rejected_total",
        "Total incomer registrations rejected (duplicate baseUUID)"
    )
    .unwrap();

    pub static ref PINGS_SENT_TOTAL: IntCounter = register_int_counter!(
        "dispatcher_pings_sent_total",
        "Total ping messages sent to incomers"
    )
    .unwrap();

    pub static ref EVICTIONS_TOTAL: IntCounter = register_int_counter!(
        "dispatcher_evictions_total",
        "Total incomers evicted for exceeding idle time"
    )
    .unwrap();

    pub static ref EVENTS_PUBLISHED_TOTAL: IntCounter = register_int_counter!(
        "dispatcher_events_published_total",
        "Total events fanned out to at least one subscriber"
    )
    .unwrap();

    pub static ref FANOUT_TARGETS_TOTAL: IntCounter = register_int_counter!(
        "dispatcher_fanout_targets_total",
        "Total dispatcher-side child transactions created by fan-out"
    )
    .unwrap();

    pub static ref EVENTS_BACKED_UP_TOTAL: IntCounter = register_int_counter!(
        "dispatcher_events_backed_up_total",
        "Total publishes parked to the backup dispatcher store (no subscriber)"
    )
    .unwrap();

    pub static ref VALIDATION_REJECTIONS_TOTAL: IntCounter = register_int_counter!(
        "dispatcher_validation_rejections_total",
        "Total messages rejected by schema or event-name validation"
    )
    .unwrap();

    pub static ref RECONCILIATION_PASSES_TOTAL: IntCounter = register_int_counter!(
        "dispatcher_reconciliation_passes_total",
        "Total transaction reconciliation passes run"
    )
    .unwrap();

    pub static ref RECONCILIATION_RESOLVED_TOTAL: IntCounter = register_int_counter!(
        "dispatcher_reconciliation_resolved_total",
        "Total transaction pairs resolved and deleted by reconciliation"
    )
    .unwrap();

    pub static ref ACTIVE_INSTANCE: IntGauge = register_int_gauge!(
        "dispatcher_active_instance",
        "Whether this process currently holds the active dispatcher role (1=yes, 0=no)"
    )
    .unwrap();

    pub static ref KNOWN_INCOMERS: IntGauge = register_int_gauge!(
        "dispatcher_known_incomers",
        "Number of incomers currently in the registry"
    )
    .unwrap();
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
