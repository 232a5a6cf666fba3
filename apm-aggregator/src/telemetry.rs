// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Telemetry metric names and label helpers.
//!
//! Counters and histograms are emitted through the `metrics` facade; the
//! embedding process decides where they go by installing a recorder.

use std::time::Duration;

use crate::config::Config;
use crate::keys::{format_interval, TenantId};

pub const REQUESTS_TOTAL: &str = "aggregator.requests.total";
pub const BYTES_INGESTED: &str = "aggregator.bytes.ingested";
pub const EVENTS_TOTAL: &str = "aggregator.events.total";
pub const EVENTS_PROCESSED: &str = "aggregator.events.processed";
pub const EVENTS_DROPPED: &str = "aggregator.events.dropped";
pub const PROCESSING_DELAY: &str = "events.processing-delay";
pub const QUEUED_DELAY: &str = "events.queued-delay";

pub const AGGREGATION_INTERVAL_LABEL: &str = "aggregation_interval";
pub const DROP_REASON_LABEL: &str = "reason";

/// Labels derived from the tenant id through the configured hook.
pub(crate) fn tenant_labels(config: &Config, tenant_id: &TenantId) -> Vec<(String, String)> {
    config
        .tenant_labels
        .as_ref()
        .map(|hook| hook(tenant_id))
        .unwrap_or_default()
}

/// Tenant labels plus the `aggregation_interval` label carried by all
/// per-interval metrics.
pub(crate) fn interval_labels(
    config: &Config,
    tenant_id: &TenantId,
    interval: Duration,
) -> Vec<(String, String)> {
    let mut labels = tenant_labels(config, tenant_id);
    labels.push((
        AGGREGATION_INTERVAL_LABEL.to_owned(),
        format_interval(interval),
    ));
    labels
}
