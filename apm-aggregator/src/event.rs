// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Input event model and the metricset events emitted at harvest.
//!
//! Input events are treated as opaque records: only the fields that drive
//! aggregation are modeled. Empty strings are significant and kept distinct
//! from missing optional payloads.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A batch of APM events, aggregated in order by a single call.
pub type Batch = Vec<ApmEvent>;

/// One observability record: a transaction or a span, with service identity,
/// timing, outcome and labels.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ApmEvent {
    /// Event timestamp in unix nanoseconds; zero when unknown.
    pub timestamp_unix_nanos: u64,
    /// Event duration in microseconds. Negative durations are rejected at
    /// ingest.
    pub duration_micros: i64,
    /// Event outcome, e.g. `success` or `failure`.
    pub outcome: String,
    pub agent_name: String,
    pub service: Service,
    /// String labels; only labels flagged global participate in the service
    /// instance identity.
    pub labels: BTreeMap<String, Label>,
    /// Numeric labels, same global semantics as `labels`.
    pub numeric_labels: BTreeMap<String, NumericLabel>,
    pub container_id: String,
    pub kubernetes_pod_name: String,
    pub client_country: String,
    pub client_region: String,
    pub client_city: String,
    pub faas: Option<Faas>,
    pub transaction: Option<Transaction>,
    pub span: Option<Span>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub environment: String,
    pub language_name: String,
    pub version: String,
    pub node_name: String,
    pub runtime_name: String,
    pub target: Option<ServiceTarget>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceTarget {
    pub r#type: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub value: String,
    pub global: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NumericLabel {
    pub value: f64,
    pub global: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Faas {
    pub coldstart: Option<bool>,
    pub id: String,
    pub name: String,
    pub version: String,
    pub trigger_type: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub name: String,
    pub r#type: String,
    pub result: String,
    /// True when the transaction is the root of its trace.
    pub trace_root: bool,
    /// How many real events this sampled event stands for.
    pub representative_count: f64,
    pub dropped_spans_stats: Vec<DroppedSpanStats>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub name: String,
    /// How many real events this sampled event stands for.
    pub representative_count: f64,
    /// Destination service resource; empty when the span has none.
    pub destination_service_resource: String,
}

/// Stats for spans dropped by the agent, reported on the enclosing
/// transaction.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DroppedSpanStats {
    pub destination_service_resource: String,
    pub service_target_type: String,
    pub service_target_name: String,
    pub outcome: String,
    pub duration_count: u64,
    pub duration_sum_micros: u64,
}

/// Metricset names emitted by the output translator.
pub mod metricset {
    pub const SERVICE_SUMMARY: &str = "service_summary";
    pub const TRANSACTION: &str = "transaction";
    pub const SERVICE_TRANSACTION: &str = "service_transaction";
    pub const SERVICE_DESTINATION: &str = "service_destination";
}

/// Synthetic key value carried by overflow groups.
pub const OVERFLOW_BUCKET_NAME: &str = "_other";

/// A downstream metricset event expanded from one combined-metrics value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricsetEvent {
    pub timestamp_unix_nanos: u64,
    /// One of the [`metricset`] names.
    pub metricset_name: &'static str,
    /// Aggregation interval as a duration string, e.g. `1m`.
    pub interval: String,
    pub doc_count: u64,
    pub service_name: String,
    pub service_environment: String,
    pub service_language_name: String,
    pub agent_name: String,
    pub service_target_type: String,
    pub service_target_name: String,
    /// Global labels of the service instance, re-attached at output.
    pub labels: BTreeMap<String, String>,
    pub numeric_labels: BTreeMap<String, f64>,
    pub event_outcome: String,
    /// Success/failure roll-up: count of outcome-carrying events, sum of
    /// successes, both representative-count weighted.
    pub success_count: Option<SummaryMetric>,
    pub transaction: Option<TransactionMetricset>,
    pub span: Option<SpanMetricset>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SummaryMetric {
    pub count: u64,
    pub sum: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransactionMetricset {
    pub name: String,
    pub r#type: String,
    pub result: String,
    pub trace_root: bool,
    /// Latency distribution in microseconds as parallel counts/values.
    pub duration_histogram_counts: Vec<u64>,
    pub duration_histogram_values: Vec<f64>,
    /// Summary derived from the histogram: `count = sum of counts`,
    /// `sum = sum of value * count`.
    pub duration_summary: SummaryMetric,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SpanMetricset {
    pub name: String,
    pub destination_service_resource: String,
    /// Weighted response count and duration sum in microseconds.
    pub response_count: u64,
    pub response_sum_micros: u64,
}
