// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Aggregation keys and the ordered byte codec for stored combined metrics.
//!
//! The store key is fixed-size and big-endian so that lexicographic byte
//! order sorts by interval, then processing time, then tenant, then
//! partition. The aggregation keys inside a value are ordinary `Ord` structs;
//! their canonical byte serialization feeds the stable partition hash.

use std::hash::{Hash, Hasher};
use std::time::Duration;

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};

use crate::error::AggregatorError;
use crate::event::{ApmEvent, DroppedSpanStats, Span, Transaction};

/// Opaque identifier for the origin of a batch.
pub type TenantId = [u8; 16];

/// Encoded size of a [`CombinedMetricsKey`]:
/// interval tag (2) + processing time (8) + tenant id (16) + partition (2).
pub const ENCODED_KEY_SIZE: usize = 28;

/// Identifies one stored combined-metrics value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CombinedMetricsKey {
    pub interval: Duration,
    /// Wall-clock time the engine observed the events, truncated to the
    /// interval, in unix nanoseconds.
    pub processing_time_unix_nanos: u64,
    pub tenant_id: TenantId,
    pub partition_id: u16,
}

impl CombinedMetricsKey {
    /// Encode with the given interval tag (the index of `interval` in the
    /// sorted configured interval list).
    pub fn encode(&self, interval_tag: u16) -> [u8; ENCODED_KEY_SIZE] {
        let mut buf = [0u8; ENCODED_KEY_SIZE];
        buf[0..2].copy_from_slice(&interval_tag.to_be_bytes());
        buf[2..10].copy_from_slice(&self.processing_time_unix_nanos.to_be_bytes());
        buf[10..26].copy_from_slice(&self.tenant_id);
        buf[26..28].copy_from_slice(&self.partition_id.to_be_bytes());
        buf
    }

    /// Decode a stored key, resolving the interval tag against the sorted
    /// configured interval list.
    pub fn decode(buf: &[u8], intervals: &[Duration]) -> Result<Self, AggregatorError> {
        if buf.len() != ENCODED_KEY_SIZE {
            return Err(AggregatorError::decoding(
                buf,
                format!("key length {} != {ENCODED_KEY_SIZE}", buf.len()),
            ));
        }
        let tag = u16::from_be_bytes([buf[0], buf[1]]);
        let interval = *intervals.get(tag as usize).ok_or_else(|| {
            AggregatorError::decoding(buf, format!("unknown interval tag {tag}"))
        })?;
        let mut processing_time = [0u8; 8];
        processing_time.copy_from_slice(&buf[2..10]);
        let mut tenant_id = [0u8; 16];
        tenant_id.copy_from_slice(&buf[10..26]);
        Ok(Self {
            interval,
            processing_time_unix_nanos: u64::from_be_bytes(processing_time),
            tenant_id,
            partition_id: u16::from_be_bytes([buf[26], buf[27]]),
        })
    }
}

/// Truncate a unix-nanosecond timestamp to the start of its interval bucket.
#[inline]
pub(crate) fn truncate_to_interval(unix_nanos: u64, interval: Duration) -> u64 {
    let interval = interval.as_nanos() as u64;
    if interval == 0 {
        return unix_nanos;
    }
    unix_nanos - (unix_nanos % interval)
}

/// Format an interval the way emitted metricsets carry it, e.g. `10m`.
pub fn format_interval(interval: Duration) -> String {
    let secs = interval.as_secs();
    if secs > 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs > 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

/// Groups events by service identity within one processing-time bucket.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceAggregationKey {
    /// Event timestamp truncated to the aggregation interval.
    pub timestamp_unix_nanos: u64,
    pub service_name: String,
    pub service_environment: String,
    pub service_language_name: String,
    pub agent_name: String,
}

impl ServiceAggregationKey {
    pub(crate) fn from_event(event: &ApmEvent, interval: Duration) -> Self {
        Self {
            timestamp_unix_nanos: truncate_to_interval(event.timestamp_unix_nanos, interval),
            service_name: event.service.name.clone(),
            service_environment: event.service.environment.clone(),
            service_language_name: event.service.language_name.clone(),
            agent_name: event.agent_name.clone(),
        }
    }

    /// Deterministic byte serialization used for partition derivation.
    pub(crate) fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            8 + 16
                + self.service_name.len()
                + self.service_environment.len()
                + self.service_language_name.len()
                + self.agent_name.len(),
        );
        out.extend_from_slice(&self.timestamp_unix_nanos.to_be_bytes());
        for field in [
            &self.service_name,
            &self.service_environment,
            &self.service_language_name,
            &self.agent_name,
        ] {
            out.extend_from_slice(&(field.len() as u32).to_be_bytes());
            out.extend_from_slice(field.as_bytes());
        }
        out
    }

    /// Stable partition for this service; all entries of one service key
    /// land in the same partition.
    pub(crate) fn partition(&self, partitions: u16) -> u16 {
        let mut hasher = FnvHasher::default();
        hasher.write(&self.canonical_bytes());
        (hasher.finish() % u64::from(partitions.max(1))) as u16
    }
}

/// Groups events by the canonicalized global labels of their origin.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceInstanceAggregationKey {
    /// Lexicographically sorted `key=value` pairs of global labels, joined
    /// with commas.
    pub global_labels: String,
}

impl ServiceInstanceAggregationKey {
    pub(crate) fn from_event(event: &ApmEvent) -> Self {
        let mut pairs: Vec<String> = Vec::new();
        for (name, label) in &event.labels {
            if label.global {
                pairs.push(format!("{name}={}", label.value));
            }
        }
        for (name, label) in &event.numeric_labels {
            if label.global {
                pairs.push(format!("{name}={}", label.value));
            }
        }
        pairs.sort();
        Self {
            global_labels: pairs.join(","),
        }
    }
}

/// Groups transactions sharing identity, outcome and environment facets.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionAggregationKey {
    pub trace_root: bool,
    pub container_id: String,
    pub kubernetes_pod_name: String,
    pub service_version: String,
    pub service_node_name: String,
    pub service_runtime_name: String,
    pub client_country: String,
    pub client_region: String,
    pub client_city: String,
    pub event_outcome: String,
    pub transaction_name: String,
    pub transaction_type: String,
    pub transaction_result: String,
    pub faas_coldstart: Option<bool>,
    pub faas_id: String,
    pub faas_name: String,
    pub faas_version: String,
    pub faas_trigger_type: String,
}

impl TransactionAggregationKey {
    pub(crate) fn from_event(event: &ApmEvent, transaction: &Transaction) -> Self {
        let faas = event.faas.as_ref();
        Self {
            trace_root: transaction.trace_root,
            container_id: event.container_id.clone(),
            kubernetes_pod_name: event.kubernetes_pod_name.clone(),
            service_version: event.service.version.clone(),
            service_node_name: event.service.node_name.clone(),
            service_runtime_name: event.service.runtime_name.clone(),
            client_country: event.client_country.clone(),
            client_region: event.client_region.clone(),
            client_city: event.client_city.clone(),
            event_outcome: event.outcome.clone(),
            transaction_name: transaction.name.clone(),
            transaction_type: transaction.r#type.clone(),
            transaction_result: transaction.result.clone(),
            faas_coldstart: faas.and_then(|f| f.coldstart),
            faas_id: faas.map(|f| f.id.clone()).unwrap_or_default(),
            faas_name: faas.map(|f| f.name.clone()).unwrap_or_default(),
            faas_version: faas.map(|f| f.version.clone()).unwrap_or_default(),
            faas_trigger_type: faas.map(|f| f.trigger_type.clone()).unwrap_or_default(),
        }
    }
}

/// Groups transactions by type only.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceTransactionAggregationKey {
    pub transaction_type: String,
}

/// Groups span contributions by destination identity.
///
/// Empty fields are significant: a dropped-span-stats contribution has an
/// empty span name, and a span without a service target keeps empty target
/// fields, distinct from any named target.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpanAggregationKey {
    pub span_name: String,
    pub outcome: String,
    pub target_type: String,
    pub target_name: String,
    pub resource: String,
}

impl SpanAggregationKey {
    pub(crate) fn from_span(event: &ApmEvent, span: &Span) -> Self {
        let target = event.service.target.as_ref();
        Self {
            span_name: span.name.clone(),
            outcome: event.outcome.clone(),
            target_type: target.map(|t| t.r#type.clone()).unwrap_or_default(),
            target_name: target.map(|t| t.name.clone()).unwrap_or_default(),
            resource: span.destination_service_resource.clone(),
        }
    }

    pub(crate) fn from_dropped_span_stats(dss: &DroppedSpanStats) -> Self {
        Self {
            span_name: String::new(),
            outcome: dss.outcome.clone(),
            target_type: dss.service_target_type.clone(),
            target_name: dss.service_target_name.clone(),
            resource: dss.destination_service_resource.clone(),
        }
    }
}

/// Process-local stable hash of an aggregation key, used by the overflow
/// cardinality counters.
pub(crate) fn key_hash<T: Hash>(key: &T) -> u64 {
    let mut hasher = FnvHasher::default();
    key.hash(&mut hasher);
    hasher.finish()
}
