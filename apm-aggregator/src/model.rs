// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory combined metrics for one (interval, processing time, tenant,
//! partition) bucket, and the cap-aware fold shared by ingest and the store
//! merge operator.
//!
//! All grouping maps are `BTreeMap` so identical logical content always
//! serializes to identical bytes, which is what makes the store-level merge
//! commutative and associative after canonical serialization.

use std::collections::{BTreeMap, HashSet};

use apm_hdrhistogram::HdrHistogram;
use serde::{Deserialize, Serialize};

use crate::config::Limits;
use crate::keys::{
    key_hash, ServiceAggregationKey, ServiceInstanceAggregationKey,
    ServiceTransactionAggregationKey, SpanAggregationKey, TransactionAggregationKey,
};

/// Counts distinct keys collapsed into an overflow bucket.
///
/// The in-memory set deduplicates observations within the lifetime of one
/// value; merging two counters adds their totals, so across store-level
/// merges the count is an upper bound on the true distinct cardinality.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CardinalityCounter {
    total: u64,
    #[serde(skip)]
    seen: HashSet<u64>,
}

impl CardinalityCounter {
    pub(crate) fn observe(&mut self, key_hash: u64) {
        if self.seen.insert(key_hash) {
            self.total += 1;
        }
    }

    pub(crate) fn merge(&mut self, other: &Self) {
        self.total += other.total;
    }

    /// Estimated number of distinct keys collapsed into this bucket.
    pub fn total(&self) -> u64 {
        self.total
    }
}

impl PartialEq for CardinalityCounter {
    fn eq(&self, other: &Self) -> bool {
        self.total == other.total
    }
}

pub(crate) trait MergeMetric {
    fn merge_with(&mut self, other: &Self);
}

/// Latency and outcome roll-up for one transaction group.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionMetric {
    /// Representative-count weighted number of events.
    pub count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Duration distribution in microseconds.
    pub histogram: HdrHistogram,
}

impl MergeMetric for TransactionMetric {
    fn merge_with(&mut self, other: &Self) {
        self.count += other.count;
        self.success_count += other.success_count;
        self.failure_count += other.failure_count;
        self.histogram.merge(&other.histogram);
    }
}

/// Same shape as [`TransactionMetric`], grouped by transaction type only.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceTransactionMetric {
    pub count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub histogram: HdrHistogram,
}

impl MergeMetric for ServiceTransactionMetric {
    fn merge_with(&mut self, other: &Self) {
        self.count += other.count;
        self.success_count += other.success_count;
        self.failure_count += other.failure_count;
        self.histogram.merge(&other.histogram);
    }
}

/// Weighted count and duration sum for one span group.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SpanMetric {
    pub count: u64,
    pub sum_micros: u64,
}

impl MergeMetric for SpanMetric {
    fn merge_with(&mut self, other: &Self) {
        self.count += other.count;
        self.sum_micros += other.sum_micros;
    }
}

/// Anchor for the global labels of one service instance.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstanceMetric {
    pub count: u64,
    pub labels: BTreeMap<String, String>,
    pub numeric_labels: BTreeMap<String, f64>,
}

impl MergeMetric for ServiceInstanceMetric {
    fn merge_with(&mut self, other: &Self) {
        self.count += other.count;
        // Identical instance keys carry identical labels; first writer wins.
        if self.labels.is_empty() && self.numeric_labels.is_empty() {
            self.labels = other.labels.clone();
            self.numeric_labels = other.numeric_labels.clone();
        }
    }
}

/// An overflow bucket: aggregates like a real group plus an estimate of how
/// many distinct keys were collapsed into it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Overflow<M> {
    pub metric: M,
    pub cardinality: CardinalityCounter,
}

impl<M: MergeMetric> Overflow<M> {
    pub(crate) fn add(&mut self, key_hash: u64, metric: &M) {
        self.cardinality.observe(key_hash);
        self.metric.merge_with(metric);
    }

    pub(crate) fn merge(&mut self, other: &Self) {
        self.cardinality.merge(&other.cardinality);
        self.metric.merge_with(&other.metric);
    }

    pub fn is_empty(&self) -> bool {
        self.cardinality.total() == 0
    }
}

/// All aggregates of one service within a combined-metrics value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceMetrics {
    /// Number of ingested events attributed to this service, regardless of
    /// whether their groups were admitted or overflowed.
    pub events_total: u64,
    pub transaction_groups: BTreeMap<TransactionAggregationKey, TransactionMetric>,
    pub service_transaction_groups:
        BTreeMap<ServiceTransactionAggregationKey, ServiceTransactionMetric>,
    pub span_groups: BTreeMap<SpanAggregationKey, SpanMetric>,
    pub service_instance_groups: BTreeMap<ServiceInstanceAggregationKey, ServiceInstanceMetric>,
    pub overflow_transactions: Overflow<TransactionMetric>,
    pub overflow_service_transactions: Overflow<ServiceTransactionMetric>,
    pub overflow_spans: Overflow<SpanMetric>,
    pub overflow_service_instances: CardinalityCounter,
}

/// Aggregate state for one (interval, processing time, tenant, partition)
/// bucket.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CombinedMetrics {
    pub services: BTreeMap<ServiceAggregationKey, ServiceMetrics>,
    /// Synthetic bucket absorbing every update for services beyond the
    /// `max_services` cap; only its overflow buckets and event counter are
    /// populated.
    pub overflow_services: ServiceMetrics,
    pub overflow_services_estimator: CardinalityCounter,
    /// Total ingested events with non-zero representative count.
    pub events_total: u64,
    /// Youngest event timestamp seen, for queued-delay telemetry.
    pub youngest_event_unix_nanos: u64,
}

impl CombinedMetrics {
    pub fn is_empty(&self) -> bool {
        self.events_total == 0 && self.services.is_empty()
    }

    /// Sum of per-service event counts including the overflow bucket. Equal
    /// to `events_total` by construction.
    pub fn total_service_events(&self) -> u64 {
        self.services.values().map(|s| s.events_total).sum::<u64>()
            + self.overflow_services.events_total
    }

    fn transaction_group_count(&self) -> usize {
        self.services
            .values()
            .map(|s| s.transaction_groups.len())
            .sum()
    }

    fn service_transaction_group_count(&self) -> usize {
        self.services
            .values()
            .map(|s| s.service_transaction_groups.len())
            .sum()
    }

    fn span_group_count(&self) -> usize {
        self.services.values().map(|s| s.span_groups.len()).sum()
    }

    /// Whether updates for this service go to a real entry or to the global
    /// overflow. Records collapsed services in the estimator.
    fn service_admitted(&mut self, key: &ServiceAggregationKey, limits: &Limits) -> bool {
        if self.services.contains_key(key) || self.services.len() < limits.max_services {
            true
        } else {
            self.overflow_services_estimator.observe(key_hash(key));
            false
        }
    }

    /// Attribute `count` events to the service, routing to the global
    /// overflow bucket when the service cap is hit. The caller updates
    /// `events_total`.
    pub(crate) fn observe_service_events(
        &mut self,
        svc_key: &ServiceAggregationKey,
        count: u64,
        limits: &Limits,
    ) {
        if self.service_admitted(svc_key, limits) {
            self.services.entry(svc_key.clone()).or_default().events_total += count;
        } else {
            self.overflow_services.events_total += count;
        }
    }

    pub(crate) fn add_transaction(
        &mut self,
        svc_key: &ServiceAggregationKey,
        txn_key: TransactionAggregationKey,
        metric: TransactionMetric,
        limits: &Limits,
    ) {
        if !self.service_admitted(svc_key, limits) {
            self.overflow_services
                .overflow_transactions
                .add(key_hash(&(svc_key, &txn_key)), &metric);
            return;
        }
        let global_count = self.transaction_group_count();
        let svc = self.services.entry(svc_key.clone()).or_default();
        if let Some(existing) = svc.transaction_groups.get_mut(&txn_key) {
            existing.merge_with(&metric);
        } else if svc.transaction_groups.len() < limits.max_transaction_groups_per_service
            && global_count < limits.max_transaction_groups
        {
            svc.transaction_groups.insert(txn_key, metric);
        } else {
            svc.overflow_transactions.add(key_hash(&txn_key), &metric);
        }
    }

    pub(crate) fn add_service_transaction(
        &mut self,
        svc_key: &ServiceAggregationKey,
        stxn_key: ServiceTransactionAggregationKey,
        metric: ServiceTransactionMetric,
        limits: &Limits,
    ) {
        if !self.service_admitted(svc_key, limits) {
            self.overflow_services
                .overflow_service_transactions
                .add(key_hash(&(svc_key, &stxn_key)), &metric);
            return;
        }
        let global_count = self.service_transaction_group_count();
        let svc = self.services.entry(svc_key.clone()).or_default();
        if let Some(existing) = svc.service_transaction_groups.get_mut(&stxn_key) {
            existing.merge_with(&metric);
        } else if svc.service_transaction_groups.len()
            < limits.max_service_transaction_groups_per_service
            && global_count < limits.max_service_transaction_groups
        {
            svc.service_transaction_groups.insert(stxn_key, metric);
        } else {
            svc.overflow_service_transactions
                .add(key_hash(&stxn_key), &metric);
        }
    }

    pub(crate) fn add_span(
        &mut self,
        svc_key: &ServiceAggregationKey,
        span_key: SpanAggregationKey,
        metric: SpanMetric,
        limits: &Limits,
    ) {
        if !self.service_admitted(svc_key, limits) {
            self.overflow_services
                .overflow_spans
                .add(key_hash(&(svc_key, &span_key)), &metric);
            return;
        }
        let global_count = self.span_group_count();
        let svc = self.services.entry(svc_key.clone()).or_default();
        if let Some(existing) = svc.span_groups.get_mut(&span_key) {
            existing.merge_with(&metric);
        } else if svc.span_groups.len() < limits.max_span_groups_per_service
            && global_count < limits.max_span_groups
        {
            svc.span_groups.insert(span_key, metric);
        } else {
            svc.overflow_spans.add(key_hash(&span_key), &metric);
        }
    }

    pub(crate) fn add_service_instance(
        &mut self,
        svc_key: &ServiceAggregationKey,
        instance_key: ServiceInstanceAggregationKey,
        metric: ServiceInstanceMetric,
        limits: &Limits,
    ) {
        // Instance labels of collapsed services are not retained; the global
        // overflow is emitted without per-instance labels.
        if !self.service_admitted(svc_key, limits) {
            return;
        }
        let svc = self.services.entry(svc_key.clone()).or_default();
        if let Some(existing) = svc.service_instance_groups.get_mut(&instance_key) {
            existing.merge_with(&metric);
        } else if svc.service_instance_groups.len()
            < limits.max_service_instance_groups_per_service
        {
            svc.service_instance_groups.insert(instance_key, metric);
        } else {
            svc.overflow_service_instances.observe(key_hash(&instance_key));
        }
    }

    /// Fold `other` into `self` through the limiter. Used by the in-memory
    /// ingest fold and by the store merge operator.
    pub fn merge_from(&mut self, other: CombinedMetrics, limits: &Limits) {
        self.events_total += other.events_total;
        self.youngest_event_unix_nanos = self
            .youngest_event_unix_nanos
            .max(other.youngest_event_unix_nanos);

        for (svc_key, svc) in other.services {
            self.observe_service_events(&svc_key, svc.events_total, limits);
            for (key, metric) in &svc.transaction_groups {
                self.add_transaction(&svc_key, key.clone(), metric.clone(), limits);
            }
            for (key, metric) in &svc.service_transaction_groups {
                self.add_service_transaction(&svc_key, key.clone(), metric.clone(), limits);
            }
            for (key, metric) in &svc.span_groups {
                self.add_span(&svc_key, key.clone(), metric.clone(), limits);
            }
            for (key, metric) in &svc.service_instance_groups {
                self.add_service_instance(&svc_key, key.clone(), metric.clone(), limits);
            }
            self.merge_service_overflow(&svc_key, &svc, limits);
        }

        self.overflow_services.events_total += other.overflow_services.events_total;
        self.overflow_services
            .overflow_transactions
            .merge(&other.overflow_services.overflow_transactions);
        self.overflow_services
            .overflow_service_transactions
            .merge(&other.overflow_services.overflow_service_transactions);
        self.overflow_services
            .overflow_spans
            .merge(&other.overflow_services.overflow_spans);
        self.overflow_services_estimator
            .merge(&other.overflow_services_estimator);
    }

    /// Fold the per-service overflow buckets of `other_svc` into either the
    /// matching admitted service or the global overflow.
    fn merge_service_overflow(
        &mut self,
        svc_key: &ServiceAggregationKey,
        other_svc: &ServiceMetrics,
        limits: &Limits,
    ) {
        let target = if self.service_admitted(svc_key, limits) {
            self.services.entry(svc_key.clone()).or_default()
        } else {
            &mut self.overflow_services
        };
        if !other_svc.overflow_transactions.is_empty() {
            target
                .overflow_transactions
                .merge(&other_svc.overflow_transactions);
        }
        if !other_svc.overflow_service_transactions.is_empty() {
            target
                .overflow_service_transactions
                .merge(&other_svc.overflow_service_transactions);
        }
        if !other_svc.overflow_spans.is_empty() {
            target.overflow_spans.merge(&other_svc.overflow_spans);
        }
        if other_svc.overflow_service_instances.total() > 0 {
            target
                .overflow_service_instances
                .merge(&other_svc.overflow_service_instances);
        }
    }
}
