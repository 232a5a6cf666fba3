// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Translation of input event batches into in-memory combined metrics.
//!
//! One call folds a batch into one value per (interval, partition) and
//! reports rejection counts; the caller writes each value to the store with
//! merge semantics.

use std::collections::BTreeMap;

use crate::config::Config;
use crate::event::ApmEvent;
use crate::keys::{
    truncate_to_interval, ServiceAggregationKey, ServiceInstanceAggregationKey,
    ServiceTransactionAggregationKey, SpanAggregationKey, TransactionAggregationKey,
};
use crate::model::{
    CombinedMetrics, ServiceInstanceMetric, ServiceTransactionMetric, SpanMetric,
    TransactionMetric,
};

const OUTCOME_SUCCESS: &str = "success";
const OUTCOME_FAILURE: &str = "failure";

/// Destination of one in-memory fold: interval tag, processing-time bucket
/// and partition.
pub(crate) type EntryKey = (u16, u64, u16);

#[derive(Debug, Default)]
pub(crate) struct IngestResult {
    pub entries: BTreeMap<EntryKey, CombinedMetrics>,
    /// Events accepted into every configured interval.
    pub events_accepted: u64,
    pub dropped_zero_weight: u64,
    pub dropped_negative_duration: u64,
}

/// Fold a batch into per-(interval, partition) combined metrics.
///
/// Events are folded in batch order. Weight-0 and negative-duration events
/// are rejected and counted; rejection never fails the call.
pub(crate) fn translate_batch(
    batch: &[ApmEvent],
    config: &Config,
    now_unix_nanos: u64,
) -> IngestResult {
    let mut result = IngestResult::default();
    let limits = &config.limits;

    for event in batch {
        let weight = representative_weight(event);
        if weight == 0 {
            result.dropped_zero_weight += 1;
            continue;
        }
        if (event.transaction.is_some() || event.span.is_some()) && event.duration_micros < 0 {
            result.dropped_negative_duration += 1;
            continue;
        }
        result.events_accepted += 1;

        let instance_key = ServiceInstanceAggregationKey::from_event(event);
        let instance_metric = instance_metric(event, weight);

        for (tag, &interval) in config.aggregation_intervals.iter().enumerate() {
            let tag = tag as u16;
            let processing_time = truncate_to_interval(now_unix_nanos, interval);
            let svc_key = ServiceAggregationKey::from_event(event, interval);
            let partition = svc_key.partition(config.partitions);

            let entry = result
                .entries
                .entry((tag, processing_time, partition))
                .or_default();
            entry.events_total += 1;
            entry.youngest_event_unix_nanos = entry
                .youngest_event_unix_nanos
                .max(event.timestamp_unix_nanos);
            entry.observe_service_events(&svc_key, 1, limits);
            entry.add_service_instance(&svc_key, instance_key.clone(), instance_metric.clone(), limits);

            if let Some(transaction) = &event.transaction {
                let metric = transaction_metric(event, weight);
                entry.add_transaction(
                    &svc_key,
                    TransactionAggregationKey::from_event(event, transaction),
                    metric.clone(),
                    limits,
                );
                entry.add_service_transaction(
                    &svc_key,
                    ServiceTransactionAggregationKey {
                        transaction_type: transaction.r#type.clone(),
                    },
                    ServiceTransactionMetric {
                        count: metric.count,
                        success_count: metric.success_count,
                        failure_count: metric.failure_count,
                        histogram: metric.histogram,
                    },
                    limits,
                );
                for dss in &transaction.dropped_spans_stats {
                    entry.add_span(
                        &svc_key,
                        SpanAggregationKey::from_dropped_span_stats(dss),
                        SpanMetric {
                            count: dss.duration_count * weight,
                            sum_micros: dss.duration_sum_micros * weight,
                        },
                        limits,
                    );
                }
            }

            if let Some(span) = &event.span {
                if !span.destination_service_resource.is_empty()
                    || event.service.target.is_some()
                {
                    entry.add_span(
                        &svc_key,
                        SpanAggregationKey::from_span(event, span),
                        SpanMetric {
                            count: weight,
                            sum_micros: event.duration_micros as u64 * weight,
                        },
                        limits,
                    );
                }
            }
        }
    }
    result
}

/// Integer weight of a sampled event: its representative count rounded half
/// to even. Events carrying neither transaction nor span weigh 1.
fn representative_weight(event: &ApmEvent) -> u64 {
    let count = if let Some(transaction) = &event.transaction {
        transaction.representative_count
    } else if let Some(span) = &event.span {
        span.representative_count
    } else {
        1.0
    };
    if !count.is_finite() || count <= 0.0 {
        return 0;
    }
    count.round_ties_even() as u64
}

fn transaction_metric(event: &ApmEvent, weight: u64) -> TransactionMetric {
    let mut metric = TransactionMetric {
        count: weight,
        ..Default::default()
    };
    match event.outcome.as_str() {
        OUTCOME_SUCCESS => metric.success_count = weight,
        OUTCOME_FAILURE => metric.failure_count = weight,
        _ => {}
    }
    metric.histogram.record_duration(event.duration_micros, weight);
    metric
}

fn instance_metric(event: &ApmEvent, weight: u64) -> ServiceInstanceMetric {
    let mut metric = ServiceInstanceMetric {
        count: weight,
        ..Default::default()
    };
    for (name, label) in &event.labels {
        if label.global {
            metric.labels.insert(name.clone(), label.value.clone());
        }
    }
    for (name, label) in &event.numeric_labels {
        if label.global {
            metric.numeric_labels.insert(name.clone(), label.value);
        }
    }
    metric
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::Limits;
    use crate::event::{DroppedSpanStats, Service, Span, Transaction};
    use crate::keys::CombinedMetricsKey;

    fn test_config(intervals: Vec<Duration>, partitions: u16) -> Config {
        Config {
            data_dir: None,
            limits: Limits::default(),
            aggregation_intervals: intervals,
            harvest_delay: Duration::ZERO,
            partitions,
            processor: Arc::new(
                |_: &CombinedMetricsKey, _: CombinedMetrics, _: Duration| -> anyhow::Result<()> {
                    Ok(())
                },
            ),
            tenant_labels: None,
        }
    }

    fn transaction_event(service: &str, name: &str, representative_count: f64) -> ApmEvent {
        ApmEvent {
            duration_micros: 100_000,
            outcome: "success".to_owned(),
            service: Service {
                name: service.to_owned(),
                ..Default::default()
            },
            transaction: Some(Transaction {
                name: name.to_owned(),
                r#type: "request".to_owned(),
                representative_count,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_zero_weight_events_dropped() {
        let config = test_config(vec![Duration::from_secs(1)], 1);
        let batch = vec![
            transaction_event("svc", "txn", 0.0),
            transaction_event("svc", "txn", 1.0),
        ];
        let result = translate_batch(&batch, &config, 10_000_000_000);
        assert_eq!(result.dropped_zero_weight, 1);
        assert_eq!(result.events_accepted, 1);
        assert_eq!(result.entries.len(), 1);
    }

    #[test]
    fn test_negative_duration_dropped() {
        let config = test_config(vec![Duration::from_secs(1)], 1);
        let mut event = transaction_event("svc", "txn", 1.0);
        event.duration_micros = -1;
        let result = translate_batch(&[event], &config, 10_000_000_000);
        assert_eq!(result.dropped_negative_duration, 1);
        assert!(result.entries.is_empty());
    }

    #[test]
    fn test_weight_rounds_half_to_even() {
        let config = test_config(vec![Duration::from_secs(1)], 1);
        let result = translate_batch(
            &[transaction_event("svc", "txn", 2.5)],
            &config,
            10_000_000_000,
        );
        let cm = result.entries.values().next().unwrap();
        let svc = cm.services.values().next().unwrap();
        assert_eq!(svc.transaction_groups.values().next().unwrap().count, 2);

        let result = translate_batch(
            &[transaction_event("svc", "txn", 3.5)],
            &config,
            10_000_000_000,
        );
        let cm = result.entries.values().next().unwrap();
        let svc = cm.services.values().next().unwrap();
        assert_eq!(svc.transaction_groups.values().next().unwrap().count, 4);
    }

    #[test]
    fn test_every_interval_gets_a_fold() {
        let config = test_config(vec![Duration::from_secs(1), Duration::from_secs(60)], 1);
        let result = translate_batch(
            &[transaction_event("svc", "txn", 1.0)],
            &config,
            90_000_000_000,
        );
        assert_eq!(result.entries.len(), 2);
        let keys: Vec<_> = result.entries.keys().copied().collect();
        // Same event lands in both interval tags with independently
        // truncated processing times.
        assert_eq!(keys[0], (0, 90_000_000_000, 0));
        assert_eq!(keys[1], (1, 60_000_000_000, 0));
    }

    #[test]
    fn test_transaction_emits_service_transaction_and_dss_spans() {
        let config = test_config(vec![Duration::from_secs(1)], 1);
        let mut event = transaction_event("svc", "txn", 2.0);
        event
            .transaction
            .as_mut()
            .unwrap()
            .dropped_spans_stats
            .push(DroppedSpanStats {
                destination_service_resource: "postgres".to_owned(),
                outcome: "success".to_owned(),
                duration_count: 3,
                duration_sum_micros: 1500,
                ..Default::default()
            });
        let result = translate_batch(&[event], &config, 10_000_000_000);
        let cm = result.entries.values().next().unwrap();
        let svc = cm.services.values().next().unwrap();
        assert_eq!(svc.transaction_groups.len(), 1);
        assert_eq!(svc.service_transaction_groups.len(), 1);
        let (span_key, span_metric) = svc.span_groups.iter().next().unwrap();
        assert_eq!(span_key.span_name, "");
        assert_eq!(span_key.resource, "postgres");
        assert_eq!(span_metric.count, 6);
        assert_eq!(span_metric.sum_micros, 3000);
    }

    #[test]
    fn test_span_without_destination_or_target_not_aggregated() {
        let config = test_config(vec![Duration::from_secs(1)], 1);
        let event = ApmEvent {
            duration_micros: 1000,
            service: Service {
                name: "svc".to_owned(),
                ..Default::default()
            },
            span: Some(Span {
                name: "internal".to_owned(),
                representative_count: 1.0,
                destination_service_resource: String::new(),
            }),
            ..Default::default()
        };
        let result = translate_batch(&[event], &config, 10_000_000_000);
        let cm = result.entries.values().next().unwrap();
        let svc = cm.services.values().next().unwrap();
        assert!(svc.span_groups.is_empty());
        // The service summary contribution is still recorded.
        assert_eq!(svc.events_total, 1);
    }

    #[test]
    fn test_partitioning_keeps_service_entries_together() {
        let config = test_config(vec![Duration::from_secs(1)], 16);
        let mut batch = Vec::new();
        for i in 0..50 {
            batch.push(transaction_event(&format!("svc{i}"), "txn", 1.0));
            batch.push(transaction_event(&format!("svc{i}"), "other", 1.0));
        }
        let result = translate_batch(&batch, &config, 10_000_000_000);
        // Each service's groups must land in exactly one partition.
        for (_, cm) in &result.entries {
            for svc_key in cm.services.keys() {
                let expected = svc_key.partition(16);
                let count = result
                    .entries
                    .iter()
                    .filter(|((_, _, partition), entry)| {
                        entry.services.contains_key(svc_key) && *partition != expected
                    })
                    .count();
                assert_eq!(count, 0);
            }
        }
    }
}
