// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Expansion of harvested combined metrics into downstream metricset events.

use std::time::Duration;

use crate::event::{
    metricset, MetricsetEvent, SpanMetricset, SummaryMetric, TransactionMetricset,
    OVERFLOW_BUCKET_NAME,
};
use crate::keys::{format_interval, CombinedMetricsKey, ServiceAggregationKey};
use crate::model::{CombinedMetrics, ServiceMetrics, ServiceTransactionMetric, TransactionMetric};

/// Expand one combined-metrics value into metricset events: one
/// `service_summary` per service, one `transaction` per transaction group,
/// one `service_transaction` per service-transaction group, one
/// `service_destination` per span group, and the same shapes under `_other`
/// for overflow buckets.
pub fn combined_metrics_to_batch(
    key: &CombinedMetricsKey,
    metrics: &CombinedMetrics,
    interval: Duration,
) -> Vec<MetricsetEvent> {
    let interval_str = format_interval(interval);
    let mut out = Vec::new();

    for (svc_key, svc) in &metrics.services {
        expand_service(&mut out, svc_key, svc, &interval_str);
    }

    if metrics.overflow_services.events_total > 0
        || !metrics.overflow_services.overflow_transactions.is_empty()
        || !metrics
            .overflow_services
            .overflow_service_transactions
            .is_empty()
        || !metrics.overflow_services.overflow_spans.is_empty()
    {
        let overflow_key = ServiceAggregationKey {
            timestamp_unix_nanos: key.processing_time_unix_nanos,
            service_name: OVERFLOW_BUCKET_NAME.to_owned(),
            ..Default::default()
        };
        expand_service(&mut out, &overflow_key, &metrics.overflow_services, &interval_str);
    }

    out
}

fn expand_service(
    out: &mut Vec<MetricsetEvent>,
    svc_key: &ServiceAggregationKey,
    svc: &ServiceMetrics,
    interval_str: &str,
) {
    // Global labels anchor on the service instance; with several instances
    // in one bucket the first instance's labels are attached.
    let (labels, numeric_labels) = svc
        .service_instance_groups
        .values()
        .next()
        .map(|instance| (instance.labels.clone(), instance.numeric_labels.clone()))
        .unwrap_or_default();

    let base = MetricsetEvent {
        timestamp_unix_nanos: svc_key.timestamp_unix_nanos,
        interval: interval_str.to_owned(),
        service_name: svc_key.service_name.clone(),
        service_environment: svc_key.service_environment.clone(),
        service_language_name: svc_key.service_language_name.clone(),
        agent_name: svc_key.agent_name.clone(),
        labels,
        numeric_labels,
        ..Default::default()
    };

    out.push(MetricsetEvent {
        metricset_name: metricset::SERVICE_SUMMARY,
        ..base.clone()
    });

    for (txn_key, metric) in &svc.transaction_groups {
        out.push(MetricsetEvent {
            metricset_name: metricset::TRANSACTION,
            doc_count: metric.count,
            event_outcome: txn_key.event_outcome.clone(),
            success_count: Some(outcome_summary(
                metric.success_count,
                metric.failure_count,
            )),
            transaction: Some(transaction_metricset(
                txn_key.transaction_name.clone(),
                txn_key.transaction_type.clone(),
                txn_key.transaction_result.clone(),
                txn_key.trace_root,
                metric,
            )),
            ..base.clone()
        });
    }
    if !svc.overflow_transactions.is_empty() {
        let metric = &svc.overflow_transactions.metric;
        out.push(MetricsetEvent {
            metricset_name: metricset::TRANSACTION,
            doc_count: metric.count,
            success_count: Some(outcome_summary(
                metric.success_count,
                metric.failure_count,
            )),
            transaction: Some(transaction_metricset(
                OVERFLOW_BUCKET_NAME.to_owned(),
                String::new(),
                String::new(),
                false,
                metric,
            )),
            ..base.clone()
        });
    }

    for (stxn_key, metric) in &svc.service_transaction_groups {
        out.push(MetricsetEvent {
            metricset_name: metricset::SERVICE_TRANSACTION,
            doc_count: metric.count,
            success_count: Some(outcome_summary(
                metric.success_count,
                metric.failure_count,
            )),
            transaction: Some(service_transaction_metricset(
                stxn_key.transaction_type.clone(),
                metric,
            )),
            ..base.clone()
        });
    }
    if !svc.overflow_service_transactions.is_empty() {
        let metric = &svc.overflow_service_transactions.metric;
        out.push(MetricsetEvent {
            metricset_name: metricset::SERVICE_TRANSACTION,
            doc_count: metric.count,
            success_count: Some(outcome_summary(
                metric.success_count,
                metric.failure_count,
            )),
            transaction: Some(service_transaction_metricset(
                OVERFLOW_BUCKET_NAME.to_owned(),
                metric,
            )),
            ..base.clone()
        });
    }

    for (span_key, metric) in &svc.span_groups {
        out.push(MetricsetEvent {
            metricset_name: metricset::SERVICE_DESTINATION,
            doc_count: metric.count,
            event_outcome: span_key.outcome.clone(),
            service_target_type: span_key.target_type.clone(),
            service_target_name: span_key.target_name.clone(),
            span: Some(SpanMetricset {
                name: span_key.span_name.clone(),
                destination_service_resource: span_key.resource.clone(),
                response_count: metric.count,
                response_sum_micros: metric.sum_micros,
            }),
            ..base.clone()
        });
    }
    if !svc.overflow_spans.is_empty() {
        let metric = &svc.overflow_spans.metric;
        out.push(MetricsetEvent {
            metricset_name: metricset::SERVICE_DESTINATION,
            doc_count: metric.count,
            span: Some(SpanMetricset {
                name: OVERFLOW_BUCKET_NAME.to_owned(),
                destination_service_resource: OVERFLOW_BUCKET_NAME.to_owned(),
                response_count: metric.count,
                response_sum_micros: metric.sum_micros,
            }),
            ..base.clone()
        });
    }
}

/// Summary derived from a latency histogram: `count` is the sum of bucket
/// counts, `sum` the sum of representative value times count.
fn histogram_summary(histogram: &apm_hdrhistogram::HdrHistogram) -> SummaryMetric {
    SummaryMetric {
        count: histogram.total(),
        sum: histogram.weighted_sum(),
    }
}

fn outcome_summary(success_count: u64, failure_count: u64) -> SummaryMetric {
    SummaryMetric {
        count: success_count + failure_count,
        sum: success_count as f64,
    }
}

fn transaction_metricset(
    name: String,
    r#type: String,
    result: String,
    trace_root: bool,
    metric: &TransactionMetric,
) -> TransactionMetricset {
    let (counts, values) = metric.histogram.buckets();
    TransactionMetricset {
        name,
        r#type,
        result,
        trace_root,
        duration_summary: histogram_summary(&metric.histogram),
        duration_histogram_counts: counts,
        duration_histogram_values: values,
    }
}

fn service_transaction_metricset(
    r#type: String,
    metric: &ServiceTransactionMetric,
) -> TransactionMetricset {
    let (counts, values) = metric.histogram.buckets();
    TransactionMetricset {
        name: String::new(),
        r#type,
        result: String::new(),
        trace_root: false,
        duration_summary: histogram_summary(&metric.histogram),
        duration_histogram_counts: counts,
        duration_histogram_values: values,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Limits;
    use crate::keys::{SpanAggregationKey, TransactionAggregationKey};
    use crate::model::SpanMetric;

    fn harvest_key() -> CombinedMetricsKey {
        CombinedMetricsKey {
            interval: Duration::from_secs(1),
            processing_time_unix_nanos: 1_000_000_000,
            tenant_id: [1; 16],
            partition_id: 0,
        }
    }

    fn svc_key(name: &str) -> ServiceAggregationKey {
        ServiceAggregationKey {
            service_name: name.to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn test_single_transaction_expansion() {
        let limits = Limits::default();
        let mut cm = CombinedMetrics {
            events_total: 1,
            ..Default::default()
        };
        let mut metric = TransactionMetric {
            count: 1,
            success_count: 1,
            ..Default::default()
        };
        metric.histogram.record(100_000);
        cm.observe_service_events(&svc_key("svc"), 1, &limits);
        cm.add_transaction(
            &svc_key("svc"),
            TransactionAggregationKey {
                transaction_name: "foo".to_owned(),
                transaction_type: "txtype".to_owned(),
                trace_root: true,
                event_outcome: "success".to_owned(),
                ..Default::default()
            },
            metric.clone(),
            &limits,
        );
        cm.add_service_transaction(
            &svc_key("svc"),
            crate::keys::ServiceTransactionAggregationKey {
                transaction_type: "txtype".to_owned(),
            },
            ServiceTransactionMetric {
                count: 1,
                success_count: 1,
                histogram: metric.histogram,
                ..Default::default()
            },
            &limits,
        );

        let events = combined_metrics_to_batch(&harvest_key(), &cm, Duration::from_secs(1));
        assert_eq!(events.len(), 3);

        let summary = &events[0];
        assert_eq!(summary.metricset_name, "service_summary");
        assert_eq!(summary.interval, "1s");
        assert_eq!(summary.service_name, "svc");

        let txn = &events[1];
        assert_eq!(txn.metricset_name, "transaction");
        assert_eq!(txn.doc_count, 1);
        let metricset = txn.transaction.as_ref().unwrap();
        assert_eq!(metricset.name, "foo");
        assert!(metricset.trace_root);
        // 100ms lands in the bucket whose highest equivalent value is
        // 100351us; the summary is derived from the histogram.
        assert_eq!(metricset.duration_histogram_counts, vec![1]);
        assert_eq!(metricset.duration_histogram_values, vec![100_351.0]);
        assert_eq!(metricset.duration_summary.count, 1);
        assert_eq!(metricset.duration_summary.sum, 100_351.0);
        assert_eq!(
            txn.success_count,
            Some(SummaryMetric { count: 1, sum: 1.0 })
        );

        let stxn = &events[2];
        assert_eq!(stxn.metricset_name, "service_transaction");
        assert_eq!(stxn.transaction.as_ref().unwrap().r#type, "txtype");
        assert_eq!(
            stxn.transaction.as_ref().unwrap().duration_summary.sum,
            100_351.0
        );
    }

    #[test]
    fn test_span_group_expansion() {
        let limits = Limits::default();
        let mut cm = CombinedMetrics {
            events_total: 1,
            ..Default::default()
        };
        cm.observe_service_events(&svc_key("svc"), 1, &limits);
        cm.add_span(
            &svc_key("svc"),
            SpanAggregationKey {
                span_name: "svc:es".to_owned(),
                outcome: "success".to_owned(),
                target_type: "db".to_owned(),
                target_name: "es".to_owned(),
                resource: "elasticsearch".to_owned(),
            },
            SpanMetric {
                count: 3,
                sum_micros: 300_000,
            },
            &limits,
        );
        let events = combined_metrics_to_batch(&harvest_key(), &cm, Duration::from_secs(60));
        assert_eq!(events.len(), 2);
        let destination = &events[1];
        assert_eq!(destination.metricset_name, "service_destination");
        assert_eq!(destination.interval, "1m");
        assert_eq!(destination.doc_count, 3);
        assert_eq!(destination.service_target_type, "db");
        let span = destination.span.as_ref().unwrap();
        assert_eq!(span.destination_service_resource, "elasticsearch");
        assert_eq!(span.response_count, 3);
        assert_eq!(span.response_sum_micros, 300_000);
    }

    #[test]
    fn test_overflow_services_emitted_under_other() {
        let mut limits = Limits::default();
        limits.max_services = 1;
        let mut cm = CombinedMetrics {
            events_total: 3,
            ..Default::default()
        };
        let mut metric = TransactionMetric {
            count: 1,
            success_count: 1,
            ..Default::default()
        };
        metric.histogram.record(1000);
        for i in 0..3 {
            let key = svc_key(&format!("svc{i}"));
            cm.observe_service_events(&key, 1, &limits);
            cm.add_transaction(
                &key,
                TransactionAggregationKey {
                    transaction_name: format!("txn{i}"),
                    ..Default::default()
                },
                metric.clone(),
                &limits,
            );
        }
        let events = combined_metrics_to_batch(&harvest_key(), &cm, Duration::from_secs(1));
        let other_summary = events
            .iter()
            .find(|e| e.metricset_name == "service_summary" && e.service_name == "_other")
            .expect("overflow service summary");
        assert_eq!(other_summary.timestamp_unix_nanos, 1_000_000_000);
        let other_txn = events
            .iter()
            .find(|e| e.metricset_name == "transaction" && e.service_name == "_other")
            .expect("overflow transaction");
        assert_eq!(other_txn.doc_count, 2);
        assert_eq!(
            other_txn.transaction.as_ref().unwrap().name,
            OVERFLOW_BUCKET_NAME
        );
    }
}
