// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Aggregator configuration and its builder.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::AggregatorError;
use crate::keys::{CombinedMetricsKey, TenantId};
use crate::model::CombinedMetrics;

/// Cardinality caps enforced by the limiter. When a cap is reached, further
/// groups are folded into overflow buckets; overflow is a normal data path,
/// never an error.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    pub max_services: usize,
    pub max_transaction_groups: usize,
    pub max_transaction_groups_per_service: usize,
    pub max_service_transaction_groups: usize,
    pub max_service_transaction_groups_per_service: usize,
    pub max_span_groups: usize,
    pub max_span_groups_per_service: usize,
    pub max_service_instance_groups_per_service: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_services: 10_000,
            max_transaction_groups: 100_000,
            max_transaction_groups_per_service: 10_000,
            max_service_transaction_groups: 100_000,
            max_service_transaction_groups_per_service: 10_000,
            max_span_groups: 100_000,
            max_span_groups_per_service: 10_000,
            max_service_instance_groups_per_service: 10_000,
        }
    }
}

/// Downstream consumer of harvested combined metrics.
///
/// Invoked synchronously once per harvested key, in store byte order. The
/// callback owns expansion to output events, typically through
/// [`crate::output::combined_metrics_to_batch`].
pub trait Processor: Send + Sync {
    fn process(
        &self,
        key: &CombinedMetricsKey,
        metrics: CombinedMetrics,
        interval: Duration,
    ) -> anyhow::Result<()>;
}

impl<F> Processor for F
where
    F: Fn(&CombinedMetricsKey, CombinedMetrics, Duration) -> anyhow::Result<()> + Send + Sync,
{
    fn process(
        &self,
        key: &CombinedMetricsKey,
        metrics: CombinedMetrics,
        interval: Duration,
    ) -> anyhow::Result<()> {
        self(key, metrics, interval)
    }
}

/// Maps a tenant id to telemetry label pairs attached to all metrics emitted
/// for that tenant.
pub type TenantLabels = Arc<dyn Fn(&TenantId) -> Vec<(String, String)> + Send + Sync>;

#[derive(Clone)]
pub(crate) struct Config {
    pub data_dir: Option<PathBuf>,
    pub limits: Limits,
    /// Sorted ascending; the interval tag is the index into this list.
    pub aggregation_intervals: Vec<Duration>,
    pub harvest_delay: Duration,
    pub partitions: u16,
    pub processor: Arc<dyn Processor>,
    pub tenant_labels: Option<TenantLabels>,
}

/// Builds an [`crate::Aggregator`].
///
/// ```no_run
/// use apm_aggregator::AggregatorBuilder;
/// use std::time::Duration;
///
/// let aggregator = AggregatorBuilder::default()
///     .set_data_dir("/var/lib/aggregator")
///     .set_aggregation_intervals(vec![Duration::from_secs(60)])
///     .build()
///     .unwrap();
/// ```
#[derive(Default)]
pub struct AggregatorBuilder {
    data_dir: Option<PathBuf>,
    limits: Option<Limits>,
    aggregation_intervals: Option<Vec<Duration>>,
    harvest_delay: Option<Duration>,
    partitions: Option<u16>,
    processor: Option<Arc<dyn Processor>>,
    tenant_labels: Option<TenantLabels>,
}

impl AggregatorBuilder {
    /// Set the storage directory. Without one the store is ephemeral and
    /// lives only as long as the aggregator.
    pub fn set_data_dir(&mut self, data_dir: impl Into<PathBuf>) -> &mut Self {
        self.data_dir = Some(data_dir.into());
        self
    }

    /// Set the cardinality caps.
    pub fn set_limits(&mut self, limits: Limits) -> &mut Self {
        self.limits = Some(limits);
        self
    }

    /// Set the aggregation intervals. The list is sorted ascending; interval
    /// tags in stored keys are indices into the sorted list, so changing the
    /// set between restarts invalidates persisted data.
    pub fn set_aggregation_intervals(&mut self, intervals: Vec<Duration>) -> &mut Self {
        self.aggregation_intervals = Some(intervals);
        self
    }

    /// Grace period past an interval boundary before its bucket is
    /// harvested, applied per interval.
    pub fn set_harvest_delay(&mut self, delay: Duration) -> &mut Self {
        self.harvest_delay = Some(delay);
        self
    }

    /// Number of partitions each tenant's data is sharded over.
    pub fn set_partitions(&mut self, partitions: u16) -> &mut Self {
        self.partitions = Some(partitions);
        self
    }

    /// Set the downstream processor invoked at harvest.
    pub fn set_processor(&mut self, processor: impl Processor + 'static) -> &mut Self {
        self.processor = Some(Arc::new(processor));
        self
    }

    /// Set the tenant-id-to-telemetry-labels hook.
    pub fn set_tenant_labels(&mut self, tenant_labels: TenantLabels) -> &mut Self {
        self.tenant_labels = Some(tenant_labels);
        self
    }

    /// Validate the configuration and open the aggregator.
    pub fn build(&mut self) -> Result<crate::Aggregator, AggregatorError> {
        let mut intervals = self
            .aggregation_intervals
            .take()
            .unwrap_or_else(|| vec![Duration::from_secs(60)]);
        if intervals.is_empty() {
            return Err(AggregatorError::InvalidConfig(
                "at least one aggregation interval is required".to_owned(),
            ));
        }
        intervals.sort();
        intervals.dedup();
        if intervals.iter().any(|ivl| ivl.is_zero()) {
            return Err(AggregatorError::InvalidConfig(
                "aggregation intervals must be non-zero".to_owned(),
            ));
        }
        if intervals.len() > usize::from(u16::MAX) {
            return Err(AggregatorError::InvalidConfig(
                "too many aggregation intervals".to_owned(),
            ));
        }
        let partitions = self.partitions.take().unwrap_or(1);
        if partitions == 0 {
            return Err(AggregatorError::InvalidConfig(
                "partitions must be at least 1".to_owned(),
            ));
        }
        let config = Config {
            data_dir: self.data_dir.take(),
            limits: self.limits.take().unwrap_or_default(),
            aggregation_intervals: intervals,
            harvest_delay: self.harvest_delay.take().unwrap_or(Duration::ZERO),
            partitions,
            processor: self
                .processor
                .take()
                .unwrap_or_else(|| Arc::new(NoopProcessor)),
            tenant_labels: self.tenant_labels.take(),
        };
        crate::Aggregator::open(config)
    }
}

struct NoopProcessor;

impl Processor for NoopProcessor {
    fn process(
        &self,
        _key: &CombinedMetricsKey,
        _metrics: CombinedMetrics,
        _interval: Duration,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
