// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The aggregation engine: ingest, interval tickers and harvest.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::{AggregatorBuilder, Config};
use crate::error::AggregatorError;
use crate::event::ApmEvent;
use crate::ingest;
use crate::keys::{CombinedMetricsKey, TenantId};
use crate::merge::{decode_value, encode_value};
use crate::model::CombinedMetrics;
use crate::store::Store;
use crate::telemetry;

/// Return the duration between `t` and the unix epoch as nanoseconds, or 0
/// if `t` is before the epoch.
fn unix_now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos() as u64
}

/// Streaming aggregation engine for APM events.
///
/// Batches fold into per-interval combined metrics persisted with merge
/// semantics; `run` drives one harvest ticker per configured interval and
/// hands closed buckets to the configured processor. `aggregate_batch` is
/// safe for concurrent use and works with or without a running harvester;
/// `close` performs one final harvest for every interval.
#[derive(Clone)]
pub struct Aggregator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator").finish_non_exhaustive()
    }
}

struct Inner {
    config: Config,
    store: Store,
    stop: CancellationToken,
    running: AtomicBool,
    closed: AtomicBool,
    /// Serializes harvest cycles; close waits here for the in-flight
    /// harvest before its final pass.
    harvest_lock: tokio::sync::Mutex<()>,
    close_done: tokio::sync::Mutex<bool>,
}

impl Aggregator {
    pub fn builder() -> AggregatorBuilder {
        AggregatorBuilder::default()
    }

    pub(crate) fn open(config: Config) -> Result<Self, AggregatorError> {
        let store = Store::open(&config)?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                stop: CancellationToken::new(),
                running: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                harvest_lock: tokio::sync::Mutex::new(()),
                close_done: tokio::sync::Mutex::new(false),
            }),
        })
    }

    /// The configured intervals, sorted ascending.
    pub fn aggregation_intervals(&self) -> &[Duration] {
        &self.inner.config.aggregation_intervals
    }

    /// Fold a batch of events for the given tenant into every configured
    /// interval and persist the partial aggregates.
    ///
    /// Dropping the returned future before completion discards the
    /// in-memory fold; no partial store write is issued.
    pub async fn aggregate_batch(
        &self,
        tenant_id: TenantId,
        batch: &[ApmEvent],
    ) -> Result<(), AggregatorError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(AggregatorError::Closed);
        }

        let tenant_labels = telemetry::tenant_labels(&inner.config, &tenant_id);
        metrics::counter!(telemetry::REQUESTS_TOTAL, tenant_labels.as_slice()).increment(1);

        let now = unix_now_nanos();
        let result = ingest::translate_batch(batch, &inner.config, now);

        if result.dropped_zero_weight > 0 {
            let mut labels = tenant_labels.clone();
            labels.push((telemetry::DROP_REASON_LABEL.to_owned(), "zero_weight".to_owned()));
            metrics::counter!(telemetry::EVENTS_DROPPED, labels.as_slice())
                .increment(result.dropped_zero_weight);
        }
        if result.dropped_negative_duration > 0 {
            let mut labels = tenant_labels.clone();
            labels.push((
                telemetry::DROP_REASON_LABEL.to_owned(),
                "negative_duration".to_owned(),
            ));
            metrics::counter!(telemetry::EVENTS_DROPPED, labels.as_slice())
                .increment(result.dropped_negative_duration);
        }
        for &interval in &inner.config.aggregation_intervals {
            let labels = telemetry::interval_labels(&inner.config, &tenant_id, interval);
            metrics::counter!(telemetry::EVENTS_TOTAL, labels.as_slice())
                .increment(batch.len() as u64);
        }

        let mut bytes_written = 0u64;
        for ((tag, processing_time, partition), folded) in result.entries {
            let key = CombinedMetricsKey {
                interval: inner.config.aggregation_intervals[tag as usize],
                processing_time_unix_nanos: processing_time,
                tenant_id,
                partition_id: partition,
            };
            let encoded_key = key.encode(tag);
            let value = encode_value(&folded)?;
            bytes_written += value.len() as u64;
            inner.store.write(&encoded_key, value)?;
        }
        if bytes_written > 0 {
            metrics::counter!(telemetry::BYTES_INGESTED, tenant_labels.as_slice())
                .increment(bytes_written);
        }
        Ok(())
    }

    /// Ingest an already-aggregated payload at the given key, as forwarded
    /// from an upstream shard.
    pub async fn aggregate_combined_metrics(
        &self,
        key: CombinedMetricsKey,
        combined_metrics: CombinedMetrics,
    ) -> Result<(), AggregatorError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(AggregatorError::Closed);
        }
        let tag = inner
            .config
            .aggregation_intervals
            .iter()
            .position(|ivl| *ivl == key.interval)
            .ok_or_else(|| {
                AggregatorError::InvalidConfig(format!(
                    "interval {:?} is not configured",
                    key.interval
                ))
            })? as u16;
        if key.partition_id >= inner.config.partitions {
            return Err(AggregatorError::InvalidConfig(format!(
                "partition {} out of range",
                key.partition_id
            )));
        }
        let encoded_key = key.encode(tag);
        let value = encode_value(&combined_metrics)?;
        let tenant_labels = telemetry::tenant_labels(&inner.config, &key.tenant_id);
        metrics::counter!(telemetry::BYTES_INGESTED, tenant_labels.as_slice())
            .increment(value.len() as u64);
        inner.store.write(&encoded_key, value)?;
        Ok(())
    }

    /// Run the harvest scheduler: one ticker task per configured interval
    /// plus this supervisor. Returns when `close` is called, or with the
    /// first fatal storage error. Once this call has returned, `run` may be
    /// called again to restart the scheduler; only a concurrent second call
    /// is rejected.
    pub async fn run(&self) -> Result<(), AggregatorError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(AggregatorError::Closed);
        }
        if inner.running.swap(true, Ordering::SeqCst) {
            return Err(AggregatorError::AlreadyRunning);
        }
        // Clears the running flag on every exit path, including this future
        // being dropped, so a later non-concurrent run can restart the
        // scheduler after a fatal error.
        let _running = RunningGuard(&inner.running);

        let mut tasks: JoinSet<Result<(), AggregatorError>> = JoinSet::new();
        for (tag, &interval) in inner.config.aggregation_intervals.iter().enumerate() {
            let inner = Arc::clone(inner);
            tasks.spawn(async move { interval_loop(inner, tag as u16, interval).await });
        }

        let mut result = Ok(());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(%err, "harvest ticker failed; shutting down scheduler");
                    if result.is_ok() {
                        result = Err(err);
                    }
                    inner.stop.cancel();
                }
                Err(join_err) => {
                    error!(%join_err, "harvest ticker panicked");
                    inner.stop.cancel();
                }
            }
        }
        result
    }

    /// Stop the scheduler, wait for any in-flight harvest, run one final
    /// harvest for every interval and flush the store. Idempotent; safe to
    /// call concurrently.
    pub async fn close(&self) -> Result<(), AggregatorError> {
        let inner = &self.inner;
        inner.closed.store(true, Ordering::SeqCst);
        let mut done = inner.close_done.lock().await;
        if *done {
            return Ok(());
        }
        inner.stop.cancel();

        let mut result = Ok(());
        for (tag, &interval) in inner.config.aggregation_intervals.iter().enumerate() {
            if let Err(err) = inner.harvest(tag as u16, interval, u64::MAX).await {
                error!(%err, "final harvest failed");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        if let Err(err) = inner.store.flush() {
            if result.is_ok() {
                result = Err(err);
            }
        }
        *done = true;
        result
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Ticker loop for one interval: each tick closes the buckets whose grace
/// period has elapsed. Only storage failures terminate the loop.
async fn interval_loop(
    inner: Arc<Inner>,
    tag: u16,
    interval: Duration,
) -> Result<(), AggregatorError> {
    let start = tokio::time::Instant::now() + delay_to_next_boundary(interval);
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.stop.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        let cutoff = unix_now_nanos()
            .saturating_sub((interval + inner.config.harvest_delay).as_nanos() as u64);
        match inner.harvest(tag, interval, cutoff).await {
            Ok(()) => {}
            Err(err @ AggregatorError::Storage { .. }) => return Err(err),
            Err(err) => warn!(%err, "harvest cycle completed with errors"),
        }
    }
}

/// Time until the next wall-clock boundary of `interval`.
fn delay_to_next_boundary(interval: Duration) -> Duration {
    let interval_nanos = interval.as_nanos() as u64;
    Duration::from_nanos(interval_nanos - unix_now_nanos() % interval_nanos)
}

impl Inner {
    /// Harvest every bucket of `tag` with processing time at or below
    /// `cutoff`: scan in key order, hand each decoded value to the
    /// processor, then delete the scanned range. Processor failures are
    /// logged and counted; the first one is returned after the cycle
    /// completes.
    async fn harvest(
        &self,
        tag: u16,
        interval: Duration,
        cutoff: u64,
    ) -> Result<(), AggregatorError> {
        let _guard = self.harvest_lock.lock().await;
        let (lo, hi) = Store::harvest_bounds(tag, cutoff);
        let mut first_error: Option<AggregatorError> = None;
        let mut harvested = 0u64;

        for row in self.store.scan(&lo, &hi) {
            let (key_bytes, value_bytes) =
                row.map_err(|err| AggregatorError::storage(&lo, err))?;
            let key = match CombinedMetricsKey::decode(&key_bytes, &self.config.aggregation_intervals)
            {
                Ok(key) => key,
                Err(err) => {
                    error!(%err, "skipping row with undecodable key");
                    first_error.get_or_insert(err);
                    continue;
                }
            };
            let combined_metrics =
                match decode_value(&key_bytes, &value_bytes, &self.config.limits) {
                    Ok(value) => value,
                    Err(err) => {
                        error!(%err, "skipping row with undecodable value");
                        first_error.get_or_insert(err);
                        continue;
                    }
                };

            let labels = telemetry::interval_labels(&self.config, &key.tenant_id, interval);
            metrics::counter!(telemetry::EVENTS_PROCESSED, labels.as_slice())
                .increment(combined_metrics.events_total);
            let now = unix_now_nanos();
            metrics::histogram!(telemetry::PROCESSING_DELAY, labels.as_slice()).record(
                Duration::from_nanos(now.saturating_sub(key.processing_time_unix_nanos))
                    .as_secs_f64(),
            );
            if combined_metrics.youngest_event_unix_nanos > 0 {
                metrics::histogram!(telemetry::QUEUED_DELAY, labels.as_slice()).record(
                    Duration::from_nanos(
                        now.saturating_sub(combined_metrics.youngest_event_unix_nanos),
                    )
                    .as_secs_f64(),
                );
            }

            if let Err(err) = self.config.processor.process(&key, combined_metrics, interval) {
                warn!(%err, "downstream processor failed; continuing harvest");
                let mut labels = telemetry::tenant_labels(&self.config, &key.tenant_id);
                labels.push((telemetry::DROP_REASON_LABEL.to_owned(), "processor".to_owned()));
                metrics::counter!(telemetry::EVENTS_DROPPED, labels.as_slice()).increment(1);
                first_error.get_or_insert(AggregatorError::Processor(err));
            }
            harvested += 1;
        }

        let deleted = self.store.delete_range(&lo, &hi)?;
        debug!(tag, harvested, deleted, "harvest cycle finished");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_aggregator() -> Aggregator {
        let mut builder = Aggregator::builder();
        builder
            .set_aggregation_intervals(vec![Duration::from_secs(1)])
            .build()
            .unwrap()
    }

    fn transaction_batch() -> Vec<ApmEvent> {
        use crate::event::{Service, Transaction};
        vec![ApmEvent {
            duration_micros: 1000,
            outcome: "success".to_owned(),
            service: Service {
                name: "svc".to_owned(),
                ..Default::default()
            },
            transaction: Some(Transaction {
                name: "txn".to_owned(),
                r#type: "request".to_owned(),
                representative_count: 1.0,
                ..Default::default()
            }),
            ..Default::default()
        }]
    }

    #[tokio::test]
    async fn test_aggregate_after_close_rejected() {
        let agg = test_aggregator();
        agg.close().await.unwrap();
        let err = agg.aggregate_batch([0; 16], &transaction_batch()).await.unwrap_err();
        assert!(matches!(err, AggregatorError::Closed));
    }

    #[tokio::test]
    async fn test_run_after_close_rejected() {
        let agg = test_aggregator();
        agg.close().await.unwrap();
        assert!(matches!(agg.run().await, Err(AggregatorError::Closed)));
    }

    #[tokio::test]
    async fn test_second_run_rejected() {
        let agg = test_aggregator();
        let runner = agg.clone();
        let handle = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            agg.run().await,
            Err(AggregatorError::AlreadyRunning)
        ));
        agg.close().await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_can_restart_after_previous_run_ended() {
        let agg = test_aggregator();
        let runner = agg.clone();
        let handle = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        // The first run ends without close, as it would on a fatal storage
        // error.
        handle.abort();
        let _ = handle.await;

        // A sequential retry restarts the scheduler instead of reporting a
        // phantom AlreadyRunning; a genuinely concurrent call is still
        // rejected.
        let runner = agg.clone();
        let handle = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            agg.run().await,
            Err(AggregatorError::AlreadyRunning)
        ));
        agg.close().await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_close_idempotent() {
        let agg = test_aggregator();
        agg.aggregate_batch([1; 16], &transaction_batch()).await.unwrap();
        let (left, right) = tokio::join!(agg.close(), agg.close());
        assert!(left.is_ok());
        assert!(right.is_ok());
    }

    #[tokio::test]
    async fn test_aggregate_combined_metrics_validates_interval() {
        let agg = test_aggregator();
        let err = agg
            .aggregate_combined_metrics(
                CombinedMetricsKey {
                    interval: Duration::from_secs(7),
                    processing_time_unix_nanos: 0,
                    tenant_id: [0; 16],
                    partition_id: 0,
                },
                CombinedMetrics::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AggregatorError::InvalidConfig(_)));
    }
}
