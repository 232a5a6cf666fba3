// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming aggregation of APM events into combined metrics.
//!
//! The engine ingests batches of transactions and spans and produces, per
//! tumbling aggregation interval, a compact set of combined metrics:
//! per-service summaries, per-transaction latency histograms,
//! per-service-transaction roll-ups and per-destination span metrics.
//! Cardinality is bounded by configurable caps with deterministic overflow
//! into `_other` buckets. Partial aggregates persist across restarts in an
//! ordered key/value store and finished intervals are handed to a downstream
//! processor at harvest time.
//!
//! ```no_run
//! use std::time::Duration;
//! use apm_aggregator::{output, Aggregator};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let aggregator = Aggregator::builder()
//!     .set_aggregation_intervals(vec![Duration::from_secs(60)])
//!     .set_processor(|key: &apm_aggregator::CombinedMetricsKey,
//!                     metrics: apm_aggregator::CombinedMetrics,
//!                     interval: Duration| -> anyhow::Result<()> {
//!         for event in output::combined_metrics_to_batch(key, &metrics, interval) {
//!             println!("{} {}", event.metricset_name, event.service_name);
//!         }
//!         Ok(())
//!     })
//!     .build()?;
//!
//! let runner = aggregator.clone();
//! tokio::spawn(async move { runner.run().await });
//! aggregator.aggregate_batch([0u8; 16], &[]).await?;
//! aggregator.close().await?;
//! # Ok(())
//! # }
//! ```

mod aggregator;
mod config;
mod error;
mod ingest;
mod merge;
mod store;

pub mod event;
pub mod keys;
pub mod model;
pub mod output;
pub mod telemetry;

pub use aggregator::Aggregator;
pub use config::{AggregatorBuilder, Limits, Processor, TenantLabels};
pub use error::AggregatorError;
pub use event::{ApmEvent, Batch, MetricsetEvent};
pub use keys::{CombinedMetricsKey, TenantId};
pub use model::CombinedMetrics;
