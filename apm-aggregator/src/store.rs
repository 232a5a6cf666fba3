// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Persistence of partial aggregates over an ordered key/value store.
//!
//! Writes go through the store's merge operator so concurrent writers append
//! without read-modify-write. Harvest range-scans one interval up to a
//! processing-time cutoff and deletes the scanned range afterwards. Crash
//! recovery is implicit: partial aggregates left in the store fold on the
//! next merge or read.

use crate::config::Config;
use crate::error::AggregatorError;
use crate::merge;

const TREE_NAME: &str = "combined_metrics";

pub(crate) struct Store {
    db: sled::Db,
    tree: sled::Tree,
}

impl Store {
    /// Open the store under the configured directory, or an ephemeral store
    /// when no directory is configured, and install the merge operator.
    pub(crate) fn open(config: &Config) -> Result<Self, AggregatorError> {
        let sled_config = match &config.data_dir {
            Some(dir) => sled::Config::new().path(dir),
            None => sled::Config::new().temporary(true),
        };
        let db = sled_config
            .open()
            .map_err(|err| AggregatorError::storage(b"(open)", err))?;
        let tree = db
            .open_tree(TREE_NAME)
            .map_err(|err| AggregatorError::storage(b"(open)", err))?;
        tree.set_merge_operator(merge::merge_operator(config.limits));
        Ok(Self { db, tree })
    }

    /// Merge one encoded combined-metrics frame into the given key.
    pub(crate) fn write(&self, key: &[u8], value: Vec<u8>) -> Result<(), AggregatorError> {
        self.tree
            .merge(key, value)
            .map_err(|err| AggregatorError::storage(key, err))?;
        Ok(())
    }

    /// Half-open key range covering every row of `interval_tag` with
    /// processing time at or below `cutoff_unix_nanos`.
    pub(crate) fn harvest_bounds(interval_tag: u16, cutoff_unix_nanos: u64) -> (Vec<u8>, Vec<u8>) {
        let mut lo = Vec::with_capacity(10);
        lo.extend_from_slice(&interval_tag.to_be_bytes());
        lo.extend_from_slice(&0u64.to_be_bytes());
        let mut hi = Vec::with_capacity(10);
        if cutoff_unix_nanos == u64::MAX {
            hi.extend_from_slice(&(interval_tag + 1).to_be_bytes());
            hi.extend_from_slice(&0u64.to_be_bytes());
        } else {
            hi.extend_from_slice(&interval_tag.to_be_bytes());
            hi.extend_from_slice(&(cutoff_unix_nanos + 1).to_be_bytes());
        }
        (lo, hi)
    }

    /// Iterate `[lo, hi)` in key order.
    pub(crate) fn scan(&self, lo: &[u8], hi: &[u8]) -> sled::Iter {
        self.tree.range(lo..hi)
    }

    /// Remove every key in `[lo, hi)` after a successful harvest.
    pub(crate) fn delete_range(&self, lo: &[u8], hi: &[u8]) -> Result<u64, AggregatorError> {
        let mut deleted = 0;
        for entry in self.tree.range(lo..hi) {
            let (key, _) = entry.map_err(|err| AggregatorError::storage(lo, err))?;
            self.tree
                .remove(&key)
                .map_err(|err| AggregatorError::storage(&key, err))?;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Flush buffered writes to disk.
    pub(crate) fn flush(&self) -> Result<(), AggregatorError> {
        self.db
            .flush()
            .map_err(|err| AggregatorError::storage(b"(flush)", err))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::Limits;
    use crate::keys::{CombinedMetricsKey, ServiceAggregationKey};
    use crate::merge::{decode_value, encode_value};
    use crate::model::CombinedMetrics;

    fn test_store() -> Store {
        let config = Config {
            data_dir: None,
            limits: Limits::default(),
            aggregation_intervals: vec![Duration::from_secs(1)],
            harvest_delay: Duration::ZERO,
            partitions: 1,
            processor: Arc::new(
                |_: &CombinedMetricsKey, _: CombinedMetrics, _: Duration| -> anyhow::Result<()> {
                    Ok(())
                },
            ),
            tenant_labels: None,
        };
        Store::open(&config).unwrap()
    }

    fn sample(count: u64) -> CombinedMetrics {
        let limits = Limits::default();
        let mut cm = CombinedMetrics {
            events_total: count,
            ..Default::default()
        };
        cm.observe_service_events(
            &ServiceAggregationKey {
                service_name: "svc".to_owned(),
                ..Default::default()
            },
            count,
            &limits,
        );
        cm
    }

    fn encoded_key(processing_time_unix_nanos: u64) -> [u8; crate::keys::ENCODED_KEY_SIZE] {
        CombinedMetricsKey {
            interval: Duration::from_secs(1),
            processing_time_unix_nanos,
            tenant_id: [1; 16],
            partition_id: 0,
        }
        .encode(0)
    }

    #[test]
    fn test_merge_writes_fold() {
        let store = test_store();
        let key = encoded_key(1_000_000_000);
        store.write(&key, encode_value(&sample(2)).unwrap()).unwrap();
        store.write(&key, encode_value(&sample(3)).unwrap()).unwrap();

        let (lo, hi) = Store::harvest_bounds(0, u64::MAX);
        let rows: Vec<_> = store.scan(&lo, &hi).collect();
        assert_eq!(rows.len(), 1);
        let (_, value) = rows[0].as_ref().unwrap();
        let decoded = decode_value(&key, value, &Limits::default()).unwrap();
        assert_eq!(decoded.events_total, 5);
    }

    #[test]
    fn test_harvest_bounds_respect_cutoff() {
        let store = test_store();
        for seconds in 1..=5u64 {
            let key = encoded_key(seconds * 1_000_000_000);
            store.write(&key, encode_value(&sample(1)).unwrap()).unwrap();
        }
        let (lo, hi) = Store::harvest_bounds(0, 3_000_000_000);
        assert_eq!(store.scan(&lo, &hi).count(), 3);
    }

    #[test]
    fn test_delete_range_removes_harvested_rows() {
        let store = test_store();
        for seconds in 1..=5u64 {
            let key = encoded_key(seconds * 1_000_000_000);
            store.write(&key, encode_value(&sample(1)).unwrap()).unwrap();
        }
        let (lo, hi) = Store::harvest_bounds(0, 3_000_000_000);
        assert_eq!(store.delete_range(&lo, &hi).unwrap(), 3);

        let (all_lo, all_hi) = Store::harvest_bounds(0, u64::MAX);
        assert_eq!(store.scan(&all_lo, &all_hi).count(), 2);
    }
}
