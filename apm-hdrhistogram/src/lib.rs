// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A compact HDR histogram tuned for microsecond latency distributions.
//!
//! The histogram covers the fixed range of 1 microsecond to one hour with two
//! significant figures of precision, which bounds the relative error of any
//! recorded value to 1%. Counts are held sparsely, keyed by bucket index, so
//! an aggregate with a handful of distinct latencies serializes to a handful
//! of `(index, count)` pairs. Merging two histograms is bucket-wise addition
//! and never loses precision.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Smallest value the histogram can distinguish, in microseconds.
pub const LOWEST_DISCERNIBLE_VALUE: u64 = 1;
/// Largest value the histogram can track, in microseconds (one hour).
pub const HIGHEST_TRACKABLE_VALUE: u64 = 3_600_000_000;

// Derived layout constants for 2 significant figures over the range above.
// With a sub-bucket count of 256 the histogram needs 25 buckets and 3328
// count slots in the equivalent dense representation.
const SUB_BUCKET_HALF_COUNT_MAGNITUDE: u32 = 7;
const SUB_BUCKET_HALF_COUNT: u32 = 1 << SUB_BUCKET_HALF_COUNT_MAGNITUDE;
const SUB_BUCKET_COUNT: u32 = SUB_BUCKET_HALF_COUNT * 2;
const SUB_BUCKET_MASK: u64 = (SUB_BUCKET_COUNT - 1) as u64;
const UNIT_MAGNITUDE: u32 = 0;

/// Number of count slots in the equivalent dense layout.
pub const COUNTS_LEN: u32 = 3328;

/// Sparse fixed-range HDR histogram with additive merge.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HdrHistogram {
    counts: BTreeMap<u32, u64>,
    total: u64,
}

impl HdrHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a single observation of `value` microseconds.
    pub fn record(&mut self, value: u64) {
        self.record_n(value, 1);
    }

    /// Record `count` observations of `value` microseconds.
    ///
    /// Values below the discernible minimum are recorded as 1; values above
    /// the trackable maximum saturate into the top bucket.
    pub fn record_n(&mut self, value: u64, count: u64) {
        if count == 0 {
            return;
        }
        let value = value.clamp(LOWEST_DISCERNIBLE_VALUE, HIGHEST_TRACKABLE_VALUE);
        let index = counts_index_for(value);
        let slot = self.counts.entry(index).or_insert(0);
        *slot = slot.saturating_add(count);
        self.total = self.total.saturating_add(count);
    }

    /// Record `count` observations of a signed microsecond duration.
    ///
    /// Returns false without recording when the duration is negative.
    pub fn record_duration(&mut self, micros: i64, count: u64) -> bool {
        if micros < 0 {
            return false;
        }
        self.record_n(micros as u64, count);
        true
    }

    /// Add all of `other`'s bucket counts into this histogram.
    pub fn merge(&mut self, other: &Self) {
        for (&index, &count) in &other.counts {
            let slot = self.counts.entry(index).or_insert(0);
            *slot = slot.saturating_add(count);
        }
        self.total = self.total.saturating_add(other.total);
    }

    /// Total number of recorded observations.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Non-zero buckets as parallel `(counts, values)` slices in ascending
    /// bucket order. `values[i]` is the highest value equivalent to the
    /// bucket, so a recorded 100ms (100000us) reports as 100351us.
    pub fn buckets(&self) -> (Vec<u64>, Vec<f64>) {
        let mut counts = Vec::with_capacity(self.counts.len());
        let mut values = Vec::with_capacity(self.counts.len());
        for (&index, &count) in &self.counts {
            counts.push(count);
            values.push(highest_equivalent_value(index) as f64);
        }
        (counts, values)
    }

    /// Sum of `value * count` over all buckets, using each bucket's
    /// representative value.
    pub fn weighted_sum(&self) -> f64 {
        self.counts
            .iter()
            .map(|(&index, &count)| highest_equivalent_value(index) as f64 * count as f64)
            .sum()
    }
}

#[inline]
fn bucket_index(value: u64) -> u32 {
    let pow2_ceiling = 64 - (value | SUB_BUCKET_MASK).leading_zeros();
    pow2_ceiling - UNIT_MAGNITUDE - (SUB_BUCKET_HALF_COUNT_MAGNITUDE + 1)
}

#[inline]
fn counts_index_for(value: u64) -> u32 {
    let bucket = bucket_index(value);
    let sub_bucket = (value >> (bucket + UNIT_MAGNITUDE)) as u32;
    ((bucket + 1) << SUB_BUCKET_HALF_COUNT_MAGNITUDE) + (sub_bucket - SUB_BUCKET_HALF_COUNT)
}

#[inline]
fn highest_equivalent_value(index: u32) -> u64 {
    let mut bucket = (index >> SUB_BUCKET_HALF_COUNT_MAGNITUDE) as i32 - 1;
    let mut sub_bucket = (index & (SUB_BUCKET_HALF_COUNT - 1)) + SUB_BUCKET_HALF_COUNT;
    if bucket < 0 {
        sub_bucket -= SUB_BUCKET_HALF_COUNT;
        bucket = 0;
    }
    let shift = bucket as u32 + UNIT_MAGNITUDE;
    let lowest = (sub_bucket as u64) << shift;
    lowest + (1u64 << shift) - 1
}

#[cfg(test)]
mod tests {
    use rand::{thread_rng, Rng};

    use super::*;

    #[test]
    fn test_record_and_buckets() {
        let mut h = HdrHistogram::new();
        h.record_n(100_000, 3);
        let (counts, values) = h.buckets();
        assert_eq!(counts, vec![3]);
        assert_eq!(values, vec![100_351.0]);
        assert_eq!(h.total(), 3);
    }

    #[test]
    fn test_sub_microsecond_recorded_as_one() {
        let mut h = HdrHistogram::new();
        h.record(0);
        let (counts, values) = h.buckets();
        assert_eq!(counts, vec![1]);
        assert_eq!(values, vec![1.0]);
    }

    #[test]
    fn test_negative_duration_rejected() {
        let mut h = HdrHistogram::new();
        assert!(!h.record_duration(-1, 1));
        assert!(h.is_empty());
        assert!(h.record_duration(250, 2));
        assert_eq!(h.total(), 2);
    }

    #[test]
    fn test_overrange_saturates() {
        let mut h = HdrHistogram::new();
        h.record(u64::MAX);
        let (_, values) = h.buckets();
        assert_eq!(values.len(), 1);
        assert!(values[0] >= HIGHEST_TRACKABLE_VALUE as f64);
    }

    #[test]
    fn test_merge_is_additive() {
        let mut a = HdrHistogram::new();
        let mut b = HdrHistogram::new();
        a.record_n(100, 2);
        a.record_n(10_000, 1);
        b.record_n(100, 5);
        b.record_n(5_000_000, 1);
        a.merge(&b);
        assert_eq!(a.total(), 9);

        let mut c = HdrHistogram::new();
        c.record_n(100, 7);
        c.record_n(10_000, 1);
        c.record_n(5_000_000, 1);
        assert_eq!(a, c);
    }

    #[test]
    fn test_relative_error_within_one_percent() {
        let mut rng = thread_rng();
        for _ in 0..1000 {
            let value = rng.gen_range(LOWEST_DISCERNIBLE_VALUE..HIGHEST_TRACKABLE_VALUE);
            let mut h = HdrHistogram::new();
            h.record(value);
            let (_, values) = h.buckets();
            let err = (values[0] - value as f64).abs() / value as f64;
            assert!(err <= 0.01, "value {value} reported as {} (err {err})", values[0]);
        }
    }

    #[test]
    fn test_indices_monotonic_in_value() {
        let mut prev = 0;
        for magnitude in 0..10 {
            let value = 10u64.pow(magnitude);
            let index = counts_index_for(value);
            assert!(index >= prev);
            assert!(index < COUNTS_LEN);
            prev = index;
        }
        assert_eq!(counts_index_for(HIGHEST_TRACKABLE_VALUE), 3286);
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut h = HdrHistogram::new();
        h.record_n(1, 10);
        h.record_n(100_000, 2);
        h.record_n(3_599_999_999, 1);
        let bytes = rmp_serde::to_vec(&h).unwrap();
        let decoded: HdrHistogram = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(h, decoded);
    }
}
