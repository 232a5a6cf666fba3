// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types surfaced by the aggregator.

use thiserror::Error;

/// Errors returned by [`crate::Aggregator`] operations.
#[derive(Debug, Error)]
pub enum AggregatorError {
    /// The aggregator has been closed; no further operations are accepted.
    #[error("aggregator is closed")]
    Closed,

    /// A second concurrent call to `run` was attempted.
    #[error("aggregator is already running")]
    AlreadyRunning,

    /// The underlying key/value store failed. The key is carried for
    /// diagnostics.
    #[error("storage failure for key {key}: {source}")]
    Storage {
        key: String,
        #[source]
        source: sled::Error,
    },

    /// Serialization of a combined metrics value failed. Given the fixed
    /// encoding contract this indicates a bug.
    #[error("failed to encode combined metrics: {0}")]
    Encoding(#[from] rmp_serde::encode::Error),

    /// A stored key or value could not be decoded.
    #[error("failed to decode combined metrics for key {key}: {reason}")]
    Decoding { key: String, reason: String },

    /// Invalid configuration passed to the builder.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The downstream processor returned an error during harvest. Harvest
    /// continues past the failing key; the first failure is reported.
    #[error("downstream processor failed: {0}")]
    Processor(#[source] anyhow::Error),
}

impl AggregatorError {
    pub(crate) fn storage(key: &[u8], source: sled::Error) -> Self {
        Self::Storage {
            key: hex(key),
            source,
        }
    }

    pub(crate) fn decoding(key: &[u8], reason: impl ToString) -> Self {
        Self::Decoding {
            key: hex(key),
            reason: reason.to_string(),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_carries_key() {
        let err = AggregatorError::storage(&[0x00, 0xab, 0xff], sled::Error::ReportableBug("x".into()));
        assert!(err.to_string().contains("00abff"));
    }
}
