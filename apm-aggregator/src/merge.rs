// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Serialized form of combined metrics and the store-side merge operator.
//!
//! A stored value is one or more frames, each a 4-byte big-endian length
//! prefix followed by a msgpack body. The decoder folds every frame it finds
//! through the limiter, which keeps the encoding additively mergeable: two
//! valid values concatenated are themselves a valid value.

use tracing::error;

use crate::config::Limits;
use crate::error::AggregatorError;
use crate::model::CombinedMetrics;

const LENGTH_PREFIX_SIZE: usize = 4;

/// Encode one combined-metrics value as a single length-prefixed frame.
pub(crate) fn encode_value(metrics: &CombinedMetrics) -> Result<Vec<u8>, AggregatorError> {
    let body = rmp_serde::to_vec(metrics)?;
    let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a stored value, folding all frames through the limiter.
pub(crate) fn decode_value(
    key: &[u8],
    mut buf: &[u8],
    limits: &Limits,
) -> Result<CombinedMetrics, AggregatorError> {
    let mut folded = CombinedMetrics::default();
    while !buf.is_empty() {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Err(AggregatorError::decoding(key, "truncated length prefix"));
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        buf = &buf[LENGTH_PREFIX_SIZE..];
        if buf.len() < len {
            return Err(AggregatorError::decoding(
                key,
                format!("frame length {len} exceeds remaining {} bytes", buf.len()),
            ));
        }
        let frame: CombinedMetrics = rmp_serde::from_slice(&buf[..len])
            .map_err(|err| AggregatorError::decoding(key, err))?;
        folded.merge_from(frame, limits);
        buf = &buf[len..];
    }
    Ok(folded)
}

/// Build the merge operator installed on the store tree.
///
/// Decodes the existing value and the operand, folds the operand through the
/// limiter and re-encodes. Merge operators cannot fail; a corrupt operand is
/// logged and the previous value retained.
pub(crate) fn merge_operator(
    limits: Limits,
) -> impl Fn(&[u8], Option<&[u8]>, &[u8]) -> Option<Vec<u8>> + Send + Sync + 'static {
    move |key, existing, operand| {
        let mut folded = match existing {
            Some(bytes) => match decode_value(key, bytes, &limits) {
                Ok(metrics) => metrics,
                Err(err) => {
                    error!(%err, "discarding corrupt stored combined metrics");
                    CombinedMetrics::default()
                }
            },
            None => CombinedMetrics::default(),
        };
        match decode_value(key, operand, &limits) {
            Ok(incoming) => folded.merge_from(incoming, &limits),
            Err(err) => {
                error!(%err, "dropping corrupt combined metrics merge operand");
                return Some(existing.map(<[u8]>::to_vec).unwrap_or_default());
            }
        }
        match encode_value(&folded) {
            Ok(encoded) => Some(encoded),
            Err(err) => {
                error!(%err, "failed to re-encode merged combined metrics");
                Some(existing.map(<[u8]>::to_vec).unwrap_or_default())
            }
        }
    }
}
