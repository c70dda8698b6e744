//! Record encoding and integrity verification.

use sha2::{Digest, Sha256};

use crate::error::{CacheError, CacheResult};

use super::CacheMeta;

/// Compute the `sha256:<hex>` digest of a payload.
pub fn compute_digest(payload: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(payload)))
}

/// Header line (compact JSON, never contains a raw newline) + payload.
pub(crate) fn encode_record_impl(meta: &CacheMeta, payload: &[u8]) -> CacheResult<Vec<u8>> {
    let header = serde_json::to_vec(meta).map_err(|e| CacheError::Serialization {
        message: format!("failed to serialize entry header: {}", e),
    })?;

    let mut record = Vec::with_capacity(header.len() + 1 + payload.len());
    record.extend_from_slice(&header);
    record.push(b'\n');
    record.extend_from_slice(payload);
    Ok(record)
}

pub(crate) fn decode_record_impl(
    fingerprint: &str,
    mut record: Vec<u8>,
) -> CacheResult<(CacheMeta, Vec<u8>)> {
    let corrupt = |reason: String| CacheError::Corrupt {
        fingerprint: fingerprint.to_string(),
        reason,
    };

    let split = record
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| corrupt("missing header terminator".to_string()))?;
    let payload = record.split_off(split + 1);
    record.truncate(split);

    let meta: CacheMeta = serde_json::from_slice(&record)
        .map_err(|e| corrupt(format!("unparsable header: {}", e)))?;

    if meta.fingerprint != fingerprint {
        return Err(corrupt(format!(
            "header belongs to {}",
            meta.fingerprint
        )));
    }

    if payload.len() as u64 != meta.size_bytes {
        return Err(corrupt(format!(
            "size mismatch: expected {} bytes, found {}",
            meta.size_bytes,
            payload.len()
        )));
    }

    let actual = compute_digest(&payload);
    if actual != meta.digest {
        return Err(corrupt(format!(
            "digest mismatch: expected {}, got {}",
            meta.digest, actual
        )));
    }

    Ok((meta, payload))
}
