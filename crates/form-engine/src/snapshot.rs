//! Transaction snapshots
//!
//! The data a transaction started from, kept as zstd-compressed JSON until
//! the transaction closes. Rolling back decompresses it and re-runs the
//! processor from scratch over it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};

#[derive(Serialize, Deserialize)]
struct SnapshotContents {
    data: Value,
    external: Value,
}

/// Compressed copy of the data and external data of a session
#[derive(Debug, Clone)]
pub struct TransactionSnapshot {
    compressed: Vec<u8>,
}

impl TransactionSnapshot {
    /// Compress `data` and `external` at the given zstd level
    pub fn capture(data: &Value, external: &Value, level: i32) -> Result<Self> {
        let json = serde_json::to_vec(&SnapshotContents {
            data: data.clone(),
            external: external.clone(),
        })?;
        let compressed =
            zstd::encode_all(&json[..], level).map_err(|e| EngineError::Compression(e.to_string()))?;
        Ok(Self { compressed })
    }

    /// Decompress into `(data, external)`
    pub fn restore(&self) -> Result<(Value, Value)> {
        let json = zstd::decode_all(&self.compressed[..])
            .map_err(|e| EngineError::Compression(e.to_string()))?;
        let contents: SnapshotContents = serde_json::from_slice(&json)?;
        Ok((contents.data, contents.external))
    }

    /// Size of the compressed snapshot in bytes
    pub fn compressed_size(&self) -> usize {
        self.compressed.len()
    }
}
