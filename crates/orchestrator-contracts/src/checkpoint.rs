//! Checkpoint record shape (§3, §4.1, §4.8). The checksum is computed and
//! verified by the persistence store; this type only carries the value so
//! callers on either side of that boundary agree on the wire shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub id: String,
    pub execution_id: String,
    pub step_index: usize,
    pub timestamp: DateTime<Utc>,
    /// Serialized {context, current_step, step_results, variables} blob.
    pub state: Vec<u8>,
    pub size_bytes: usize,
    /// CRC32 of `state`, verified on load; mismatch is `CheckpointCorrupted`.
    pub checksum: u32,
}

impl Checkpoint {
    pub fn new(
        id: impl Into<String>,
        execution_id: impl Into<String>,
        step_index: usize,
        state: Vec<u8>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let checksum = crc32fast::hash(&state);
        let size_bytes = state.len();
        Self {
            id: id.into(),
            execution_id: execution_id.into(),
            step_index,
            timestamp,
            state,
            size_bytes,
            checksum,
        }
    }

    pub fn verify(&self) -> bool {
        crc32fast::hash(&self.state) == self.checksum
    }
}
