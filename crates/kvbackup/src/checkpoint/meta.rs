//! Checkpoint metadata persisted next to the checkpoint log.
//!
//! The metadata is written once when a job starts from scratch and read back
//! when a job resumes. It is stored as JSON wrapped in an envelope carrying a
//! CRC32 of the payload so a half-written object is rejected on load.

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::storage::{BackupStorage, CHECKPOINT_META_FILE};

const METADATA_ENVELOPE_VERSION: u8 = 1;

/// Identity of a resumable backup job.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointMetadata {
    /// Service id under which the job holds the GC safepoint.
    pub gc_service_id: String,
    /// Hash of the job configuration; a resume must present the same hash.
    pub config_hash: Vec<u8>,
    /// Snapshot timestamp the job exports at.
    pub backup_ts: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CheckpointMetadataEnvelope {
    version: u8,
    checksum_crc32: u32,
    payload: CheckpointMetadata,
}

fn payload_checksum(meta: &CheckpointMetadata) -> anyhow::Result<u32> {
    let bytes = serde_json::to_vec(meta).context("serialize checkpoint metadata payload")?;
    Ok(crc32fast::hash(&bytes))
}

pub fn encode_metadata(meta: &CheckpointMetadata) -> anyhow::Result<Vec<u8>> {
    let envelope = CheckpointMetadataEnvelope {
        version: METADATA_ENVELOPE_VERSION,
        checksum_crc32: payload_checksum(meta)?,
        payload: meta.clone(),
    };
    serde_json::to_vec_pretty(&envelope).context("serialize checkpoint metadata")
}

/// Decode and verify an envelope; `origin` names the source in errors.
pub fn decode_metadata(bytes: &[u8], origin: &str) -> anyhow::Result<CheckpointMetadata> {
    let envelope: CheckpointMetadataEnvelope = serde_json::from_slice(bytes)
        .with_context(|| format!("parse checkpoint metadata: {origin}"))?;
    if envelope.version != METADATA_ENVELOPE_VERSION {
        anyhow::bail!(
            "unsupported checkpoint metadata version {} at {origin}",
            envelope.version
        );
    }
    let actual = payload_checksum(&envelope.payload)?;
    if actual != envelope.checksum_crc32 {
        anyhow::bail!(
            "checkpoint metadata checksum mismatch at {origin} (expected={}, actual={actual})",
            envelope.checksum_crc32
        );
    }
    Ok(envelope.payload)
}

/// Load the metadata of a previous run, if there was one.
pub fn load_metadata(storage: &dyn BackupStorage) -> anyhow::Result<Option<CheckpointMetadata>> {
    if !storage.file_exists(CHECKPOINT_META_FILE)? {
        return Ok(None);
    }
    let bytes = storage.read_file(CHECKPOINT_META_FILE)?;
    let origin = format!("{}/{CHECKPOINT_META_FILE}", storage.uri());
    decode_metadata(&bytes, &origin).map(Some)
}

pub fn save_metadata(storage: &dyn BackupStorage, meta: &CheckpointMetadata) -> anyhow::Result<()> {
    storage.write_file(CHECKPOINT_META_FILE, &encode_metadata(meta)?)
}
