//! Storage implementations.
//!
//! - `MemoryJobStore` / `MemoryFragmentStore`: in-process, for tests and
//!   development
//! - `FsFragmentStore`: JSON fragments on disk
//! - `SqliteJobStore` (feature `sqlite`): durable job/batch state

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{PipelineError, Result};

pub mod fs;
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use fs::FsFragmentStore;
pub use memory::{MemoryFragmentStore, MemoryJobStore};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteJobStore;

/// On-disk/in-store shape of a fragment: the payload plus a hash of its
/// serialized form, verified on every read.
#[derive(Debug, Serialize, Deserialize)]
struct FragmentEnvelope {
    content_hash: String,
    body: serde_json::Value,
}

fn hash_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Serialize items into a hash-stamped fragment payload.
pub(crate) fn encode_fragment<T: Serialize>(items: &[T]) -> Result<String> {
    let body = serde_json::to_value(items)?;
    let content_hash = hash_hex(&serde_json::to_string(&body)?);
    Ok(serde_json::to_string(&FragmentEnvelope {
        content_hash,
        body,
    })?)
}

/// Parse and verify a fragment payload.
///
/// Any failure here is an integrity error: an unparsable envelope, a
/// hash mismatch, or a body that no longer deserializes all mean the
/// stored fragment is corrupt, not merely absent.
pub(crate) fn decode_fragment<T: DeserializeOwned>(fragment_ref: &str, raw: &str) -> Result<Vec<T>> {
    let envelope: FragmentEnvelope =
        serde_json::from_str(raw).map_err(|e| PipelineError::Integrity {
            fragment_ref: fragment_ref.to_string(),
            reason: format!("unparsable fragment: {e}"),
        })?;

    let body_text = serde_json::to_string(&envelope.body).map_err(|e| PipelineError::Integrity {
        fragment_ref: fragment_ref.to_string(),
        reason: format!("unserializable body: {e}"),
    })?;

    if hash_hex(&body_text) != envelope.content_hash {
        return Err(PipelineError::Integrity {
            fragment_ref: fragment_ref.to_string(),
            reason: "content hash mismatch".to_string(),
        });
    }

    serde_json::from_value(envelope.body).map_err(|e| PipelineError::Integrity {
        fragment_ref: fragment_ref.to_string(),
        reason: format!("body does not deserialize: {e}"),
    })
}
