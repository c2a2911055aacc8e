//! Filesystem fragment store.
//!
//! Lays fragments out as JSON files under a root directory, one tree per
//! job (`job_<id>/batches/...`, `job_<id>/outputs/...`, `job_<id>/final.json`).
//! Refs map directly onto relative paths, so a worker restarted on the
//! same volume finds its slices where it left them.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::{PipelineError, Result};
use crate::stores::{decode_fragment, encode_fragment};
use crate::traits::store::FragmentStore;
use crate::types::row::{Record, TargetRow};

/// File-based fragment store.
pub struct FsFragmentStore {
    root: PathBuf,
}

impl FsFragmentStore {
    /// Create a store rooted at `root`. The directory is created lazily
    /// on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, fragment_ref: &str) -> PathBuf {
        self.root.join(fragment_ref)
    }

    async fn write_raw(&self, fragment_ref: &str, raw: String) -> Result<()> {
        let path = self.path_for(fragment_ref);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, raw).await?;
        Ok(())
    }

    async fn read_raw(&self, fragment_ref: &str) -> Result<String> {
        match fs::read_to_string(self.path_for(fragment_ref)).await {
            Ok(raw) => Ok(raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PipelineError::FragmentNotFound {
                    fragment_ref: fragment_ref.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl FragmentStore for FsFragmentStore {
    async fn write_rows(&self, fragment_ref: &str, rows: &[TargetRow]) -> Result<()> {
        self.write_raw(fragment_ref, encode_fragment(rows)?).await
    }

    async fn read_rows(&self, fragment_ref: &str) -> Result<Vec<TargetRow>> {
        decode_fragment(fragment_ref, &self.read_raw(fragment_ref).await?)
    }

    async fn write_records(&self, fragment_ref: &str, records: &[Record]) -> Result<()> {
        self.write_raw(fragment_ref, encode_fragment(records)?).await
    }

    async fn read_records(&self, fragment_ref: &str) -> Result<Vec<Record>> {
        decode_fragment(fragment_ref, &self.read_raw(fragment_ref).await?)
    }
}
