//! Test doubles for exercising the pipeline without a live extraction
//! service.
//!
//! `MockExtractor` is deterministic and clonable: clones share state, so
//! a test can keep a handle for assertions while the pipeline owns the
//! extractor. Available to integration tests and downstream crates; not
//! compiled into release binaries that do not name it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{ExtractError, ExtractResult};
use crate::traits::extractor::Extractor;
use crate::types::row::{Record, TargetRow};

enum Script {
    /// Fail transiently this many more times, then succeed.
    FailTimes(u32),
    /// Fail permanently on every attempt.
    Permanent,
}

/// Scripted in-memory extractor.
///
/// By default every batch succeeds, echoing each row back as a record
/// with the same fields. Failures are scripted per batch, keyed by the
/// id of the batch's first row.
#[derive(Clone, Default)]
pub struct MockExtractor {
    scripts: Arc<Mutex<HashMap<String, Script>>>,
    calls: Arc<Mutex<Vec<Vec<String>>>>,
}

impl MockExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the batch whose first row has id `key` to fail transiently
    /// `times` times before succeeding.
    pub fn with_failures(self, key: impl Into<String>, times: u32) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(key.into(), Script::FailTimes(times));
        self
    }

    /// Script the batch whose first row has id `key` to fail permanently
    /// on every attempt.
    pub fn with_permanent_failure(self, key: impl Into<String>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(key.into(), Script::Permanent);
        self
    }

    /// Row ids of every batch submitted so far, in submission order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of batches submitted so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl Extractor for MockExtractor {
    async fn extract(&self, rows: &[TargetRow]) -> ExtractResult<Vec<Record>> {
        self.calls
            .lock()
            .unwrap()
            .push(rows.iter().map(|r| r.id.clone()).collect());

        if let Some(first) = rows.first() {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(&first.id) {
                Some(Script::FailTimes(remaining)) if *remaining > 0 => {
                    *remaining -= 1;
                    return Err(ExtractError::Transient(format!(
                        "scripted transient failure for {}",
                        first.id
                    )));
                }
                Some(Script::FailTimes(_)) => {
                    scripts.remove(&first.id);
                }
                Some(Script::Permanent) => {
                    return Err(ExtractError::Permanent(format!(
                        "scripted permanent failure for {}",
                        first.id
                    )));
                }
                None => {}
            }
        }

        Ok(rows
            .iter()
            .map(|row| {
                let mut record = Record::new(&row.id);
                for (key, value) in &row.fields {
                    record = record.with_field(key, value);
                }
                record
            })
            .collect())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echoes_rows_as_records() {
        let mock = MockExtractor::new();
        let rows = vec![
            TargetRow::new("row-1").with_field("name", "Jane"),
            TargetRow::new("row-2"),
        ];

        let records = mock.extract(&rows).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].target_id, "row-1");
        assert_eq!(records[0].fields.get("name"), Some(&"Jane".to_string()));
        assert_eq!(mock.calls(), vec![vec!["row-1".to_string(), "row-2".to_string()]]);
    }

    #[tokio::test]
    async fn test_transient_script_fails_then_succeeds() {
        let mock = MockExtractor::new().with_failures("row-1", 2);
        let rows = vec![TargetRow::new("row-1")];

        let err = mock.extract(&rows).await.unwrap_err();
        assert!(err.is_transient());
        assert!(mock.extract(&rows).await.unwrap_err().is_transient());
        assert!(mock.extract(&rows).await.is_ok());
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_permanent_script_never_recovers() {
        let mock = MockExtractor::new().with_permanent_failure("row-1");
        let rows = vec![TargetRow::new("row-1")];

        for _ in 0..3 {
            let err = mock.extract(&rows).await.unwrap_err();
            assert!(!err.is_transient());
        }
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let mock = MockExtractor::new();
        let clone = mock.clone();
        clone.extract(&[TargetRow::new("row-1")]).await.unwrap();
        assert_eq!(mock.call_count(), 1);
    }
}
