//! Append-only story metrics.
//!
//! `MetricsRecorder` is the only writer of a story's `metrics` block during
//! execution. Nothing here removes or rewrites earlier entries.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::document::{
    FailureEntry, StoryEvent, StoryMetrics, StoryState, TimestampEntry, WorkflowDocument,
};
use crate::errors::DocumentError;
use crate::util::atomic_write;

/// Why one attempt failed. An attempt produces exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub stage: StoryState,
    /// Validators that rejected the attempt, empty outside VALIDATE.
    pub validators: Vec<String>,
    pub reason: String,
}

impl AttemptFailure {
    pub fn new(stage: StoryState, reason: impl Into<String>) -> Self {
        Self {
            stage,
            validators: Vec::new(),
            reason: reason.into(),
        }
    }

    /// A VALIDATE failure naming every validator that failed, in order.
    pub fn validators(failed: Vec<(String, String)>) -> Self {
        let reason = failed
            .iter()
            .map(|(name, reason)| format!("{name}: {reason}"))
            .collect::<Vec<_>>()
            .join("; ");
        Self {
            stage: StoryState::Validate,
            validators: failed.into_iter().map(|(name, _)| name).collect(),
            reason,
        }
    }
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.stage, self.reason)
    }
}

pub struct MetricsRecorder<'a> {
    doc: &'a mut WorkflowDocument,
}

impl<'a> MetricsRecorder<'a> {
    pub fn new(doc: &'a mut WorkflowDocument) -> Self {
        Self { doc }
    }

    fn metrics(&mut self, id: &str) -> Result<&mut StoryMetrics, DocumentError> {
        Ok(&mut self.doc.require_story_mut(id)?.metrics)
    }

    /// Start a new attempt and return its 1-based number.
    pub fn begin_attempt(&mut self, id: &str) -> Result<u32, DocumentError> {
        let metrics = self.metrics(id)?;
        metrics.iterations += 1;
        metrics.timestamps.push(TimestampEntry {
            event: StoryEvent::AttemptStarted,
            at: Utc::now(),
        });
        Ok(metrics.iterations)
    }

    /// Log the failure of the current attempt. Called once per failed attempt.
    pub fn record_iteration(&mut self, id: &str, failure: AttemptFailure) -> Result<(), DocumentError> {
        let metrics = self.metrics(id)?;
        let attempt = metrics.iterations;
        tracing::debug!(
            story_id = id,
            attempt,
            stage = %failure.stage,
            validators = ?failure.validators,
            "attempt failure recorded"
        );
        metrics.failure_log.push(FailureEntry {
            attempt,
            stage: failure.stage,
            validators: failure.validators,
            reason: failure.reason,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    pub fn record_timestamp(&mut self, id: &str, event: StoryEvent) -> Result<(), DocumentError> {
        self.metrics(id)?.timestamps.push(TimestampEntry {
            event,
            at: Utc::now(),
        });
        Ok(())
    }

    pub fn set_checkpoint_ref(&mut self, id: &str, rev: &str) -> Result<(), DocumentError> {
        self.metrics(id)?.last_checkpoint_ref = Some(rev.to_string());
        Ok(())
    }
}

/// One story's entry in `.gantry/metrics.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryMetricsSummary {
    pub iterations: u32,
    pub failures: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint_ref: Option<String>,
    pub failure_log: Vec<FailureEntry>,
    pub timestamps: Vec<TimestampEntry>,
}

/// Metrics for every story, keyed by story ID.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricsRecord {
    pub stories: BTreeMap<String, StoryMetricsSummary>,
}

impl MetricsRecord {
    pub fn from_document(doc: &WorkflowDocument) -> Self {
        let stories = doc
            .stories()
            .map(|s| {
                (
                    s.id.clone(),
                    StoryMetricsSummary {
                        iterations: s.metrics.iterations,
                        failures: s.metrics.failure_log.len(),
                        last_checkpoint_ref: s.metrics.last_checkpoint_ref.clone(),
                        failure_log: s.metrics.failure_log.clone(),
                        timestamps: s.metrics.timestamps.clone(),
                    },
                )
            })
            .collect();
        Self { stories }
    }

    pub fn total_iterations(&self) -> u32 {
        self.stories.values().map(|s| s.iterations).sum()
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        atomic_write(path, &json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{StoryDraft, TaskDraft};
    use tempfile::tempdir;

    fn doc_with_story() -> WorkflowDocument {
        WorkflowDocument::default()
            .add_tasks_from_prd(vec![TaskDraft {
                title: "Task".into(),
                stories: vec![StoryDraft {
                    title: "Story".into(),
                    ..Default::default()
                }],
                ..Default::default()
            }])
            .unwrap()
    }

    #[test]
    fn test_begin_attempt_counts_up() {
        let mut doc = doc_with_story();
        let mut rec = MetricsRecorder::new(&mut doc);
        assert_eq!(rec.begin_attempt("US-001").unwrap(), 1);
        assert_eq!(rec.begin_attempt("US-001").unwrap(), 2);

        let story = doc.story("US-001").unwrap();
        assert_eq!(story.metrics.iterations, 2);
        assert_eq!(story.metrics.timestamps.len(), 2);
        assert_eq!(story.metrics.timestamps[0].event, StoryEvent::AttemptStarted);
    }

    #[test]
    fn test_failures_tagged_with_attempt_and_appended() {
        let mut doc = doc_with_story();
        let mut rec = MetricsRecorder::new(&mut doc);
        rec.begin_attempt("US-001").unwrap();
        rec.record_iteration("US-001", AttemptFailure::new(StoryState::Build, "compile error"))
            .unwrap();
        rec.begin_attempt("US-001").unwrap();
        rec.record_iteration(
            "US-001",
            AttemptFailure::validators(vec![("whitebox".into(), "3 tests failed".into())]),
        )
        .unwrap();

        let log = &doc.story("US-001").unwrap().metrics.failure_log;
        assert_eq!(log.len(), 2);
        assert_eq!((log[0].attempt, log[0].stage), (1, StoryState::Build));
        assert_eq!(log[1].attempt, 2);
        assert_eq!(log[1].validators, vec!["whitebox".to_string()]);
    }

    #[test]
    fn test_unknown_story_is_an_error() {
        let mut doc = doc_with_story();
        let mut rec = MetricsRecorder::new(&mut doc);
        assert!(matches!(
            rec.begin_attempt("US-999"),
            Err(DocumentError::StoryNotFound { .. })
        ));
    }

    #[test]
    fn test_export_keyed_by_story() {
        let dir = tempdir().unwrap();
        let mut doc = doc_with_story();
        {
            let mut rec = MetricsRecorder::new(&mut doc);
            rec.set_checkpoint_ref("US-001", "abc123").unwrap();
            rec.begin_attempt("US-001").unwrap();
            rec.record_iteration("US-001", AttemptFailure::new(StoryState::TestWrite, "no tests"))
                .unwrap();
        }
        let record = MetricsRecord::from_document(&doc);
        assert_eq!(record.total_iterations(), 1);

        let path = dir.path().join("metrics.json");
        record.save(&path).unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["US-001"]["iterations"], 1);
        assert_eq!(raw["US-001"]["failures"], 1);
        assert_eq!(raw["US-001"]["lastCheckpointRef"], "abc123");
        assert_eq!(raw["US-001"]["failureLog"][0]["stage"], "TEST_WRITE");
    }

    #[test]
    fn test_validator_failures_fold_into_one() {
        let f = AttemptFailure::validators(vec![
            ("whitebox".into(), "2 tests failed".into()),
            ("blackbox".into(), "timed out".into()),
        ]);
        assert_eq!(f.stage, StoryState::Validate);
        assert_eq!(f.validators, vec!["whitebox", "blackbox"]);
        assert_eq!(
            f.to_string(),
            "VALIDATE: whitebox: 2 tests failed; blackbox: timed out"
        );
    }
}
