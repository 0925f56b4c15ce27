//! The per-story state machine.
//!
//! One story runs at a time per runner. Each run takes a version-control
//! checkpoint, then loops TEST_WRITE → BUILD → VALIDATE → CLEANUP until the
//! story passes or this run's attempts reach `max-attempts-per-story`, at
//! which point the workspace is reverted to the checkpoint.

use futures::future::join_all;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::collaborators::{AgentRequest, AgentRole, CheckReport, Collaborators, RevisionRef};
use crate::document::{Story, StoryEvent, StoryState, WorkflowDocument};
use crate::errors::StoryError;
use crate::learnings::LearningEnforcer;
use crate::metrics::{AttemptFailure, MetricsRecorder};
use crate::ui::StoryProgress;

/// Longest slice of agent output quoted in a failure reason.
const MAX_REASON_CHARS: usize = 500;

/// Result of driving one story.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryOutcome {
    pub id: String,
    pub attempts_used: u32,
    pub passed: bool,
    pub state: StoryState,
    pub reason: Option<String>,
}

enum AttemptResult {
    Passed,
    Failed(AttemptFailure),
}

/// Failed attempts since the story last passed or was rolled back.
pub fn failed_attempts_in_cycle(story: &Story) -> u32 {
    story
        .metrics
        .timestamps
        .iter()
        .fold(0, |count, entry| match entry.event {
            StoryEvent::AttemptFailed => count + 1,
            StoryEvent::RolledBack | StoryEvent::Passed | StoryEvent::MarkedPass => 0,
            _ => count,
        })
}

/// Clears the runner's active-story slot on drop.
struct ActiveSlot<'a> {
    slot: &'a Mutex<Option<String>>,
}

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        *lock_slot(self.slot) = None;
    }
}

fn lock_slot(slot: &Mutex<Option<String>>) -> MutexGuard<'_, Option<String>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn truncate_reason(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= MAX_REASON_CHARS {
        trimmed.to_string()
    } else {
        let head: String = trimmed.chars().take(MAX_REASON_CHARS).collect();
        format!("{head}...")
    }
}

pub struct StoryRunner {
    collaborators: Collaborators,
    enforcer: LearningEnforcer,
    active: Mutex<Option<String>>,
    document_path: Option<PathBuf>,
    ui: Option<Arc<StoryProgress>>,
}

impl StoryRunner {
    pub fn new(collaborators: Collaborators, enforcer: LearningEnforcer) -> Self {
        Self {
            collaborators,
            enforcer,
            active: Mutex::new(None),
            document_path: None,
            ui: None,
        }
    }

    /// Save the document to `path` after every attempt and state change.
    pub fn with_document_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.document_path = Some(path.into());
        self
    }

    pub fn with_ui(mut self, ui: Arc<StoryProgress>) -> Self {
        self.ui = Some(ui);
        self
    }

    /// The story currently being driven, if any.
    pub fn active_story(&self) -> Option<String> {
        lock_slot(&self.active).clone()
    }

    fn claim(&self, id: &str) -> Result<ActiveSlot<'_>, StoryError> {
        let mut active = lock_slot(&self.active);
        if let Some(current) = active.as_ref() {
            return Err(StoryError::ConcurrentStoryConflict {
                active: current.clone(),
                requested: id.to_string(),
            });
        }
        *active = Some(id.to_string());
        Ok(ActiveSlot { slot: &self.active })
    }

    /// The enabled validators, provided every one has a collaborator.
    pub fn require_validators(&self, doc: &WorkflowDocument) -> Result<Vec<String>, StoryError> {
        let validators = doc.config.enabled_validators();
        if let Some(missing) = validators
            .iter()
            .find(|name| !self.collaborators.validators.contains_key(*name))
        {
            return Err(StoryError::MissingValidator {
                name: missing.clone(),
            });
        }
        Ok(validators)
    }

    fn persist(&self, doc: &WorkflowDocument) -> Result<(), StoryError> {
        if let Some(path) = &self.document_path {
            doc.save(path)?;
        }
        Ok(())
    }

    fn set_state(
        &self,
        doc: &mut WorkflowDocument,
        id: &str,
        state: StoryState,
    ) -> Result<(), StoryError> {
        doc.require_story_mut(id)?.status = state;
        if let Some(ui) = &self.ui {
            ui.stage(state);
        }
        debug!(story_id = id, stage = %state, "stage entered");
        Ok(())
    }

    fn snapshot(doc: &WorkflowDocument, id: &str) -> Result<Story, StoryError> {
        doc.story(id)
            .cloned()
            .ok_or_else(|| StoryError::StoryNotFound { id: id.to_string() })
    }

    /// Drive one story to PASSED, ROLLED_BACK, or UNRECOVERABLE.
    pub async fn run_story(
        &self,
        doc: &mut WorkflowDocument,
        id: &str,
    ) -> Result<StoryOutcome, StoryError> {
        let _slot = self.claim(id)?;
        let story = Self::snapshot(doc, id)?;

        match story.status {
            StoryState::Passed => {
                return Ok(StoryOutcome {
                    id: id.to_string(),
                    attempts_used: 0,
                    passed: true,
                    state: StoryState::Passed,
                    reason: None,
                });
            }
            StoryState::Unrecoverable => {
                return Ok(StoryOutcome {
                    id: id.to_string(),
                    attempts_used: 0,
                    passed: false,
                    state: StoryState::Unrecoverable,
                    reason: Some(format!(
                        "a previous rollback failed; run 'gantry rollback {id}' first"
                    )),
                });
            }
            _ => {}
        }

        let validators = self.require_validators(doc)?;
        doc.require_story_mut(id)?
            .checkpoints
            .ensure_validators(&validators);

        if let Some(ui) = &self.ui {
            ui.start_story(id, &story.title);
        }
        info!(story_id = id, validators = ?validators, "starting story");

        let rev = self
            .collaborators
            .vcs
            .checkpoint(&format!("before story {id}"))
            .await
            .map_err(|source| StoryError::CheckpointUnavailable {
                id: id.to_string(),
                source,
            })?;
        {
            let mut rec = MetricsRecorder::new(doc);
            rec.set_checkpoint_ref(id, &rev.0)?;
            rec.record_timestamp(id, StoryEvent::CheckpointTaken)?;
        }
        self.persist(doc)?;

        let max_attempts = doc.config.max_attempts_per_story;
        let mut attempts_used = 0;
        loop {
            let attempt = MetricsRecorder::new(doc).begin_attempt(id)?;
            attempts_used += 1;
            if let Some(ui) = &self.ui {
                ui.start_attempt(attempts_used, max_attempts);
            }
            info!(story_id = id, attempt, run_attempt = attempts_used, "attempt started");

            match self.run_attempt(doc, id, attempt, &validators).await? {
                AttemptResult::Passed => {
                    let story = doc.require_story_mut(id)?;
                    story.checkpoints.mark_all();
                    story.status = StoryState::Passed;
                    MetricsRecorder::new(doc).record_timestamp(id, StoryEvent::Passed)?;
                    self.persist(doc)?;
                    info!(story_id = id, attempts = attempts_used, "story passed");

                    let outcome = StoryOutcome {
                        id: id.to_string(),
                        attempts_used,
                        passed: true,
                        state: StoryState::Passed,
                        reason: None,
                    };
                    if let Some(ui) = &self.ui {
                        ui.story_finished(&outcome);
                    }
                    return Ok(outcome);
                }
                AttemptResult::Failed(failure) => {
                    warn!(story_id = id, attempt, stage = %failure.stage, "attempt failed");
                    if let Some(ui) = &self.ui {
                        ui.attempt_failed(attempts_used, &failure);
                    }
                    let summary = failure.to_string();
                    {
                        let mut rec = MetricsRecorder::new(doc);
                        rec.record_iteration(id, failure)?;
                        rec.record_timestamp(id, StoryEvent::AttemptFailed)?;
                    }
                    doc.require_story_mut(id)?.checkpoints.reset();
                    self.persist(doc)?;

                    if attempts_used >= max_attempts {
                        let outcome = self
                            .roll_back_exhausted(doc, id, &rev, attempts_used, &summary)
                            .await?;
                        if let Some(ui) = &self.ui {
                            ui.story_finished(&outcome);
                        }
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    async fn run_attempt(
        &self,
        doc: &mut WorkflowDocument,
        id: &str,
        attempt: u32,
        validators: &[String],
    ) -> Result<AttemptResult, StoryError> {
        self.set_state(doc, id, StoryState::TestWrite)?;
        if let Some(failure) = self.run_agent(doc, id, attempt, AgentRole::TestAuthor).await? {
            return Ok(AttemptResult::Failed(failure));
        }
        doc.require_story_mut(id)?.checkpoints.tests_written = true;
        MetricsRecorder::new(doc).record_timestamp(id, StoryEvent::TestsWritten)?;

        self.set_state(doc, id, StoryState::Build)?;
        if let Some(failure) = self.run_agent(doc, id, attempt, AgentRole::Implementer).await? {
            return Ok(AttemptResult::Failed(failure));
        }
        doc.require_story_mut(id)?.checkpoints.build_complete = true;
        MetricsRecorder::new(doc).record_timestamp(id, StoryEvent::BuildComplete)?;

        self.set_state(doc, id, StoryState::Validate)?;
        let snapshot = Self::snapshot(doc, id)?;
        let results = self
            .run_validators(&snapshot, validators, doc.config.validator_timeout())
            .await;

        let mut failed = Vec::new();
        for (name, result) in results {
            let passed = matches!(&result, Ok(report) if report.passed);
            if let Some(ui) = &self.ui {
                ui.validator_result(&name, passed);
            }
            match result {
                Ok(report) if report.passed => {
                    doc.require_story_mut(id)?
                        .checkpoints
                        .validators
                        .insert(name, true);
                }
                Ok(report) => {
                    let reason = if report.diagnostics.trim().is_empty() {
                        "validation failed".to_string()
                    } else {
                        truncate_reason(&report.diagnostics)
                    };
                    failed.push((name, reason));
                }
                Err(reason) => failed.push((name, reason)),
            }
        }
        if !failed.is_empty() {
            return Ok(AttemptResult::Failed(AttemptFailure::validators(failed)));
        }
        MetricsRecorder::new(doc).record_timestamp(id, StoryEvent::Validated)?;

        if doc.config.cleanup_enabled {
            self.set_state(doc, id, StoryState::Cleanup)?;
            let snapshot = Self::snapshot(doc, id)?;
            let failure = match self.collaborators.cleaner.cleanup(&snapshot).await {
                Ok(report) if report.passed => None,
                Ok(report) => Some(truncate_reason(&report.diagnostics)),
                Err(e) => Some(format!("cleanup failed to run: {e:#}")),
            };
            if let Some(reason) = failure {
                return Ok(AttemptResult::Failed(AttemptFailure::new(
                    StoryState::Cleanup,
                    reason,
                )));
            }
        } else {
            debug!(story_id = id, "cleanup disabled, skipping");
        }
        doc.require_story_mut(id)?.checkpoints.cleanup_complete = true;
        MetricsRecorder::new(doc).record_timestamp(id, StoryEvent::CleanupComplete)?;

        Ok(AttemptResult::Passed)
    }

    /// Run one agent step. `Ok(Some(_))` is a recoverable failure.
    async fn run_agent(
        &self,
        doc: &WorkflowDocument,
        id: &str,
        attempt: u32,
        role: AgentRole,
    ) -> Result<Option<AttemptFailure>, StoryError> {
        let story = Self::snapshot(doc, id)?;
        let (stage, agent) = match role {
            AgentRole::TestAuthor => (StoryState::TestWrite, &self.collaborators.test_author),
            AgentRole::Implementer => (StoryState::Build, &self.collaborators.implementer),
        };
        let request = AgentRequest {
            role,
            previous_failures: story.metrics.failure_log.clone(),
            story,
            attempt,
            denylist: self.enforcer.patterns(),
        };

        let output = match agent.run(&request).await {
            Ok(output) => output,
            Err(e) => {
                return Ok(Some(AttemptFailure::new(
                    stage,
                    format!("{role} failed to run: {e:#}"),
                )));
            }
        };
        if !output.success {
            return Ok(Some(AttemptFailure::new(
                stage,
                format!("{role} reported failure: {}", truncate_reason(&output.content)),
            )));
        }

        let violations = self.enforcer.find_violations(&output.content);
        if !violations.is_empty() {
            let reason = violations
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Ok(Some(AttemptFailure::new(stage, reason)));
        }
        Ok(None)
    }

    /// Run every named validator concurrently, each under its own timeout.
    /// A slow validator fails alone; the others run to completion.
    async fn run_validators(
        &self,
        story: &Story,
        names: &[String],
        limit: Duration,
    ) -> Vec<(String, Result<CheckReport, String>)> {
        let futures: Vec<_> = names
            .iter()
            .filter_map(|name| {
                self.collaborators
                    .validators
                    .get(name)
                    .map(|v| (name.clone(), Arc::clone(v)))
            })
            .map(|(name, validator)| async move {
                let result = match tokio::time::timeout(limit, validator.validate(story)).await {
                    Ok(Ok(report)) => Ok(report),
                    Ok(Err(e)) => Err(format!("validator failed to run: {e:#}")),
                    Err(_) => Err(format!("timed out after {limit:?}")),
                };
                (name, result)
            })
            .collect();

        join_all(futures).await
    }

    async fn roll_back_exhausted(
        &self,
        doc: &mut WorkflowDocument,
        id: &str,
        rev: &RevisionRef,
        attempts_used: u32,
        last_failure: &str,
    ) -> Result<StoryOutcome, StoryError> {
        let reason = format!("exhausted {attempts_used} attempt(s); last failure: {last_failure}");

        match self.collaborators.vcs.revert(rev).await {
            Ok(()) => {
                let story = doc.require_story_mut(id)?;
                story.checkpoints.reset();
                story.status = StoryState::RolledBack;
                MetricsRecorder::new(doc).record_timestamp(id, StoryEvent::RolledBack)?;
                self.persist(doc)?;
                warn!(story_id = id, revision = %rev, attempts = attempts_used, "story rolled back");

                Ok(StoryOutcome {
                    id: id.to_string(),
                    attempts_used,
                    passed: false,
                    state: StoryState::RolledBack,
                    reason: Some(reason),
                })
            }
            Err(e) => {
                let detail = format!("revert to {rev} failed: {e:#}");
                MetricsRecorder::new(doc).record_timestamp(id, StoryEvent::RevertFailed)?;
                doc.require_story_mut(id)?.status = StoryState::Unrecoverable;
                self.persist(doc)?;
                error!(
                    story_id = id,
                    revision = %rev,
                    error = %detail,
                    "rollback failed, workspace needs manual attention"
                );

                Ok(StoryOutcome {
                    id: id.to_string(),
                    attempts_used,
                    passed: false,
                    state: StoryState::Unrecoverable,
                    reason: Some(format!("{reason}; {detail}")),
                })
            }
        }
    }

    /// Run every story that has not passed, one at a time, in document order.
    pub async fn run_all(
        &self,
        doc: &mut WorkflowDocument,
        fail_fast: bool,
    ) -> Result<Vec<StoryOutcome>, StoryError> {
        let pending: Vec<String> = doc
            .stories()
            .filter(|s| s.status != StoryState::Passed)
            .map(|s| s.id.clone())
            .collect();

        let mut outcomes = Vec::with_capacity(pending.len());
        for id in pending {
            let outcome = self.run_story(doc, &id).await?;
            let stop = fail_fast && !outcome.passed;
            outcomes.push(outcome);
            if stop {
                info!(story_id = %id, "stopping after first failed story");
                break;
            }
        }
        Ok(outcomes)
    }

    /// Run only the cleanup collaborator against a story.
    pub async fn run_cleanup(
        &self,
        doc: &mut WorkflowDocument,
        id: &str,
    ) -> Result<CheckReport, StoryError> {
        let _slot = self.claim(id)?;
        let snapshot = Self::snapshot(doc, id)?;

        let report = match self.collaborators.cleaner.cleanup(&snapshot).await {
            Ok(report) => report,
            Err(e) => CheckReport::fail(format!("cleanup failed to run: {e:#}")),
        };

        if report.passed {
            doc.require_story_mut(id)?.checkpoints.cleanup_complete = true;
            MetricsRecorder::new(doc).record_timestamp(id, StoryEvent::CleanupComplete)?;
        } else {
            // Not an attempt, so it stays out of the failure log.
            MetricsRecorder::new(doc).record_timestamp(id, StoryEvent::CleanupFailed)?;
            warn!(story_id = id, "cleanup failed");
        }
        self.persist(doc)?;
        Ok(report)
    }

    /// Accept a story as passed and commit the workspace.
    pub async fn mark_story_pass(
        &self,
        doc: &mut WorkflowDocument,
        id: &str,
    ) -> Result<RevisionRef, StoryError> {
        let _slot = self.claim(id)?;
        let story = Self::snapshot(doc, id)?;

        let failed = failed_attempts_in_cycle(&story);
        if story.status == StoryState::Unrecoverable || failed >= doc.config.max_attempts_per_story {
            return Err(StoryError::AttemptsExhausted {
                id: id.to_string(),
                attempts: failed,
            });
        }

        let rev = self
            .collaborators
            .vcs
            .commit(&format!("[gantry] {id}: {}", story.title))
            .await
            .map_err(|source| StoryError::CommitFailed {
                id: id.to_string(),
                source,
            })?;

        let story = doc.require_story_mut(id)?;
        story.checkpoints.mark_all();
        story.status = StoryState::Passed;
        MetricsRecorder::new(doc).record_timestamp(id, StoryEvent::MarkedPass)?;
        self.persist(doc)?;
        info!(story_id = id, revision = %rev, "story marked as passed");
        Ok(rev)
    }

    /// Revert the workspace to the story's last checkpoint.
    pub async fn rollback_story(
        &self,
        doc: &mut WorkflowDocument,
        id: &str,
    ) -> Result<RevisionRef, StoryError> {
        let _slot = self.claim(id)?;
        let story = Self::snapshot(doc, id)?;
        let rev = story
            .metrics
            .last_checkpoint_ref
            .clone()
            .map(RevisionRef)
            .ok_or_else(|| StoryError::NoRollbackPoint { id: id.to_string() })?;

        self.collaborators
            .vcs
            .revert(&rev)
            .await
            .map_err(|source| StoryError::RevertFailed {
                id: id.to_string(),
                revision: rev.0.clone(),
                source,
            })?;

        let story = doc.require_story_mut(id)?;
        story.checkpoints.reset();
        story.status = StoryState::RolledBack;
        MetricsRecorder::new(doc).record_timestamp(id, StoryEvent::RolledBack)?;
        self.persist(doc)?;
        warn!(story_id = id, revision = %rev, "story rolled back manually");
        Ok(rev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{StoryDraft, TaskDraft};
    use crate::learnings::LearningsRecord;
    use crate::runner::collaborators::{
        Agent, AgentOutput, Cleaner, Validator, VersionControl,
    };
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tempfile::tempdir;

    struct MockAgent {
        script: Mutex<VecDeque<AgentOutput>>,
        delay: Option<Duration>,
        calls: AtomicU32,
        requests: Mutex<Vec<AgentRequest>>,
    }

    impl MockAgent {
        fn ok() -> Arc<Self> {
            Self::scripted(vec![])
        }

        fn scripted(outputs: Vec<AgentOutput>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(outputs.into()),
                delay: None,
                calls: AtomicU32::new(0),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(VecDeque::new()),
                delay: Some(delay),
                calls: AtomicU32::new(0),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Agent for MockAgent {
        async fn run(&self, request: &AgentRequest) -> Result<AgentOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            Ok(next.unwrap_or(AgentOutput {
                success: true,
                content: "done".into(),
            }))
        }
    }

    struct MockValidator {
        name: String,
        results: Mutex<VecDeque<bool>>,
        fallback: bool,
        delay: Option<Duration>,
        completed: AtomicU32,
    }

    impl MockValidator {
        fn new(name: &str, results: Vec<bool>, fallback: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                results: Mutex::new(results.into()),
                fallback,
                delay: None,
                completed: AtomicU32::new(0),
            })
        }

        fn slow(name: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                results: Mutex::new(VecDeque::new()),
                fallback: true,
                delay: Some(delay),
                completed: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Validator for MockValidator {
        fn name(&self) -> &str {
            &self.name
        }

        async fn validate(&self, _story: &Story) -> Result<CheckReport> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let passed = self.results.lock().unwrap().pop_front().unwrap_or(self.fallback);
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(if passed {
                CheckReport::pass()
            } else {
                CheckReport::fail(format!("{} found failing tests", self.name))
            })
        }
    }

    struct MockCleaner {
        pass: bool,
        calls: AtomicU32,
    }

    impl MockCleaner {
        fn new(pass: bool) -> Arc<Self> {
            Arc::new(Self {
                pass,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Cleaner for MockCleaner {
        async fn cleanup(&self, _story: &Story) -> Result<CheckReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(if self.pass {
                CheckReport::pass()
            } else {
                CheckReport::fail("type errors remain")
            })
        }
    }

    #[derive(Default)]
    struct MockVcs {
        fail_checkpoint: bool,
        fail_revert: AtomicBool,
        checkpoints: AtomicU32,
        reverts: Mutex<Vec<RevisionRef>>,
        commits: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl VersionControl for MockVcs {
        async fn checkpoint(&self, _label: &str) -> Result<RevisionRef> {
            if self.fail_checkpoint {
                anyhow::bail!("repository is locked");
            }
            let n = self.checkpoints.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(RevisionRef(format!("rev-{n}")))
        }

        async fn revert(&self, rev: &RevisionRef) -> Result<()> {
            if self.fail_revert.load(Ordering::SeqCst) {
                anyhow::bail!("worktree has conflicting changes");
            }
            self.reverts.lock().unwrap().push(rev.clone());
            Ok(())
        }

        async fn commit(&self, message: &str) -> Result<RevisionRef> {
            self.commits.lock().unwrap().push(message.to_string());
            Ok(RevisionRef("commit-1".into()))
        }
    }

    struct Harness {
        author: Arc<MockAgent>,
        implementer: Arc<MockAgent>,
        whitebox: Arc<MockValidator>,
        cleaner: Arc<MockCleaner>,
        vcs: Arc<MockVcs>,
    }

    impl Harness {
        fn new(whitebox: Arc<MockValidator>) -> Self {
            Self {
                author: MockAgent::ok(),
                implementer: MockAgent::ok(),
                whitebox,
                cleaner: MockCleaner::new(true),
                vcs: Arc::new(MockVcs::default()),
            }
        }

        fn collaborators(&self) -> Collaborators {
            Collaborators::new(
                self.author.clone(),
                self.implementer.clone(),
                self.cleaner.clone(),
                self.vcs.clone(),
            )
            .with_validator(self.whitebox.clone())
        }

        fn runner(&self) -> StoryRunner {
            StoryRunner::new(self.collaborators(), LearningEnforcer::default())
        }
    }

    fn make_doc(stories: usize, max_attempts: u32) -> WorkflowDocument {
        let mut doc = WorkflowDocument::default();
        doc.config.max_attempts_per_story = max_attempts;
        doc.add_tasks_from_prd(vec![TaskDraft {
            title: "Task".into(),
            stories: (0..stories)
                .map(|i| StoryDraft {
                    title: format!("Story {i}"),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }])
        .unwrap()
    }

    #[tokio::test]
    async fn test_exhausted_attempts_roll_back_once() {
        let h = Harness::new(MockValidator::new("whitebox", vec![], false));
        let mut doc = make_doc(1, 5);

        let outcome = h.runner().run_story(&mut doc, "US-001").await.unwrap();

        assert!(!outcome.passed);
        assert_eq!(outcome.state, StoryState::RolledBack);
        assert_eq!(outcome.attempts_used, 5);
        assert!(outcome.reason.unwrap().contains("whitebox"));

        let story = doc.story("US-001").unwrap();
        assert_eq!(story.status, StoryState::RolledBack);
        assert_eq!(story.metrics.iterations, 5);
        assert_eq!(story.metrics.failure_log.len(), 5);
        assert!(story
            .metrics
            .failure_log
            .iter()
            .all(|f| f.validators == vec!["whitebox".to_string()]));
        assert!(!story.checkpoints.tests_written);
        assert!(!story.is_complete());

        assert_eq!(h.vcs.checkpoints.load(Ordering::SeqCst), 1);
        assert_eq!(
            *h.vcs.reverts.lock().unwrap(),
            vec![RevisionRef("rev-1".into())]
        );
        assert_eq!(story.metrics.last_checkpoint_ref.as_deref(), Some("rev-1"));
    }

    #[tokio::test]
    async fn test_passes_on_last_allowed_attempt() {
        let h = Harness::new(MockValidator::new(
            "whitebox",
            vec![false, false, false, false],
            true,
        ));
        let mut doc = make_doc(1, 5);

        let outcome = h.runner().run_story(&mut doc, "US-001").await.unwrap();

        assert!(outcome.passed);
        assert_eq!(outcome.attempts_used, 5);
        let story = doc.story("US-001").unwrap();
        assert_eq!(story.status, StoryState::Passed);
        assert!(story.is_complete());
        assert_eq!(story.metrics.iterations, 5);
        assert_eq!(story.metrics.failure_log.len(), 4);
        assert!(h.vcs.reverts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_previous_failures_reach_the_agents() {
        let h = Harness::new(MockValidator::new("whitebox", vec![false], true));
        let mut doc = make_doc(1, 3);
        h.runner().run_story(&mut doc, "US-001").await.unwrap();

        let requests = h.implementer.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].previous_failures.is_empty());
        assert_eq!(requests[1].attempt, 2);
        assert_eq!(requests[1].previous_failures.len(), 1);
        assert_eq!(requests[1].role, AgentRole::Implementer);
    }

    #[tokio::test]
    async fn test_second_concurrent_story_is_rejected() {
        let mut h = Harness::new(MockValidator::new("whitebox", vec![], true));
        h.author = MockAgent::slow(Duration::from_millis(200));
        let runner = h.runner();
        let mut doc_a = make_doc(2, 1);
        let mut doc_b = doc_a.clone();

        let (first, second) = tokio::join!(runner.run_story(&mut doc_a, "US-001"), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            runner.run_story(&mut doc_b, "US-002").await
        });

        assert!(first.unwrap().passed);
        match second.unwrap_err() {
            StoryError::ConcurrentStoryConflict { active, requested } => {
                assert_eq!(active, "US-001");
                assert_eq!(requested, "US-002");
            }
            other => panic!("Expected ConcurrentStoryConflict, got {other:?}"),
        }
        assert!(runner.active_story().is_none());
    }

    #[tokio::test]
    async fn test_validator_timeout_does_not_cancel_siblings() {
        let h = Harness::new(MockValidator::slow("whitebox", Duration::from_secs(3)));
        let blackbox = MockValidator::slow("blackbox", Duration::from_millis(200));
        let runner = StoryRunner::new(
            h.collaborators().with_validator(blackbox.clone()),
            LearningEnforcer::default(),
        );
        let mut doc = make_doc(1, 1);
        doc.config.validator_timeout_secs = 1;
        doc.config.set_validator("blackbox", true);

        let outcome = runner.run_story(&mut doc, "US-001").await.unwrap();

        assert!(!outcome.passed);
        assert_eq!(blackbox.completed.load(Ordering::SeqCst), 1);
        assert_eq!(h.whitebox.completed.load(Ordering::SeqCst), 0);

        let log = &doc.story("US-001").unwrap().metrics.failure_log;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].validators, vec!["whitebox".to_string()]);
        assert!(log[0].reason.contains("timed out"));
    }

    #[tokio::test]
    async fn test_failing_validators_share_one_entry_per_attempt() {
        let h = Harness::new(MockValidator::new("whitebox", vec![], false));
        let blackbox = MockValidator::new("blackbox", vec![], false);
        let runner = StoryRunner::new(
            h.collaborators().with_validator(blackbox),
            LearningEnforcer::default(),
        );
        let mut doc = make_doc(1, 2);
        doc.config.set_validator("blackbox", true);

        let outcome = runner.run_story(&mut doc, "US-001").await.unwrap();
        assert_eq!(outcome.attempts_used, 2);

        let story = doc.story("US-001").unwrap();
        let log = &story.metrics.failure_log;
        assert_eq!(log.len() as u32, story.metrics.iterations);
        assert_eq!(
            log.iter().map(|f| f.attempt).collect::<Vec<_>>(),
            vec![1, 2]
        );
        for entry in log {
            let mut names = entry.validators.clone();
            names.sort();
            assert_eq!(names, vec!["blackbox", "whitebox"]);
            assert!(entry.reason.contains("blackbox:"));
            assert!(entry.reason.contains("whitebox:"));
        }
    }

    #[tokio::test]
    async fn test_learning_violation_skips_build() {
        let mut h = Harness::new(MockValidator::new("whitebox", vec![], true));
        h.author = MockAgent::scripted(vec![AgentOutput {
            success: true,
            content: "tests use thread::sleep(100)".into(),
        }]);
        let mut record = LearningsRecord::default();
        record.add("sleep(", "timing hacks", false).unwrap();
        let runner = StoryRunner::new(
            h.collaborators(),
            LearningEnforcer::from_record(&record).unwrap(),
        );
        let mut doc = make_doc(1, 1);

        let outcome = runner.run_story(&mut doc, "US-001").await.unwrap();

        assert!(!outcome.passed);
        assert_eq!(h.implementer.calls(), 0);
        let log = &doc.story("US-001").unwrap().metrics.failure_log;
        assert_eq!(log[0].stage, StoryState::TestWrite);
        assert!(log[0].reason.contains("timing hacks"));
        assert_eq!(h.author.requests.lock().unwrap()[0].denylist, vec!["sleep("]);
    }

    #[tokio::test]
    async fn test_agent_reported_failure_is_recoverable() {
        let mut h = Harness::new(MockValidator::new("whitebox", vec![], true));
        h.implementer = MockAgent::scripted(vec![AgentOutput {
            success: false,
            content: "could not compile".into(),
        }]);
        let mut doc = make_doc(1, 2);

        let outcome = h.runner().run_story(&mut doc, "US-001").await.unwrap();

        assert!(outcome.passed);
        assert_eq!(outcome.attempts_used, 2);
        let log = &doc.story("US-001").unwrap().metrics.failure_log;
        assert_eq!(log[0].stage, StoryState::Build);
        assert!(log[0].reason.contains("could not compile"));
    }

    #[tokio::test]
    async fn test_failed_revert_is_unrecoverable() {
        let h = Harness::new(MockValidator::new("whitebox", vec![], false));
        h.vcs.fail_revert.store(true, Ordering::SeqCst);
        let runner = h.runner();
        let mut doc = make_doc(1, 2);

        let outcome = runner.run_story(&mut doc, "US-001").await.unwrap();
        assert_eq!(outcome.state, StoryState::Unrecoverable);
        assert!(outcome.reason.unwrap().contains("conflicting changes"));

        let story = doc.story("US-001").unwrap();
        assert_eq!(story.status, StoryState::Unrecoverable);
        assert_eq!(story.metrics.failure_log.len(), 2);
        assert_eq!(
            story.metrics.timestamps.last().map(|t| t.event),
            Some(StoryEvent::RevertFailed)
        );

        // Re-running does nothing until the rollback is resolved.
        let calls = h.author.calls();
        let again = runner.run_story(&mut doc, "US-001").await.unwrap();
        assert_eq!(again.state, StoryState::Unrecoverable);
        assert_eq!(h.author.calls(), calls);
    }

    #[tokio::test]
    async fn test_checkpoint_failure_is_fatal() {
        let mut h = Harness::new(MockValidator::new("whitebox", vec![], true));
        h.vcs = Arc::new(MockVcs {
            fail_checkpoint: true,
            ..Default::default()
        });
        let mut doc = make_doc(1, 5);

        let err = h.runner().run_story(&mut doc, "US-001").await.unwrap_err();
        assert!(matches!(err, StoryError::CheckpointUnavailable { ref id, .. } if id == "US-001"));
        assert_eq!(h.author.calls(), 0);
        assert_eq!(doc.story("US-001").unwrap().metrics.iterations, 0);
    }

    #[tokio::test]
    async fn test_missing_validator_fails_before_side_effects() {
        let h = Harness::new(MockValidator::new("whitebox", vec![], true));
        let mut doc = make_doc(1, 5);
        doc.config.set_validator("security", true);

        let err = h.runner().run_story(&mut doc, "US-001").await.unwrap_err();
        assert!(matches!(err, StoryError::MissingValidator { ref name } if name == "security"));
        assert_eq!(h.vcs.checkpoints.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_story() {
        let h = Harness::new(MockValidator::new("whitebox", vec![], true));
        let mut doc = make_doc(1, 5);
        let err = h.runner().run_story(&mut doc, "US-404").await.unwrap_err();
        assert!(matches!(err, StoryError::StoryNotFound { .. }));
    }

    #[tokio::test]
    async fn test_cleanup_disabled_is_skipped() {
        let h = Harness::new(MockValidator::new("whitebox", vec![], true));
        let mut doc = make_doc(1, 5);
        doc.config.cleanup_enabled = false;

        let outcome = h.runner().run_story(&mut doc, "US-001").await.unwrap();
        assert!(outcome.passed);
        assert_eq!(h.cleaner.calls.load(Ordering::SeqCst), 0);
        assert!(doc.story("US-001").unwrap().checkpoints.cleanup_complete);
    }

    #[tokio::test]
    async fn test_cleanup_failure_logged_as_cleanup_stage() {
        let mut h = Harness::new(MockValidator::new("whitebox", vec![], true));
        h.cleaner = MockCleaner::new(false);
        let mut doc = make_doc(1, 1);

        h.runner().run_story(&mut doc, "US-001").await.unwrap();
        let log = &doc.story("US-001").unwrap().metrics.failure_log;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].stage, StoryState::Cleanup);
        assert!(log[0].validators.is_empty());
    }

    #[tokio::test]
    async fn test_run_all_fail_fast() {
        let h = Harness::new(MockValidator::new("whitebox", vec![], false));
        let mut doc = make_doc(3, 1);
        let outcomes = h.runner().run_all(&mut doc, true).await.unwrap();
        assert_eq!(outcomes.len(), 1);

        let h = Harness::new(MockValidator::new("whitebox", vec![], false));
        let mut doc = make_doc(3, 1);
        let outcomes = h.runner().run_all(&mut doc, false).await.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| !o.passed));
    }

    #[tokio::test]
    async fn test_run_all_skips_passed_stories() {
        let h = Harness::new(MockValidator::new("whitebox", vec![], true));
        let mut doc = make_doc(2, 1);
        doc.story_mut("US-001").unwrap().status = StoryState::Passed;
        let outcomes = h.runner().run_all(&mut doc, false).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].id, "US-002");
    }

    #[tokio::test]
    async fn test_mark_pass_requires_acknowledged_rollback() {
        let h = Harness::new(MockValidator::new("whitebox", vec![], false));
        h.vcs.fail_revert.store(true, Ordering::SeqCst);
        let runner = h.runner();
        let mut doc = make_doc(1, 2);
        runner.run_story(&mut doc, "US-001").await.unwrap();

        let err = runner.mark_story_pass(&mut doc, "US-001").await.unwrap_err();
        assert!(matches!(err, StoryError::AttemptsExhausted { attempts: 2, .. }));

        h.vcs.fail_revert.store(false, Ordering::SeqCst);
        let rev = runner.rollback_story(&mut doc, "US-001").await.unwrap();
        assert_eq!(rev, RevisionRef("rev-1".into()));
        let story = doc.story("US-001").unwrap();
        assert_eq!(story.status, StoryState::RolledBack);
        assert_eq!(story.metrics.failure_log.len(), 2);

        runner.mark_story_pass(&mut doc, "US-001").await.unwrap();
        let story = doc.story("US-001").unwrap();
        assert_eq!(story.status, StoryState::Passed);
        assert!(story.is_complete());
        assert_eq!(h.vcs.commits.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_without_checkpoint() {
        let h = Harness::new(MockValidator::new("whitebox", vec![], true));
        let mut doc = make_doc(1, 5);
        let err = h.runner().rollback_story(&mut doc, "US-001").await.unwrap_err();
        assert!(matches!(err, StoryError::NoRollbackPoint { .. }));
    }

    #[tokio::test]
    async fn test_manual_cleanup() {
        let mut h = Harness::new(MockValidator::new("whitebox", vec![], true));
        let mut doc = make_doc(1, 5);
        let report = h.runner().run_cleanup(&mut doc, "US-001").await.unwrap();
        assert!(report.passed);
        assert!(doc.story("US-001").unwrap().checkpoints.cleanup_complete);

        h.cleaner = MockCleaner::new(false);
        let mut doc = make_doc(1, 5);
        let report = h.runner().run_cleanup(&mut doc, "US-001").await.unwrap();
        assert!(!report.passed);
        let story = doc.story("US-001").unwrap();
        assert!(story.metrics.failure_log.is_empty());
        assert_eq!(
            story.metrics.timestamps.last().map(|t| t.event),
            Some(StoryEvent::CleanupFailed)
        );
    }

    #[tokio::test]
    async fn test_progress_is_persisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("workflow.json");
        let h = Harness::new(MockValidator::new("whitebox", vec![], true));
        let runner = h.runner().with_document_path(&path);
        let mut doc = make_doc(1, 5);

        runner.run_story(&mut doc, "US-001").await.unwrap();
        let saved = WorkflowDocument::load(&path).unwrap();
        assert_eq!(saved.story("US-001").unwrap().status, StoryState::Passed);
        assert_eq!(saved, doc);
    }

    #[test]
    fn test_failed_attempts_reset_by_rollback() {
        let mut doc = make_doc(1, 5);
        {
            let mut rec = MetricsRecorder::new(&mut doc);
            rec.record_timestamp("US-001", StoryEvent::AttemptFailed).unwrap();
            rec.record_timestamp("US-001", StoryEvent::AttemptFailed).unwrap();
            rec.record_timestamp("US-001", StoryEvent::RolledBack).unwrap();
            rec.record_timestamp("US-001", StoryEvent::AttemptFailed).unwrap();
        }
        assert_eq!(failed_attempts_in_cycle(doc.story("US-001").unwrap()), 1);
    }
}
