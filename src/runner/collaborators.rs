//! Seams between the story runner and the outside world.
//!
//! Real implementations: `CommandAgent`, `CommandValidator`, `CommandCleaner`
//! (see [`super::command`]) and [`crate::tracker::GitTracker`]. Tests use
//! in-file mocks.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::document::{FailureEntry, Story};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    TestAuthor,
    Implementer,
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentRole::TestAuthor => write!(f, "test-author"),
            AgentRole::Implementer => write!(f, "implementer"),
        }
    }
}

/// Everything an agent needs for one step of one attempt.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub role: AgentRole,
    pub story: Story,
    pub attempt: u32,
    pub previous_failures: Vec<FailureEntry>,
    pub denylist: Vec<String>,
}

impl AgentRequest {
    /// Render the request as a plain-text prompt for external commands.
    pub fn to_prompt(&self) -> String {
        let mut prompt = format!(
            "Role: {}\nStory {}: {}\nAttempt: {}\n",
            self.role, self.story.id, self.story.title, self.attempt
        );

        if !self.story.acceptance_criteria.is_empty() {
            prompt.push_str("\nAcceptance criteria:\n");
            for c in &self.story.acceptance_criteria {
                prompt.push_str(&format!("- {c}\n"));
            }
        }

        for s in &self.story.scenarios {
            prompt.push_str(&format!("\nScenario: {}\n", s.name));
            for g in &s.given {
                prompt.push_str(&format!("  Given {g}\n"));
            }
            for w in &s.when {
                prompt.push_str(&format!("  When {w}\n"));
            }
            for t in &s.then {
                prompt.push_str(&format!("  Then {t}\n"));
            }
        }

        if !self.previous_failures.is_empty() {
            prompt.push_str("\nPrevious failures:\n");
            for f in &self.previous_failures {
                prompt.push_str(&format!("- attempt {} {}: {}\n", f.attempt, f.stage, f.reason));
            }
        }

        if !self.denylist.is_empty() {
            prompt.push_str("\nNever produce output containing:\n");
            for p in &self.denylist {
                prompt.push_str(&format!("- {p}\n"));
            }
        }

        prompt
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOutput {
    pub success: bool,
    pub content: String,
}

/// Outcome of a validator or cleanup pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub passed: bool,
    pub diagnostics: String,
}

impl CheckReport {
    pub fn pass() -> Self {
        Self {
            passed: true,
            diagnostics: String::new(),
        }
    }

    pub fn fail(diagnostics: impl Into<String>) -> Self {
        Self {
            passed: false,
            diagnostics: diagnostics.into(),
        }
    }
}

/// Opaque handle to a version-control snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionRef(pub String);

impl fmt::Display for RevisionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    async fn run(&self, request: &AgentRequest) -> Result<AgentOutput>;
}

#[async_trait]
pub trait Validator: Send + Sync {
    fn name(&self) -> &str;
    async fn validate(&self, story: &Story) -> Result<CheckReport>;
}

#[async_trait]
pub trait Cleaner: Send + Sync {
    async fn cleanup(&self, story: &Story) -> Result<CheckReport>;
}

#[async_trait]
pub trait VersionControl: Send + Sync {
    async fn checkpoint(&self, label: &str) -> Result<RevisionRef>;
    async fn revert(&self, rev: &RevisionRef) -> Result<()>;
    async fn commit(&self, message: &str) -> Result<RevisionRef>;
}

/// The set of collaborators a runner is built with.
#[derive(Clone)]
pub struct Collaborators {
    pub test_author: Arc<dyn Agent>,
    pub implementer: Arc<dyn Agent>,
    pub validators: BTreeMap<String, Arc<dyn Validator>>,
    pub cleaner: Arc<dyn Cleaner>,
    pub vcs: Arc<dyn VersionControl>,
}

impl Collaborators {
    pub fn new(
        test_author: Arc<dyn Agent>,
        implementer: Arc<dyn Agent>,
        cleaner: Arc<dyn Cleaner>,
        vcs: Arc<dyn VersionControl>,
    ) -> Self {
        Self {
            test_author,
            implementer,
            validators: BTreeMap::new(),
            cleaner,
            vcs,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validators
            .insert(validator.name().to_string(), validator);
        self
    }
}
