//! The workflow document: the single source of truth shared across phases.
//!
//! - [`types`] holds the serialized shape (intent, tasks, stories, config)
//! - this module holds load/save, invariant checks, and the two planning-time
//!   mutations: [`WorkflowDocument::merge_intent`] and
//!   [`WorkflowDocument::add_tasks_from_prd`]
//!
//! Mutations never touch `self`; they return an updated copy, so a failed
//! call leaves the caller's document exactly as it was.

pub mod types;

pub use types::*;

use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use crate::errors::DocumentError;
use crate::util::atomic_write;

/// A task as produced by PRD conversion, before IDs are settled.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDraft {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub stories: Vec<StoryDraft>,
}

/// A story parsed from PRD/story text.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryDraft {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub scenarios: Vec<Scenario>,
}

/// The file shape accepted by `gantry import-prd`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PrdImport {
    pub tasks: Vec<TaskDraft>,
}

impl WorkflowDocument {
    /// Load and validate a document.
    ///
    /// The schema version is checked before anything else is decoded, so a
    /// document from another build fails with `SchemaMismatch` even if its
    /// other fields have moved on.
    pub fn load(path: &Path) -> Result<Self, DocumentError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DocumentError::NotFound {
                    path: path.to_path_buf(),
                });
            }
            Err(source) => {
                return Err(DocumentError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let raw: serde_json::Value =
            serde_json::from_str(&content).map_err(|source| DocumentError::Malformed {
                path: path.to_path_buf(),
                source,
            })?;

        let found = raw
            .get("version")
            .or_else(|| raw.get("schemaVersion"))
            .and_then(|v| v.as_str())
            .unwrap_or("<missing>");
        check_schema_version(found)?;

        let doc: WorkflowDocument =
            serde_json::from_value(raw).map_err(|source| DocumentError::Malformed {
                path: path.to_path_buf(),
                source,
            })?;
        doc.validate()?;
        Ok(doc)
    }

    /// Validate and atomically write the document as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), DocumentError> {
        self.validate()?;
        let json = serde_json::to_string_pretty(self).map_err(|source| DocumentError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;
        atomic_write(path, json.as_bytes()).map_err(|source| DocumentError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "workflow document saved");
        Ok(())
    }

    /// Check the document invariants: supported version, unique task and
    /// story IDs, and a usable attempt budget.
    pub fn validate(&self) -> Result<(), DocumentError> {
        check_schema_version(&self.version)?;

        if self.config.max_attempts_per_story < 1 {
            return Err(DocumentError::InvalidConfig(
                "max-attempts-per-story must be at least 1".to_string(),
            ));
        }

        let mut task_ids = HashSet::new();
        let mut story_ids = HashSet::new();
        for task in &self.tasks {
            if !task_ids.insert(task.id.as_str()) {
                return Err(DocumentError::DuplicateTaskId {
                    id: task.id.clone(),
                });
            }
            for story in &task.stories {
                if !story_ids.insert(story.id.as_str()) {
                    return Err(DocumentError::DuplicateStoryId {
                        id: story.id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Populate the intent. Fails with `AlreadyPopulated` if an intent is
    /// present, unless `overwrite` is set.
    pub fn merge_intent(&self, intent: Intent, overwrite: bool) -> Result<Self, DocumentError> {
        if self.intent.is_some() && !overwrite {
            return Err(DocumentError::AlreadyPopulated);
        }
        let mut next = self.clone();
        next.intent = Some(intent);
        Ok(next)
    }

    /// Add converted PRD tasks and their stories.
    ///
    /// Stories keep a supplied ID (which must be new to both the document
    /// and the batch) or receive the next free `US-NNN`. Tasks without an
    /// ID get the next free `T-NNN`; a draft whose ID matches an existing
    /// task appends to it.
    pub fn add_tasks_from_prd(&self, drafts: Vec<TaskDraft>) -> Result<Self, DocumentError> {
        let mut used_story_ids: HashSet<String> =
            self.stories().map(|s| s.id.clone()).collect();

        // Reject preserved IDs first so nothing is generated for a batch
        // that is going to fail anyway.
        let mut batch_ids = HashSet::new();
        for story in drafts.iter().flat_map(|t| &t.stories) {
            if let Some(id) = &story.id
                && (used_story_ids.contains(id) || !batch_ids.insert(id.clone()))
            {
                return Err(DocumentError::DuplicateStoryId { id: id.clone() });
            }
        }
        used_story_ids.extend(batch_ids);

        let mut next = self.clone();
        let validators = next.config.enabled_validators();
        let mut used_task_ids: HashSet<String> = next.tasks.iter().map(|t| t.id.clone()).collect();

        for draft in drafts {
            let mut stories = Vec::with_capacity(draft.stories.len());
            for s in draft.stories {
                let id = match s.id {
                    Some(id) => id,
                    None => {
                        let id = next_free_id("US", &used_story_ids)?;
                        used_story_ids.insert(id.clone());
                        id
                    }
                };
                stories.push(Story {
                    id,
                    title: s.title,
                    acceptance_criteria: s.acceptance_criteria,
                    scenarios: s.scenarios,
                    status: StoryState::Pending,
                    checkpoints: StoryCheckpoints::new(validators.iter().cloned()),
                    metrics: StoryMetrics::default(),
                });
            }

            let existing = draft
                .id
                .as_ref()
                .and_then(|id| next.tasks.iter_mut().find(|t| &t.id == id));
            match existing {
                Some(task) => task.stories.extend(stories),
                None => {
                    let id = match draft.id {
                        Some(id) => id,
                        None => next_free_id("T", &used_task_ids)?,
                    };
                    used_task_ids.insert(id.clone());
                    next.tasks.push(Task {
                        id,
                        title: draft.title,
                        description: draft.description,
                        stories,
                    });
                }
            }
        }

        next.validate()?;
        Ok(next)
    }

    /// All stories in authoring order.
    pub fn stories(&self) -> impl Iterator<Item = &Story> {
        self.tasks.iter().flat_map(|t| t.stories.iter())
    }

    pub fn story_ids(&self) -> Vec<String> {
        self.stories().map(|s| s.id.clone()).collect()
    }

    pub fn story(&self, id: &str) -> Option<&Story> {
        self.stories().find(|s| s.id == id)
    }

    pub fn story_mut(&mut self, id: &str) -> Option<&mut Story> {
        self.tasks
            .iter_mut()
            .flat_map(|t| t.stories.iter_mut())
            .find(|s| s.id == id)
    }

    /// Like [`story_mut`](Self::story_mut) but reports the missing ID.
    pub fn require_story_mut(&mut self, id: &str) -> Result<&mut Story, DocumentError> {
        self.story_mut(id)
            .ok_or_else(|| DocumentError::StoryNotFound { id: id.to_string() })
    }

    /// The task owning `story_id`.
    pub fn task_of(&self, story_id: &str) -> Option<&Task> {
        self.tasks
            .iter()
            .find(|t| t.stories.iter().any(|s| s.id == story_id))
    }
}

fn check_schema_version(found: &str) -> Result<(), DocumentError> {
    if SUPPORTED_SCHEMA_VERSIONS.contains(&found) {
        Ok(())
    } else {
        Err(DocumentError::SchemaMismatch {
            found: found.to_string(),
            expected: SUPPORTED_SCHEMA_VERSIONS.join(", "),
        })
    }
}

/// Next `<prefix>-NNN` above every numeric ID already using that prefix.
fn next_free_id(prefix: &str, used: &HashSet<String>) -> Result<String, DocumentError> {
    let exhausted = || DocumentError::IdsExhausted {
        prefix: prefix.to_string(),
    };
    let max = used
        .iter()
        .filter_map(|id| id.strip_prefix(prefix)?.strip_prefix('-')?.parse::<u64>().ok())
        .max()
        .unwrap_or(0);
    let mut n = max.checked_add(1).ok_or_else(exhausted)?;
    loop {
        let candidate = format!("{prefix}-{n:03}");
        if !used.contains(&candidate) {
            return Ok(candidate);
        }
        n = n.checked_add(1).ok_or_else(exhausted)?;
    }
}
