//! Typed error hierarchy for the gantry orchestrator.
//!
//! One enum per subsystem:
//! - `DocumentError`: workflow document load/save/mutation failures
//! - `CheckpointError`: checkpoint marker storage
//! - `GateError`: phase ordering violations
//! - `SessionError`: session lifecycle and the planning-mode edit guard
//! - `StoryError`: fatal story execution failures
//!
//! Recoverable per-attempt failures are not errors; see
//! [`crate::metrics::AttemptFailure`].

use std::path::PathBuf;
use thiserror::Error;

use crate::gate::BlockReason;

/// Errors from loading, saving, or mutating the workflow document.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Workflow document not found at {path}. Run 'gantry start' first.")]
    NotFound { path: PathBuf },

    #[error("Unsupported workflow schema version '{found}' (this build supports {expected})")]
    SchemaMismatch { found: String, expected: String },

    #[error("Failed to parse workflow document at {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Intent is already populated; pass --overwrite to replace it")]
    AlreadyPopulated,

    #[error("Story ID {id} already exists in the workflow document")]
    DuplicateStoryId { id: String },

    #[error("Task ID {id} appears more than once in the workflow document")]
    DuplicateTaskId { id: String },

    #[error("Story {id} not found in the workflow document")]
    StoryNotFound { id: String },

    #[error("No {prefix}-NNN identifiers left to assign; renumber the workflow document")]
    IdsExhausted { prefix: String },

    #[error("Invalid workflow config: {0}")]
    InvalidConfig(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the checkpoint marker store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint '{name}' not found")]
    NotFound { name: String },

    #[error("Invalid checkpoint name '{name}': only letters, digits, '_' and '-' are allowed")]
    InvalidName { name: String },

    #[error("Checkpoint '{name}' is unreadable: {source}")]
    Malformed {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error on checkpoint {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from phase gating.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Unknown phase '{phase}'")]
    UnknownPhase { phase: String },

    #[error("Cannot enter phase '{phase}': {}", format_reasons(.reasons))]
    OutOfOrderPhase {
        phase: String,
        reasons: Vec<BlockReason>,
    },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

fn format_reasons(reasons: &[BlockReason]) -> String {
    reasons
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors from the workflow session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No workflow session at {path}. Run 'gantry start' first.")]
    NotStarted { path: PathBuf },

    #[error("Planning mode is active (phase '{phase}'); source mutations are rejected")]
    PlanningModeActive { phase: String },

    #[error("Session file {path} is unreadable: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error on session file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Fatal errors from story execution. Per-attempt failures are absorbed by
/// the retry loop and only surface as a `StoryOutcome`.
#[derive(Debug, Error)]
pub enum StoryError {
    #[error("Story {id} not found in the workflow document")]
    StoryNotFound { id: String },

    #[error("Cannot start story {requested}: story {active} is already active")]
    ConcurrentStoryConflict { active: String, requested: String },

    #[error("Could not obtain a version-control checkpoint for story {id}: {source}")]
    CheckpointUnavailable {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(
        "Validator '{name}' is enabled in the workflow config but has no collaborator; add [validators.{name}] to .gantry/gantry.toml"
    )]
    MissingValidator { name: String },

    #[error(
        "Story {id} exhausted {attempts} attempt(s) without an acknowledged rollback; run 'gantry rollback {id}' first"
    )]
    AttemptsExhausted { id: String, attempts: u32 },

    #[error("Story {id} has no recorded checkpoint to roll back to")]
    NoRollbackPoint { id: String },

    #[error("Reverting story {id} to checkpoint {revision} failed: {source}")]
    RevertFailed {
        id: String,
        revision: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Committing story {id} failed: {source}")]
    CommitFailed {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Document(#[from] DocumentError),
}
