//! Story execution.
//!
//! | Module          | Purpose                                                    |
//! |-----------------|------------------------------------------------------------|
//! | `collaborators` | Agent, validator, cleaner, and version-control traits      |
//! | `story`         | `StoryRunner`: attempts, concurrent validation, rollback   |
//! | `command`       | Collaborators that shell out to configured commands        |
//! | `lock`          | `StoryLock`: one story at a time across processes          |

pub mod collaborators;
pub mod command;
pub mod lock;
pub mod story;

pub use collaborators::{
    Agent, AgentOutput, AgentRequest, AgentRole, CheckReport, Cleaner, Collaborators,
    RevisionRef, Validator, VersionControl,
};
pub use command::{CommandAgent, CommandCleaner, CommandValidator};
pub use lock::StoryLock;
pub use story::{StoryOutcome, StoryRunner, failed_attempts_in_cycle};

pub use crate::metrics::AttemptFailure;
