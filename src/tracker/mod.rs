//! Version control for story checkpoints, commits, and rollbacks.

pub mod git;

pub use git::GitTracker;
