use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::gantry_config::{CONFIG_FILE, GantryToml};

/// Name of the per-project state directory.
pub const STATE_DIR: &str = ".gantry";

/// Runtime paths for one project.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub workflow_file: PathBuf,
    pub session_file: PathBuf,
    pub checkpoints_dir: PathBuf,
    pub learnings_file: PathBuf,
    pub metrics_file: PathBuf,
    pub lock_file: PathBuf,
    pub log_dir: PathBuf,
    pub config_file: PathBuf,
    pub verbose: bool,
}

impl Config {
    pub fn new(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        Ok(Self::for_dir(project_dir, verbose))
    }

    /// Derive every path from `project_dir` without touching the filesystem.
    pub fn for_dir(project_dir: PathBuf, verbose: bool) -> Self {
        let state_dir = project_dir.join(STATE_DIR);
        Self {
            workflow_file: state_dir.join("workflow.json"),
            session_file: state_dir.join("session.json"),
            checkpoints_dir: state_dir.join("checkpoints"),
            learnings_file: state_dir.join("learnings.json"),
            metrics_file: state_dir.join("metrics.json"),
            lock_file: state_dir.join("story.lock"),
            log_dir: state_dir.join("logs"),
            config_file: state_dir.join(CONFIG_FILE),
            state_dir,
            project_dir,
            verbose,
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.checkpoints_dir)
            .context("Failed to create checkpoints directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }

    pub fn load_toml(&self) -> Result<GantryToml> {
        GantryToml::load_or_default(&self.state_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_paths_live_under_state_dir() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), false).unwrap();
        assert!(config.workflow_file.ends_with(".gantry/workflow.json"));
        assert!(config.checkpoints_dir.ends_with(".gantry/checkpoints"));
        assert!(config.lock_file.ends_with(".gantry/story.lock"));
        assert!(config.config_file.ends_with(".gantry/gantry.toml"));
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), false).unwrap();
        config.ensure_directories().unwrap();
        assert!(config.checkpoints_dir.is_dir());
        assert!(config.log_dir.is_dir());
    }

    #[test]
    fn test_missing_project_dir_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(Config::new(dir.path().join("nope"), false).is_err());
    }
}
