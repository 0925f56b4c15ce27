//! Project configuration from `.gantry/gantry.toml`.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! name = "my-project"
//!
//! [gate]
//! staleness_days = 30
//!
//! [[gate.phases]]
//! name = "research"
//!
//! [[gate.phases]]
//! name = "design"
//! prerequisites = ["research"]
//! fresh = true
//!
//! [agents]
//! test_author = ["claude", "--print"]
//! implementer = ["claude", "--print"]
//!
//! [validators.whitebox]
//! command = ["cargo", "test"]
//!
//! [cleanup]
//! commands = [["cargo", "fmt"], ["cargo", "clippy", "--", "-D", "warnings"]]
//! ```
//!
//! When `[[gate.phases]]` is absent the five default planning phases apply.
//! `GANTRY_TEST_AUTHOR_CMD` and `GANTRY_IMPLEMENTER_CMD` override the agent
//! commands (split on whitespace).

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::gate::{DEFAULT_STALENESS_DAYS, MAX_STALENESS_DAYS, PhaseDefinition, PhaseRegistry};
use crate::util::is_valid_marker_name;

pub const CONFIG_FILE: &str = "gantry.toml";
pub const TEST_AUTHOR_ENV: &str = "GANTRY_TEST_AUTHOR_CMD";
pub const IMPLEMENTER_ENV: &str = "GANTRY_IMPLEMENTER_CMD";

/// Written by `gantry start` when no config exists.
pub const DEFAULT_TOML: &str = r#"[project]
# name = "my-project"

[gate]
staleness_days = 30

[agents]
# Commands receive the story prompt on stdin and GANTRY_STORY_ID in the environment.
# test_author = ["claude", "--print"]
# implementer = ["claude", "--print"]

# One table per validator enabled in the workflow document config
# ("<name>-validation-enabled": true).
# [validators.whitebox]
# command = ["cargo", "test"]

[cleanup]
commands = []
"#;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GantryToml {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub validators: BTreeMap<String, ValidatorConfig>,
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: Option<String>,
}

fn default_staleness_days() -> i64 {
    DEFAULT_STALENESS_DAYS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default = "default_staleness_days")]
    pub staleness_days: i64,
    #[serde(default)]
    pub phases: Vec<PhaseDefinition>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            staleness_days: default_staleness_days(),
            phases: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default)]
    pub test_author: Vec<String>,
    #[serde(default)]
    pub implementer: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidatorConfig {
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default)]
    pub commands: Vec<Vec<String>>,
}

impl GantryToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Load `<state_dir>/gantry.toml`, or defaults when the file is missing.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<()> {
        if !(0..=MAX_STALENESS_DAYS).contains(&self.gate.staleness_days) {
            bail!(
                "gate.staleness_days must be between 0 and {MAX_STALENESS_DAYS}, got {}",
                self.gate.staleness_days
            );
        }

        let mut seen = HashSet::new();
        for phase in &self.gate.phases {
            if !is_valid_marker_name(&phase.name) {
                bail!(
                    "Invalid phase name '{}': only letters, digits, '_' and '-' are allowed",
                    phase.name
                );
            }
            if !seen.insert(phase.name.as_str()) {
                bail!("Phase '{}' is defined more than once", phase.name);
            }
        }
        for phase in &self.gate.phases {
            if let Some(unknown) = phase
                .prerequisites
                .iter()
                .find(|p| !seen.contains(p.as_str()))
            {
                bail!(
                    "Phase '{}' requires unknown phase '{}'",
                    phase.name,
                    unknown
                );
            }
        }

        for (name, validator) in &self.validators {
            if validator.command.is_empty() {
                bail!("validators.{name}.command must not be empty");
            }
        }
        Ok(())
    }

    pub fn registry(&self) -> PhaseRegistry {
        if self.gate.phases.is_empty() {
            PhaseRegistry::default_planning()
        } else {
            PhaseRegistry::new(self.gate.phases.clone())
        }
    }

    pub fn test_author_command(&self) -> Result<Vec<String>> {
        resolve_command(
            std::env::var(TEST_AUTHOR_ENV).ok(),
            &self.agents.test_author,
            "agents.test_author",
            TEST_AUTHOR_ENV,
        )
    }

    pub fn implementer_command(&self) -> Result<Vec<String>> {
        resolve_command(
            std::env::var(IMPLEMENTER_ENV).ok(),
            &self.agents.implementer,
            "agents.implementer",
            IMPLEMENTER_ENV,
        )
    }
}

/// Pick the environment override if set and non-blank, else the configured
/// command. Neither being present is an error naming both sources.
fn resolve_command(
    env_value: Option<String>,
    configured: &[String],
    key: &str,
    env_key: &str,
) -> Result<Vec<String>> {
    if let Some(value) = env_value {
        let argv: Vec<String> = value.split_whitespace().map(str::to_string).collect();
        if !argv.is_empty() {
            return Ok(argv);
        }
    }
    if configured.is_empty() {
        bail!("No command configured for {key}; set it in gantry.toml or via {env_key}");
    }
    Ok(configured.to_vec())
}
